//! Process configuration from `COURTSIDE_*` environment variables, and the
//! TLS acceptor built from it.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::auth;
use crate::clock;
use crate::engine::Policy;
use crate::limits::*;
use crate::model::MINUTE_MS;
use crate::queue::RetryPolicy;
use crate::validate::{self, WindowPolicy};

#[derive(Debug)]
pub struct ConfigError(String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub users: HashMap<String, String>,
    /// Admin user names; each must have its own password in `users`.
    pub admins: HashSet<String>,
    /// Booking attempts per principal per window; 0 disables the limit.
    pub booking_rate_limit: u32,
    pub booking_rate_window: Duration,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub sweep_interval: Duration,
    pub policy: Policy,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let grace_minutes: i64 = parse_or(&get, "COURTSIDE_GRACE_MINUTES", DEFAULT_GRACE_MINUTES)?;
        let grace_ms = grace_minutes.checked_mul(MINUTE_MS);
        if grace_minutes <= 0 || grace_ms.is_none_or(|ms| ms > MAX_GRACE_MS) {
            return Err(ConfigError(format!(
                "COURTSIDE_GRACE_MINUTES must be between 1 and {}",
                MAX_GRACE_MS / MINUTE_MS
            )));
        }

        let offset_minutes: i32 =
            parse_or(&get, "COURTSIDE_UTC_OFFSET_MINUTES", DEFAULT_UTC_OFFSET_MINUTES)?;
        let utc_offset = clock::offset_from_minutes(offset_minutes).ok_or_else(|| {
            ConfigError(format!("COURTSIDE_UTC_OFFSET_MINUTES out of range: {offset_minutes}"))
        })?;

        let window = WindowPolicy {
            open_minute: minute_of_day(&get, "COURTSIDE_OPEN_TIME", DEFAULT_OPEN_MINUTE)?,
            close_minute: minute_of_day(&get, "COURTSIDE_CLOSE_TIME", DEFAULT_CLOSE_MINUTE)?,
            slot_minutes: parse_or(&get, "COURTSIDE_SLOT_MINUTES", DEFAULT_SLOT_MINUTES)?,
            min_duration_minutes: parse_or(
                &get,
                "COURTSIDE_MIN_DURATION_MINUTES",
                DEFAULT_MIN_DURATION_MINUTES,
            )?,
            max_duration_minutes: parse_or(
                &get,
                "COURTSIDE_MAX_DURATION_MINUTES",
                DEFAULT_MAX_DURATION_MINUTES,
            )?,
            utc_offset,
        };
        check_window_policy(&window)?;

        let attempts: u32 = parse_or(&get, "COURTSIDE_ENQUEUE_ATTEMPTS", DEFAULT_ENQUEUE_ATTEMPTS)?;
        if attempts == 0 {
            return Err(ConfigError("COURTSIDE_ENQUEUE_ATTEMPTS must be at least 1".into()));
        }
        let backoff_ms: u64 =
            parse_or(&get, "COURTSIDE_ENQUEUE_BACKOFF_MS", DEFAULT_ENQUEUE_BACKOFF_MS)?;

        let policy = Policy {
            window,
            grace: Duration::from_secs(grace_minutes as u64 * 60),
            retry: RetryPolicy {
                attempts,
                base_backoff: Duration::from_millis(backoff_ms),
            },
        };

        let users = match get("COURTSIDE_USERS") {
            Some(list) => auth::parse_users(&list).map_err(ConfigError)?,
            None => HashMap::new(),
        };
        let admins = get("COURTSIDE_ADMINS")
            .map(|list| auth::parse_admins(&list))
            .unwrap_or_default();
        if let Some(admin) = admins.iter().find(|a| !users.contains_key(*a)) {
            return Err(ConfigError(format!(
                "admin {admin:?} needs its own password in COURTSIDE_USERS"
            )));
        }

        let booking_rate_limit: u32 =
            parse_or(&get, "COURTSIDE_BOOKING_RATE_LIMIT", DEFAULT_BOOKING_RATE_LIMIT)?;
        let rate_window_secs: u64 = parse_or(
            &get,
            "COURTSIDE_BOOKING_RATE_WINDOW_SECS",
            DEFAULT_BOOKING_RATE_WINDOW_SECS,
        )?;
        if booking_rate_limit > 0 && rate_window_secs == 0 {
            return Err(ConfigError(
                "COURTSIDE_BOOKING_RATE_WINDOW_SECS must be positive".into(),
            ));
        }

        let sweep_secs: u64 =
            parse_or(&get, "COURTSIDE_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS)?;
        if sweep_secs == 0 {
            return Err(ConfigError("COURTSIDE_SWEEP_INTERVAL_SECS must be positive".into()));
        }

        let metrics_port = match get("COURTSIDE_METRICS_PORT") {
            Some(raw) => Some(parse_value("COURTSIDE_METRICS_PORT", &raw)?),
            None => None,
        };

        Ok(Self {
            bind: get("COURTSIDE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&get, "COURTSIDE_PORT", 5433)?,
            data_dir: PathBuf::from(get("COURTSIDE_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("COURTSIDE_PASSWORD").unwrap_or_else(|| "courtside".into()),
            users,
            admins,
            booking_rate_limit,
            booking_rate_window: Duration::from_secs(rate_window_secs),
            max_connections: parse_or(&get, "COURTSIDE_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&get, "COURTSIDE_COMPACT_THRESHOLD", 1000)?,
            metrics_port,
            tls_cert: get("COURTSIDE_TLS_CERT"),
            tls_key: get("COURTSIDE_TLS_KEY"),
            sweep_interval: Duration::from_secs(sweep_secs),
            policy,
        })
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("courtside.journal")
    }

    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        load_tls_acceptor(self.tls_cert.as_deref(), self.tls_key.as_deref())
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError(format!("{key}: cannot parse {raw:?}")))
}

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

/// `HH:MM` as minutes since midnight.
fn minute_of_day(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u32,
) -> Result<u32, ConfigError> {
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    let time = validate::parse_time(&raw).map_err(|e| ConfigError(format!("{key}: {e}")))?;
    Ok(chrono::Timelike::hour(&time) * 60 + chrono::Timelike::minute(&time))
}

fn check_window_policy(p: &WindowPolicy) -> Result<(), ConfigError> {
    if p.open_minute >= p.close_minute {
        return Err(ConfigError("opening time must be before closing time".into()));
    }
    if p.slot_minutes <= 0 || 24 * 60 % p.slot_minutes != 0 {
        return Err(ConfigError(format!(
            "slot length must divide a day, got {} minutes",
            p.slot_minutes
        )));
    }
    if p.min_duration_minutes <= 0 || p.min_duration_minutes > p.max_duration_minutes {
        return Err(ConfigError("minimum duration must be positive and at most the maximum".into()));
    }
    Ok(())
}

pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "COURTSIDE_TLS_CERT and COURTSIDE_TLS_KEY must be set together",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
