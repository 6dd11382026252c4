use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::{DEFAULT_ENQUEUE_ATTEMPTS, DEFAULT_ENQUEUE_BACKOFF_MS};

/// How often a fired job without a registered handler is re-armed.
const HANDLER_WAIT: Duration = Duration::from_secs(1);

/// Delayed request to reclaim one reservation if it is still unpaid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryJob {
    pub reservation_id: Ulid,
}

impl ExpiryJob {
    pub fn new(reservation_id: Ulid) -> Self {
        Self { reservation_id }
    }

    /// Dedup key: at most one live job per reservation.
    pub fn key(&self) -> Ulid {
        self.reservation_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    New,
    /// A job with the same key is already waiting; nothing was added.
    Duplicate,
}

#[derive(Debug)]
pub enum QueueError {
    Closed,
    Rejected(String),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Closed => write!(f, "queue closed"),
            QueueError::Rejected(e) => write!(f, "job rejected: {e}"),
        }
    }
}

impl std::error::Error for QueueError {}

/// At-least-once delayed delivery of expiry jobs, deduplicated by key.
#[async_trait]
pub trait DeferredQueue: Send + Sync {
    async fn schedule(&self, job: ExpiryJob, fire_after: Duration) -> Result<Scheduled, QueueError>;
}

/// Invoked when a job's delay has elapsed. May run more than once per job.
#[async_trait]
pub trait ExpiryHandler: Send + Sync {
    async fn on_fire(&self, job: ExpiryJob);
}

struct Inner {
    /// Keys of jobs waiting or firing.
    pending: DashMap<Ulid, ExpiryJob>,
    handler: OnceLock<Arc<dyn ExpiryHandler>>,
    closed: AtomicBool,
}

/// In-process delay queue on tokio timers. Not durable: jobs die with the
/// process, so callers re-schedule from the store on startup.
#[derive(Clone)]
pub struct LocalDelayQueue {
    inner: Arc<Inner>,
}

impl Default for LocalDelayQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalDelayQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: DashMap::new(),
                handler: OnceLock::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register the handler. Only the first registration takes effect.
    pub fn on_fire(&self, handler: Arc<dyn ExpiryHandler>) {
        if self.inner.handler.set(handler).is_err() {
            warn!("expiry handler already registered, ignoring");
        }
    }

    /// Reject further `schedule` calls. Waiting jobs still fire.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }
}

async fn fire(inner: Arc<Inner>, job: ExpiryJob, fire_after: Duration) {
    tokio::time::sleep(fire_after).await;
    let handler = loop {
        if let Some(h) = inner.handler.get() {
            break h.clone();
        }
        debug!(reservation_id = %job.reservation_id, "no expiry handler yet, re-arming");
        tokio::time::sleep(HANDLER_WAIT).await;
    };
    handler.on_fire(job).await;
    inner.pending.remove(&job.key());
}

#[async_trait]
impl DeferredQueue for LocalDelayQueue {
    async fn schedule(&self, job: ExpiryJob, fire_after: Duration) -> Result<Scheduled, QueueError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        match self.inner.pending.entry(job.key()) {
            Entry::Occupied(_) => return Ok(Scheduled::Duplicate),
            Entry::Vacant(slot) => {
                slot.insert(job);
            }
        }
        tokio::spawn(fire(self.inner.clone(), job, fire_after));
        Ok(Scheduled::New)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ENQUEUE_ATTEMPTS,
            base_backoff: Duration::from_millis(DEFAULT_ENQUEUE_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `n` (1-based): `base * 2^(n-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX))
    }
}

/// Schedule with bounded exponential backoff. The job still fires
/// `fire_after` from the first attempt; time spent retrying is subtracted.
pub async fn schedule_with_retry(
    queue: &dyn DeferredQueue,
    job: ExpiryJob,
    fire_after: Duration,
    policy: RetryPolicy,
) -> Result<Scheduled, QueueError> {
    let started = Instant::now();
    let mut attempt = 1;
    loop {
        let remaining = fire_after.saturating_sub(started.elapsed());
        match queue.schedule(job, remaining).await {
            Ok(scheduled) => return Ok(scheduled),
            Err(e) if attempt >= policy.attempts.max(1) => return Err(e),
            Err(e) => {
                let backoff = policy.backoff(attempt);
                warn!(
                    reservation_id = %job.reservation_id,
                    attempt,
                    "expiry enqueue failed: {e}; retrying in {backoff:?}"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
