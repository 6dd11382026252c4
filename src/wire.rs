use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::FixedOffset;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{Caller, CourtsideAuthSource};
use crate::clock;
use crate::engine::{BookingEngine, BookingError, BookingRequest, CourtPatch};
use crate::model::*;
use crate::observability;
use crate::ratelimit::RateLimiter;
use crate::sql::{self, BookingFilter, Command};
use crate::validate::{self, WindowError};

/// Login and authorization settings for one server.
#[derive(Debug, Default)]
pub struct Access {
    /// Password for any user not listed in `users`.
    pub password: String,
    pub users: HashMap<String, String>,
    /// Users with the admin role. Everyone else is a customer.
    pub admins: HashSet<String>,
    /// Applied per principal to booking inserts.
    pub booking_limit: RateLimiter,
}

pub struct CourtsideHandler {
    engine: Arc<BookingEngine>,
    admins: HashSet<String>,
    booking_limit: RateLimiter,
    query_parser: Arc<CourtsideQueryParser>,
}

impl CourtsideHandler {
    pub fn new(engine: Arc<BookingEngine>, admins: HashSet<String>, booking_limit: RateLimiter) -> Self {
        Self {
            engine,
            admins,
            booking_limit,
            query_parser: Arc::new(CourtsideQueryParser),
        }
    }

    /// The login user and their role. The user is recorded as the principal
    /// on new bookings.
    fn caller<C: ClientInfo>(&self, client: &C) -> PgWireResult<Caller> {
        let principal = client.metadata().get("user").cloned().ok_or_else(|| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "28000".into(),
                "no user in startup packet".into(),
            )))
        })?;
        if self.admins.contains(&principal) {
            Ok(Caller::admin(principal))
        } else {
            Ok(Caller::customer(principal))
        }
    }

    async fn run(&self, caller: Caller, sql: &str) -> PgWireResult<Vec<Response>> {
        let started = Instant::now();
        let cmd = match sql::parse_sql(sql) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(observability::QUERIES_TOTAL, "command" => "parse", "status" => "error")
                    .increment(1);
                return Err(sql_err(e));
            }
        };
        let label = observability::command_label(&cmd);
        let result = self.execute_command(caller, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, caller: Caller, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::UpsertCourt {
                id,
                name,
                kind,
                unit_price,
                active,
            } => {
                match engine.get_court(id).await {
                    Ok(_) => {
                        let patch = CourtPatch {
                            name: Some(name),
                            kind: Some(kind),
                            unit_price: Some(unit_price),
                            active,
                        };
                        engine.update_court(&caller, id, patch).await.map_err(booking_err)?;
                    }
                    Err(BookingError::CourtNotFound(_)) => {
                        let court = Court {
                            id,
                            name,
                            kind,
                            unit_price,
                            active: active.unwrap_or(true),
                        };
                        engine.create_court(&caller, court).await.map_err(booking_err)?;
                    }
                    Err(e) => return Err(booking_err(e)),
                }
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeactivateCourt { id } => {
                let patch = CourtPatch {
                    active: Some(false),
                    ..CourtPatch::default()
                };
                engine.update_court(&caller, id, patch).await.map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectCourts => {
                let courts = engine.list_courts().await.map_err(booking_err)?;
                Ok(vec![court_rows(courts)])
            }
            Command::SelectAvailableCourts {
                date,
                start_time,
                end_time,
            } => {
                let span =
                    validate::window_from_local(&date, &start_time, &end_time, &engine.policy().window)
                        .map_err(|e| booking_err(e.into()))?;
                let courts = engine.query_availability(span).await.map_err(booking_err)?;

                let schema = Arc::new(available_schema());
                let rows: Vec<PgWireResult<_>> = courts
                    .iter()
                    .map(|court| {
                        let quote = engine.quote(court, &span);
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&court.id.to_string())?;
                        encoder.encode_field(&court.name)?;
                        encoder.encode_field(&court.kind.as_str().to_string())?;
                        encoder.encode_field(&court.unit_price)?;
                        encoder.encode_field(&quote.duration_minutes)?;
                        encoder.encode_field(&quote.total_price)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::InsertBooking {
                court_id,
                start,
                end,
            } => {
                if let Err(retry_after) = self.booking_limit.check(&caller.principal) {
                    metrics::counter!(observability::BOOKINGS_RATE_LIMITED_TOTAL).increment(1);
                    tracing::warn!(principal = %caller.principal, "booking rate limit hit");
                    return Err(rate_limited_err(retry_after));
                }
                let span = booking_span(&start, &end).map_err(|e| booking_err(e.into()))?;
                let request = BookingRequest {
                    principal: caller.principal,
                    court_id,
                    span,
                };
                let reservation = engine.create_booking(request).await.map_err(booking_err)?;
                Ok(vec![self.booking_rows(vec![reservation])])
            }
            Command::SelectBookings { filter } => {
                let reservations = match filter {
                    BookingFilter::Id(id) => {
                        vec![engine.reservation_for(&caller, id).await.map_err(booking_err)?]
                    }
                    BookingFilter::Court(court_id) => {
                        engine.get_court(court_id).await.map_err(booking_err)?;
                        engine.court_reservations(&caller, court_id).await.map_err(booking_err)?
                    }
                };
                Ok(vec![self.booking_rows(reservations)])
            }
            Command::ConfirmPayment { booking_id } => {
                let reservation = engine.confirm_payment(&caller, booking_id).await.map_err(booking_err)?;
                Ok(vec![self.booking_rows(vec![reservation])])
            }
            Command::CancelBooking { id } => {
                let reservation = engine.cancel_booking(&caller, id).await.map_err(booking_err)?;
                Ok(vec![self.booking_rows(vec![reservation])])
            }
        }
    }

    fn booking_rows(&self, reservations: Vec<Reservation>) -> Response {
        let offset = self.engine.policy().window.utc_offset;
        let schema = Arc::new(booking_schema());
        let rows: Vec<PgWireResult<_>> = reservations
            .iter()
            .map(|r| encode_booking(&schema, r, offset))
            .collect();
        Response::Query(QueryResponse::new(schema, stream::iter(rows)))
    }
}

/// Parse both ends of a requested booking; ordering is checked before a
/// `Span` exists so a reversed window is a client error, not a panic.
fn booking_span(start: &str, end: &str) -> Result<Span, WindowError> {
    let start = validate::parse_instant(start)?;
    let end = validate::parse_instant(end)?;
    if start >= end {
        return Err(WindowError::NotOrdered);
    }
    Ok(Span::new(start, end))
}

fn encode_booking(
    schema: &Arc<Vec<FieldInfo>>,
    r: &Reservation,
    offset: FixedOffset,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.principal)?;
    encoder.encode_field(&r.court_id.to_string())?;
    encoder.encode_field(&clock::format_instant(r.span.start, offset))?;
    encoder.encode_field(&clock::format_instant(r.span.end, offset))?;
    encoder.encode_field(&r.duration_minutes)?;
    encoder.encode_field(&r.unit_price)?;
    encoder.encode_field(&r.total_price)?;
    encoder.encode_field(&r.status.as_str().to_string())?;
    encoder.encode_field(&clock::format_instant(r.expires_at, offset))?;
    encoder.encode_field(&clock::format_instant(r.created_at, offset))?;
    Ok(encoder.take_row())
}

fn court_rows(courts: Vec<Court>) -> Response {
    let schema = Arc::new(court_schema());
    let rows: Vec<PgWireResult<_>> = courts
        .iter()
        .map(|court| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&court.id.to_string())?;
            encoder.encode_field(&court.name)?;
            encoder.encode_field(&court.kind.as_str().to_string())?;
            encoder.encode_field(&court.unit_price)?;
            encoder.encode_field(&court.active)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn court_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("name"),
        text("kind"),
        int8("unit_price"),
        FieldInfo::new("active".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn available_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("name"),
        text("kind"),
        int8("unit_price"),
        int8("duration_minutes"),
        int8("total_price"),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("principal"),
        text("court_id"),
        text("start_time"),
        text("end_time"),
        int8("duration_minutes"),
        int8("unit_price"),
        int8("total_price"),
        text("status"),
        text("expires_at"),
        text("created_at"),
    ]
}

/// Row shape a statement will produce, judged from its text so that
/// statements with unbound `$n` placeholders can be described.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("AVAILABLE_COURTS") {
        available_schema()
    } else if upper.contains("BOOKINGS") || upper.contains("PAYMENTS") {
        booking_schema()
    } else if upper.contains("SELECT") && upper.contains("COURTS") {
        court_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for CourtsideHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let caller = self.caller(client)?;
        self.run(caller, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CourtsideQueryParser;

#[async_trait]
impl QueryParser for CourtsideQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CourtsideHandler {
    type Statement = String;
    type QueryParser = CourtsideQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let caller = self.caller(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run(caller, &sql).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, portal.parameters.as_slice())
}

/// Inline bound text parameters as quoted literals in one left-to-right
/// pass. Placeholders inside quoted literals, and text that came from a
/// bound value, are left alone.
fn inline_params<T: AsRef<[u8]>>(sql: &str, params: &[Option<T>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_literal = false;
    while let Some(c) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
        }
        if c != '$' || in_literal {
            out.push(c);
            continue;
        }
        let mut digits = String::new();
        while let Some(&d) = chars.peek()
            && d.is_ascii_digit()
        {
            digits.push(d);
            chars.next();
        }
        let index = digits.parse::<usize>().ok().filter(|n| (1..=params.len()).contains(n));
        match index {
            Some(n) => match &params[n - 1] {
                Some(bytes) => {
                    let text = String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''");
                    out.push('\'');
                    out.push_str(&text);
                    out.push('\'');
                }
                None => out.push_str("NULL"),
            },
            None => {
                out.push('$');
                out.push_str(&digits);
            }
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CourtsideFactory {
    handler: Arc<CourtsideHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<CourtsideAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CourtsideFactory {
    pub fn new(engine: Arc<BookingEngine>, access: Access) -> Self {
        Self {
            handler: Arc::new(CourtsideHandler::new(
                engine,
                access.admins,
                access.booking_limit,
            )),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                CourtsideAuthSource::new(access.password, access.users),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CourtsideFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<CourtsideFactory>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each booking failure.
fn sqlstate(e: &BookingError) -> &'static str {
    match e {
        BookingError::CourtNotFound(_) | BookingError::ReservationNotFound(_) => "P0002",
        BookingError::SlotConflict { .. } => "23P01",
        BookingError::InvalidWindow(_) => "22023",
        BookingError::InvalidTransition { .. } | BookingError::Expired(_) => "55000",
        BookingError::LimitExceeded(_) => "54000",
        BookingError::StoreUnavailable(_) => "58030",
        BookingError::AlreadyExists(_) => "23505",
        BookingError::Forbidden(_) => "42501",
    }
}

fn booking_err(e: BookingError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn rate_limited_err(retry_after: Duration) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "53400".into(),
        format!(
            "too many booking attempts, retry in {}s",
            retry_after.as_secs().max(1)
        ),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM courts"), 0);
        assert_eq!(count_params("INSERT INTO bookings VALUES ($1, $2, $3)"), 3);
        assert_eq!(count_params("SELECT * FROM bookings WHERE id = $12"), 12);
        assert_eq!(count_params("SELECT '$' FROM courts"), 0);
    }

    #[test]
    fn inlines_each_placeholder_once() {
        let params = [Some("$2 or '1'"), Some("x"), None];
        assert_eq!(
            inline_params("SELECT $1, $2, $3, $4, '$1'", &params),
            "SELECT '$2 or ''1''', 'x', NULL, $4, '$1'"
        );
        let many: Vec<Option<String>> = (1..=10).map(|i| Some(i.to_string())).collect();
        assert_eq!(inline_params("VALUES ($10, $1)", &many), "VALUES ('10', '1')");
    }

    #[test]
    fn schema_follows_statement_target() {
        assert_eq!(
            result_schema("SELECT * FROM available_courts WHERE date = $1").len(),
            6
        );
        assert_eq!(result_schema("insert into bookings values ($1, $2, $3)").len(), 11);
        assert_eq!(result_schema("INSERT INTO payments VALUES ($1)").len(), 11);
        assert_eq!(result_schema("SELECT * FROM courts").len(), 5);
        assert!(result_schema("INSERT INTO courts VALUES ($1, $2, $3, $4)").is_empty());
    }

    #[test]
    fn booking_span_rejects_reversed_window() {
        assert!(matches!(
            booking_span("2000", "1000"),
            Err(WindowError::NotOrdered)
        ));
        assert!(matches!(
            booking_span("1000", "1000"),
            Err(WindowError::NotOrdered)
        ));
        assert!(matches!(
            booking_span("yesterday", "1000"),
            Err(WindowError::BadInstant(_))
        ));
        let span = booking_span("2024-01-01T06:00:00+07:00", "2024-01-01T08:00:00+07:00").unwrap();
        assert_eq!(span.duration_ms(), 120 * MINUTE_MS);
    }

    #[test]
    fn sqlstates_distinguish_failures() {
        let id = Ulid::new();
        assert_eq!(
            sqlstate(&BookingError::SlotConflict {
                court_id: id,
                span: Span::new(0, 1)
            }),
            "23P01"
        );
        assert_eq!(sqlstate(&BookingError::CourtNotFound(id)), "P0002");
        assert_eq!(sqlstate(&BookingError::Expired(id)), "55000");
        assert_eq!(
            sqlstate(&BookingError::InvalidWindow(WindowError::NotOrdered)),
            "22023"
        );
        assert_eq!(sqlstate(&BookingError::StoreUnavailable("down".into())), "58030");
        assert_eq!(sqlstate(&BookingError::Forbidden("courts")), "42501");
    }
}
