use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::SlotGuardAuthSource;
use crate::calendar::format_time_of_day;
use crate::engine::{EngineError, ReservationRequest};
use crate::model::*;
use crate::notify::Notification;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::{Tenant, TenantManager};

const CHANNEL_PREFIX: &str = "provider_";

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls_acceptor: Option<TlsAcceptor>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let factory = Arc::new(SlotGuardFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls_acceptor, factory).await?;
    Ok(())
}

/// Per-connection query handler. Holds this session's LISTEN subscriptions;
/// pending notifications are written out at every statement boundary.
pub struct SlotGuardHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotGuardQueryParser>,
    subscriptions: Mutex<HashMap<Ulid, broadcast::Receiver<Notification>>>,
}

impl SlotGuardHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotGuardQueryParser),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_tenant<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Tenant>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse, execute and account one statement, then flush notifications.
    async fn run<C>(&self, client: &mut C, query: &str, format: &Format) -> PgWireResult<Response>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let tenant = self.resolve_tenant(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);

        let started = Instant::now();
        let result = self.execute_command(&tenant, cmd, format).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);

        self.flush_notifications(client).await?;
        result
    }

    async fn execute_command(
        &self,
        tenant: &Tenant,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        let engine = &tenant.engine;
        match cmd {
            Command::InsertService {
                id,
                provider_id,
                duration_minutes,
                price,
            } => {
                engine
                    .register_service(Service {
                        id,
                        provider_id,
                        duration_minutes,
                        price,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteService { id } => {
                engine.remove_service(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertRecurringWindow {
                id,
                provider_id,
                week_day,
                from,
                to,
            } => {
                let window = AvailabilityWindow {
                    id,
                    ..AvailabilityWindow::recurring(provider_id, week_day, from, to)
                };
                engine.add_window(window).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertOnceWindow {
                id,
                provider_id,
                start,
                end,
                active,
            } => {
                let span = Span::checked(start, end)
                    .ok_or_else(|| engine_err(EngineError::InvalidWindow("start must be before end")))?;
                let window = AvailabilityWindow {
                    id,
                    active,
                    ..AvailabilityWindow::once(provider_id, span)
                };
                engine.add_window(window).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteWindow { id } => {
                engine.remove_window(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertBooking {
                id,
                provider_id,
                service_id,
                customer_id,
                start,
                notes,
            } => {
                let request = ReservationRequest {
                    id,
                    provider_id,
                    service_id,
                    customer_id,
                    start,
                    notes,
                };
                engine.reserve(request).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertTransition {
                booking_id,
                status,
                actor,
            } => {
                engine
                    .transition(booking_id, status, actor)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectServices { provider_id } => {
                let services = engine.list_services(provider_id);
                let schema = Arc::new(schema(SERVICE_COLUMNS, format));
                let rows: Vec<PgWireResult<_>> = services
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.provider_id.to_string())?;
                        encoder.encode_field(&(s.duration_minutes as i32))?;
                        encoder.encode_field(&s.price)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectWindows {
                provider_id,
                week_day,
                date,
            } => {
                let windows = engine.list_windows(provider_id, week_day, date).await;
                let schema = Arc::new(schema(WINDOW_COLUMNS, format));
                let rows: Vec<PgWireResult<_>> = windows
                    .into_iter()
                    .map(|w| encode_window(&schema, &w))
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectBookings { party } => {
                let bookings = engine.list_bookings(party).await;
                let schema = Arc::new(schema(BOOKING_COLUMNS, format));
                let rows: Vec<PgWireResult<_>> = bookings
                    .into_iter()
                    .map(|b| encode_booking(&schema, &b))
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectSlots {
                service_id,
                date,
                timezone,
                customer_id,
            } => {
                let ctx = CallerContext {
                    customer_id,
                    timezone,
                };
                let slots = engine
                    .available_slots(&ctx, service_id, date)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(schema(SLOT_COLUMNS, format));
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.time)?;
                        encoder.encode_field(&slot.start)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::Listen { channel } => {
                let provider_id = parse_channel(&channel)?;
                self.lock_subscriptions()
                    .entry(provider_id)
                    .or_insert_with(|| tenant.hub.subscribe(provider_id));
                debug!(%provider_id, "listening");
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                let provider_id = parse_channel(&channel)?;
                self.lock_subscriptions().remove(&provider_id);
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.lock_subscriptions().clear();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, HashMap<Ulid, broadcast::Receiver<Notification>>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take everything queued on this session's subscriptions.
    fn drain_pending(&self) -> Vec<Notification> {
        let mut pending = Vec::new();
        self.lock_subscriptions().retain(|provider_id, rx| loop {
            match rx.try_recv() {
                Ok(notification) => pending.push(notification),
                Err(TryRecvError::Empty) => break true,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(%provider_id, skipped, "listener lagged, notifications dropped");
                }
                Err(TryRecvError::Closed) => break false,
            }
        });
        pending
    }

    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        for notification in self.drain_pending() {
            let payload = notification
                .to_json()
                .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
            let channel = format!("{CHANNEL_PREFIX}{}", notification.booking.provider_id);
            let message = NotificationResponse::new(std::process::id() as i32, channel, payload);
            client
                .send(PgWireBackendMessage::NotificationResponse(message))
                .await?;
        }
        Ok(())
    }
}

fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    let provider_id = channel.strip_prefix(CHANNEL_PREFIX).ok_or_else(|| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("invalid channel: {channel} (expected {CHANNEL_PREFIX}{{id}})"),
        )))
    })?;
    Ulid::from_string(provider_id).map_err(|e| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!("bad ULID in channel: {e}"),
        )))
    })
}

// ── Result schemas ───────────────────────────────────────────────

const SERVICE_COLUMNS: &[(&str, Type)] = &[
    ("id", Type::VARCHAR),
    ("provider_id", Type::VARCHAR),
    ("duration_minutes", Type::INT4),
    ("price", Type::INT8),
];

const WINDOW_COLUMNS: &[(&str, Type)] = &[
    ("id", Type::VARCHAR),
    ("provider_id", Type::VARCHAR),
    ("kind", Type::VARCHAR),
    ("week_day", Type::INT2),
    ("start_time", Type::VARCHAR),
    ("end_time", Type::VARCHAR),
    ("start", Type::INT8),
    ("end", Type::INT8),
    ("active", Type::BOOL),
];

const BOOKING_COLUMNS: &[(&str, Type)] = &[
    ("id", Type::VARCHAR),
    ("provider_id", Type::VARCHAR),
    ("service_id", Type::VARCHAR),
    ("customer_id", Type::VARCHAR),
    ("start", Type::INT8),
    ("end", Type::INT8),
    ("status", Type::VARCHAR),
    ("slot_id", Type::VARCHAR),
    ("notes", Type::VARCHAR),
    ("version", Type::INT8),
];

const SLOT_COLUMNS: &[(&str, Type)] = &[("time", Type::VARCHAR), ("start", Type::INT8)];

/// Field descriptions in the result format the client asked for.
fn schema(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(idx, (name, ty))| {
            FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(idx))
        })
        .collect()
}

/// Result columns of a SELECT, from the table named after FROM.
/// Works on unbound statements, so `$n` placeholders are fine.
fn select_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let mut words = sql.split_whitespace();
    if !words.next().is_some_and(|w| w.eq_ignore_ascii_case("select")) {
        return vec![];
    }
    let table = words
        .skip_while(|w| !w.eq_ignore_ascii_case("from"))
        .nth(1)
        .map(|t| t.trim_end_matches(';').to_lowercase());
    let columns = match table.as_deref() {
        Some("services") => SERVICE_COLUMNS,
        Some("windows") => WINDOW_COLUMNS,
        Some("bookings") => BOOKING_COLUMNS,
        Some("slots") => SLOT_COLUMNS,
        _ => return vec![],
    };
    schema(columns, format)
}

fn encode_window(
    schema: &Arc<Vec<FieldInfo>>,
    w: &AvailabilityWindow,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&w.id.to_string())?;
    encoder.encode_field(&w.provider_id.to_string())?;
    match w.schedule {
        WindowSchedule::Recurring { week_day, from, to } => {
            encoder.encode_field(&"recurring")?;
            encoder.encode_field(&Some(week_day as i16))?;
            encoder.encode_field(&Some(format_time_of_day(from)))?;
            encoder.encode_field(&Some(format_time_of_day(to)))?;
            encoder.encode_field(&None::<i64>)?;
            encoder.encode_field(&None::<i64>)?;
        }
        WindowSchedule::Once { span } => {
            encoder.encode_field(&"once")?;
            encoder.encode_field(&None::<i16>)?;
            encoder.encode_field(&None::<String>)?;
            encoder.encode_field(&None::<String>)?;
            encoder.encode_field(&Some(span.start))?;
            encoder.encode_field(&Some(span.end))?;
        }
    }
    encoder.encode_field(&w.active)?;
    Ok(encoder.take_row())
}

fn encode_booking(
    schema: &Arc<Vec<FieldInfo>>,
    b: &Booking,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.provider_id.to_string())?;
    encoder.encode_field(&b.service_id.to_string())?;
    encoder.encode_field(&b.customer_id.to_string())?;
    encoder.encode_field(&b.start)?;
    encoder.encode_field(&b.end)?;
    encoder.encode_field(&b.status.as_str())?;
    encoder.encode_field(&b.slot_id.map(|id| id.to_string()))?;
    encoder.encode_field(&b.notes)?;
    encoder.encode_field(&(b.version as i64))?;
    Ok(encoder.take_row())
}

#[async_trait]
impl SimpleQueryHandler for SlotGuardHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotGuardQueryParser;

#[async_trait]
impl QueryParser for SlotGuardQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(select_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotGuardHandler {
    type Statement = String;
    type QueryParser = SlotGuardQueryParser;

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
        let sql = substitute_params(portal);
        self.run(client, &sql, &portal.result_column_format).await
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
            select_schema(&target.statement, &Format::UnifiedText),
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
        Ok(DescribePortalResponse::new(select_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotGuardFactory {
    handler: Arc<SlotGuardHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotGuardAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotGuardFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotGuardAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotGuardHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotGuardFactory {
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

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE reported for each engine failure.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SlotOccupied(_) | EngineError::CustomerDoubleBooked(_) => "23P01",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::StorageContention(_) => "40001",
        EngineError::NotPermitted { .. } => "42501",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::NotFound(_) | EngineError::ServiceNotFound(_) => "P0002",
        EngineError::InvalidTimezone(_)
        | EngineError::ServiceProviderMismatch { .. }
        | EngineError::PastBooking
        | EngineError::TooFarInFuture
        | EngineError::SelfBookingForbidden
        | EngineError::OutsideAvailability
        | EngineError::IllegalTransition { .. }
        | EngineError::InvalidWindow(_)
        | EngineError::InvalidService(_) => "22023",
        EngineError::Storage(_) => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
