use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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

use crate::audit::TimelineEvent;
use crate::auth::SlotbookAuthSource;
use crate::engine::{Engine, EngineError, ReRentPolicy};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SlotbookFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

pub struct SlotbookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    /// The startup `user` parameter names the acting account (email or id).
    fn session_login<C: ClientInfo>(client: &C) -> String {
        client.metadata().get("user").cloned().unwrap_or_default()
    }

    async fn run(&self, login: &str, sql_text: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql_text).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(login, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result.map_err(engine_err)
    }

    async fn execute_command(&self, login: &str, cmd: Command) -> Result<Response, EngineError> {
        let engine = &self.engine;

        // Registration is the one statement an unknown login may run.
        let actor = match engine.resolve_actor(login).await {
            Ok(actor) => actor,
            Err(_) => {
                return match cmd {
                    Command::InsertUser { id, email, name, role } => {
                        engine.register_user(None, login, id, email, name, role).await?;
                        Ok(inserted(1))
                    }
                    _ => Err(EngineError::Forbidden("session login is not a registered user")),
                };
            }
        };

        match cmd {
            Command::InsertUser { id, email, name, role } => {
                engine.register_user(Some(&actor), login, id, email, name, role).await?;
                Ok(inserted(1))
            }
            Command::InsertResource(resource) => {
                engine.create_resource(&actor, resource).await?;
                Ok(inserted(1))
            }
            Command::UpdateResource { id, patch } => {
                engine.update_resource(&actor, &id, patch).await?;
                Ok(updated(1))
            }
            Command::SelectResources => Ok(rows(resource_schema(), engine.list_resources().await, encode_resource)),
            Command::UpdateUserRole { id, role } => {
                engine.change_role(&actor, id, role).await?;
                Ok(updated(1))
            }
            Command::UpdateCreditLimit { id, limit } => {
                engine.set_credit_limit(&actor, id, limit).await?;
                Ok(updated(1))
            }
            Command::SelectUsers { id } => {
                let users = match id {
                    Some(id) => vec![engine.user_info(&actor, id).await?],
                    None => engine.list_users(&actor).await,
                };
                Ok(rows(user_schema(), users, encode_user))
            }
            Command::InsertDeposit { user_id, amount } => {
                engine.deposit(&actor, user_id, amount).await?;
                Ok(inserted(1))
            }
            Command::InsertSubscription { user_id, hours, plan } => {
                engine.assign_subscription(&actor, user_id, hours, plan).await?;
                Ok(inserted(1))
            }
            Command::InsertDiscount { user_id, percent, reason } => {
                engine.set_personal_discount(&actor, user_id, percent, reason).await?;
                Ok(inserted(1))
            }
            Command::FreezeSubscription { user_id, frozen } => {
                engine.set_subscription_frozen(&actor, user_id, frozen).await?;
                Ok(updated(1))
            }
            Command::InsertBooking(request) => {
                engine.create_booking(&actor, request).await?;
                Ok(inserted(1))
            }
            Command::CancelBooking { id, reason } => {
                let outcome = engine.cancel_booking(&actor, id, reason).await?;
                // Zero rows: it was already cancelled.
                Ok(updated(usize::from(outcome.refund.is_some())))
            }
            Command::SetReRentListed { id, listed } => {
                engine.set_re_rent_listed(&actor, id, listed).await?;
                Ok(updated(1))
            }
            Command::SelectBookings(filter) => {
                let bookings = engine.list_bookings(&actor, &filter).await?;
                Ok(rows(booking_schema(), bookings, encode_booking))
            }
            Command::SelectAvailability {
                resource_id,
                date,
                min_duration,
                include_re_rent,
            } => {
                let policy = if include_re_rent {
                    ReRentPolicy::Skip
                } else {
                    ReRentPolicy::Block
                };
                let slots = engine.free_slots(&resource_id, date, min_duration, policy).await?;
                Ok(rows(availability_schema(), slots, |enc, span| {
                    enc.encode_field(&resource_id)?;
                    enc.encode_field(&date.to_string())?;
                    enc.encode_field(&format_hhmm(span.start))?;
                    enc.encode_field(&format_hhmm(span.end))?;
                    enc.encode_field(&i64::from(span.duration()))
                }))
            }
            Command::SelectSlotCheck {
                resource_id,
                date,
                start_time,
                duration,
                exclude_id,
            } => {
                let check = engine
                    .is_available(&resource_id, date, start_time, duration, exclude_id, ReRentPolicy::Block)
                    .await?;
                Ok(rows(slot_check_schema(), vec![check], |enc, check| {
                    enc.encode_field(&check.available)?;
                    enc.encode_field(&check.conflict.as_ref().map(|c| c.booking_id.to_string()))?;
                    enc.encode_field(&check.conflict.as_ref().map(|c| c.description.clone()))
                }))
            }
            Command::InsertWaitlist {
                id,
                resource_id,
                date,
                start,
                end,
            } => {
                engine.join_waitlist(&actor, id, &resource_id, date, start, end).await?;
                Ok(inserted(1))
            }
            Command::DeleteWaitlist { id } => {
                engine.leave_waitlist(&actor, id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectWaitlist => Ok(rows(waitlist_schema(), engine.list_waitlist(&actor), encode_waitlist)),
            Command::SelectTimeline(filter) => {
                let events = engine.list_timeline(&actor, &filter)?;
                Ok(rows(timeline_schema(), events, encode_timeline))
            }
        }
    }
}

fn inserted(n: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(n))
}

fn updated(n: usize) -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(n))
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let data: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(data)))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

// Money and hours travel as exact decimal text.
fn resource_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("location", Type::VARCHAR),
        field("hourly_rate", Type::VARCHAR),
        field("capacity", Type::INT8),
        field("min_booking_hours", Type::INT8),
        field("active", Type::BOOL),
    ]
}

fn encode_resource(enc: &mut DataRowEncoder, r: &Resource) -> PgWireResult<()> {
    enc.encode_field(&r.id)?;
    enc.encode_field(&r.name)?;
    enc.encode_field(&r.kind.to_string())?;
    enc.encode_field(&r.location)?;
    enc.encode_field(&r.hourly_rate.to_string())?;
    enc.encode_field(&i64::from(r.capacity))?;
    enc.encode_field(&i64::from(r.min_booking_hours))?;
    enc.encode_field(&r.active)
}

fn user_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("email", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("role", Type::VARCHAR),
        field("balance", Type::VARCHAR),
        field("credit_limit", Type::VARCHAR),
        field("subscription_hours", Type::VARCHAR),
        field("subscription_frozen", Type::BOOL),
        field("subscription_plan", Type::VARCHAR),
        field("personal_discount_percent", Type::INT8),
    ]
}

fn encode_user(enc: &mut DataRowEncoder, u: &User) -> PgWireResult<()> {
    let sub = u.subscription.as_ref();
    enc.encode_field(&u.id.to_string())?;
    enc.encode_field(&u.email)?;
    enc.encode_field(&u.name)?;
    enc.encode_field(&u.role.to_string())?;
    enc.encode_field(&u.balance.to_string())?;
    enc.encode_field(&u.credit_limit.to_string())?;
    enc.encode_field(&sub.map(|s| s.remaining.to_string()))?;
    enc.encode_field(&sub.map(|s| s.frozen))?;
    enc.encode_field(&sub.and_then(|s| s.plan.clone()))?;
    enc.encode_field(&i64::from(u.personal_discount_percent))
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("duration", Type::INT8),
        field("status", Type::VARCHAR),
        field("payment_method", Type::VARCHAR),
        field("final_price", Type::VARCHAR),
        field("hours_deducted", Type::VARCHAR),
        field("format", Type::VARCHAR),
        field("re_rent_listed", Type::BOOL),
        field("cancellation_reason", Type::VARCHAR),
        field("cancelled_by", Type::VARCHAR),
        field("calendar_event_id", Type::VARCHAR),
    ]
}

fn encode_booking(enc: &mut DataRowEncoder, b: &Booking) -> PgWireResult<()> {
    enc.encode_field(&b.id.to_string())?;
    enc.encode_field(&b.resource_id)?;
    enc.encode_field(&b.user_id.to_string())?;
    enc.encode_field(&b.date.to_string())?;
    enc.encode_field(&format_hhmm(b.span.start))?;
    enc.encode_field(&format_hhmm(b.span.end))?;
    enc.encode_field(&i64::from(b.duration()))?;
    enc.encode_field(&b.status.to_string())?;
    enc.encode_field(&b.payment_method.to_string())?;
    enc.encode_field(&b.final_price.to_string())?;
    enc.encode_field(&b.hours_deducted.map(|h| h.to_string()))?;
    enc.encode_field(&b.format.to_string())?;
    enc.encode_field(&b.re_rent_listed)?;
    enc.encode_field(&b.cancellation_reason)?;
    enc.encode_field(&b.cancelled_by)?;
    enc.encode_field(&b.calendar_event_id)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("duration", Type::INT8),
    ]
}

fn slot_check_schema() -> Vec<FieldInfo> {
    vec![
        field("available", Type::BOOL),
        field("conflict_booking_id", Type::VARCHAR),
        field("conflict", Type::VARCHAR),
    ]
}

fn waitlist_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("status", Type::VARCHAR),
    ]
}

fn encode_waitlist(enc: &mut DataRowEncoder, w: &WaitlistEntry) -> PgWireResult<()> {
    enc.encode_field(&w.id.to_string())?;
    enc.encode_field(&w.user_id.to_string())?;
    enc.encode_field(&w.resource_id)?;
    enc.encode_field(&w.date.to_string())?;
    enc.encode_field(&format_hhmm(w.span.start))?;
    enc.encode_field(&format_hhmm(w.span.end))?;
    enc.encode_field(&w.status.to_string())
}

fn timeline_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("timestamp", Type::INT8),
        field("actor_id", Type::VARCHAR),
        field("actor_role", Type::VARCHAR),
        field("target_id", Type::VARCHAR),
        field("target_type", Type::VARCHAR),
        field("event_type", Type::VARCHAR),
        field("description", Type::VARCHAR),
        field("metadata", Type::VARCHAR),
    ]
}

fn encode_timeline(enc: &mut DataRowEncoder, e: &TimelineEvent) -> PgWireResult<()> {
    enc.encode_field(&e.id.to_string())?;
    enc.encode_field(&e.timestamp)?;
    enc.encode_field(&e.actor_id.to_string())?;
    enc.encode_field(&e.actor_role.to_string())?;
    enc.encode_field(&e.target_id)?;
    enc.encode_field(&e.target_type)?;
    enc.encode_field(&e.event_type)?;
    enc.encode_field(&e.description)?;
    enc.encode_field(&serde_json::Value::Object(e.metadata.clone()).to_string())
}

/// Result columns for a statement, or none for anything that is not a known SELECT.
fn result_schema(sql_text: &str) -> Vec<FieldInfo> {
    match sql::select_table(sql_text) {
        Some("resources") => resource_schema(),
        Some("users") => user_schema(),
        Some("bookings") => booking_schema(),
        Some("availability") => availability_schema(),
        Some("slot_check") => slot_check_schema(),
        Some("waitlist") => waitlist_schema(),
        Some("timeline") => timeline_schema(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let login = Self::session_login(client);
        Ok(vec![self.run(&login, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

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
        let login = Self::session_login(client);
        let sql_text = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&login, &sql_text).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql_text: &str) -> usize {
    sql_text
        .split('$')
        .skip(1)
        .filter_map(|rest| {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<usize>().ok()
        })
        .max()
        .unwrap_or(0)
}

/// Inline bound parameters as quoted text literals. Highest index first so
/// `$1` never clobbers the prefix of `$10`.
fn substitute_params<B: AsRef<[u8]>>(sql_text: &str, params: &[Option<B>]) -> String {
    let mut out = sql_text.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let value = match param {
            Some(raw) => format!("'{}'", String::from_utf8_lossy(raw.as_ref()).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        out = out.replace(&format!("${}", i + 1), &value);
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(SlotbookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SlotbookAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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

// ── Error mapping ────────────────────────────────────────────────

pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SlotConflict(_) => "23P01",
        EngineError::InsufficientFunds { .. } => "P0002",
        EngineError::InsufficientHours { .. } => "P0003",
        EngineError::NotFound(_) => "02000",
        EngineError::Forbidden(_) => "42501",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Invalid(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
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
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), "42601".into(), e.to_string())))
}
