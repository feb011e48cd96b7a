use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
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
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast};

use crate::auth::VacancyAuthSource;
use crate::engine::{Engine, NewReservation};
use crate::limits::MAX_POLL_WAIT_MS;
use crate::model::*;
use crate::notify::{Notice, Topic};
use crate::sql::{self, Command, ReservationFilter};
use crate::tenant::TenantManager;

pub struct VacancyHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<VacancyQueryParser>,
    /// LISTEN subscriptions of this connection, keyed by channel name.
    /// Drained by `SELECT * FROM notices` long-polls.
    subscriptions: Mutex<HashMap<String, broadcast::Receiver<Notice>>>,
}

impl VacancyHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(VacancyQueryParser),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
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

    async fn execute_command(
        &self,
        engine: &Arc<Engine>,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertProperty { id, name } => {
                engine.register_property(id, name).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteProperty { id } => {
                engine.remove_property(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertRoom {
                id,
                property_id,
                name,
                capacity,
                nightly_rate,
            } => {
                engine
                    .register_room(id, property_id, name, capacity, nightly_rate)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateRoom {
                id,
                name,
                capacity,
                nightly_rate,
            } => {
                // Absent assignments keep the current values.
                let room = engine
                    .get_room(&id)
                    .ok_or_else(|| engine_err(crate::engine::EngineError::NotFound(id)))?;
                let (cur_name, cur_capacity, cur_rate) = {
                    let guard = room.read().await;
                    (guard.name.clone(), guard.capacity, guard.nightly_rate)
                };
                engine
                    .update_room(
                        id,
                        name.or(cur_name),
                        capacity.unwrap_or(cur_capacity),
                        nightly_rate.unwrap_or(cur_rate),
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteRoom { id } => {
                engine.retire_room(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertReservation {
                guest_id,
                room_id,
                check_in,
                check_out,
                guests,
                notes,
            } => {
                let reservation = engine
                    .create_reservation(NewReservation {
                        guest_id,
                        room_id,
                        stay: StaySpan {
                            check_in,
                            check_out,
                        },
                        guests,
                        notes,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![reservation_row_response(&[reservation])?])
            }
            Command::CancelReservation {
                id,
                guest_id,
                reason,
            } => {
                let updated = engine
                    .cancel_reservation(id, guest_id, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![reservation_row_response(&[updated])?])
            }
            Command::SetReservationStatus { id, status, reason } => {
                let updated = engine
                    .set_reservation_status(id, status, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![reservation_row_response(&[updated])?])
            }
            Command::SelectProperties => {
                let schema = Arc::new(property_schema());
                let rows: Vec<PgWireResult<DataRow>> = engine
                    .list_properties()
                    .into_iter()
                    .map(|p| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&p.id.to_string())?;
                        encoder.encode_field(&p.name)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectRooms { property_id } => {
                let schema = Arc::new(room_schema());
                let rows: Vec<PgWireResult<DataRow>> = engine
                    .list_rooms(property_id)
                    .await
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.property_id.to_string())?;
                        encoder.encode_field(&r.name)?;
                        encoder.encode_field(&(r.capacity as i32))?;
                        encoder.encode_field(&r.nightly_rate)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectReservations { filter } => {
                let reservations = match filter {
                    ReservationFilter::ById(id) => {
                        vec![engine.get_reservation(&id).await.map_err(engine_err)?]
                    }
                    ReservationFilter::ByCode(code) => vec![
                        engine
                            .get_reservation_by_code(&code)
                            .await
                            .map_err(engine_err)?,
                    ],
                    ReservationFilter::ByGuest(guest_id) => {
                        engine.reservations_for_guest(guest_id).await
                    }
                    ReservationFilter::ByRoom(room_id) => {
                        engine.reservations_for_room(room_id).await.map_err(engine_err)?
                    }
                    ReservationFilter::ByRoomInRange {
                        room_id,
                        check_in,
                        check_out,
                    } => engine
                        .reservations_in_range(
                            room_id,
                            StaySpan {
                                check_in,
                                check_out,
                            },
                        )
                        .await
                        .map_err(engine_err)?,
                };
                Ok(vec![reservation_row_response(&reservations)?])
            }
            Command::SelectAvailability {
                room_id,
                check_in,
                check_out,
            } => {
                let report = engine
                    .availability_for_room(
                        room_id,
                        StaySpan {
                            check_in,
                            check_out,
                        },
                    )
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let room_ids = report
                    .available_rooms
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                let rows: Vec<PgWireResult<DataRow>> = vec![{
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&report.property_id.to_string())?;
                    encoder.encode_field(&(report.available as i32))?;
                    encoder.encode_field(&(report.total as i32))?;
                    encoder.encode_field(&room_ids)?;
                    Ok(encoder.take_row())
                }];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectFreeNights {
                room_id,
                check_in,
                check_out,
            } => {
                let spans = engine
                    .free_nights(
                        room_id,
                        StaySpan {
                            check_in,
                            check_out,
                        },
                    )
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(free_nights_schema());
                let rid = room_id.to_string();
                let rows: Vec<PgWireResult<DataRow>> = spans
                    .into_iter()
                    .map(|span| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid)?;
                        encoder.encode_field(&span.check_in.to_string())?;
                        encoder.encode_field(&span.check_out.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::RefreshAvailability {
                room_id,
                check_in,
                check_out,
            } => {
                engine
                    .refresh_availability(
                        room_id,
                        StaySpan {
                            check_in,
                            check_out,
                        },
                    )
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("REFRESH"))])
            }
            Command::Listen { channel } => {
                let topic = Topic::parse_channel(&channel).ok_or_else(|| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!(
                            "invalid channel: {channel} (expected room_/property_/guest_{{id}})"
                        ),
                    )))
                })?;
                let receiver = engine.notify.subscribe(topic);
                self.subscriptions.lock().await.insert(channel, receiver);
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                let mut subs = self.subscriptions.lock().await;
                match channel {
                    Some(name) => {
                        subs.remove(&name);
                    }
                    None => subs.clear(),
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::PollNotices { wait_ms } => {
                let notices = self.poll_notices(wait_ms).await;
                let schema = Arc::new(notices_schema());
                let rows: Vec<PgWireResult<DataRow>> = notices
                    .into_iter()
                    .map(|(channel, notice)| {
                        let payload = serde_json::to_string(&notice).map_err(|e| {
                            PgWireError::ApiError(Box::new(e))
                        })?;
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&channel)?;
                        encoder.encode_field(&payload)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
        }
    }

    /// Drain this connection's subscriptions, waiting up to `wait_ms` for the
    /// first notice. Lagged receivers silently skip what they missed —
    /// delivery is at-most-once by contract.
    async fn poll_notices(&self, wait_ms: i64) -> Vec<(String, Notice)> {
        let wait = Duration::from_millis(wait_ms.clamp(0, MAX_POLL_WAIT_MS) as u64);
        let deadline = Instant::now() + wait;

        loop {
            let mut out = Vec::new();
            {
                let mut subs = self.subscriptions.lock().await;
                subs.retain(|channel, rx| {
                    loop {
                        match rx.try_recv() {
                            Ok(notice) => out.push((channel.clone(), notice)),
                            Err(broadcast::error::TryRecvError::Empty) => return true,
                            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                            Err(broadcast::error::TryRecvError::Closed) => return false,
                        }
                    }
                });
            }
            if !out.is_empty() || Instant::now() >= deadline {
                return out;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

// ── Response schemas ─────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int4_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT4, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn property_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("name")]
}

fn room_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("property_id"),
        text_field("name"),
        int4_field("capacity"),
        int8_field("nightly_rate"),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("code"),
        text_field("guest_id"),
        text_field("room_id"),
        text_field("check_in"),
        text_field("check_out"),
        int4_field("guests"),
        int8_field("nightly_rate"),
        int8_field("total_price"),
        text_field("status"),
        text_field("notes"),
        text_field("cancel_reason"),
        int8_field("created_at"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("property_id"),
        int4_field("available"),
        int4_field("total"),
        text_field("available_rooms"),
    ]
}

fn free_nights_schema() -> Vec<FieldInfo> {
    vec![
        text_field("room_id"),
        text_field("check_in"),
        text_field("check_out"),
    ]
}

fn notices_schema() -> Vec<FieldInfo> {
    vec![text_field("channel"), text_field("payload")]
}

fn reservation_row_response(reservations: &[Reservation]) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<DataRow>> = reservations
        .iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.code)?;
            encoder.encode_field(&r.guest_id.to_string())?;
            encoder.encode_field(&r.room_id.to_string())?;
            encoder.encode_field(&r.stay.check_in.to_string())?;
            encoder.encode_field(&r.stay.check_out.to_string())?;
            encoder.encode_field(&(r.guests as i32))?;
            encoder.encode_field(&r.nightly_rate)?;
            encoder.encode_field(&r.total_price)?;
            encoder.encode_field(&r.status.as_str())?;
            encoder.encode_field(&r.notes)?;
            encoder.encode_field(&r.cancel_reason)?;
            encoder.encode_field(&r.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

#[async_trait]
impl SimpleQueryHandler for VacancyHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = crate::observability::command_label(&cmd);
        let start = std::time::Instant::now();
        let result = self.execute_command(&engine, cmd).await;
        metrics::histogram!(crate::observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        metrics::counter!(
            crate::observability::QUERIES_TOTAL,
            "command" => label,
            "status" => if result.is_ok() { "ok" } else { "error" }
        )
        .increment(1);
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct VacancyQueryParser;

#[async_trait]
impl QueryParser for VacancyQueryParser {
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
        Ok(statement_schema(stmt))
    }
}

/// Best-effort schema guess from the statement text, for Describe.
fn statement_schema(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    if upper.contains("RESERVATIONS") {
        reservation_schema()
    } else if upper.contains("FREE_NIGHTS") {
        free_nights_schema()
    } else if upper.contains("REFRESH_AVAILABILITY") {
        vec![]
    } else if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("NOTICES") {
        notices_schema()
    } else if upper.contains("SELECT") && upper.contains("ROOMS") {
        room_schema()
    } else if upper.contains("SELECT") && upper.contains("PROPERTIES") {
        property_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl ExtendedQueryHandler for VacancyHandler {
    type Statement = String;
    type QueryParser = VacancyQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(&engine, cmd).await?;
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
            statement_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
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
                && n > max {
                    max = n;
                }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text
/// format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
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

pub struct VacancyFactory {
    handler: Arc<VacancyHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<VacancyAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl VacancyFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = VacancyAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(VacancyHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for VacancyFactory {
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

/// Serve one connection. The factory — and with it the LISTEN subscription
/// state — is scoped to this connection.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls_acceptor: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(VacancyFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls_acceptor, factory).await
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
