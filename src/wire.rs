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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::auth::{self, IdentityError, SlotbayAuthSource};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, AUTH_FAILURES_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

// ── Result shapes ────────────────────────────────────────────────

type Columns = &'static [(&'static str, Type)];

const AVAILABLE_SLOT_COLUMNS: Columns = &[("slot", Type::VARCHAR), ("label", Type::VARCHAR)];

const DAILY_DETAIL_COLUMNS: Columns = &[
    ("slot", Type::VARCHAR),
    ("label", Type::VARCHAR),
    ("occupied", Type::BOOL),
    ("appointment_id", Type::VARCHAR),
    ("customer_id", Type::VARCHAR),
    ("service", Type::VARCHAR),
    ("status", Type::VARCHAR),
    ("vehicle", Type::VARCHAR),
    ("assigned_employee", Type::VARCHAR),
];

const DAILY_SUMMARY_COLUMNS: Columns = &[
    ("date", Type::VARCHAR),
    ("total", Type::INT8),
    ("occupied", Type::INT8),
    ("available", Type::INT8),
];

const APPOINTMENT_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("customer_id", Type::VARCHAR),
    ("service_id", Type::VARCHAR),
    ("date", Type::VARCHAR),
    ("slot", Type::VARCHAR),
    ("status", Type::VARCHAR),
    ("priority", Type::VARCHAR),
    ("assigned_employee", Type::VARCHAR),
    ("vehicle_make", Type::VARCHAR),
    ("vehicle_model", Type::VARCHAR),
    ("vehicle_year", Type::INT8),
    ("vehicle_plate", Type::VARCHAR),
    ("notes", Type::VARCHAR),
    ("work_notes", Type::VARCHAR),
    ("created_at", Type::INT8),
    ("work_started_at", Type::INT8),
    ("work_completed_at", Type::INT8),
    ("estimated_completion", Type::INT8),
    ("overdue", Type::BOOL),
];

const ASSIGNMENT_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("assigned_by", Type::VARCHAR),
    ("assignee_id", Type::VARCHAR),
    ("appointment_id", Type::VARCHAR),
    ("title", Type::VARCHAR),
    ("description", Type::VARCHAR),
    ("priority", Type::VARCHAR),
    ("status", Type::VARCHAR),
    ("progress", Type::INT8),
    ("assigned_at", Type::INT8),
    ("due_at", Type::INT8),
    ("accepted_at", Type::INT8),
    ("started_at", Type::INT8),
    ("completed_at", Type::INT8),
    ("employee_notes", Type::VARCHAR),
    ("supervisor_notes", Type::VARCHAR),
    ("overdue", Type::BOOL),
];

const EMPLOYEE_COLUMNS: Columns = &[
    ("id", Type::VARCHAR),
    ("code", Type::VARCHAR),
    ("kind", Type::VARCHAR),
    ("specialization", Type::VARCHAR),
    ("active", Type::BOOL),
    ("status", Type::VARCHAR),
    ("supervisor_id", Type::VARCHAR),
    ("rating", Type::VARCHAR),
    ("pending_tasks", Type::INT8),
    ("tasks_completed", Type::INT8),
    ("avg_completion_ms", Type::INT8),
];

const WORKLOAD_COLUMNS: Columns = &[
    ("employee_id", Type::VARCHAR),
    ("code", Type::VARCHAR),
    ("status", Type::VARCHAR),
    ("active_appointments", Type::INT8),
    ("open_assignments", Type::INT8),
    ("overdue_assignments", Type::INT8),
];

fn table_columns(table: &str) -> Option<Columns> {
    Some(match table {
        "available_slots" => AVAILABLE_SLOT_COLUMNS,
        "daily_detail" => DAILY_DETAIL_COLUMNS,
        "daily_summary" => DAILY_SUMMARY_COLUMNS,
        "appointments" | "available_work" => APPOINTMENT_COLUMNS,
        "assignments" => ASSIGNMENT_COLUMNS,
        "employees" => EMPLOYEE_COLUMNS,
        "workload" => WORKLOAD_COLUMNS,
        _ => return None,
    })
}

/// Result columns of a statement that has not been bound yet.
fn statement_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    sql::select_table(sql)
        .and_then(|t| table_columns(&t))
        .map(|cols| schema(cols, format))
        .unwrap_or_default()
}

fn schema(columns: Columns, format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(i)))
        .collect()
}

enum Cell {
    Text(Option<String>),
    Int(Option<i64>),
    Bool(bool),
}

fn text(v: impl ToString) -> Cell {
    Cell::Text(Some(v.to_string()))
}

fn opt_text(v: Option<impl ToString>) -> Cell {
    Cell::Text(v.map(|v| v.to_string()))
}

fn int(v: impl Into<i64>) -> Cell {
    Cell::Int(Some(v.into()))
}

fn count(v: usize) -> Cell {
    Cell::Int(Some(v as i64))
}

fn rows_response(columns: Columns, format: &Format, rows: Vec<Vec<Cell>>) -> Response {
    let schema = Arc::new(schema(columns, format));
    let rows: Vec<PgWireResult<_>> = rows
        .into_iter()
        .map(|row| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            for cell in row {
                match cell {
                    Cell::Text(v) => encoder.encode_field(&v)?,
                    Cell::Int(v) => encoder.encode_field(&v)?,
                    Cell::Bool(v) => encoder.encode_field(&v)?,
                }
            }
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn appointment_row(a: &Appointment, now: Ms) -> Vec<Cell> {
    vec![
        text(a.id),
        text(a.customer_id),
        text(a.service_id),
        text(a.key.date),
        text(a.key.slot.code()),
        text(a.status.as_str()),
        text(a.priority.as_str()),
        opt_text(a.assigned_employee),
        text(&a.vehicle.make),
        text(&a.vehicle.model),
        int(a.vehicle.year),
        text(&a.vehicle.plate),
        opt_text(a.notes.as_ref()),
        opt_text(a.work_notes.as_ref()),
        int(a.created_at),
        Cell::Int(a.work_started_at),
        Cell::Int(a.work_completed_at),
        Cell::Int(a.estimated_completion),
        Cell::Bool(a.is_overdue(now)),
    ]
}

fn assignment_row(t: &TaskAssignment, now: Ms) -> Vec<Cell> {
    vec![
        text(t.id),
        text(t.assigned_by),
        text(t.assigned_to),
        opt_text(t.appointment_id),
        text(&t.title),
        text(&t.description),
        text(t.priority.as_str()),
        text(t.status.as_str()),
        int(t.progress),
        int(t.assigned_at),
        int(t.due_at),
        Cell::Int(t.accepted_at),
        Cell::Int(t.started_at),
        Cell::Int(t.completed_at),
        opt_text(t.employee_notes.as_ref()),
        opt_text(t.supervisor_notes.as_ref()),
        Cell::Bool(t.is_overdue(now)),
    ]
}

fn employee_row(p: &EmployeeProfile) -> Vec<Cell> {
    let e = &p.employee;
    vec![
        text(e.id),
        text(&e.code),
        text(e.kind.as_str()),
        opt_text(e.specialization.as_ref()),
        Cell::Bool(e.active),
        text(e.status.as_str()),
        opt_text(e.supervisor_id),
        text(e.rating_display()),
        count(p.pending_tasks),
        count(p.tasks_completed),
        Cell::Int(p.avg_completion_ms),
    ]
}

fn slot_detail_row(d: &SlotDetail) -> Vec<Cell> {
    let o = d.occupant.as_ref();
    vec![
        text(d.slot.code()),
        text(d.slot.label()),
        Cell::Bool(d.occupied),
        opt_text(o.map(|o| o.appointment_id)),
        opt_text(o.map(|o| o.customer_id)),
        opt_text(o.map(|o| &o.service)),
        opt_text(o.map(|o| o.status.as_str())),
        opt_text(o.map(|o| &o.vehicle)),
        opt_text(o.and_then(|o| o.assigned_employee)),
    ]
}

fn workload_row(w: &WorkloadRow) -> Vec<Cell> {
    vec![
        text(w.employee_id),
        text(&w.code),
        text(w.status.as_str()),
        count(w.active_appointments),
        count(w.open_assignments),
        count(w.overdue_assignments),
    ]
}

// ── Handler ──────────────────────────────────────────────────────

pub struct SlotbayHandler {
    engine: Arc<Engine>,
    admin_user: String,
    query_parser: Arc<SlotbayQueryParser>,
}

impl SlotbayHandler {
    pub fn new(engine: Arc<Engine>, admin_user: String) -> Self {
        Self {
            engine,
            admin_user,
            query_parser: Arc::new(SlotbayQueryParser),
        }
    }

    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let user = client.metadata().get("user").map(String::as_str).unwrap_or_default();
        auth::resolve_actor(user, &self.admin_user, &self.engine.directory).map_err(|e| {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            warn!(user, "caller refused: {e}");
            identity_err(e)
        })
    }

    async fn execute(&self, actor: &Actor, sql: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(actor, cmd, format).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        result.map_err(|e| {
            debug!(command = label, actor = %actor.id, "statement failed: {e}");
            engine_err(e)
        })
    }

    async fn execute_command(&self, actor: &Actor, cmd: Command, format: &Format) -> Result<Response, EngineError> {
        let engine = &self.engine;
        let now = chrono::Utc::now().timestamp_millis();
        match cmd {
            Command::InsertService { service } => {
                engine.register_service(actor, service).await?;
                Ok(inserted())
            }
            Command::InsertEmployee {
                id,
                code,
                kind,
                specialization,
                supervisor_id,
            } => {
                let mut employee = Employee::new(id, code, kind);
                employee.specialization = specialization;
                employee.supervisor_id = supervisor_id;
                engine.register_employee(actor, employee).await?;
                Ok(inserted())
            }
            Command::UpdateEmployee { id, patch } => {
                engine.update_employee(actor, id, patch).await?;
                Ok(updated())
            }
            Command::InsertAppointment {
                id,
                service_id,
                date,
                slot,
                vehicle,
                notes,
                priority,
            } => {
                let slot = TimeSlot::parse(&slot).ok_or(EngineError::InvalidSlot(slot))?;
                let req = BookingRequest {
                    id,
                    service_id,
                    key: SlotKey::new(date, slot),
                    vehicle,
                    notes,
                    priority,
                };
                engine.book_appointment(actor, req).await?;
                Ok(inserted())
            }
            Command::UpdateAppointment { id, update } => {
                engine.update_appointment(actor, id, update).await?;
                Ok(updated())
            }
            Command::DeleteAppointment { id } => {
                engine.cancel_appointment(actor, id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertAssignment { new } => {
                engine.create_assignment(actor, new).await?;
                Ok(inserted())
            }
            Command::UpdateAssignment { id, update } => {
                engine.update_assignment(actor, id, update).await?;
                Ok(updated())
            }
            Command::SelectAvailableSlots { date } => {
                let rows = engine
                    .available_slots(date)
                    .await
                    .into_iter()
                    .map(|s| vec![text(s.code()), text(s.label())])
                    .collect();
                Ok(rows_response(AVAILABLE_SLOT_COLUMNS, format, rows))
            }
            Command::SelectDailyDetail { date } => {
                let detail = engine.daily_detail(date).await;
                let rows = detail.slots.iter().map(slot_detail_row).collect();
                Ok(rows_response(DAILY_DETAIL_COLUMNS, format, rows))
            }
            Command::SelectDailySummary { date } => {
                let d = engine.daily_summary(date).await;
                let row = vec![text(d.date), count(d.total), count(d.occupied), count(d.available)];
                Ok(rows_response(DAILY_SUMMARY_COLUMNS, format, vec![row]))
            }
            Command::SelectAppointments { filter } => {
                let rows = engine
                    .list_appointments(actor, filter)
                    .await
                    .iter()
                    .map(|a| appointment_row(a, now))
                    .collect();
                Ok(rows_response(APPOINTMENT_COLUMNS, format, rows))
            }
            Command::SelectAvailableWork => {
                if !actor.is_staff() && !actor.is_admin() {
                    return Err(EngineError::PermissionDenied("available work is staff-only"));
                }
                let rows = engine
                    .available_work()
                    .await
                    .iter()
                    .map(|a| appointment_row(a, now))
                    .collect();
                Ok(rows_response(APPOINTMENT_COLUMNS, format, rows))
            }
            Command::SelectAssignments { filter } => {
                let rows = engine
                    .list_assignments(actor, filter)
                    .await?
                    .iter()
                    .map(|t| assignment_row(t, now))
                    .collect();
                Ok(rows_response(ASSIGNMENT_COLUMNS, format, rows))
            }
            Command::SelectEmployees { id } => {
                if actor.role == Role::Customer {
                    return Err(EngineError::PermissionDenied("the employee directory is staff-only"));
                }
                let rows = engine.employee_profiles(id).await.iter().map(employee_row).collect();
                Ok(rows_response(EMPLOYEE_COLUMNS, format, rows))
            }
            Command::SelectWorkload { supervisor_id } => {
                let rows = engine
                    .workload(actor, supervisor_id)
                    .await?
                    .iter()
                    .map(workload_row)
                    .collect();
                Ok(rows_response(WORKLOAD_COLUMNS, format, rows))
            }
        }
    }
}

fn inserted() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

fn updated() -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(1))
}

#[async_trait]
impl SimpleQueryHandler for SlotbayHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.resolve_actor(client)?;
        let response = self.execute(&actor, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbayQueryParser;

#[async_trait]
impl QueryParser for SlotbayQueryParser {
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

    fn get_result_schema(&self, stmt: &String, column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbayHandler {
    type Statement = String;
    type QueryParser = SlotbayQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(&self, client: &mut C, portal: &Portal<Self::Statement>, _max_rows: usize) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.resolve_actor(client)?;
        let sql = substitute_params(portal);
        self.execute(&actor, &sql, &portal.result_column_format).await
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
            statement_schema(&target.statement, &Format::UnifiedText),
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
            &target.result_column_format,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        if let Ok(n) = sql[start..end].parse::<usize>() {
            max = max.max(n);
        }
        i = end.max(start);
    }
    max
}

/// Inline bound text parameters as quoted literals in one left-to-right pass
/// over the statement. Inserted values are never rescanned, and `$N` inside
/// a quoted literal of the statement is left alone.
fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                let index = sql[start..end].parse::<usize>().ok().and_then(|n| n.checked_sub(1));
                match index.and_then(|n| params.get(n)) {
                    Some(param) => {
                        out.push_str(&sql[copied..i]);
                        match param {
                            Some(value) => {
                                out.push('\'');
                                out.push_str(&String::from_utf8_lossy(value.as_ref()).replace('\'', "''"));
                                out.push('\'');
                            }
                            None => out.push_str("NULL"),
                        }
                        copied = end;
                        i = end;
                    }
                    None => i = end.max(start),
                }
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[copied..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbayFactory {
    handler: Arc<SlotbayHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SlotbayAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbayFactory {
    pub fn new(engine: Arc<Engine>, password: String, admin_user: String) -> Self {
        let auth_source = SlotbayAuthSource::new(password, admin_user.clone());
        Self {
            handler: Arc::new(SlotbayHandler::new(engine, admin_user)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbayFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    admin_user: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = SlotbayFactory::new(engine, password, admin_user);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SlotOccupied(_) => "23P01",
        EngineError::PastDate(_)
        | EngineError::HorizonExceeded { .. }
        | EngineError::InvalidSlot(_)
        | EngineError::LimitExceeded(_) => "22023",
        EngineError::InvalidTransition { .. }
        | EngineError::NotAssigned(_)
        | EngineError::NotCancellable { .. }
        | EngineError::EmployeeInactive(_)
        | EngineError::ServiceInactive(_) => "55000",
        EngineError::PermissionDenied(_) => "42501",
        EngineError::NotFound(_) => "02000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::CycleDetected(_) | EngineError::InvalidSupervisor(_) => "23514",
        EngineError::WalError(_) => "58030",
    }
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

fn identity_err(e: IdentityError) -> PgWireError {
    let code = match e {
        IdentityError::Malformed(_) => "28000",
        IdentityError::Inactive(_) => "42501",
    };
    user_error(code, e.to_string())
}
