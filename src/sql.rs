use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// One statement of the booking dialect, already type-checked.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertService {
        service: Service,
    },
    InsertEmployee {
        id: Ulid,
        code: String,
        kind: EmployeeKind,
        specialization: Option<String>,
        supervisor_id: Option<Ulid>,
    },
    UpdateEmployee {
        id: Ulid,
        patch: EmployeePatch,
    },
    InsertAppointment {
        id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
        /// Checked against the slot set by the engine, so a bad value
        /// surfaces as an invalid-slot error rather than a syntax error.
        slot: String,
        vehicle: Vehicle,
        notes: Option<String>,
        priority: Priority,
    },
    UpdateAppointment {
        id: Ulid,
        update: AppointmentUpdate,
    },
    DeleteAppointment {
        id: Ulid,
    },
    InsertAssignment {
        new: NewAssignment,
    },
    UpdateAssignment {
        id: Ulid,
        update: AssignmentUpdate,
    },
    SelectAvailableSlots {
        date: NaiveDate,
    },
    SelectDailyDetail {
        date: NaiveDate,
    },
    SelectDailySummary {
        date: NaiveDate,
    },
    SelectAppointments {
        filter: AppointmentFilter,
    },
    SelectAvailableWork,
    SelectAssignments {
        filter: AssignmentFilter,
    },
    SelectEmployees {
        id: Option<Ulid>,
    },
    SelectWorkload {
        supervisor_id: Ulid,
    },
}

const SERVICE_COLUMNS: &[&str] = &["id", "name", "duration_minutes", "active"];
const EMPLOYEE_COLUMNS: &[&str] = &["id", "code", "kind", "specialization", "supervisor_id"];
const APPOINTMENT_COLUMNS: &[&str] = &[
    "id",
    "service_id",
    "date",
    "slot",
    "vehicle_make",
    "vehicle_model",
    "vehicle_year",
    "vehicle_plate",
    "notes",
    "priority",
];
const ASSIGNMENT_COLUMNS: &[&str] = &[
    "id",
    "assignee_id",
    "title",
    "description",
    "priority",
    "due_at",
    "appointment_id",
];

const EMPLOYEE_UPDATABLE: &[&str] = &["status", "active", "supervisor_id", "rating"];
const APPOINTMENT_UPDATABLE: &[&str] = &["status", "assigned_employee", "priority", "work_notes"];
const ASSIGNMENT_UPDATABLE: &[&str] = &["status", "progress", "employee_notes", "supervisor_notes"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [one] => one,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Name of the relation a SELECT reads, without interpreting its filters.
/// Used to describe result columns before parameters are bound.
pub fn select_table(sql: &str) -> Option<String> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    let Statement::Query(query) = stmts.first()? else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

// ── Writes ────────────────────────────────────────────────────

/// Column name → value for a single INSERT row or UPDATE SET list.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn build(table: &'static str, allowed: &[&str], cells: Vec<(String, &'a Expr)>) -> Result<Self, SqlError> {
        for (col, _) in &cells {
            if !allowed.contains(&col.as_str()) {
                return Err(SqlError::UnknownColumn(table, col.clone()));
            }
        }
        Ok(Self { table, cells })
    }

    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.cells.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
    }

    fn required(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        match self.get(col) {
            Some(expr) if !is_null(expr) => Ok(expr),
            _ => Err(SqlError::MissingColumn(self.table, col)),
        }
    }

    /// Absent and NULL both read as `None`.
    fn optional<T>(&self, col: &str, parse: impl Fn(&Expr) -> Result<T, SqlError>) -> Result<Option<T>, SqlError> {
        match self.get(col) {
            Some(expr) if !is_null(expr) => parse(expr).map(Some),
            _ => Ok(None),
        }
    }
}

fn insert_row<'a>(insert: &'a ast::Insert, table: &'static str, columns: &[&str]) -> Result<Row<'a>, SqlError> {
    let values = extract_insert_values(insert)?;
    let names: Vec<String> = if insert.columns.is_empty() {
        if values.len() > columns.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        columns.iter().map(|c| c.to_string()).collect()
    } else {
        if insert.columns.len() != values.len() {
            return Err(SqlError::WrongArity(table, insert.columns.len(), values.len()));
        }
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    Row::build(table, columns, names.into_iter().zip(values.iter()).collect())
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "services" => {
            let row = insert_row(insert, "services", SERVICE_COLUMNS)?;
            let minutes = row.optional("duration_minutes", parse_i64)?;
            Ok(Command::InsertService {
                service: Service {
                    id: parse_ulid(row.required("id")?)?,
                    name: parse_string(row.required("name")?)?,
                    estimated_duration: minutes.map(|m| m.saturating_mul(60_000)),
                    active: row.optional("active", parse_bool)?.unwrap_or(true),
                },
            })
        }
        "employees" => {
            let row = insert_row(insert, "employees", EMPLOYEE_COLUMNS)?;
            Ok(Command::InsertEmployee {
                id: parse_ulid(row.required("id")?)?,
                code: parse_string(row.required("code")?)?,
                kind: row
                    .optional("kind", |e| parse_keyword(e, "employee kind", EmployeeKind::parse))?
                    .unwrap_or_default(),
                specialization: row.optional("specialization", parse_string)?,
                supervisor_id: row.optional("supervisor_id", parse_ulid)?,
            })
        }
        "appointments" => {
            let row = insert_row(insert, "appointments", APPOINTMENT_COLUMNS)?;
            Ok(Command::InsertAppointment {
                id: parse_ulid(row.required("id")?)?,
                service_id: parse_ulid(row.required("service_id")?)?,
                date: parse_date(row.required("date")?)?,
                slot: parse_string(row.required("slot")?)?,
                vehicle: Vehicle {
                    make: parse_string(row.required("vehicle_make")?)?,
                    model: parse_string(row.required("vehicle_model")?)?,
                    year: parse_u16(row.required("vehicle_year")?)?,
                    plate: parse_string(row.required("vehicle_plate")?)?,
                },
                notes: row.optional("notes", parse_string)?,
                priority: row
                    .optional("priority", |e| parse_keyword(e, "priority", Priority::parse))?
                    .unwrap_or_default(),
            })
        }
        "assignments" => {
            let row = insert_row(insert, "assignments", ASSIGNMENT_COLUMNS)?;
            Ok(Command::InsertAssignment {
                new: NewAssignment {
                    id: parse_ulid(row.required("id")?)?,
                    assigned_to: parse_ulid(row.required("assignee_id")?)?,
                    title: parse_string(row.required("title")?)?,
                    description: row.optional("description", parse_string)?.unwrap_or_default(),
                    priority: row
                        .optional("priority", |e| parse_keyword(e, "priority", Priority::parse))?
                        .unwrap_or_default(),
                    due_at: parse_i64(row.required("due_at")?)?,
                    appointment_id: row.optional("appointment_id", parse_ulid)?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    let mut cells = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        cells.push((col, &a.value));
    }

    match table.as_str() {
        "employees" => {
            let row = Row::build("employees", EMPLOYEE_UPDATABLE, cells)?;
            let supervisor_id = match row.get("supervisor_id") {
                Some(expr) => Some(parse_ulid_or_null(expr)?),
                None => None,
            };
            Ok(Command::UpdateEmployee {
                id,
                patch: EmployeePatch {
                    status: row.optional("status", |e| parse_keyword(e, "employee status", EmployeeStatus::parse))?,
                    active: row.optional("active", parse_bool)?,
                    supervisor_id,
                    rating_centi: row.optional("rating", parse_rating)?,
                },
            })
        }
        "appointments" => {
            let row = Row::build("appointments", APPOINTMENT_UPDATABLE, cells)?;
            Ok(Command::UpdateAppointment {
                id,
                update: AppointmentUpdate {
                    status: row.optional("status", |e| parse_keyword(e, "status", AppointmentStatus::parse))?,
                    assigned_employee: row.optional("assigned_employee", parse_ulid)?,
                    priority: row.optional("priority", |e| parse_keyword(e, "priority", Priority::parse))?,
                    work_notes: row.optional("work_notes", parse_string)?,
                },
            })
        }
        "assignments" => {
            let row = Row::build("assignments", ASSIGNMENT_UPDATABLE, cells)?;
            Ok(Command::UpdateAssignment {
                id,
                update: AssignmentUpdate {
                    status: row.optional("status", |e| parse_keyword(e, "assignment status", TaskStatus::parse))?,
                    progress: row.optional("progress", parse_i64)?,
                    employee_notes: row.optional("employee_notes", parse_string)?,
                    supervisor_notes: row.optional("supervisor_notes", parse_string)?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;
    match table.as_str() {
        "appointments" => Ok(Command::DeleteAppointment { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Reads ─────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let first = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&first.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let find = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| *e);

    match table.as_str() {
        "available_slots" | "daily_detail" | "daily_summary" => {
            let date = parse_date(find("date").ok_or(SqlError::MissingFilter("date"))?)?;
            Ok(match table.as_str() {
                "available_slots" => Command::SelectAvailableSlots { date },
                "daily_detail" => Command::SelectDailyDetail { date },
                _ => Command::SelectDailySummary { date },
            })
        }
        "appointments" => {
            let filter = match filters.as_slice() {
                [] => AppointmentFilter::All,
                [(col, expr)] => match col.as_str() {
                    "id" => AppointmentFilter::Id(parse_ulid(expr)?),
                    "customer_id" => AppointmentFilter::Customer(parse_ulid(expr)?),
                    "assigned_employee" => AppointmentFilter::AssignedTo(parse_ulid(expr)?),
                    "date" => AppointmentFilter::Date(parse_date(expr)?),
                    "status" => AppointmentFilter::Status(parse_keyword(expr, "status", AppointmentStatus::parse)?),
                    _ => return Err(SqlError::UnknownColumn("appointments", col.clone())),
                },
                _ => return Err(SqlError::Unsupported("more than one appointment filter".into())),
            };
            Ok(Command::SelectAppointments { filter })
        }
        "available_work" => Ok(Command::SelectAvailableWork),
        "assignments" => {
            let filter = match filters.as_slice() {
                [] => AssignmentFilter::All,
                [(col, expr)] => match col.as_str() {
                    "id" => AssignmentFilter::Id(parse_ulid(expr)?),
                    "assignee_id" => AssignmentFilter::AssignedTo(parse_ulid(expr)?),
                    "assigned_by" => AssignmentFilter::AssignedBy(parse_ulid(expr)?),
                    "appointment_id" => AssignmentFilter::Appointment(parse_ulid(expr)?),
                    _ => return Err(SqlError::UnknownColumn("assignments", col.clone())),
                },
                _ => return Err(SqlError::Unsupported("more than one assignment filter".into())),
            };
            Ok(Command::SelectAssignments { filter })
        }
        "employees" => Ok(Command::SelectEmployees {
            id: find("id").map(parse_ulid).transpose()?,
        }),
        "workload" => Ok(Command::SelectWorkload {
            supervisor_id: parse_ulid(find("supervisor_id").ok_or(SqlError::MissingFilter("supervisor_id"))?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y` into column/value pairs. Other operators are rejected.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left).ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            out.push((col, &**right));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── AST helpers ───────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    let first = tables
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into())),
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<&Vec<Expr>, SqlError> {
    let body = insert.source.as_ref().ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

// ── Literal parsing ───────────────────────────────────────────

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) { Ok(None) } else { parse_ulid(expr).map(Some) }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_keyword<T>(expr: &Expr, what: &str, parse: fn(&str) -> Option<T>) -> Result<T, SqlError> {
    let s = parse_string(expr)?;
    parse(&s.to_lowercase()).ok_or_else(|| SqlError::Parse(format!("bad {what}: {s}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => {
            s.parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
        }
        Some(other) => Err(SqlError::Parse(format!("expected number, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_u16(expr: &Expr) -> Result<u16, SqlError> {
    let v = parse_i64(expr)?;
    u16::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

/// `4.5` → 450 hundredths.
fn parse_rating(expr: &Expr) -> Result<u16, SqlError> {
    let raw = match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s.clone(),
        _ => return Err(SqlError::Parse(format!("expected rating, got {expr}"))),
    };
    let rating: f64 = raw
        .parse()
        .map_err(|e| SqlError::Parse(format!("bad rating {raw:?}: {e}")))?;
    if !rating.is_finite() || rating < 0.0 || rating > f64::from(u16::MAX) / 100.0 {
        return Err(SqlError::Parse(format!("bad rating {raw:?}")));
    }
    Ok((rating * 100.0).round() as u16)
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: {c} is required"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
