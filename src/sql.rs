use chrono::NaiveDate;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::{Cents, ReservationStatus};

/// Parsed command from SQL input. Values are positional per table, the
/// column list is decorative.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProperty {
        id: Ulid,
        name: String,
    },
    DeleteProperty {
        id: Ulid,
    },
    InsertRoom {
        id: Ulid,
        property_id: Ulid,
        name: Option<String>,
        capacity: u32,
        nightly_rate: Cents,
    },
    /// Absent assignments keep the room's current value.
    UpdateRoom {
        id: Ulid,
        name: Option<String>,
        capacity: Option<u32>,
        nightly_rate: Option<Cents>,
    },
    DeleteRoom {
        id: Ulid,
    },
    InsertReservation {
        guest_id: Ulid,
        room_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
        guests: u32,
        notes: Option<String>,
    },
    /// Owner-scoped: `WHERE id = .. AND guest_id = ..` with status=cancelled.
    CancelReservation {
        id: Ulid,
        guest_id: Ulid,
        reason: Option<String>,
    },
    /// Administrative: `WHERE id = ..` only.
    SetReservationStatus {
        id: Ulid,
        status: ReservationStatus,
        reason: Option<String>,
    },
    SelectProperties,
    SelectRooms {
        property_id: Option<Ulid>,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    SelectAvailability {
        room_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    SelectFreeNights {
        room_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    RefreshAvailability {
        room_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
    Listen {
        channel: String,
    },
    /// `None` means `UNLISTEN *`.
    Unlisten {
        channel: Option<String>,
    },
    /// Long-poll registered subscriptions for queued notices.
    PollNotices {
        wait_ms: i64,
    },
}

#[derive(Debug, PartialEq)]
pub enum ReservationFilter {
    ById(Ulid),
    ByCode(String),
    ByGuest(Ulid),
    ByRoom(Ulid),
    ByRoomInRange {
        room_id: Ulid,
        check_in: NaiveDate,
        check_out: NaiveDate,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("UNLISTEN") {
        let rest = trimmed[8..].trim().trim_matches(';').trim();
        let channel = match rest {
            "" | "*" => None,
            name => Some(name.to_string()),
        };
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "properties" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("properties", 2, values.len()));
            }
            Ok(Command::InsertProperty {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
            })
        }
        "rooms" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("rooms", 2, values.len()));
            }
            let name = if values.len() >= 3 {
                parse_string_or_null(&values[2])?
            } else {
                None
            };
            let capacity = if values.len() >= 4 {
                parse_u32(&values[3])?
            } else {
                1
            };
            let nightly_rate = if values.len() >= 5 {
                parse_i64(&values[4])?
            } else {
                0
            };
            Ok(Command::InsertRoom {
                id: parse_ulid(&values[0])?,
                property_id: parse_ulid(&values[1])?,
                name,
                capacity,
                nightly_rate,
            })
        }
        "reservations" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("reservations", 4, values.len()));
            }
            let guests = if values.len() >= 5 {
                parse_u32(&values[4])?
            } else {
                1
            };
            let notes = if values.len() >= 6 {
                parse_string_or_null(&values[5])?
            } else {
                None
            };
            Ok(Command::InsertReservation {
                guest_id: parse_ulid(&values[0])?,
                room_id: parse_ulid(&values[1])?,
                check_in: parse_date(&values[2])?,
                check_out: parse_date(&values[3])?,
                guests,
                notes,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "properties" => Ok(Command::DeleteProperty { id }),
        "rooms" => Ok(Command::DeleteRoom { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    match table.as_str() {
        "rooms" => {
            let id = extract_where_id(selection)?;
            let (mut name, mut capacity, mut nightly_rate) = (None, None, None);
            for assignment in assignments {
                let col = assignment_column(assignment)?;
                match col.as_str() {
                    "name" => name = Some(parse_string(&assignment.value)?),
                    "capacity" => capacity = Some(parse_u32(&assignment.value)?),
                    "nightly_rate" => nightly_rate = Some(parse_i64(&assignment.value)?),
                    other => return Err(SqlError::Parse(format!("unknown column: {other}"))),
                }
            }
            Ok(Command::UpdateRoom {
                id,
                name,
                capacity,
                nightly_rate,
            })
        }
        "reservations" => {
            let (mut status, mut reason) = (None, None);
            for assignment in assignments {
                let col = assignment_column(assignment)?;
                match col.as_str() {
                    "status" => {
                        let s = parse_string(&assignment.value)?;
                        status = Some(
                            ReservationStatus::parse(&s)
                                .ok_or_else(|| SqlError::Parse(format!("bad status: {s}")))?,
                        );
                    }
                    "reason" => reason = parse_string_or_null(&assignment.value)?,
                    other => return Err(SqlError::Parse(format!("unknown column: {other}"))),
                }
            }
            let status = status.ok_or(SqlError::MissingFilter("status"))?;

            let filters = collect_filters(selection)?;
            let id = filters
                .eq_ulid("id")?
                .ok_or(SqlError::MissingFilter("id"))?;
            match filters.eq_ulid("guest_id")? {
                // Owner path: only ever a cancellation
                Some(guest_id) => {
                    if status != ReservationStatus::Cancelled {
                        return Err(SqlError::Parse(
                            "owner-scoped updates may only set status = 'cancelled'".into(),
                        ));
                    }
                    Ok(Command::CancelReservation { id, guest_id, reason })
                }
                None => Ok(Command::SetReservationStatus { id, status, reason }),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = collect_filters(&select.selection)?;

    match table.as_str() {
        "properties" => Ok(Command::SelectProperties),
        "rooms" => Ok(Command::SelectRooms {
            property_id: filters.eq_ulid("property_id")?,
        }),
        "reservations" => {
            let filter = if let Some(id) = filters.eq_ulid("id")? {
                ReservationFilter::ById(id)
            } else if let Some(code) = filters.eq_string("code")? {
                ReservationFilter::ByCode(code)
            } else if let Some(guest_id) = filters.eq_ulid("guest_id")? {
                ReservationFilter::ByGuest(guest_id)
            } else if let Some(room_id) = filters.eq_ulid("room_id")? {
                match (filters.ge_date("check_in")?, filters.le_date("check_out")?) {
                    (Some(check_in), Some(check_out)) => ReservationFilter::ByRoomInRange {
                        room_id,
                        check_in,
                        check_out,
                    },
                    (None, None) => ReservationFilter::ByRoom(room_id),
                    _ => return Err(SqlError::MissingFilter("check_in/check_out")),
                }
            } else {
                return Err(SqlError::MissingFilter("id, code, guest_id or room_id"));
            };
            Ok(Command::SelectReservations { filter })
        }
        "availability" | "free_nights" | "refresh_availability" => {
            let room_id = filters
                .eq_ulid("room_id")?
                .ok_or(SqlError::MissingFilter("room_id"))?;
            let check_in = filters
                .ge_date("check_in")?
                .ok_or(SqlError::MissingFilter("check_in"))?;
            let check_out = filters
                .le_date("check_out")?
                .ok_or(SqlError::MissingFilter("check_out"))?;
            Ok(match table.as_str() {
                "availability" => Command::SelectAvailability {
                    room_id,
                    check_in,
                    check_out,
                },
                "free_nights" => Command::SelectFreeNights {
                    room_id,
                    check_in,
                    check_out,
                },
                _ => Command::RefreshAvailability {
                    room_id,
                    check_in,
                    check_out,
                },
            })
        }
        "notices" => {
            let wait_ms = filters.le_i64("wait")?.unwrap_or(0);
            Ok(Command::PollNotices { wait_ms })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE-clause filters ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum FilterOp {
    Eq,
    Ge,
    Le,
}

struct Filters<'a>(Vec<(String, FilterOp, &'a Expr)>);

impl<'a> Filters<'a> {
    fn find(&self, col: &str, op: FilterOp) -> Option<&'a Expr> {
        self.0
            .iter()
            .find(|(c, o, _)| c == col && *o == op)
            .map(|(_, _, e)| *e)
    }

    fn eq_ulid(&self, col: &str) -> Result<Option<Ulid>, SqlError> {
        self.find(col, FilterOp::Eq).map(parse_ulid).transpose()
    }

    fn eq_string(&self, col: &str) -> Result<Option<String>, SqlError> {
        self.find(col, FilterOp::Eq).map(parse_string).transpose()
    }

    fn ge_date(&self, col: &str) -> Result<Option<NaiveDate>, SqlError> {
        self.find(col, FilterOp::Ge).map(parse_date).transpose()
    }

    fn le_date(&self, col: &str) -> Result<Option<NaiveDate>, SqlError> {
        self.find(col, FilterOp::Le).map(parse_date).transpose()
    }

    fn le_i64(&self, col: &str) -> Result<Option<i64>, SqlError> {
        self.find(col, FilterOp::Le).map(parse_i64).transpose()
    }
}

fn collect_filters(selection: &Option<Expr>) -> Result<Filters<'_>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        walk_filters(expr, &mut out)?;
    }
    Ok(Filters(out))
}

fn walk_filters<'a>(
    expr: &'a Expr,
    out: &mut Vec<(String, FilterOp, &'a Expr)>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                walk_filters(left, out)?;
                walk_filters(right, out)?;
            }
            ast::BinaryOperator::Eq => push_filter(left, FilterOp::Eq, right, out)?,
            ast::BinaryOperator::GtEq => push_filter(left, FilterOp::Ge, right, out)?,
            ast::BinaryOperator::LtEq => push_filter(left, FilterOp::Le, right, out)?,
            other => return Err(SqlError::Unsupported(format!("operator {other}"))),
        },
        Expr::Nested(inner) => walk_filters(inner, out)?,
        other => return Err(SqlError::Unsupported(format!("filter {other}"))),
    }
    Ok(())
}

fn push_filter<'a>(
    left: &Expr,
    op: FilterOp,
    right: &'a Expr,
    out: &mut Vec<(String, FilterOp, &'a Expr)>,
) -> Result<(), SqlError> {
    let col = expr_column_name(left)
        .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
    out.push((col, op, right));
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn assignment_column(assignment: &ast::Assignment) -> Result<String, SqlError> {
    match &assignment.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            if values.rows.len() > 1 {
                return Err(SqlError::Unsupported("multi-row INSERT".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let filters = collect_filters(selection)?;
    filters.eq_ulid("id")?.ok_or(SqlError::MissingFilter("id"))
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date '{s}': {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
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
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
