use chrono::{DateTime, NaiveDate, NaiveDateTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, LimitClause, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::audit::TimelineFilter;
use crate::engine::{BookingFilter, NewBooking, ResourcePatch};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource(Resource),
    UpdateResource {
        id: String,
        patch: ResourcePatch,
    },
    SelectResources,
    InsertUser {
        id: Ulid,
        email: String,
        name: String,
        role: Role,
    },
    UpdateUserRole {
        id: Ulid,
        role: Role,
    },
    UpdateCreditLimit {
        id: Ulid,
        limit: Money,
    },
    SelectUsers {
        id: Option<Ulid>,
    },
    InsertDeposit {
        user_id: Ulid,
        amount: Money,
    },
    InsertSubscription {
        user_id: Ulid,
        hours: Hours,
        plan: Option<String>,
    },
    InsertDiscount {
        user_id: Ulid,
        percent: u8,
        reason: Option<String>,
    },
    FreezeSubscription {
        user_id: Ulid,
        frozen: bool,
    },
    InsertBooking(NewBooking),
    CancelBooking {
        id: Ulid,
        reason: Option<String>,
    },
    SetReRentListed {
        id: Ulid,
        listed: bool,
    },
    SelectBookings(BookingFilter),
    SelectAvailability {
        resource_id: String,
        date: NaiveDate,
        min_duration: Option<Minute>,
        include_re_rent: bool,
    },
    SelectSlotCheck {
        resource_id: String,
        date: NaiveDate,
        start_time: Minute,
        duration: Minute,
        exclude_id: Option<Ulid>,
    },
    InsertWaitlist {
        id: Ulid,
        resource_id: String,
        date: NaiveDate,
        start: Minute,
        end: Minute,
    },
    DeleteWaitlist {
        id: Ulid,
    },
    SelectWaitlist,
    SelectTimeline(TimelineFilter),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── Column/value pairs ────────────────────────────────────────

/// Named values of one INSERT row, SET list, or AND-chain of equality filters.
struct Fields<'a> {
    table: &'static str,
    pairs: Vec<(String, &'a Expr)>,
}

impl<'a> Fields<'a> {
    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.pairs.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
    }

    fn req(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    /// Reject columns the table does not know.
    fn only(self, known: &[&str]) -> Result<Self, SqlError> {
        if let Some((col, _)) = self.pairs.iter().find(|(c, _)| !known.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(self.table, col.clone()));
        }
        Ok(self)
    }

    fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

const RESOURCE_COLUMNS: &[&str] = &[
    "id",
    "name",
    "kind",
    "location",
    "hourly_rate",
    "capacity",
    "min_booking_hours",
    "active",
];
const USER_COLUMNS: &[&str] = &["id", "email", "name", "role"];
const DEPOSIT_COLUMNS: &[&str] = &["user_id", "amount"];
const SUBSCRIPTION_COLUMNS: &[&str] = &["user_id", "hours", "plan"];
const DISCOUNT_COLUMNS: &[&str] = &["user_id", "percent", "reason"];
const BOOKING_COLUMNS: &[&str] = &[
    "id",
    "resource_id",
    "date",
    "start_time",
    "duration",
    "payment_method",
    "final_price",
    "format",
    "target_user",
];
const WAITLIST_COLUMNS: &[&str] = &["id", "resource_id", "date", "start_time", "end_time"];

fn static_table(name: &str) -> Result<&'static str, SqlError> {
    Ok(match name {
        "resources" => "resources",
        "users" => "users",
        "deposits" => "deposits",
        "subscriptions" => "subscriptions",
        "discounts" => "discounts",
        "bookings" => "bookings",
        "availability" => "availability",
        "slot_check" => "slot_check",
        "waitlist" => "waitlist",
        "timeline" => "timeline",
        other => return Err(SqlError::UnknownTable(other.to_string())),
    })
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = static_table(&insert_table_name(insert)?)?;
    let canonical = match table {
        "resources" => RESOURCE_COLUMNS,
        "users" => USER_COLUMNS,
        "deposits" => DEPOSIT_COLUMNS,
        "subscriptions" => SUBSCRIPTION_COLUMNS,
        "discounts" => DISCOUNT_COLUMNS,
        "bookings" => BOOKING_COLUMNS,
        "waitlist" => WAITLIST_COLUMNS,
        _ => return Err(SqlError::Unsupported(format!("INSERT INTO {table}"))),
    };
    let f = insert_fields(insert, table, canonical)?.only(canonical)?;

    match table {
        "resources" => Ok(Command::InsertResource(Resource {
            id: parse_text(f.req("id")?)?,
            name: opt(f.get("name"), parse_text)?.unwrap_or_default(),
            kind: opt(f.get("kind"), parse_enum)?.unwrap_or(ResourceKind::Cabinet),
            location: opt(f.get("location"), parse_text)?.unwrap_or_default(),
            hourly_rate: parse_money(f.req("hourly_rate")?)?,
            capacity: opt(f.get("capacity"), parse_u32)?.unwrap_or(1),
            min_booking_hours: opt(f.get("min_booking_hours"), parse_u32)?.unwrap_or(1),
            active: opt(f.get("active"), parse_bool)?.unwrap_or(true),
        })),
        "users" => Ok(Command::InsertUser {
            id: parse_ulid(f.req("id")?)?,
            email: parse_text(f.req("email")?)?,
            name: opt(f.get("name"), parse_text)?.unwrap_or_default(),
            role: opt(f.get("role"), parse_enum)?.unwrap_or(Role::User),
        }),
        "deposits" => Ok(Command::InsertDeposit {
            user_id: parse_ulid(f.req("user_id")?)?,
            amount: parse_money(f.req("amount")?)?,
        }),
        "subscriptions" => Ok(Command::InsertSubscription {
            user_id: parse_ulid(f.req("user_id")?)?,
            hours: parse_hours(f.req("hours")?)?,
            plan: opt(f.get("plan"), parse_text_or_null)?.flatten(),
        }),
        "discounts" => Ok(Command::InsertDiscount {
            user_id: parse_ulid(f.req("user_id")?)?,
            percent: parse_u8(f.req("percent")?)?,
            reason: opt(f.get("reason"), parse_text_or_null)?.flatten(),
        }),
        "bookings" => Ok(Command::InsertBooking(NewBooking {
            id: parse_ulid(f.req("id")?)?,
            resource_id: parse_text(f.req("resource_id")?)?,
            date: parse_date(f.req("date")?)?,
            start_time: parse_time(f.req("start_time")?)?,
            duration: parse_u32(f.req("duration")?)?,
            payment_method: parse_enum(f.req("payment_method")?)?,
            final_price: parse_money(f.req("final_price")?)?,
            format: opt(f.get("format"), parse_enum)?.unwrap_or(BookingFormat::Individual),
            target_user: opt(f.get("target_user"), parse_text_or_null)?.flatten(),
        })),
        "waitlist" => Ok(Command::InsertWaitlist {
            id: parse_ulid(f.req("id")?)?,
            resource_id: parse_text(f.req("resource_id")?)?,
            date: parse_date(f.req("date")?)?,
            start: parse_time(f.req("start_time")?)?,
            end: parse_time(f.req("end_time")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

/// Pair the first VALUES row with its column list, or with `canonical` order if none is given.
fn insert_fields<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    canonical: &[&str],
) -> Result<Fields<'a>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let row = match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => row,
            [] => return Err(SqlError::Parse("empty VALUES".into())),
            _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let columns: Vec<String> = if insert.columns.is_empty() {
        canonical.iter().take(row.len()).map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != row.len() {
        return Err(SqlError::WrongArity(table, columns.len(), row.len()));
    }
    Ok(Fields {
        table,
        pairs: columns.into_iter().zip(row.iter()).collect(),
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = static_table(&table_factor_name(&table.relation)?)?;
    let mut pairs = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => return Err(SqlError::Unsupported("tuple assignment".into())),
        };
        pairs.push((col, &a.value));
    }
    let set = Fields { table, pairs };
    let filters = where_fields(table, selection)?;

    match table {
        "resources" => {
            let set = set.only(&["name", "location", "hourly_rate", "capacity", "min_booking_hours", "active"])?;
            let patch = ResourcePatch {
                name: opt(set.get("name"), parse_text)?,
                location: opt(set.get("location"), parse_text)?,
                hourly_rate: opt(set.get("hourly_rate"), parse_money)?,
                capacity: opt(set.get("capacity"), parse_u32)?,
                min_booking_hours: opt(set.get("min_booking_hours"), parse_u32)?,
                active: opt(set.get("active"), parse_bool)?,
            };
            Ok(Command::UpdateResource {
                id: parse_text(filters.only(&["id"])?.req("id")?)?,
                patch,
            })
        }
        "users" => {
            let id = parse_ulid(filters.only(&["id"])?.req("id")?)?;
            let set = set.only(&["role", "credit_limit"])?;
            match (set.get("role"), set.get("credit_limit")) {
                (Some(role), None) => Ok(Command::UpdateUserRole {
                    id,
                    role: parse_enum(role)?,
                }),
                (None, Some(limit)) => Ok(Command::UpdateCreditLimit {
                    id,
                    limit: parse_money(limit)?,
                }),
                _ => Err(SqlError::Unsupported("UPDATE users sets exactly one of role, credit_limit".into())),
            }
        }
        "subscriptions" => Ok(Command::FreezeSubscription {
            user_id: parse_ulid(filters.only(&["user_id"])?.req("user_id")?)?,
            frozen: parse_bool(set.only(&["frozen"])?.req("frozen")?)?,
        }),
        "bookings" => {
            let id = parse_ulid(filters.only(&["id"])?.req("id")?)?;
            let set = set.only(&["status", "cancellation_reason", "re_rent_listed"])?;
            if let Some(listed) = set.get("re_rent_listed") {
                if set.get("status").is_some() {
                    return Err(SqlError::Unsupported("status and re_rent_listed in one UPDATE".into()));
                }
                return Ok(Command::SetReRentListed {
                    id,
                    listed: parse_bool(listed)?,
                });
            }
            let status: BookingStatus = parse_enum(set.req("status")?)?;
            if status != BookingStatus::Cancelled {
                return Err(SqlError::Unsupported("bookings can only be set to 'cancelled'".into()));
            }
            Ok(Command::CancelBooking {
                id,
                reason: opt(set.get("cancellation_reason"), parse_text_or_null)?.flatten(),
            })
        }
        _ => Err(SqlError::Unsupported(format!("UPDATE {table}"))),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = static_table(&delete_table_name(delete)?)?;
    let id = parse_ulid(where_fields(table, delete.selection.as_ref())?.only(&["id"])?.req("id")?)?;
    match table {
        "bookings" => Ok(Command::CancelBooking { id, reason: None }),
        "waitlist" => Ok(Command::DeleteWaitlist { id }),
        _ => Err(SqlError::Unsupported(format!("DELETE FROM {table}"))),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = static_table(&table_factor_name(&from.relation)?)?;
    let f = where_fields(table, select.selection.as_ref())?;

    match table {
        "resources" => {
            if !f.is_empty() {
                return Err(SqlError::Unsupported("filters on resources".into()));
            }
            Ok(Command::SelectResources)
        }
        "users" => Ok(Command::SelectUsers {
            id: opt(f.only(&["id"])?.get("id"), parse_ulid)?,
        }),
        "bookings" => {
            let f = f.only(&["resource_id", "date", "status", "user_id"])?;
            Ok(Command::SelectBookings(BookingFilter {
                resource_id: opt(f.get("resource_id"), parse_text)?,
                date: opt(f.get("date"), parse_date)?,
                status: opt(f.get("status"), parse_enum)?,
                user_id: opt(f.get("user_id"), parse_ulid)?,
            }))
        }
        "availability" => {
            let f = f.only(&["resource_id", "date", "min_duration", "include_re_rent"])?;
            Ok(Command::SelectAvailability {
                resource_id: parse_text(f.req("resource_id")?)?,
                date: parse_date(f.req("date")?)?,
                min_duration: opt(f.get("min_duration"), parse_u32)?,
                include_re_rent: opt(f.get("include_re_rent"), parse_bool)?.unwrap_or(false),
            })
        }
        "slot_check" => {
            let f = f.only(&["resource_id", "date", "start_time", "duration", "exclude_id"])?;
            Ok(Command::SelectSlotCheck {
                resource_id: parse_text(f.req("resource_id")?)?,
                date: parse_date(f.req("date")?)?,
                start_time: parse_time(f.req("start_time")?)?,
                duration: parse_u32(f.req("duration")?)?,
                exclude_id: opt(f.get("exclude_id"), parse_ulid)?,
            })
        }
        "waitlist" => {
            if !f.is_empty() {
                return Err(SqlError::Unsupported("filters on waitlist".into()));
            }
            Ok(Command::SelectWaitlist)
        }
        "timeline" => {
            let f = f.only(&["target_id", "event_type"])?;
            Ok(Command::SelectTimeline(TimelineFilter {
                target_id: opt(f.get("target_id"), parse_text)?,
                event_type: opt(f.get("event_type"), parse_text)?,
                limit: query_limit(query)?.unwrap_or(0),
            }))
        }
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

fn query_limit(query: &ast::Query) -> Result<Option<usize>, SqlError> {
    let limit = match &query.limit_clause {
        Some(LimitClause::LimitOffset { limit, .. }) => limit.as_ref(),
        Some(LimitClause::OffsetCommaLimit { limit, .. }) => Some(limit),
        None => None,
    };
    limit
        .map(|expr| {
            let n = parse_i64(expr)?;
            usize::try_from(n).map_err(|_| SqlError::Parse(format!("bad LIMIT: {n}")))
        })
        .transpose()
}

/// Flatten `a = x AND b = y` into column/value pairs.
fn where_fields<'a>(table: &'static str, selection: Option<&'a Expr>) -> Result<Fields<'a>, SqlError> {
    let mut pairs = Vec::new();
    if let Some(expr) = selection {
        collect_eq(expr, &mut pairs)?;
    }
    Ok(Fields { table, pairs })
}

fn collect_eq<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq(left, out)?;
            collect_eq(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column on left of =, got {left}")))?;
            out.push((col, right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn opt<T>(expr: Option<&Expr>, parse: impl Fn(&Expr) -> Result<T, SqlError>) -> Result<Option<T>, SqlError> {
    expr.map(parse).transpose()
}

/// String literal or bare number, as text. `-5` arrives as a unary minus.
fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(format!("-{}", parse_text(expr)?));
    }
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_text(expr).map(Some),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    let s = parse_text(expr)?;
    s.parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_money(expr: &Expr) -> Result<Money, SqlError> {
    parse_text(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_hours(expr: &Expr) -> Result<Hours, SqlError> {
    parse_text(expr)?.parse().map_err(SqlError::Parse)
}

/// `'YYYY-MM-DD'`. A timestamp is truncated to the day it names in its own offset.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    let text = s.trim();
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Ok(date);
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Ok(at.date_naive());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|at| at.date())
        .ok_or_else(|| SqlError::Parse(format!("bad date {s:?}, expected YYYY-MM-DD")))
}

/// `'HH:MM'`.
fn parse_time(expr: &Expr) -> Result<Minute, SqlError> {
    let s = parse_text(expr)?;
    parse_hhmm(&s).ok_or_else(|| SqlError::Parse(format!("bad time {s:?}, expected HH:MM")))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(expr: &Expr) -> Result<T, SqlError> {
    parse_text(expr)?.parse().map_err(SqlError::Parse)
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
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Table a SELECT reads from, for describing result columns before binding.
/// Placeholders parse fine here, so this works on unbound statements.
pub fn select_table(sql: &str) -> Option<&'static str> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Some(Statement::Query(query)) = stmts.first() else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    let name = table_factor_name(&select.from.first()?.relation).ok()?;
    static_table(&name).ok()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
    WrongArity(&'static str, usize, usize),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
        }
    }
}

impl std::error::Error for SqlError {}
