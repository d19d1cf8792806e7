use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::calendar::{parse_date, parse_time_of_day};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertService {
        id: Ulid,
        provider_id: Ulid,
        duration_minutes: u32,
        price: i64,
    },
    DeleteService {
        id: Ulid,
    },
    InsertRecurringWindow {
        id: Ulid,
        provider_id: Ulid,
        week_day: u8,
        from: Ms,
        to: Ms,
    },
    InsertOnceWindow {
        id: Ulid,
        provider_id: Ulid,
        start: Ms,
        end: Ms,
        active: bool,
    },
    DeleteWindow {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        provider_id: Ulid,
        service_id: Ulid,
        customer_id: Ulid,
        start: Ms,
        notes: Option<String>,
    },
    InsertTransition {
        booking_id: Ulid,
        status: BookingStatus,
        actor: ActorRole,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectServices {
        provider_id: Ulid,
    },
    SelectWindows {
        provider_id: Ulid,
        week_day: Option<u8>,
        date: Option<NaiveDate>,
    },
    SelectBookings {
        party: Party,
    },
    SelectSlots {
        service_id: Ulid,
        date: NaiveDate,
        timezone: String,
        customer_id: Option<Ulid>,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(rest) = strip_keyword(trimmed, "LISTEN") {
        return Ok(Command::Listen { channel: channel_name(rest)? });
    }
    if let Some(rest) = strip_keyword(trimmed, "UNLISTEN") {
        if rest == "*" {
            return Ok(Command::UnlistenAll);
        }
        return Ok(Command::Unlisten { channel: channel_name(rest)? });
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
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// `LISTEN foo` / `UNLISTEN foo`, case-insensitive, whitespace-separated.
fn strip_keyword<'a>(sql: &'a str, keyword: &str) -> Option<&'a str> {
    let head = sql.get(..keyword.len())?;
    let rest = &sql[keyword.len()..];
    if head.eq_ignore_ascii_case(keyword) && rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

fn channel_name(raw: &str) -> Result<String, SqlError> {
    let channel = raw.trim_matches('"');
    if channel.is_empty() {
        return Err(SqlError::Parse("missing channel name".into()));
    }
    Ok(channel.to_string())
}

/// Column order of an insertable table. The first `required` columns must be given.
struct InsertLayout {
    table: &'static str,
    columns: &'static [&'static str],
    required: usize,
}

const INSERT_LAYOUTS: &[InsertLayout] = &[
    InsertLayout {
        table: "services",
        columns: &["id", "provider_id", "duration_minutes", "price"],
        required: 4,
    },
    InsertLayout {
        table: "recurring_windows",
        columns: &["id", "provider_id", "week_day", "start_time", "end_time"],
        required: 5,
    },
    InsertLayout {
        table: "once_windows",
        columns: &["id", "provider_id", "start", "end", "active"],
        required: 4,
    },
    InsertLayout {
        table: "bookings",
        columns: &["id", "provider_id", "service_id", "customer_id", "start", "notes"],
        required: 5,
    },
    InsertLayout {
        table: "booking_transitions",
        columns: &["booking_id", "status", "actor"],
        required: 3,
    },
];

/// One VALUES row rearranged into its table's column order.
struct InsertRow {
    layout: &'static InsertLayout,
    values: Vec<Option<Expr>>,
}

impl InsertRow {
    /// Without a column list values are positional. With one, every named
    /// column must exist in the table and appear once.
    fn new(layout: &'static InsertLayout, columns: &[ast::Ident], values: Vec<Expr>) -> Result<Self, SqlError> {
        let width = layout.columns.len();
        let mut row: Vec<Option<Expr>> = vec![None; width];

        if columns.is_empty() {
            if values.len() < layout.required {
                return Err(SqlError::WrongArity(layout.table, layout.required, values.len()));
            }
            if values.len() > width {
                return Err(SqlError::WrongArity(layout.table, width, values.len()));
            }
            for (slot, value) in row.iter_mut().zip(values) {
                *slot = Some(value);
            }
        } else {
            if columns.len() != values.len() {
                return Err(SqlError::WrongArity(layout.table, columns.len(), values.len()));
            }
            for (column, value) in columns.iter().zip(values) {
                let name = column.value.to_lowercase();
                let idx = layout
                    .columns
                    .iter()
                    .position(|c| *c == name)
                    .ok_or_else(|| SqlError::UnknownColumn(layout.table, name.clone()))?;
                if row[idx].replace(value).is_some() {
                    return Err(SqlError::Parse(format!("column {name} given twice")));
                }
            }
            if let Some(missing) = (0..layout.required).find(|&i| row[i].is_none()) {
                return Err(SqlError::MissingColumn(layout.table, layout.columns[missing]));
            }
        }
        Ok(Self { layout, values: row })
    }

    fn get(&self, idx: usize) -> Result<&Expr, SqlError> {
        self.optional(idx)
            .ok_or(SqlError::MissingColumn(self.layout.table, self.layout.columns[idx]))
    }

    fn optional(&self, idx: usize) -> Option<&Expr> {
        self.values.get(idx).and_then(Option::as_ref)
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let layout = INSERT_LAYOUTS
        .iter()
        .find(|l| l.table == table)
        .ok_or(SqlError::UnknownTable(table))?;
    let row = InsertRow::new(layout, &insert.columns, extract_insert_values(insert)?)?;

    match layout.table {
        "services" => Ok(Command::InsertService {
            id: parse_ulid_expr(row.get(0)?)?,
            provider_id: parse_ulid_expr(row.get(1)?)?,
            duration_minutes: parse_u32(row.get(2)?)?,
            price: parse_i64_expr(row.get(3)?)?,
        }),
        "recurring_windows" => Ok(Command::InsertRecurringWindow {
            id: parse_ulid_expr(row.get(0)?)?,
            provider_id: parse_ulid_expr(row.get(1)?)?,
            week_day: parse_week_day(row.get(2)?)?,
            from: parse_time_expr(row.get(3)?)?,
            to: parse_time_expr(row.get(4)?)?,
        }),
        "once_windows" => Ok(Command::InsertOnceWindow {
            id: parse_ulid_expr(row.get(0)?)?,
            provider_id: parse_ulid_expr(row.get(1)?)?,
            start: parse_i64_expr(row.get(2)?)?,
            end: parse_i64_expr(row.get(3)?)?,
            active: row.optional(4).map(parse_bool).transpose()?.unwrap_or(true),
        }),
        "bookings" => Ok(Command::InsertBooking {
            id: parse_ulid_expr(row.get(0)?)?,
            provider_id: parse_ulid_expr(row.get(1)?)?,
            service_id: parse_ulid_expr(row.get(2)?)?,
            customer_id: parse_ulid_expr(row.get(3)?)?,
            start: parse_i64_expr(row.get(4)?)?,
            notes: row.optional(5).map(parse_string_or_null).transpose()?.flatten(),
        }),
        "booking_transitions" => {
            let status = parse_string(row.get(1)?)?;
            let actor = parse_string(row.get(2)?)?;
            Ok(Command::InsertTransition {
                booking_id: parse_ulid_expr(row.get(0)?)?,
                status: BookingStatus::parse(&status)
                    .ok_or_else(|| SqlError::Parse(format!("unknown status: {status}")))?,
                actor: ActorRole::parse(&actor)
                    .ok_or_else(|| SqlError::Parse(format!("unknown actor: {actor}")))?,
            })
        }
        other => Err(SqlError::UnknownTable(other.to_string())),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "services" => Ok(Command::DeleteService { id }),
        "windows" | "recurring_windows" | "once_windows" => Ok(Command::DeleteWindow { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| *e);

    match table.as_str() {
        "services" => Ok(Command::SelectServices {
            provider_id: parse_ulid_expr(filter("provider_id").ok_or(SqlError::MissingFilter("provider_id"))?)?,
        }),
        "windows" => Ok(Command::SelectWindows {
            provider_id: parse_ulid_expr(filter("provider_id").ok_or(SqlError::MissingFilter("provider_id"))?)?,
            week_day: filter("week_day").map(parse_week_day).transpose()?,
            date: filter("date").map(parse_date_expr).transpose()?,
        }),
        "bookings" => {
            let party = match (filter("provider_id"), filter("customer_id")) {
                (Some(p), None) => Party::Provider(parse_ulid_expr(p)?),
                (None, Some(c)) => Party::Customer(parse_ulid_expr(c)?),
                (Some(_), Some(_)) => {
                    return Err(SqlError::Unsupported("filter bookings by provider_id or customer_id, not both".into()));
                }
                (None, None) => return Err(SqlError::MissingFilter("provider_id or customer_id")),
            };
            Ok(Command::SelectBookings { party })
        }
        "slots" => {
            let tz = filter("tz")
                .or_else(|| filter("timezone"))
                .ok_or(SqlError::MissingFilter("tz"))?;
            Ok(Command::SelectSlots {
                service_id: parse_ulid_expr(filter("service_id").ok_or(SqlError::MissingFilter("service_id"))?)?,
                date: parse_date_expr(filter("date").ok_or(SqlError::MissingFilter("date"))?)?,
                timezone: parse_string(tz)?,
                customer_id: filter("customer_id").map(parse_ulid_expr).transpose()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = 1 AND b = 2 ...` into `(column, value)` pairs.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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

/// The single VALUES row of an INSERT. Multi-row inserts are rejected so
/// each reservation gets its own conflict check and error.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_week_day(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64_expr(expr)?;
    match u8::try_from(v) {
        Ok(day) if day <= 6 => Ok(day),
        _ => Err(SqlError::Parse(format!("week_day must be 0..=6, got {v}"))),
    }
}

fn parse_time_expr(expr: &Expr) -> Result<Ms, SqlError> {
    let s = parse_string(expr)?;
    parse_time_of_day(&s).ok_or_else(|| SqlError::Parse(format!("bad time of day: {s}")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    parse_date(&s).ok_or_else(|| SqlError::Parse(format!("bad date: {s}")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
}
