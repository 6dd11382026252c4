use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::CourtKind;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// `INSERT INTO courts`: creates the court, or replaces its fields if the id exists.
    UpsertCourt {
        id: Ulid,
        name: String,
        kind: CourtKind,
        unit_price: i64,
        active: Option<bool>,
    },
    /// `DELETE FROM courts`: courts are never removed, only deactivated.
    DeactivateCourt {
        id: Ulid,
    },
    SelectCourts,
    SelectAvailableCourts {
        date: String,
        start_time: String,
        end_time: String,
    },
    /// Start and end are RFC 3339 or Unix ms, validated by the engine.
    InsertBooking {
        court_id: Ulid,
        start: String,
        end: String,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    /// `INSERT INTO payments`: payment confirmation for a booking.
    ConfirmPayment {
        booking_id: Ulid,
    },
    /// `DELETE FROM bookings`: soft cancel, the row stays as `CANCELLED`.
    CancelBooking {
        id: Ulid,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingFilter {
    Id(Ulid),
    Court(Ulid),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
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

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "courts" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("courts", 4, values.len()));
            }
            let kind_text = parse_string_expr(&values[2])?;
            let kind = CourtKind::parse(&kind_text)
                .ok_or_else(|| SqlError::Parse(format!("bad court kind: {kind_text}")))?;
            let active = match values.get(4) {
                Some(v) => Some(parse_bool(v)?),
                None => None,
            };
            Ok(Command::UpsertCourt {
                id: parse_ulid_expr(&values[0])?,
                name: parse_string_expr(&values[1])?,
                kind,
                unit_price: parse_i64_expr(&values[3])?,
                active,
            })
        }
        "bookings" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("bookings", 3, values.len()));
            }
            Ok(Command::InsertBooking {
                court_id: parse_ulid_expr(&values[0])?,
                start: parse_string_expr(&values[1])?,
                end: parse_string_expr(&values[2])?,
            })
        }
        "payments" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("payments", 1, 0));
            }
            Ok(Command::ConfirmPayment {
                booking_id: parse_ulid_expr(&values[0])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = eq_filters(delete.selection.as_ref())?;
    let id = filter_ulid(&filters, "id")?.ok_or(SqlError::MissingFilter("id"))?;

    match table.as_str() {
        "courts" => Ok(Command::DeactivateCourt { id }),
        "bookings" => Ok(Command::CancelBooking { id }),
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
    let filters = eq_filters(select.selection.as_ref())?;

    match table.as_str() {
        "courts" => Ok(Command::SelectCourts),
        "available_courts" => Ok(Command::SelectAvailableCourts {
            date: filter_string(&filters, "date")?.ok_or(SqlError::MissingFilter("date"))?,
            start_time: filter_string(&filters, "start_time")?
                .ok_or(SqlError::MissingFilter("start_time"))?,
            end_time: filter_string(&filters, "end_time")?
                .ok_or(SqlError::MissingFilter("end_time"))?,
        }),
        "bookings" => {
            let filter = if let Some(id) = filter_ulid(&filters, "id")? {
                BookingFilter::Id(id)
            } else if let Some(court_id) = filter_ulid(&filters, "court_id")? {
                BookingFilter::Court(court_id)
            } else {
                return Err(SqlError::MissingFilter("id or court_id"));
            };
            Ok(Command::SelectBookings { filter })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `col = value` pairs joined by AND. Other predicates are rejected.
fn eq_filters(selection: Option<&Expr>) -> Result<Vec<(String, &Expr)>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_eq_filters(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
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
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn filter_expr<'a>(filters: &[(String, &'a Expr)], col: &str) -> Option<&'a Expr> {
    filters.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
}

fn filter_ulid(filters: &[(String, &Expr)], col: &str) -> Result<Option<Ulid>, SqlError> {
    filter_expr(filters, col).map(parse_ulid_expr).transpose()
}

fn filter_string(filters: &[(String, &Expr)], col: &str) -> Result<Option<String>, SqlError> {
    filter_expr(filters, col).map(parse_string_expr).transpose()
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

/// First VALUES row. Multi-row inserts are rejected.
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
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

/// Quoted string or bare number, as text.
fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
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

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    fn id() -> Ulid {
        Ulid::from_string(ID).unwrap()
    }

    #[test]
    fn parse_insert_court() {
        let sql = format!(
            "INSERT INTO courts (id, name, kind, unit_price) VALUES ('{ID}', 'Court A', 'double', 120000)"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpsertCourt {
                id: id(),
                name: "Court A".into(),
                kind: CourtKind::Double,
                unit_price: 120000,
                active: None,
            }
        );
    }

    #[test]
    fn parse_insert_court_with_active_flag() {
        let sql = format!(
            "INSERT INTO courts (id, name, kind, unit_price, active) VALUES ('{ID}', 'B', 'SINGLE', 90000, false)"
        );
        match parse_sql(&sql).unwrap() {
            Command::UpsertCourt { kind, active, .. } => {
                assert_eq!(kind, CourtKind::Single);
                assert_eq!(active, Some(false));
            }
            other => panic!("expected UpsertCourt, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_court_bad_kind() {
        let sql = format!(
            "INSERT INTO courts (id, name, kind, unit_price) VALUES ('{ID}', 'A', 'triple', 1)"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_insert_court_too_few_values() {
        let sql = format!("INSERT INTO courts (id, name) VALUES ('{ID}', 'A')");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::WrongArity("courts", 4, 2))
        ));
    }

    #[test]
    fn parse_delete_court() {
        let sql = format!("DELETE FROM courts WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeactivateCourt { id: id() });
    }

    #[test]
    fn parse_select_courts() {
        assert_eq!(parse_sql("SELECT * FROM courts").unwrap(), Command::SelectCourts);
    }

    #[test]
    fn parse_available_courts() {
        let sql = "SELECT * FROM available_courts WHERE date = '2024-01-01' AND start_time = '06:00' AND end_time = '08:00'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectAvailableCourts {
                date: "2024-01-01".into(),
                start_time: "06:00".into(),
                end_time: "08:00".into(),
            }
        );
    }

    #[test]
    fn parse_available_courts_missing_filter() {
        let sql = "SELECT * FROM available_courts WHERE date = '2024-01-01' AND start_time = '06:00'";
        assert!(matches!(
            parse_sql(sql),
            Err(SqlError::MissingFilter("end_time"))
        ));
    }

    #[test]
    fn parse_insert_booking_rfc3339() {
        let sql = format!(
            "INSERT INTO bookings (court_id, start_time, end_time) VALUES ('{ID}', '2024-01-01T06:00:00+07:00', '2024-01-01T08:00:00+07:00')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertBooking {
                court_id: id(),
                start: "2024-01-01T06:00:00+07:00".into(),
                end: "2024-01-01T08:00:00+07:00".into(),
            }
        );
    }

    #[test]
    fn parse_insert_booking_millis() {
        let sql = format!(
            "INSERT INTO bookings (court_id, start_time, end_time) VALUES ('{ID}', 1704063600000, 1704070800000)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { start, end, .. } => {
                assert_eq!(start, "1704063600000");
                assert_eq!(end, "1704070800000");
            }
            other => panic!("expected InsertBooking, got {other:?}"),
        }
    }

    #[test]
    fn parse_multi_row_booking_rejected() {
        let sql = format!(
            "INSERT INTO bookings (court_id, start_time, end_time) VALUES ('{ID}', 1, 2), ('{ID}', 3, 4)"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_bookings_by_id_and_court() {
        let sql = format!("SELECT * FROM bookings WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectBookings {
                filter: BookingFilter::Id(id())
            }
        );
        let sql = format!("SELECT * FROM bookings WHERE court_id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectBookings {
                filter: BookingFilter::Court(id())
            }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM bookings"),
            Err(SqlError::MissingFilter(_))
        ));
    }

    #[test]
    fn parse_payment_and_cancel() {
        let sql = format!("INSERT INTO payments (booking_id) VALUES ('{ID}')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::ConfirmPayment { booking_id: id() }
        );
        let sql = format!("DELETE FROM bookings WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::CancelBooking { id: id() });
    }

    #[test]
    fn parse_rejects_other_predicates() {
        let sql = format!("DELETE FROM bookings WHERE id > '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_bad_ulid() {
        let sql = "DELETE FROM bookings WHERE id = 'not-a-ulid'";
        assert!(matches!(parse_sql(sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
