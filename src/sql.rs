use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::{Ms, RoomId, UserId};

/// Parsed command from SQL input. The acting user comes from the connection,
/// never from the statement.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: UserId,
        student_id: String,
        name: String,
    },
    InsertRoom {
        id: RoomId,
        name: String,
        location: Option<String>,
        capacity: u32,
        projector: bool,
        whiteboard: bool,
    },
    /// Partial update: unset fields keep their current value.
    UpdateRoom {
        id: RoomId,
        name: Option<String>,
        location: Option<Option<String>>,
        capacity: Option<u32>,
        projector: Option<bool>,
        whiteboard: Option<bool>,
    },
    DeleteRoom {
        id: RoomId,
    },
    InsertReservation {
        id: Ulid,
        room_id: RoomId,
        start: Ms,
        end: Ms,
        /// Comma-separated student ids from the optional fifth column.
        participants: Vec<String>,
    },
    DeleteReservation {
        id: Ulid,
    },
    InsertWaitlist {
        id: Ulid,
        room_id: RoomId,
        start: Ms,
        end: Ms,
        participants: Vec<String>,
    },
    DeleteWaitlist {
        id: Ulid,
    },
    SelectRooms,
    SelectReservations {
        room_id: Option<RoomId>,
        user_id: Option<UserId>,
    },
    SelectWaitlist {
        user_id: Option<UserId>,
    },
    SelectFreeSlots {
        room_id: RoomId,
        start: Ms,
        end: Ms,
    },
    Listen {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
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
        "users" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("users", 3, values.len()));
            }
            Ok(Command::InsertUser {
                id: parse_u64(&values[0])?,
                student_id: parse_string(&values[1])?,
                name: parse_string(&values[2])?,
            })
        }
        "rooms" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("rooms", 4, values.len()));
            }
            Ok(Command::InsertRoom {
                id: parse_u64(&values[0])?,
                name: parse_string(&values[1])?,
                location: parse_string_or_null(&values[2])?,
                capacity: parse_u32(&values[3])?,
                projector: values.get(4).map(parse_bool).transpose()?.unwrap_or(false),
                whiteboard: values.get(5).map(parse_bool).transpose()?.unwrap_or(false),
            })
        }
        "reservations" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("reservations", 4, values.len()));
            }
            Ok(Command::InsertReservation {
                id: parse_ulid(&values[0])?,
                room_id: parse_u64(&values[1])?,
                start: parse_i64(&values[2])?,
                end: parse_i64(&values[3])?,
                participants: values
                    .get(4)
                    .map(parse_participants)
                    .transpose()?
                    .unwrap_or_default(),
            })
        }
        "waitlist" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("waitlist", 4, values.len()));
            }
            Ok(Command::InsertWaitlist {
                id: parse_ulid(&values[0])?,
                room_id: parse_u64(&values[1])?,
                start: parse_i64(&values[2])?,
                end: parse_i64(&values[3])?,
                participants: values
                    .get(4)
                    .map(parse_participants)
                    .transpose()?
                    .unwrap_or_default(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;

    match table.as_str() {
        "rooms" => Ok(Command::DeleteRoom {
            id: extract_where_id_u64(&delete.selection)?,
        }),
        "reservations" => Ok(Command::DeleteReservation {
            id: extract_where_id_ulid(&delete.selection)?,
        }),
        "waitlist" => Ok(Command::DeleteWaitlist {
            id: extract_where_id_ulid(&delete.selection)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    if table != "rooms" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id_u64(selection)?;

    let (mut name, mut location, mut capacity) = (None, None, None);
    let (mut projector, mut whiteboard) = (None, None);
    for assignment in assignments {
        let col = assignment_column(assignment)?;
        match col.as_str() {
            "name" => name = Some(parse_string(&assignment.value)?),
            "location" => location = Some(parse_string_or_null(&assignment.value)?),
            "capacity" => capacity = Some(parse_u32(&assignment.value)?),
            "projector" => projector = Some(parse_bool(&assignment.value)?),
            "whiteboard" => whiteboard = Some(parse_bool(&assignment.value)?),
            other => return Err(SqlError::Parse(format!("unknown column: {other}"))),
        }
    }
    Ok(Command::UpdateRoom { id, name, location, capacity, projector, whiteboard })
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

    match table.as_str() {
        "rooms" => Ok(Command::SelectRooms),
        "reservations" => {
            let mut filters = SelectFilters::default();
            if let Some(selection) = &select.selection {
                extract_filters(selection, &mut filters)?;
            }
            Ok(Command::SelectReservations {
                room_id: filters.room_id,
                user_id: filters.user_id,
            })
        }
        "waitlist" => {
            let mut filters = SelectFilters::default();
            if let Some(selection) = &select.selection {
                extract_filters(selection, &mut filters)?;
            }
            Ok(Command::SelectWaitlist {
                user_id: filters.user_id,
            })
        }
        "free_slots" => {
            let mut filters = SelectFilters::default();
            if let Some(selection) = &select.selection {
                extract_filters(selection, &mut filters)?;
            }
            Ok(Command::SelectFreeSlots {
                room_id: filters.room_id.ok_or(SqlError::MissingFilter("room_id"))?,
                start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
                end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

#[derive(Default)]
struct SelectFilters {
    room_id: Option<RoomId>,
    user_id: Option<UserId>,
    start: Option<Ms>,
    end: Option<Ms>,
}

fn extract_filters(expr: &Expr, filters: &mut SelectFilters) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_filters(left, filters)?;
                extract_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left);
                if col.as_deref() == Some("room_id") {
                    filters.room_id = Some(parse_u64(right)?);
                } else if col.as_deref() == Some("user_id") {
                    filters.user_id = Some(parse_u64(right)?);
                }
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    filters.start = Some(parse_i64(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    filters.end = Some(parse_i64(right)?);
                }
            }
            _ => {}
        }
    }
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
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id_ulid(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    parse_ulid(extract_where_id_expr(selection)?)
}

fn extract_where_id_u64(selection: &Option<Expr>) -> Result<u64, SqlError> {
    parse_u64(extract_where_id_expr(selection)?)
}

fn extract_where_id_expr(selection: &Option<Expr>) -> Result<&Expr, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                Ok(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u64 range")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
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

/// Comma-separated student ids in a single string column; empty string or
/// NULL means nobody.
fn parse_participants(expr: &Expr) -> Result<Vec<String>, SqlError> {
    let raw = match parse_string_or_null(expr)? {
        Some(s) => s,
        None => return Ok(Vec::new()),
    };
    Ok(raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
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
