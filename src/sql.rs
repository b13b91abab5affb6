use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::limits::{MAX_IN_LIST, MAX_SQL_LEN};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertProfessional {
        id: ProfessionalId,
        name: Option<String>,
    },
    DeleteProfessional {
        id: ProfessionalId,
    },
    InsertLocal {
        id: LocalId,
        name: Option<String>,
    },
    DeleteLocal {
        id: LocalId,
    },
    InsertSession {
        session: NewSession,
    },
    BatchInsertSessions {
        sessions: Vec<NewSession>,
    },
    UpdateSession {
        id: SessionId,
        patch: SessionPatch,
    },
    DeleteSession {
        id: SessionId,
    },
    BatchDeleteSessions {
        ids: Vec<SessionId>,
    },
    SelectSession {
        id: SessionId,
    },
    SelectSessions {
        filter: SessionFilter,
    },
    SelectProfessionals,
    SelectLocals,
    SelectConflicts {
        request: CheckConflictRequest,
    },
    SelectAvailability {
        date: NaiveDate,
        professional_id: Option<ProfessionalId>,
        local_id: Option<LocalId>,
        window: Option<Span>,
    },
}

/// Column order assumed by `INSERT INTO sessions VALUES (...)` without a column list.
const SESSION_COLUMNS: &[&str] = &[
    "id",
    "title",
    "date",
    "start_time",
    "end_time",
    "professional_id",
    "local_id",
    "community_service_id",
    "capacity",
    "session_link",
];

const DIRECTORY_COLUMNS: &[&str] = &["id", "name"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::LimitExceeded("query too long"));
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_all_insert_rows(insert)?;
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| c.value.to_lowercase())
        .collect();

    match table.as_str() {
        "professionals" | "locals" => {
            if rows.len() != 1 {
                return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
            }
            let row = bind_row(&columns, DIRECTORY_COLUMNS, &rows[0])?;
            let id = parse_ulid_expr(row.required("id")?)?;
            let name = row.optional("name").map(parse_string_or_null).transpose()?.flatten();
            if table == "professionals" {
                Ok(Command::InsertProfessional { id, name })
            } else {
                Ok(Command::InsertLocal { id, name })
            }
        }
        "sessions" => {
            let mut sessions = Vec::with_capacity(rows.len());
            for (i, values) in rows.iter().enumerate() {
                let row = bind_row(&columns, SESSION_COLUMNS, values)?;
                let session = new_session_from_row(&row).map_err(|e| match rows.len() {
                    1 => e,
                    _ => SqlError::Parse(format!("row {i}: {e}")),
                })?;
                sessions.push(session);
            }
            if sessions.len() == 1 {
                let session = sessions.remove(0);
                Ok(Command::InsertSession { session })
            } else {
                Ok(Command::BatchInsertSessions { sessions })
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Values of one VALUES row keyed by column name.
struct Row<'a> {
    values: HashMap<&'a str, &'a Expr>,
}

impl<'a> Row<'a> {
    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.values
            .get(column)
            .copied()
            .ok_or(SqlError::MissingColumn(column))
    }

    fn optional(&self, column: &str) -> Option<&'a Expr> {
        self.values.get(column).copied()
    }
}

/// Pair each value with its column. Without an explicit column list the
/// table's default order applies.
fn bind_row<'a>(
    columns: &'a [String],
    default_order: &'static [&'static str],
    values: &'a [Expr],
) -> Result<Row<'a>, SqlError> {
    let names: Vec<&'a str> = if columns.is_empty() {
        if values.len() > default_order.len() {
            return Err(SqlError::WrongArity("VALUES", default_order.len(), values.len()));
        }
        default_order[..values.len()].to_vec()
    } else {
        if columns.len() != values.len() {
            return Err(SqlError::WrongArity("VALUES", columns.len(), values.len()));
        }
        columns.iter().map(String::as_str).collect()
    };

    let mut bound = HashMap::with_capacity(names.len());
    for (name, value) in names.into_iter().zip(values) {
        if !default_order.iter().any(|c| *c == name) {
            return Err(SqlError::UnknownColumn(name.to_string()));
        }
        if bound.insert(name, value).is_some() {
            return Err(SqlError::Parse(format!("column {name} specified more than once")));
        }
    }
    Ok(Row { values: bound })
}

fn new_session_from_row(row: &Row<'_>) -> Result<NewSession, SqlError> {
    let start = parse_time_expr(row.required("start_time")?)?;
    let end = parse_time_expr(row.required("end_time")?)?;
    Ok(NewSession {
        id: parse_ulid_expr(row.required("id")?)?,
        title: parse_string(row.required("title")?)?,
        date: parse_date_expr(row.required("date")?)?,
        span: Span::new(start, end),
        capacity: row.optional("capacity").map(parse_u32).transpose()?.unwrap_or(0),
        session_link: row
            .optional("session_link")
            .map(parse_string_or_null)
            .transpose()?
            .flatten(),
        professional_id: parse_ulid_expr(row.required("professional_id")?)?,
        local_id: row
            .optional("local_id")
            .map(parse_ulid_or_null)
            .transpose()?
            .flatten(),
        community_service_id: row
            .optional("community_service_id")
            .map(parse_ulid_or_null)
            .transpose()?
            .flatten(),
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "sessions" {
        return Err(SqlError::Unsupported(format!("UPDATE on {table}")));
    }
    let id = extract_where_id(selection)?;

    let mut patch = SessionPatch::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        let value = &assignment.value;
        match column.as_str() {
            "title" => patch.title = Some(parse_string(value)?),
            "date" => patch.date = Some(parse_date_expr(value)?),
            "start_time" => patch.start_time = Some(parse_time_expr(value)?),
            "end_time" => patch.end_time = Some(parse_time_expr(value)?),
            "state" => patch.state = Some(parse_state_expr(value)?),
            "capacity" => patch.capacity = Some(parse_u32(value)?),
            "registered_count" => patch.registered_count = Some(parse_u32(value)?),
            "session_link" => patch.session_link = Some(parse_string_or_null(value)?),
            "professional_id" => patch.professional_id = Some(parse_ulid_expr(value)?),
            "local_id" => patch.local_id = Some(parse_ulid_or_null(value)?),
            "community_service_id" => {
                patch.community_service_id = Some(parse_ulid_or_null(value)?)
            }
            _ => return Err(SqlError::UnknownColumn(column)),
        }
    }
    Ok(Command::UpdateSession { id, patch })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "professionals" => Ok(Command::DeleteProfessional {
            id: extract_where_id(&delete.selection)?,
        }),
        "locals" => Ok(Command::DeleteLocal {
            id: extract_where_id(&delete.selection)?,
        }),
        "sessions" => {
            let selection = delete.selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
            let predicates = collect_predicates(selection)?;
            match predicates.as_slice() {
                [Predicate::Eq(col, value)] if col == "id" => Ok(Command::DeleteSession {
                    id: parse_ulid_expr(value)?,
                }),
                [Predicate::In(col, list)] if col == "id" => Ok(Command::BatchDeleteSessions {
                    ids: parse_ulid_list(list)?,
                }),
                _ => Err(SqlError::MissingFilter("id")),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
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
    let table = table_factor_name(&from.relation)?;
    let predicates = match &select.selection {
        Some(selection) => collect_predicates(selection)?,
        None => Vec::new(),
    };

    match table.as_str() {
        "sessions" => select_sessions(predicates),
        "professionals" => Ok(Command::SelectProfessionals),
        "locals" => Ok(Command::SelectLocals),
        "conflicts" => select_conflicts(predicates),
        "availability" => select_availability(predicates),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn select_sessions(predicates: Vec<Predicate<'_>>) -> Result<Command, SqlError> {
    let mut filter = SessionFilter::default();
    for predicate in predicates {
        match predicate {
            Predicate::Eq(col, value) => match col.as_str() {
                "id" => {
                    return Ok(Command::SelectSession {
                        id: parse_ulid_expr(value)?,
                    });
                }
                "professional_id" => filter.professional_ids.push(parse_ulid_expr(value)?),
                "local_id" => filter.local_ids.push(parse_ulid_expr(value)?),
                "state" => filter.states.push(parse_state_expr(value)?),
                "date" => filter.date = Some(parse_date_expr(value)?),
                _ => return Err(SqlError::UnsupportedFilter(col)),
            },
            Predicate::In(col, list) => match col.as_str() {
                "professional_id" => filter.professional_ids.extend(parse_ulid_list(list)?),
                "local_id" => filter.local_ids.extend(parse_ulid_list(list)?),
                "state" => {
                    for value in list {
                        filter.states.push(parse_state_expr(value)?);
                    }
                }
                _ => return Err(SqlError::UnsupportedFilter(col)),
            },
            Predicate::GtEq(col, _) | Predicate::LtEq(col, _) => {
                return Err(SqlError::UnsupportedFilter(col));
            }
        }
    }
    Ok(Command::SelectSessions { filter })
}

fn select_conflicts(predicates: Vec<Predicate<'_>>) -> Result<Command, SqlError> {
    let (mut date, mut start, mut end, mut professional_id) = (None, None, None, None);
    let (mut local_id, mut exclude_id) = (None, None);
    for predicate in predicates {
        let (col, value) = match predicate {
            Predicate::Eq(col, value) => (col, value),
            other => return Err(SqlError::UnsupportedFilter(other.column().to_string())),
        };
        match col.as_str() {
            "date" => date = Some(parse_date_expr(value)?),
            "start_time" => start = Some(parse_time_expr(value)?),
            "end_time" => end = Some(parse_time_expr(value)?),
            "professional_id" => professional_id = Some(parse_ulid_expr(value)?),
            "local_id" => local_id = parse_ulid_or_null(value)?,
            "exclude_id" => exclude_id = parse_ulid_or_null(value)?,
            _ => return Err(SqlError::UnsupportedFilter(col)),
        }
    }
    let start = start.ok_or(SqlError::MissingFilter("start_time"))?;
    let end = end.ok_or(SqlError::MissingFilter("end_time"))?;
    Ok(Command::SelectConflicts {
        request: CheckConflictRequest {
            candidate: SessionCandidate {
                date: date.ok_or(SqlError::MissingFilter("date"))?,
                span: Span::new(start, end),
                professional_id: professional_id.ok_or(SqlError::MissingFilter("professional_id"))?,
                local_id,
                community_service_id: None,
            },
            exclude_id,
        },
    })
}

fn select_availability(predicates: Vec<Predicate<'_>>) -> Result<Command, SqlError> {
    let (mut date, mut professional_id, mut local_id) = (None, None, None);
    let (mut start, mut end) = (None, None);
    for predicate in predicates {
        match predicate {
            Predicate::Eq(col, value) => match col.as_str() {
                "date" => date = Some(parse_date_expr(value)?),
                "professional_id" => professional_id = Some(parse_ulid_expr(value)?),
                "local_id" => local_id = Some(parse_ulid_expr(value)?),
                _ => return Err(SqlError::UnsupportedFilter(col)),
            },
            Predicate::GtEq(col, value) if col == "start_time" => {
                start = Some(parse_time_expr(value)?)
            }
            Predicate::LtEq(col, value) if col == "end_time" => end = Some(parse_time_expr(value)?),
            other => return Err(SqlError::UnsupportedFilter(other.column().to_string())),
        }
    }
    let window = match (start, end) {
        (None, None) => None,
        (start, end) => {
            let whole = Span::whole_day();
            Some(Span::new(start.unwrap_or(whole.start), end.unwrap_or(whole.end)))
        }
    };
    Ok(Command::SelectAvailability {
        date: date.ok_or(SqlError::MissingFilter("date"))?,
        professional_id,
        local_id,
        window,
    })
}

/// One conjunct of a WHERE clause: `col = v`, `col IN (...)`, `col >= v`, `col <= v`.
#[derive(Debug)]
enum Predicate<'a> {
    Eq(String, &'a Expr),
    In(String, &'a [Expr]),
    GtEq(String, &'a Expr),
    LtEq(String, &'a Expr),
}

impl Predicate<'_> {
    fn column(&self) -> &str {
        match self {
            Predicate::Eq(c, _) | Predicate::In(c, _) | Predicate::GtEq(c, _) | Predicate::LtEq(c, _) => c,
        }
    }
}

/// Flatten an AND-chain into predicates. OR, NOT IN and anything else are rejected.
fn collect_predicates(expr: &Expr) -> Result<Vec<Predicate<'_>>, SqlError> {
    fn walk<'a>(expr: &'a Expr, out: &mut Vec<Predicate<'a>>) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => walk(inner, out),
            Expr::BinaryOp { left, op, right } => {
                if *op == ast::BinaryOperator::And {
                    walk(left, out)?;
                    return walk(right, out);
                }
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
                match op {
                    ast::BinaryOperator::Eq => out.push(Predicate::Eq(column, right)),
                    ast::BinaryOperator::GtEq => out.push(Predicate::GtEq(column, right)),
                    ast::BinaryOperator::LtEq => out.push(Predicate::LtEq(column, right)),
                    _ => return Err(SqlError::Unsupported(format!("operator {op}"))),
                }
                Ok(())
            }
            Expr::InList {
                expr: column,
                list,
                negated: false,
            } => {
                let column = expr_column_name(column)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
                if list.len() > MAX_IN_LIST {
                    return Err(SqlError::LimitExceeded("IN list too long"));
                }
                out.push(Predicate::In(column, list));
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
        }
    }

    let mut out = Vec::new();
    walk(expr, &mut out)?;
    Ok(out)
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

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
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

/// Literal as text; `None` for NULL.
fn literal_text(expr: &Expr) -> Result<Option<&str>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(Some(s.as_str())),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn non_null(expr: &Expr) -> Result<&str, SqlError> {
    literal_text(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    non_null(expr).map(str::to_string)
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    Ok(literal_text(expr)?.map(str::to_string))
}

fn parse_ulid_str(s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_str(non_null(expr)?)
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    literal_text(expr)?.map(parse_ulid_str).transpose()
}

fn parse_ulid_list(list: &[Expr]) -> Result<Vec<Ulid>, SqlError> {
    list.iter().map(parse_ulid_expr).collect()
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let s = non_null(expr)?;
    s.trim()
        .parse()
        .map_err(|_| SqlError::Parse(format!("{s} is not a non-negative 32-bit integer")))
}

fn parse_state_expr(expr: &Expr) -> Result<SessionState, SqlError> {
    non_null(expr)?.parse().map_err(SqlError::Parse)
}

/// `YYYY-MM-DD`, or the date part of a timestamp.
fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = non_null(expr)?.trim();
    let date_part = s.get(..10).unwrap_or(s);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s}: {e}")))
}

/// `HH:MM`, `HH:MM:SS[.fff]`, or the time part of a timestamp.
fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = non_null(expr)?.trim();
    let time_part = match s.find(['T', ' ']) {
        Some(pos) if s.len() > 10 => &s[pos + 1..],
        _ => s,
    };
    NaiveTime::parse_from_str(time_part, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(time_part, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s}: {e}")))
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
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("unsupported filter column: {0}")]
    UnsupportedFilter(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}
