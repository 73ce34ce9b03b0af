use std::collections::HashMap;

use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: ResourceId,
        capacity: u32,
        name: Option<String>,
    },
    DeleteResource {
        id: ResourceId,
    },
    SelectResources {
        id: Option<ResourceId>,
    },
    /// Reserve a slot.
    InsertClaim {
        resource_id: ResourceId,
        claimant_id: ClaimantId,
    },
    /// Cancel a slot.
    DeleteClaim {
        resource_id: ResourceId,
        claimant_id: ClaimantId,
    },
    SelectClaims {
        resource_id: ResourceId,
    },
}

const RESOURCE_COLUMNS: &[&str] = &["id", "capacity", "name"];
const CLAIM_COLUMNS: &[&str] = &["resource_id", "claimant_id"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "resources" => {
            let mut row = insert_row(insert, RESOURCE_COLUMNS)?;
            let id = row
                .remove("id")
                .ok_or(SqlError::MissingColumn("id"))
                .and_then(|e| parse_string(&e))?;
            let capacity = row
                .remove("capacity")
                .ok_or(SqlError::MissingColumn("capacity"))
                .and_then(|e| parse_u32(&e))?;
            let name = match row.remove("name") {
                Some(e) => parse_string_or_null(&e)?,
                None => None,
            };
            reject_leftovers("resources", row)?;
            Ok(Command::InsertResource {
                id: id.into(),
                capacity,
                name,
            })
        }
        "claims" => {
            let mut row = insert_row(insert, CLAIM_COLUMNS)?;
            let resource_id = row
                .remove("resource_id")
                .ok_or(SqlError::MissingColumn("resource_id"))
                .and_then(|e| parse_string(&e))?;
            let claimant_id = row
                .remove("claimant_id")
                .ok_or(SqlError::MissingColumn("claimant_id"))
                .and_then(|e| parse_string(&e))?;
            reject_leftovers("claims", row)?;
            Ok(Command::InsertClaim {
                resource_id: resource_id.into(),
                claimant_id: claimant_id.into(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let mut filters = where_filters(delete.selection.as_ref())?;

    match table.as_str() {
        "resources" => {
            let id = required_filter(&mut filters, "id")?;
            reject_extra_filters("resources", filters)?;
            Ok(Command::DeleteResource { id: id.into() })
        }
        "claims" => {
            let resource_id = required_filter(&mut filters, "resource_id")?;
            let claimant_id = required_filter(&mut filters, "claimant_id")?;
            reject_extra_filters("claims", filters)?;
            Ok(Command::DeleteClaim {
                resource_id: resource_id.into(),
                claimant_id: claimant_id.into(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let mut filters = where_filters(select.selection.as_ref())?;

    match table.as_str() {
        "resources" => {
            let id = filters.remove("id").map(ResourceId::from);
            reject_extra_filters("resources", filters)?;
            Ok(Command::SelectResources { id })
        }
        "claims" => {
            let resource_id = required_filter(&mut filters, "resource_id")?;
            reject_extra_filters("claims", filters)?;
            Ok(Command::SelectClaims {
                resource_id: resource_id.into(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Collect `column = 'literal'` terms joined by AND. Anything else is rejected
/// rather than silently ignored.
fn where_filters(selection: Option<&Expr>) -> Result<HashMap<String, String>, SqlError> {
    let mut filters = HashMap::new();
    if let Some(expr) = selection {
        collect_filters(expr, &mut filters)?;
    }
    Ok(filters)
}

fn collect_filters(expr: &Expr, out: &mut HashMap<String, String>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            let value = parse_string(right)?;
            if out.contains_key(&col) {
                return Err(SqlError::Unsupported(format!("repeated filter on {col}")));
            }
            out.insert(col, value);
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn required_filter(
    filters: &mut HashMap<String, String>,
    col: &'static str,
) -> Result<String, SqlError> {
    filters.remove(col).ok_or(SqlError::MissingFilter(col))
}

fn reject_extra_filters(
    table: &'static str,
    filters: HashMap<String, String>,
) -> Result<(), SqlError> {
    match filters.into_keys().next() {
        Some(col) => Err(SqlError::UnsupportedFilter(table, col)),
        None => Ok(()),
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

/// The single VALUES row keyed by column. Without a column list, values map
/// onto `defaults` in order.
fn insert_row(
    insert: &ast::Insert,
    defaults: &[&str],
) -> Result<HashMap<String, Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => values,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    let row = match values.rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [row] => row,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if row.len() > columns.len() || (!insert.columns.is_empty() && row.len() != columns.len()) {
        return Err(SqlError::WrongArity(columns.len(), row.len()));
    }
    Ok(columns.into_iter().zip(row.iter().cloned()).collect())
}

fn reject_leftovers(table: &'static str, row: HashMap<String, Expr>) -> Result<(), SqlError> {
    match row.into_keys().next() {
        Some(col) => Err(SqlError::UnknownColumn(table, col)),
        None => Ok(()),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
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
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column {1} for {0}")]
    UnknownColumn(&'static str, String),
    #[error("expected {0} values, got {1}")]
    WrongArity(usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("cannot filter {0} on {1}")]
    UnsupportedFilter(&'static str, String),
}
