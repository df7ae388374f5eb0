//! TDTQL → SQL translation.
//!
//! Deterministic rendering of a statement as dialect-neutral SQL.
//! Identifiers are emitted verbatim (adapters quote them for their
//! dialect); literals that match the numeric shape go out bare, all
//! others single-quoted with `''` escaping. Dialect-specific pagination
//! rewrites (MSSQL OFFSET/FETCH) happen in the adapters.

use crate::query::ast::{CompareOp, Expr, Filter, SelectStatement, SortDirection};

/// Whether every operator in the statement has a SQL mapping. The
/// operator set is closed and fully mapped, so push-down is always
/// possible; the hook stays for schema-dependent restrictions.
pub fn can_translate(_stmt: &SelectStatement) -> bool {
    true
}

/// Render only the WHERE clause body, if the statement has one.
/// Adapters use this to derive COUNT queries for execution statistics.
pub fn where_clause(stmt: &SelectStatement) -> Option<String> {
    stmt.where_expr.as_ref().map(|expr| {
        let mut out = String::new();
        render_expr(expr, true, &mut out);
        out
    })
}

/// Render the statement as a single SELECT.
pub fn to_sql(stmt: &SelectStatement) -> String {
    let mut sql = format!("SELECT * FROM {}", stmt.table);
    if let Some(expr) = &stmt.where_expr {
        sql.push_str(" WHERE ");
        render_expr(expr, true, &mut sql);
    }
    if !stmt.order_by.is_empty() {
        sql.push_str(" ORDER BY ");
        for (i, order) in stmt.order_by.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&order.field);
            sql.push(' ');
            sql.push_str(order.direction.as_str());
        }
    }
    if let Some(limit) = stmt.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = stmt.offset {
        sql.push_str(&format!(" OFFSET {offset}"));
    }
    sql
}

fn render_expr(expr: &Expr, top_level: bool, out: &mut String) {
    match expr {
        Expr::And(children) | Expr::Or(children) => {
            let joiner = if matches!(expr, Expr::And(_)) { " AND " } else { " OR " };
            let wrap = !top_level && children.len() > 1;
            if wrap {
                out.push('(');
            }
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    out.push_str(joiner);
                }
                render_expr(child, false, out);
            }
            if wrap {
                out.push(')');
            }
        }
        Expr::Not(inner) => {
            out.push_str("NOT (");
            render_expr(inner, true, out);
            out.push(')');
        }
        Expr::Filter(filter) => render_filter(filter, out),
    }
}

fn render_filter(filter: &Filter, out: &mut String) {
    out.push_str(&filter.field);
    match filter.op {
        CompareOp::Eq => binary(out, "=", filter),
        CompareOp::Ne => binary(out, "!=", filter),
        CompareOp::Gt => binary(out, ">", filter),
        CompareOp::Gte => binary(out, ">=", filter),
        CompareOp::Lt => binary(out, "<", filter),
        CompareOp::Lte => binary(out, "<=", filter),
        CompareOp::Like => binary(out, "LIKE", filter),
        CompareOp::NotLike => binary(out, "NOT LIKE", filter),
        CompareOp::In | CompareOp::NotIn => {
            out.push_str(if filter.op == CompareOp::In { " IN (" } else { " NOT IN (" });
            for (i, value) in filter.values.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&literal(value));
            }
            out.push(')');
        }
        CompareOp::Between => {
            out.push_str(" BETWEEN ");
            out.push_str(&literal(filter.value.as_deref().unwrap_or_default()));
            out.push_str(" AND ");
            out.push_str(&literal(filter.value2.as_deref().unwrap_or_default()));
        }
        CompareOp::IsNull => out.push_str(" IS NULL"),
        CompareOp::IsNotNull => out.push_str(" IS NOT NULL"),
    }
}

fn binary(out: &mut String, op: &str, filter: &Filter) {
    out.push(' ');
    out.push_str(op);
    out.push(' ');
    out.push_str(&literal(filter.value.as_deref().unwrap_or_default()));
}

/// Bare for numeric-shaped values, single-quoted otherwise.
pub fn literal(value: &str) -> String {
    if is_numeric(value) {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}

fn is_numeric(value: &str) -> bool {
    let body = value.strip_prefix('-').unwrap_or(value);
    if body.is_empty() || body.starts_with('.') || body.ends_with('.') {
        return false;
    }
    let mut dots = 0;
    body.bytes().all(|b| match b {
        b'0'..=b'9' => true,
        b'.' => {
            dots += 1;
            dots == 1
        }
        _ => false,
    })
}
