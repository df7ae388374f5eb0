//! In-memory TDTQL execution.
//!
//! Filters, sorts and paginates decoded packet rows. Comparison is
//! typed against the schema; when a value refuses to parse under its
//! declared type the comparator falls back to string comparison and the
//! fallback is counted in the filter statistics under `parse_fallback`.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::codec::decode_row;
use crate::error::TdtpError;
use crate::packet::{ExecutionResults, QueryContext, Row, Schema};
use crate::query::ast::{CompareOp, Expr, Filter, SelectStatement, SortDirection};
use crate::query::sqlgen;
use crate::types::{compare_values, parse_value};

/// Result of executing a query over a row vector.
#[derive(Debug)]
pub struct ExecutionOutcome {
    /// Rows after filter, sort and pagination, in their encoded form.
    pub rows: Vec<Row>,
    pub total_rows: u64,
    pub matched_rows: u64,
    pub returned_rows: u64,
    pub more_available: bool,
    pub next_offset: u64,
    /// Evaluation counters keyed by `field:op`, plus `parse_fallback`.
    pub filter_stats: HashMap<String, u64>,
    pub query_context: QueryContext,
}

/// Execute `stmt` over `rows` described by `schema`.
///
/// Fails when a referenced field is missing from the schema or a row
/// does not decode; value-level parse failures degrade to string
/// comparison instead.
pub fn execute(
    stmt: &SelectStatement,
    rows: &[Row],
    schema: &Schema,
) -> Result<ExecutionOutcome, TdtpError> {
    for name in stmt.referenced_fields() {
        if schema.index_of(name).is_none() {
            return Err(TdtpError::SchemaMismatch(format!(
                "query references unknown field {name:?} on table {}",
                stmt.table
            )));
        }
    }

    let mut stats: HashMap<String, u64> = HashMap::new();

    // decode once; keep the original encoded row alongside
    let mut decoded: Vec<(usize, Vec<Option<String>>)> = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        decoded.push((i, decode_row(&row.value)?));
    }
    let total_rows = decoded.len() as u64;

    if let Some(expr) = &stmt.where_expr {
        let mut kept = Vec::with_capacity(decoded.len());
        for entry in decoded {
            if eval(expr, &entry.1, schema, &mut stats)? {
                kept.push(entry);
            }
        }
        decoded = kept;
    }
    let matched_rows = decoded.len() as u64;

    if !stmt.order_by.is_empty() {
        let keys: Vec<(usize, SortDirection)> = stmt
            .order_by
            .iter()
            .map(|o| {
                let idx = schema.index_of(&o.field).expect("validated above");
                (idx, o.direction)
            })
            .collect();
        let fields = schema.fields();
        // Vec::sort_by is stable: rows with equal keys keep their order
        decoded.sort_by(|(_, a), (_, b)| {
            for (idx, direction) in &keys {
                let ord = compare_column(
                    a[*idx].as_deref(),
                    b[*idx].as_deref(),
                    &fields[*idx],
                    *direction,
                );
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }

    let offset = stmt.offset.unwrap_or(0);
    let paginated: Vec<(usize, Vec<Option<String>>)> = decoded
        .into_iter()
        .skip(offset as usize)
        .take(match stmt.limit {
            Some(limit) if limit > 0 => limit as usize,
            _ => usize::MAX,
        })
        .collect();
    let returned_rows = paginated.len() as u64;
    let more_available = matched_rows > offset + returned_rows;
    let next_offset = if more_available { offset + returned_rows } else { 0 };

    let query_text = if stmt.raw.is_empty() {
        sqlgen::to_sql(stmt)
    } else {
        stmt.raw.clone()
    };

    Ok(ExecutionOutcome {
        rows: paginated.iter().map(|(i, _)| rows[*i].clone()).collect(),
        total_rows,
        matched_rows,
        returned_rows,
        more_available,
        next_offset,
        filter_stats: stats,
        query_context: QueryContext {
            query: query_text,
            results: ExecutionResults {
                total_records_in_table: total_rows,
                records_after_filters: matched_rows,
                records_returned: returned_rows,
                more_data_available: more_available,
                next_offset,
            },
        },
    })
}

/// Short-circuiting filter tree walk. AND stops at the first false
/// child, OR at the first true one; only evaluated filters bump their
/// counters.
fn eval(
    expr: &Expr,
    row: &[Option<String>],
    schema: &Schema,
    stats: &mut HashMap<String, u64>,
) -> Result<bool, TdtpError> {
    match expr {
        Expr::And(children) => {
            for child in children {
                if !eval(child, row, schema, stats)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Expr::Or(children) => {
            for child in children {
                if eval(child, row, schema, stats)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Expr::Not(inner) => Ok(!eval(inner, row, schema, stats)?),
        Expr::Filter(filter) => eval_filter(filter, row, schema, stats),
    }
}

fn eval_filter(
    filter: &Filter,
    row: &[Option<String>],
    schema: &Schema,
    stats: &mut HashMap<String, u64>,
) -> Result<bool, TdtpError> {
    let idx = schema.index_of(&filter.field).ok_or_else(|| {
        TdtpError::SchemaMismatch(format!("unknown field {:?}", filter.field))
    })?;
    let field = &schema.fields()[idx];
    let cell = row[idx].as_deref();
    *stats
        .entry(format!("{}:{}", field.name, filter.op.as_str()))
        .or_insert(0) += 1;

    let result = match filter.op {
        CompareOp::IsNull => cell.is_none(),
        CompareOp::IsNotNull => cell.is_some(),
        CompareOp::Like | CompareOp::NotLike => {
            let pattern = filter.value.as_deref().unwrap_or_default();
            match cell {
                None => false,
                Some(text) => {
                    let matched = like_match(pattern, text)?;
                    if filter.op == CompareOp::Like { matched } else { !matched }
                }
            }
        }
        CompareOp::In | CompareOp::NotIn => {
            let Some(cell) = cell else { return Ok(false) };
            let mut found = false;
            for candidate in &filter.values {
                if typed_compare(cell, candidate, field, stats) == Ordering::Equal {
                    found = true;
                    break;
                }
            }
            if filter.op == CompareOp::In { found } else { !found }
        }
        CompareOp::Between => {
            let Some(cell) = cell else { return Ok(false) };
            let low = filter.value.as_deref().unwrap_or_default();
            let high = filter.value2.as_deref().unwrap_or_default();
            typed_compare(cell, low, field, stats) != Ordering::Less
                && typed_compare(cell, high, field, stats) != Ordering::Greater
        }
        CompareOp::Eq | CompareOp::Ne | CompareOp::Gt | CompareOp::Gte | CompareOp::Lt
        | CompareOp::Lte => {
            let Some(cell) = cell else { return Ok(false) };
            let target = filter.value.as_deref().unwrap_or_default();
            let ord = typed_compare(cell, target, field, stats);
            match filter.op {
                CompareOp::Eq => ord == Ordering::Equal,
                CompareOp::Ne => ord != Ordering::Equal,
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Gte => ord != Ordering::Less,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Lte => ord != Ordering::Greater,
                _ => unreachable!(),
            }
        }
    };
    Ok(result)
}

/// Compare two string representations under a field's type, degrading
/// to string comparison when either side refuses to parse.
fn typed_compare(
    left: &str,
    right: &str,
    field: &crate::packet::Field,
    stats: &mut HashMap<String, u64>,
) -> Ordering {
    match (parse_value(left, field), parse_value(right, field)) {
        (Ok(a), Ok(b)) => compare_values(&a, &b).unwrap_or_else(|| left.cmp(right)),
        _ => {
            *stats.entry("parse_fallback".to_string()).or_insert(0) += 1;
            left.cmp(right)
        }
    }
}

/// Sort comparator for one column. NULLs sort first in ASC and last in
/// DESC; non-null values order naturally within the field's type, with
/// silent string fallback.
fn compare_column(
    a: Option<&str>,
    b: Option<&str>,
    field: &crate::packet::Field,
    direction: SortDirection,
) -> Ordering {
    let ord = match (a, b) {
        (None, None) => return Ordering::Equal,
        (None, Some(_)) => return match direction {
            SortDirection::Asc => Ordering::Less,
            SortDirection::Desc => Ordering::Greater,
        },
        (Some(_), None) => return match direction {
            SortDirection::Asc => Ordering::Greater,
            SortDirection::Desc => Ordering::Less,
        },
        (Some(a), Some(b)) => match (parse_value(a, field), parse_value(b, field)) {
            (Ok(x), Ok(y)) => compare_values(&x, &y).unwrap_or_else(|| a.cmp(b)),
            _ => a.cmp(b),
        },
    };
    match direction {
        SortDirection::Asc => ord,
        SortDirection::Desc => ord.reverse(),
    }
}

/// `%` matches any run, `_` any single character; everything else is
/// literal. Matching is case-sensitive.
fn like_match(pattern: &str, text: &str) -> Result<bool, TdtpError> {
    let mut regex_src = String::with_capacity(pattern.len() + 2);
    regex_src.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => regex_src.push_str(".*"),
            '_' => regex_src.push('.'),
            c => regex_src.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex_src.push('$');
    let re = regex::Regex::new(&regex_src)
        .map_err(|e| TdtpError::Query(format!("LIKE pattern {pattern:?}: {e}")))?;
    Ok(re.is_match(text))
}
