//! Read-path logic shared by the SQL adapters.
//!
//! Each adapter exposes its raw SELECT/COUNT execution through
//! [`SqlPort`]; the push-down and in-memory query paths on top of it
//! are dialect-independent.

use async_trait::async_trait;
use chrono::Utc;

use tdtp_core::codec::{decode_row, encode_row};
use tdtp_core::generator::{generate_response, new_batch_id};
use tdtp_core::packet::{
    DataBlock, ExecutionResults, Header, Packet, PacketKind, QueryContext, Row, Schema,
};
use tdtp_core::query::{executor, sqlgen, SelectStatement};
use tdtp_core::TdtpError;

use crate::dialect::{adapt_pagination, Dialect};

/// Raw SQL execution surface an adapter lends to the shared read path.
#[async_trait]
pub trait SqlPort: Send + Sync {
    /// Run a SELECT whose column list matches `schema`, returning
    /// encoded rows.
    async fn port_fetch_rows(&self, sql: &str, schema: &Schema) -> Result<Vec<Row>, TdtpError>;
    /// Run a single-value COUNT query.
    async fn port_fetch_count(&self, sql: &str) -> Result<u64, TdtpError>;
}

/// Query read: push the query down as dialect SQL when translatable,
/// otherwise load the table and run the in-memory executor. Either way
/// the result is `response` packets carrying execution statistics, with
/// read-only columns projected away unless opted in.
#[allow(clippy::too_many_arguments)]
pub async fn pushdown_response(
    port: &dyn SqlPort,
    dialect: Dialect,
    query: &SelectStatement,
    full_schema: Schema,
    include_read_only: bool,
    allow_pushdown: bool,
    sender: Option<&str>,
    recipient: Option<&str>,
) -> Result<Vec<Packet>, TdtpError> {
    let (rows_full, context) = if allow_pushdown && sqlgen::can_translate(query) {
        let sql = adapt_pagination(dialect, &sqlgen::to_sql(query));
        let rows = port.port_fetch_rows(&sql, &full_schema).await?;

        let total = port
            .port_fetch_count(&format!("SELECT COUNT(*) FROM {}", query.table))
            .await?;
        let matched = match sqlgen::where_clause(query) {
            Some(clause) => {
                port.port_fetch_count(&format!(
                    "SELECT COUNT(*) FROM {} WHERE {}",
                    query.table, clause
                ))
                .await?
            }
            None => total,
        };
        let returned = rows.len() as u64;
        let offset = query.offset.unwrap_or(0);
        let more = matched > offset + returned;
        let context = QueryContext {
            query: if query.raw.is_empty() {
                sqlgen::to_sql(query)
            } else {
                query.raw.clone()
            },
            results: ExecutionResults {
                total_records_in_table: total,
                records_after_filters: matched,
                records_returned: returned,
                more_data_available: more,
                next_offset: if more { offset + returned } else { 0 },
            },
        };
        (rows, context)
    } else {
        // cache the full table and filter in memory
        let columns: Vec<String> = full_schema
            .fields()
            .iter()
            .map(|f| dialect.quote(&f.name))
            .collect();
        let sql = format!(
            "SELECT {} FROM {}",
            columns.join(", "),
            dialect.quote(&query.table)
        );
        let all_rows = port.port_fetch_rows(&sql, &full_schema).await?;
        let outcome = executor::execute(query, &all_rows, &full_schema)?;
        (outcome.rows, outcome.query_context)
    };

    let (schema, rows) = if include_read_only {
        (full_schema, rows_full)
    } else {
        let (projected, keep) = full_schema.without_read_only();
        if keep.len() == full_schema.len() {
            (full_schema, rows_full)
        } else {
            let rows = project_rows(&rows_full, &keep)?;
            (projected, rows)
        }
    };

    Ok(generate_response(
        &query.table,
        None,
        &schema,
        rows,
        context,
        sender,
        recipient,
    ))
}

/// Project encoded rows down to the kept column indexes.
pub fn project_rows(rows: &[Row], keep: &[usize]) -> Result<Vec<Row>, TdtpError> {
    rows.iter()
        .map(|row| {
            let columns = decode_row(&row.value)?;
            let kept: Vec<Option<String>> = keep
                .iter()
                .map(|&i| columns.get(i).cloned().unwrap_or(None))
                .collect();
            Ok(Row::new(encode_row(&kept)))
        })
        .collect()
}

/// One single-part `reference` packet holding an entire ad-hoc result.
/// Splitting happens later, at export time.
pub fn single_reference_packet(
    table: &str,
    schema: Schema,
    rows: Vec<Row>,
) -> Result<Packet, TdtpError> {
    let record_count = rows.len() as u64;
    Ok(Packet {
        header: Header {
            kind: PacketKind::Reference,
            table: table.to_string(),
            message_id: format!("{}-P1", new_batch_id()),
            part_number: 1,
            total_parts: 1,
            record_count,
            total_records: record_count,
            sender: None,
            recipient: None,
            reply_to: None,
            created_at: Utc::now(),
        },
        schema,
        data: DataBlock {
            compression: None,
            checksum: None,
            rows,
        },
        query_context: None,
    })
}
