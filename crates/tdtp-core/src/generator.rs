//! Buffered multi-part packet generation.
//!
//! Splits a row vector into parts whose cumulative serialized row bytes
//! stay under [`MAX_PART_BYTES`], so each part fits a message-broker
//! payload envelope. Part numbers are 1-based; every part's message id
//! is `<batchId>-P<n>` and `total_parts` is set once the count is
//! known.

use chrono::Utc;
use uuid::Uuid;

use crate::packet::{DataBlock, Header, Packet, PacketKind, QueryContext, Row, Schema};

/// Maximum serialized row bytes per part (~3.8 MB).
pub const MAX_PART_BYTES: usize = 3_800_000;

/// Produce `reference` packets for a full table snapshot.
pub fn generate_reference(table: &str, schema: &Schema, rows: Vec<Row>) -> Vec<Packet> {
    generate(
        PacketKind::Reference,
        table,
        schema,
        rows,
        None,
        None,
        None,
        None,
    )
}

/// Produce `response` packets answering a query; every part carries the
/// query context.
pub fn generate_response(
    table: &str,
    reply_to: Option<&str>,
    schema: &Schema,
    rows: Vec<Row>,
    query_context: QueryContext,
    sender: Option<&str>,
    recipient: Option<&str>,
) -> Vec<Packet> {
    generate(
        PacketKind::Response,
        table,
        schema,
        rows,
        reply_to,
        Some(query_context),
        sender,
        recipient,
    )
}

#[allow(clippy::too_many_arguments)]
fn generate(
    kind: PacketKind,
    table: &str,
    schema: &Schema,
    rows: Vec<Row>,
    reply_to: Option<&str>,
    query_context: Option<QueryContext>,
    sender: Option<&str>,
    recipient: Option<&str>,
) -> Vec<Packet> {
    let batch_id = new_batch_id();
    let total_records = rows.len() as u64;

    // split row runs at the size bound; a single oversized row still
    // forms its own part
    let mut chunks: Vec<Vec<Row>> = Vec::new();
    let mut current: Vec<Row> = Vec::new();
    let mut current_bytes = 0usize;
    for row in rows {
        let len = row.value.len();
        if !current.is_empty() && current_bytes + len > MAX_PART_BYTES {
            chunks.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += len;
        current.push(row);
    }
    chunks.push(current);

    let total_parts = chunks.len() as u32;
    let created_at = Utc::now();
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let part_number = i as u32 + 1;
            Packet {
                header: Header {
                    kind,
                    table: table.to_string(),
                    message_id: format!("{batch_id}-P{part_number}"),
                    part_number,
                    total_parts,
                    record_count: chunk.len() as u64,
                    total_records,
                    sender: sender.map(str::to_string),
                    recipient: recipient.map(str::to_string),
                    reply_to: reply_to.map(str::to_string),
                    created_at,
                },
                schema: schema.clone(),
                data: DataBlock {
                    compression: None,
                    checksum: None,
                    rows: chunk,
                },
                query_context: query_context.clone(),
            }
        })
        .collect()
}

/// A fresh batch identifier.
pub fn new_batch_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{validate_batch, ExecutionResults, Field};
    use crate::types::FieldType;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", FieldType::Integer).key(),
            Field::new("payload", FieldType::Text),
        ])
    }

    #[test]
    fn single_part_for_small_data() {
        let rows = vec![Row::new("1|a"), Row::new("2|b")];
        let packets = generate_reference("t", &schema(), rows);
        assert_eq!(packets.len(), 1);
        let p = &packets[0];
        assert_eq!(p.header.part_number, 1);
        assert_eq!(p.header.total_parts, 1);
        assert_eq!(p.header.record_count, 2);
        assert_eq!(p.header.total_records, 2);
        assert!(p.header.message_id.ends_with("-P1"));
        assert_eq!(p.header.kind, PacketKind::Reference);
    }

    #[test]
    fn empty_input_still_yields_one_packet() {
        let packets = generate_reference("t", &schema(), Vec::new());
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].header.record_count, 0);
    }

    #[test]
    fn splits_at_part_size_and_reassembles() {
        // 10,000 rows of ~500 encoded bytes against a 1,000,000-byte bound
        // would need >= 5 parts; the real bound scales the same way
        let row = format!("1|{}", "x".repeat(498));
        let rows: Vec<Row> = (0..10_000)
            .map(|i| Row::new(format!("{i}|{}", &row[2..])))
            .collect();
        let total_bytes: usize = rows.iter().map(|r| r.value.len()).sum();
        let expected_min_parts = total_bytes / MAX_PART_BYTES;

        let packets = generate_reference("t", &schema(), rows.clone());
        assert!(packets.len() > expected_min_parts);
        assert!(packets.len() >= 2);
        for p in &packets {
            assert!(p.row_bytes() <= MAX_PART_BYTES);
            assert_eq!(p.header.total_parts, packets.len() as u32);
            assert_eq!(p.header.total_records, 10_000);
        }

        let ordered = validate_batch(packets).unwrap();
        let reassembled: Vec<Row> = ordered.into_iter().flat_map(|p| p.data.rows).collect();
        assert_eq!(reassembled, rows);
    }

    #[test]
    fn parts_share_batch_id() {
        let rows: Vec<Row> = (0..3)
            .map(|i| Row::new(format!("{i}|{}", "y".repeat(MAX_PART_BYTES / 2))))
            .collect();
        let packets = generate_reference("t", &schema(), rows);
        assert_eq!(packets.len(), 3);
        let batch = packets[0].header.batch_id().to_string();
        for (i, p) in packets.iter().enumerate() {
            assert_eq!(p.header.batch_id(), batch);
            assert_eq!(p.header.part_number, i as u32 + 1);
        }
    }

    #[test]
    fn response_carries_context_on_every_part() {
        let rows: Vec<Row> = (0..2)
            .map(|i| Row::new(format!("{i}|{}", "z".repeat(MAX_PART_BYTES - 10))))
            .collect();
        let ctx = QueryContext {
            query: "SELECT * FROM t".into(),
            results: ExecutionResults::default(),
        };
        let packets =
            generate_response("t", Some("q-1"), &schema(), rows, ctx, Some("node-a"), None);
        assert_eq!(packets.len(), 2);
        for p in &packets {
            assert_eq!(p.header.kind, PacketKind::Response);
            assert_eq!(p.header.reply_to.as_deref(), Some("q-1"));
            assert!(p.query_context.is_some());
        }
    }
}
