//! Streaming packet generation.
//!
//! Consumes a row channel and seals size-bounded parts as rows arrive,
//! so a result of any size streams through one in-flight part's worth
//! of memory. The total part count is unknowable mid-stream, so parts
//! carry the sentinel `total_parts = 0`; receivers treat the channel
//! close (and the terminal summary) as end of batch.

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tdtp_core::codec::encode_row;
use tdtp_core::generator::{new_batch_id, MAX_PART_BYTES};
use tdtp_core::packet::{DataBlock, Header, Packet, PacketKind, Row, Schema};
use tdtp_core::TdtpError;

/// One sealed part.
#[derive(Debug)]
pub struct PartResult {
    pub packet: Packet,
    pub part_number: u32,
    pub rows: u64,
}

/// Terminal accounting, delivered once after the last part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub total_parts: u32,
    pub total_rows: u64,
}

/// Parts channel depth: the generator stays at most a couple of sealed
/// parts ahead of the sender.
const PARTS_BUFFER: usize = 2;

/// Spawn the generator over a row channel. Parts (or a terminal error)
/// arrive on the first channel, the summary on the second once the
/// stream ends normally.
pub fn generate(
    table: &str,
    schema: Schema,
    mut rows: mpsc::Receiver<Vec<Option<String>>>,
    cancel: CancellationToken,
) -> (
    mpsc::Receiver<Result<PartResult, TdtpError>>,
    oneshot::Receiver<StreamSummary>,
) {
    let (parts_tx, parts_rx) = mpsc::channel(PARTS_BUFFER);
    let (summary_tx, summary_rx) = oneshot::channel();
    let table = table.to_string();

    tokio::spawn(async move {
        let batch_id = new_batch_id();
        let mut pending: Vec<Row> = Vec::new();
        let mut pending_bytes = 0usize;
        let mut part_number = 0u32;
        let mut total_rows = 0u64;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = parts_tx
                        .send(Err(TdtpError::Cancelled("stream generator cancelled".into())))
                        .await;
                    return;
                }
                next = rows.recv() => next,
            };
            match next {
                Some(columns) => {
                    let encoded = encode_row(&columns);
                    if !pending.is_empty() && pending_bytes + encoded.len() > MAX_PART_BYTES {
                        part_number += 1;
                        let packet = seal_part(
                            &table,
                            &schema,
                            &batch_id,
                            part_number,
                            std::mem::take(&mut pending),
                        );
                        pending_bytes = 0;
                        let rows_in_part = packet.header.record_count;
                        if parts_tx
                            .send(Ok(PartResult {
                                packet,
                                part_number,
                                rows: rows_in_part,
                            }))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    pending_bytes += encoded.len();
                    total_rows += 1;
                    pending.push(Row::new(encoded));
                }
                None => break,
            }
        }

        // the final part; an empty stream still yields one empty part
        // so downstream consumers observe the schema
        if !pending.is_empty() || part_number == 0 {
            part_number += 1;
            let packet = seal_part(&table, &schema, &batch_id, part_number, pending);
            let rows_in_part = packet.header.record_count;
            if parts_tx
                .send(Ok(PartResult {
                    packet,
                    part_number,
                    rows: rows_in_part,
                }))
                .await
                .is_err()
            {
                return;
            }
        }
        debug!(parts = part_number, rows = total_rows, table = %table, "stream sealed");
        let _ = summary_tx.send(StreamSummary {
            total_parts: part_number,
            total_rows,
        });
    });

    (parts_rx, summary_rx)
}

fn seal_part(
    table: &str,
    schema: &Schema,
    batch_id: &str,
    part_number: u32,
    rows: Vec<Row>,
) -> Packet {
    Packet {
        header: Header {
            kind: PacketKind::Reference,
            table: table.to_string(),
            message_id: format!("{batch_id}-P{part_number}"),
            part_number,
            // unknown while streaming; end of batch is channel close
            total_parts: 0,
            record_count: rows.len() as u64,
            total_records: 0,
            sender: None,
            recipient: None,
            reply_to: None,
            created_at: Utc::now(),
        },
        schema: schema.clone(),
        data: DataBlock {
            compression: None,
            checksum: None,
            rows,
        },
        query_context: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdtp_core::packet::Field;
    use tdtp_core::types::FieldType;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", FieldType::Integer).key(),
            Field::new("payload", FieldType::Text),
        ])
    }

    async fn run_stream(
        row_count: usize,
        payload_len: usize,
    ) -> (Vec<PartResult>, Option<StreamSummary>) {
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let (mut parts_rx, summary_rx) = generate("t", schema(), rx, cancel);

        tokio::spawn(async move {
            for i in 0..row_count {
                let row = vec![Some(i.to_string()), Some("x".repeat(payload_len))];
                if tx.send(row).await.is_err() {
                    break;
                }
            }
        });

        let mut parts = Vec::new();
        while let Some(part) = parts_rx.recv().await {
            parts.push(part.unwrap());
        }
        (parts, summary_rx.await.ok())
    }

    #[tokio::test]
    async fn single_part_stream() {
        let (parts, summary) = run_stream(10, 5).await;
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].packet.header.total_parts, 0);
        assert_eq!(parts[0].rows, 10);
        assert_eq!(
            summary,
            Some(StreamSummary {
                total_parts: 1,
                total_rows: 10
            })
        );
    }

    #[tokio::test]
    async fn empty_stream_yields_one_empty_part() {
        let (parts, summary) = run_stream(0, 0).await;
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].rows, 0);
        assert!(parts[0].packet.schema.equivalent(&schema()));
        assert_eq!(summary.unwrap().total_rows, 0);
    }

    #[tokio::test]
    async fn splits_preserve_order_and_count() {
        // rows of ~MAX/3 bytes force a part roughly every other row
        let payload = MAX_PART_BYTES / 3;
        let (parts, summary) = run_stream(7, payload).await;
        assert!(parts.len() >= 3, "got {} parts", parts.len());

        let total: u64 = parts.iter().map(|p| p.rows).sum();
        assert_eq!(total, 7);
        assert_eq!(summary.unwrap().total_rows, 7);

        // parts are numbered consecutively and share the batch id
        let batch = parts[0].packet.header.batch_id().to_string();
        for (i, part) in parts.iter().enumerate() {
            assert_eq!(part.part_number, i as u32 + 1);
            assert_eq!(part.packet.header.batch_id(), batch);
            assert!(part.packet.row_bytes() <= MAX_PART_BYTES);
        }

        // concatenation preserves the consumed row order
        let ids: Vec<String> = parts
            .iter()
            .flat_map(|p| p.packet.data.rows.iter())
            .map(|r| {
                tdtp_core::codec::decode_row(&r.value).unwrap()[0]
                    .clone()
                    .unwrap()
            })
            .collect();
        let expected: Vec<String> = (0..7).map(|i| i.to_string()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn cancellation_surfaces_on_the_parts_channel() {
        let (tx, rx) = mpsc::channel::<Vec<Option<String>>>(1);
        let cancel = CancellationToken::new();
        let (mut parts_rx, summary_rx) = generate("t", schema(), rx, cancel.clone());

        tx.send(vec![Some("1".into()), Some("x".into())]).await.unwrap();
        cancel.cancel();

        let mut saw_cancel = false;
        while let Some(part) = parts_rx.recv().await {
            if let Err(e) = part {
                assert!(e.is_cancelled(), "{e}");
                saw_cancel = true;
            }
        }
        assert!(saw_cancel);
        // no summary after cancellation
        assert!(summary_rx.await.is_err());
        drop(tx);
    }
}
