//! Result delivery.
//!
//! File sinks serialize one buffered packet (split into parts when it
//! outgrows the part bound, compressed when that pays for itself).
//! Broker sinks consume the streaming generator's parts channel and
//! send each part as it seals, retrying with linear backoff. Partial
//! success is reported, not hidden: the report carries everything that
//! went wrong alongside what was delivered.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tdtp_core::broker::MessageBroker;
use tdtp_core::config::{ErrorHandlingConfig, ErrorPolicy, TdtpOutputConfig, XlsxOutputConfig};
use tdtp_core::generator::{generate_reference, MAX_PART_BYTES};
use tdtp_core::packet::Packet;
use tdtp_core::wire::{maybe_compress, serialize_packet, PacketFormat};
use tdtp_core::TdtpError;

use crate::stream_gen::PartResult;

/// Packets sent to brokers use the framework's native XML form.
const BROKER_FORMAT: PacketFormat = PacketFormat::Xml;

#[derive(Debug, Default)]
pub struct ExportReport {
    pub parts_sent: u32,
    pub rows_sent: u64,
    pub errors: Vec<String>,
}

impl ExportReport {
    pub fn errors_count(&self) -> usize {
        self.errors.len()
    }

    /// Collapse the error list into one output error, if any.
    pub fn into_error(&self) -> Option<TdtpError> {
        if self.errors.is_empty() {
            None
        } else {
            Some(TdtpError::Output(self.errors.join("; ")))
        }
    }
}

/// Buffered file export. Oversized results are re-split into parts;
/// compression applies per part when configured and worthwhile.
pub async fn export_file(
    packet: Packet,
    config: &TdtpOutputConfig,
) -> Result<ExportReport, TdtpError> {
    let mut parts = if packet.row_bytes() > MAX_PART_BYTES {
        generate_reference(&packet.header.table, &packet.schema, packet.data.rows)
    } else {
        vec![packet]
    };

    let mut rows_sent = 0u64;
    for part in &mut parts {
        rows_sent += part.header.record_count;
        if config.compression {
            let applied = maybe_compress(part)?;
            debug!(part = part.header.part_number, compressed = applied, "file part ready");
        }
    }

    let destination = config.destination.clone();
    let format = config.format;
    let parts_count = parts.len() as u32;
    let written = tokio::task::spawn_blocking(move || {
        tdtp_io::tdtp_file::write_packet_files(&destination, &parts, format)
    })
    .await
    .map_err(|e| TdtpError::Output(format!("file export task: {e}")))??;

    info!(files = written.len(), rows = rows_sent, "file export complete");
    Ok(ExportReport {
        parts_sent: parts_count,
        rows_sent,
        errors: Vec::new(),
    })
}

/// Spreadsheet export.
pub async fn export_xlsx(
    packet: Packet,
    config: &XlsxOutputConfig,
) -> Result<ExportReport, TdtpError> {
    let destination = config.destination.clone();
    let sheet = config.sheet.clone();
    let rows = tokio::task::spawn_blocking(move || {
        tdtp_io::xlsx::write_packet_xlsx(&packet, &destination, sheet.as_deref())
    })
    .await
    .map_err(|e| TdtpError::Output(format!("xlsx export task: {e}")))??;
    info!(rows, "xlsx export complete");
    Ok(ExportReport {
        parts_sent: 1,
        rows_sent: rows,
        errors: Vec::new(),
    })
}

/// Streaming broker export: serialize and send parts as they seal.
///
/// The generator's terminal error (including cancellation) and the
/// workspace's error channel both land in the report; the
/// `on_output_error` policy decides whether a failed send stops the
/// stream.
pub async fn export_stream_to_broker(
    broker: &dyn MessageBroker,
    mut parts: mpsc::Receiver<Result<PartResult, TdtpError>>,
    mut stream_errors: mpsc::Receiver<TdtpError>,
    error_handling: &ErrorHandlingConfig,
) -> ExportReport {
    let mut report = ExportReport::default();

    while let Some(next) = parts.recv().await {
        match next {
            Ok(part) => {
                let payload = match serialize_packet(&part.packet, BROKER_FORMAT) {
                    Ok(payload) => payload,
                    Err(e) => {
                        report.errors.push(e.to_string());
                        continue;
                    }
                };
                match send_with_retries(broker, &payload, error_handling).await {
                    Ok(()) => {
                        report.parts_sent += 1;
                        report.rows_sent += part.rows;
                        debug!(part = part.part_number, rows = part.rows, "part sent");
                    }
                    Err(e) => {
                        report.errors.push(e.to_string());
                        if error_handling.on_output_error == ErrorPolicy::Fail {
                            warn!(error = %e, "broker send failed, aborting stream");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                // generator-side terminal error (e.g. cancellation)
                report.errors.push(e.to_string());
                break;
            }
        }
    }
    // at most one terminal error from the workspace side
    if let Some(e) = stream_errors.recv().await {
        report.errors.push(e.to_string());
    }
    report
}

/// One payload with the configured linear backoff.
async fn send_with_retries(
    broker: &dyn MessageBroker,
    payload: &[u8],
    error_handling: &ErrorHandlingConfig,
) -> Result<(), TdtpError> {
    let retries = if error_handling.on_output_error == ErrorPolicy::Retry {
        error_handling.retry_attempts.max(1) as u64
    } else {
        0
    };
    let mut last = None;
    for attempt in 0..=retries {
        match broker.send(payload).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                if attempt < retries {
                    let delay =
                        Duration::from_secs(error_handling.retry_delay_seconds * (attempt + 1));
                    warn!(attempt = attempt + 1, error = %e, "broker send failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| TdtpError::Output("send failed".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tdtp_core::packet::{Field, Row, Schema};
    use tdtp_core::types::FieldType;
    use tokio_util::sync::CancellationToken;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", FieldType::Integer).key(),
            Field::new("v", FieldType::Text),
        ])
    }

    /// Broker stub that can fail the first N sends.
    struct FlakyBroker {
        fail_first: AtomicU32,
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl FlakyBroker {
        fn new(fail_first: u32) -> Self {
            FlakyBroker {
                fail_first: AtomicU32::new(fail_first),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MessageBroker for FlakyBroker {
        async fn connect(&mut self) -> Result<(), TdtpError> {
            Ok(())
        }
        async fn send(&self, payload: &[u8]) -> Result<(), TdtpError> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TdtpError::Output("transient broker outage".into()));
            }
            self.sent.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
        async fn receive(&mut self) -> Result<Option<Vec<u8>>, TdtpError> {
            Ok(None)
        }
        async fn close(&mut self) -> Result<(), TdtpError> {
            Ok(())
        }
    }

    fn feed_rows(count: usize) -> (mpsc::Receiver<Result<PartResult, TdtpError>>, mpsc::Receiver<TdtpError>) {
        let (row_tx, row_rx) = mpsc::channel(16);
        let (_err_tx, err_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let (parts_rx, _summary) = crate::stream_gen::generate("t", schema(), row_rx, cancel);
        tokio::spawn(async move {
            for i in 0..count {
                let _ = row_tx.send(vec![Some(i.to_string()), Some("v".into())]).await;
            }
        });
        (parts_rx, err_rx)
    }

    #[tokio::test]
    async fn file_export_writes_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let config = TdtpOutputConfig {
            format: PacketFormat::Json,
            compression: false,
            destination: dir.path().join("out.json").to_string_lossy().to_string(),
        };
        let packet = generate_reference(
            "t",
            &schema(),
            vec![Row::new("1|a"), Row::new("2|b")],
        )
        .remove(0);
        let report = export_file(packet, &config).await.unwrap();
        assert_eq!(report.parts_sent, 1);
        assert_eq!(report.rows_sent, 2);
        assert!(report.into_error().is_none());
    }

    #[tokio::test]
    async fn file_export_compresses_large_packets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.xml");
        let config = TdtpOutputConfig {
            format: PacketFormat::Xml,
            compression: true,
            destination: path.to_string_lossy().to_string(),
        };
        let rows: Vec<Row> = (0..500)
            .map(|i| Row::new(format!("{i}|value-{i}-padding-padding")))
            .collect();
        let packet = generate_reference("t", &schema(), rows.clone()).remove(0);
        export_file(packet, &config).await.unwrap();

        let read = tdtp_io::tdtp_file::read_packet_file(&path).unwrap();
        // parser transparently decompressed; the rows round-tripped
        assert_eq!(read.data.rows, rows);
        // the raw document holds a single compressed row
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("compression=\"zstd\""), "not compressed");
    }

    #[tokio::test]
    async fn stream_export_sends_every_part() {
        let (parts_rx, err_rx) = feed_rows(25);
        let broker = FlakyBroker::new(0);
        let report = export_stream_to_broker(
            &broker,
            parts_rx,
            err_rx,
            &ErrorHandlingConfig::default(),
        )
        .await;
        assert_eq!(report.parts_sent, 1);
        assert_eq!(report.rows_sent, 25);
        assert_eq!(report.errors_count(), 0);
        assert_eq!(broker.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retry_policy_rides_out_transient_failures() {
        let (parts_rx, err_rx) = feed_rows(5);
        let broker = FlakyBroker::new(2);
        let error_handling = ErrorHandlingConfig {
            on_output_error: ErrorPolicy::Retry,
            retry_attempts: 3,
            retry_delay_seconds: 0,
            ..ErrorHandlingConfig::default()
        };
        let report =
            export_stream_to_broker(&broker, parts_rx, err_rx, &error_handling).await;
        assert_eq!(report.parts_sent, 1);
        assert_eq!(report.errors_count(), 0);
    }

    #[tokio::test]
    async fn fail_policy_aborts_on_send_error() {
        let (parts_rx, err_rx) = feed_rows(5);
        let broker = FlakyBroker::new(u32::MAX);
        let report = export_stream_to_broker(
            &broker,
            parts_rx,
            err_rx,
            &ErrorHandlingConfig::default(),
        )
        .await;
        assert_eq!(report.parts_sent, 0);
        assert!(report.errors_count() >= 1);
        assert!(report.into_error().is_some());
    }

    #[tokio::test]
    async fn cancellation_reason_reaches_the_report() {
        let (row_tx, row_rx) = mpsc::channel::<Vec<Option<String>>>(1);
        let (err_tx, err_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let (parts_rx, _summary) =
            crate::stream_gen::generate("t", schema(), row_rx, cancel.clone());

        // a producer that is cancelled mid-stream, like the workspace
        let producer_cancel = cancel.clone();
        tokio::spawn(async move {
            for i in 0..1000 {
                if i == 100 {
                    producer_cancel.cancel();
                    let _ = err_tx
                        .send(TdtpError::Cancelled("sql stream cancelled".into()))
                        .await;
                    return;
                }
                if row_tx
                    .send(vec![Some(i.to_string()), Some("v".into())])
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });

        let broker = FlakyBroker::new(0);
        let report = export_stream_to_broker(
            &broker,
            parts_rx,
            err_rx,
            &ErrorHandlingConfig::default(),
        )
        .await;
        assert!(report.errors_count() >= 1);
        let joined = report.errors.join("; ");
        assert!(joined.contains("cancelled"), "{joined}");
    }
}
