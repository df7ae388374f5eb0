//! Broker-side packet importer.
//!
//! Worker tasks pull raw payloads off a broker, parse them into packets
//! and hand them to a user-supplied handler. Across one run every part
//! must belong to a single batch and carry an equivalent schema; table
//! creation happens exactly once, guarded by a mutex whose first writer
//! wins. Violations are named errors recorded in the run statistics;
//! acknowledgement and redelivery policy belong to the broker client
//! behind the byte interface.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tdtp_core::broker::MessageBroker;
use tdtp_core::packet::{Packet, Schema};
use tdtp_core::wire::parse_packet;
use tdtp_core::TdtpError;

/// What the importer hands each parsed packet to.
///
/// `first_part` is true exactly once per run; that call creates the
/// target table, later calls only load rows.
#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn handle(&self, packet: &Packet, first_part: bool) -> Result<(), TdtpError>;
}

#[derive(Debug, Default, Clone)]
pub struct ImportStats {
    pub packets_processed: u64,
    pub packets_failed: u64,
    pub rows_imported: u64,
    pub errors: Vec<String>,
}

/// Cross-part invariants of one importer run.
#[derive(Default)]
struct BatchGuard {
    batch_id: Option<String>,
    schema: Option<Schema>,
    table_created: bool,
}

impl BatchGuard {
    /// Admit a packet, returning whether it is the run's first part.
    fn admit(&mut self, packet: &Packet) -> Result<bool, TdtpError> {
        let batch_id = packet.header.batch_id();
        match &self.batch_id {
            None => self.batch_id = Some(batch_id.to_string()),
            Some(expected) if expected != batch_id => {
                return Err(TdtpError::Packet(format!(
                    "batch invariant violated: expected batch {expected}, got {batch_id}"
                )));
            }
            Some(_) => {}
        }
        match &self.schema {
            None => self.schema = Some(packet.schema.clone()),
            Some(expected) if !expected.equivalent(&packet.schema) => {
                return Err(TdtpError::SchemaMismatch(format!(
                    "schema invariant violated: part {} of batch {batch_id} differs from the first part",
                    packet.header.part_number
                )));
            }
            Some(_) => {}
        }
        let first = !self.table_created;
        self.table_created = true;
        Ok(first)
    }
}

pub struct Importer {
    workers: usize,
}

impl Importer {
    pub fn new() -> Self {
        Importer { workers: 4 }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Drain the broker until it reports a graceful end (or the context
    /// is cancelled), feeding packets through the handler.
    pub async fn run(
        &self,
        broker: &mut dyn MessageBroker,
        handler: Arc<dyn PacketHandler>,
        cancel: &CancellationToken,
    ) -> Result<ImportStats, TdtpError> {
        let (payload_tx, payload_rx) = mpsc::channel::<Vec<u8>>(self.workers * 2);
        let payload_rx = Arc::new(Mutex::new(payload_rx));
        let guard = Arc::new(Mutex::new(BatchGuard::default()));
        let stats = Arc::new(Mutex::new(ImportStats::default()));

        let mut workers: JoinSet<()> = JoinSet::new();
        for worker in 0..self.workers {
            let payload_rx = Arc::clone(&payload_rx);
            let guard = Arc::clone(&guard);
            let stats = Arc::clone(&stats);
            let handler = Arc::clone(&handler);
            workers.spawn(async move {
                loop {
                    let payload = {
                        let mut rx = payload_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(payload) = payload else { break };
                    match process(&payload, &guard, handler.as_ref()).await {
                        Ok(rows) => {
                            let mut stats = stats.lock().await;
                            stats.packets_processed += 1;
                            stats.rows_imported += rows;
                        }
                        Err(e) => {
                            warn!(worker, error = %e, "packet rejected");
                            let mut stats = stats.lock().await;
                            stats.packets_failed += 1;
                            stats.errors.push(e.to_string());
                        }
                    }
                }
                debug!(worker, "importer worker done");
            });
        }

        let mut cancelled = false;
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                received = broker.receive() => received,
            };
            match received {
                Ok(Some(payload)) => {
                    if payload_tx.send(payload).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    drop(payload_tx);
                    while workers.join_next().await.is_some() {}
                    return Err(e.with_context("importer receive"));
                }
            }
        }
        drop(payload_tx);
        while workers.join_next().await.is_some() {}

        if cancelled {
            return Err(TdtpError::Cancelled("importer cancelled".into()));
        }
        let stats = stats.lock().await.clone();
        Ok(stats)
    }
}

impl Default for Importer {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler that lands packets in a database through an adapter.
///
/// The adapter creates the target table on the first part and loads
/// rows with the configured strategy; Replace and Ignore keep the
/// import idempotent under broker redelivery.
pub struct AdapterImportHandler {
    adapter: Box<dyn tdtp_io::adapter::Adapter>,
    strategy: tdtp_io::adapter::WriteStrategy,
}

impl AdapterImportHandler {
    pub fn new(
        adapter: Box<dyn tdtp_io::adapter::Adapter>,
        strategy: tdtp_io::adapter::WriteStrategy,
    ) -> Self {
        AdapterImportHandler { adapter, strategy }
    }
}

#[async_trait]
impl PacketHandler for AdapterImportHandler {
    async fn handle(&self, packet: &Packet, first_part: bool) -> Result<(), TdtpError> {
        if first_part {
            debug!(table = %packet.header.table, "first part, target table will be created");
        }
        self.adapter
            .import_packet(packet, self.strategy)
            .await
            .map(|_| ())
    }
}

async fn process(
    payload: &[u8],
    guard: &Mutex<BatchGuard>,
    handler: &dyn PacketHandler,
) -> Result<u64, TdtpError> {
    let packet = parse_packet(payload)?;
    packet.validate_arity()?;
    let first_part = {
        let mut guard = guard.lock().await;
        guard.admit(&packet)?
    };
    handler.handle(&packet, first_part).await?;
    Ok(packet.header.record_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdtp_core::generator::generate_reference;
    use tdtp_core::packet::{Field, Row};
    use tdtp_core::types::FieldType;
    use tdtp_core::wire::{serialize_packet, PacketFormat};

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", FieldType::Integer).key(),
            Field::new("v", FieldType::Text),
        ])
    }

    /// Broker stub feeding a fixed payload list.
    struct ScriptedBroker {
        payloads: Vec<Vec<u8>>,
        next: usize,
    }

    impl ScriptedBroker {
        fn new(packets: &[Packet]) -> Self {
            ScriptedBroker {
                payloads: packets
                    .iter()
                    .map(|p| serialize_packet(p, PacketFormat::Xml).unwrap())
                    .collect(),
                next: 0,
            }
        }
    }

    #[async_trait]
    impl MessageBroker for ScriptedBroker {
        async fn connect(&mut self) -> Result<(), TdtpError> {
            Ok(())
        }
        async fn send(&self, _payload: &[u8]) -> Result<(), TdtpError> {
            Ok(())
        }
        async fn receive(&mut self) -> Result<Option<Vec<u8>>, TdtpError> {
            let payload = self.payloads.get(self.next).cloned();
            self.next += 1;
            Ok(payload)
        }
        async fn close(&mut self) -> Result<(), TdtpError> {
            Ok(())
        }
    }

    /// Handler recording what it saw.
    #[derive(Default)]
    struct RecordingHandler {
        first_parts: std::sync::Mutex<u32>,
        rows: std::sync::Mutex<u64>,
    }

    #[async_trait]
    impl PacketHandler for RecordingHandler {
        async fn handle(&self, packet: &Packet, first_part: bool) -> Result<(), TdtpError> {
            if first_part {
                *self.first_parts.lock().unwrap() += 1;
            }
            *self.rows.lock().unwrap() += packet.header.record_count;
            Ok(())
        }
    }

    fn multi_part_batch() -> Vec<Packet> {
        let rows: Vec<Row> = (0..3)
            .map(|i| Row::new(format!("{i}|{}", "x".repeat(tdtp_core::MAX_PART_BYTES / 2))))
            .collect();
        generate_reference("t", &schema(), rows)
    }

    #[tokio::test]
    async fn imports_a_batch_with_one_table_creation() {
        let packets = multi_part_batch();
        assert_eq!(packets.len(), 3);
        let mut broker = ScriptedBroker::new(&packets);
        let handler = Arc::new(RecordingHandler::default());
        let cancel = CancellationToken::new();

        let stats = Importer::new()
            .run(&mut broker, handler.clone(), &cancel)
            .await
            .unwrap();
        assert_eq!(stats.packets_processed, 3);
        assert_eq!(stats.packets_failed, 0);
        assert_eq!(stats.rows_imported, 3);
        // table creation happened exactly once
        assert_eq!(*handler.first_parts.lock().unwrap(), 1);
        assert_eq!(*handler.rows.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn mixed_batches_are_rejected() {
        let mut packets = multi_part_batch();
        // a part from an unrelated batch slips in
        let foreign = generate_reference("t", &schema(), vec![Row::new("9|z")]).remove(0);
        packets.push(foreign);

        let mut broker = ScriptedBroker::new(&packets);
        let handler = Arc::new(RecordingHandler::default());
        let cancel = CancellationToken::new();

        // single worker keeps delivery order deterministic
        let stats = Importer::new()
            .with_workers(1)
            .run(&mut broker, handler, &cancel)
            .await
            .unwrap();
        assert_eq!(stats.packets_processed, 3);
        assert_eq!(stats.packets_failed, 1);
        assert!(stats.errors[0].contains("batch invariant"), "{:?}", stats.errors);
    }

    #[tokio::test]
    async fn schema_drift_is_rejected() {
        let mut packets = multi_part_batch();
        let batch_id = packets[0].header.batch_id().to_string();
        let drifted_schema = Schema::new(vec![
            Field::new("id", FieldType::Integer).key(),
            Field::new("v", FieldType::Integer),
        ]);
        let mut drifted = generate_reference("t", &drifted_schema, vec![Row::new("9|9")]).remove(0);
        drifted.header.message_id = format!("{batch_id}-P9");
        packets.push(drifted);

        let mut broker = ScriptedBroker::new(&packets);
        let handler = Arc::new(RecordingHandler::default());
        let cancel = CancellationToken::new();

        let stats = Importer::new()
            .with_workers(1)
            .run(&mut broker, handler, &cancel)
            .await
            .unwrap();
        assert_eq!(stats.packets_failed, 1);
        assert!(
            stats.errors[0].contains("schema invariant"),
            "{:?}",
            stats.errors
        );
    }

    #[tokio::test]
    async fn malformed_payload_is_counted_not_fatal() {
        let packets = multi_part_batch();
        let mut broker = ScriptedBroker::new(&packets);
        broker.payloads.insert(0, b"not a packet".to_vec());

        let handler = Arc::new(RecordingHandler::default());
        let cancel = CancellationToken::new();
        let stats = Importer::new()
            .with_workers(1)
            .run(&mut broker, handler, &cancel)
            .await
            .unwrap();
        assert_eq!(stats.packets_failed, 1);
        assert_eq!(stats.packets_processed, 3);
    }
}
