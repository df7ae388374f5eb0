//! Collaborator contracts: message brokers and the result log.
//!
//! The core only ever sees a broker as a byte pipe; durability and
//! redelivery policy belong to the client implementation behind the
//! trait.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::TdtpError;

/// Byte-level broker interface.
///
/// `receive` returning `Ok(None)` means graceful end of stream.
/// At-least-once delivery is assumed; importers stay idempotent because
/// the Replace/Ignore write strategies tolerate redelivery.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn connect(&mut self) -> Result<(), TdtpError>;
    async fn send(&self, payload: &[u8]) -> Result<(), TdtpError>;
    async fn receive(&mut self) -> Result<Option<Vec<u8>>, TdtpError>;
    async fn close(&mut self) -> Result<(), TdtpError>;
}

/// Terminal-state sink: publishes the outcome of a pipeline run under a
/// keyed identifier with a TTL.
#[async_trait]
pub trait ResultLog: Send + Sync {
    async fn publish(&self, key: &str, state: &str, ttl: Duration) -> Result<(), TdtpError>;
}

/// A [`ResultLog`] that reports through the tracing subscriber; the
/// default when no external state store is wired in.
pub struct TracingResultLog;

#[async_trait]
impl ResultLog for TracingResultLog {
    async fn publish(&self, key: &str, state: &str, ttl: Duration) -> Result<(), TdtpError> {
        tracing::info!(key, state, ttl_seconds = ttl.as_secs(), "pipeline result");
        Ok(())
    }
}
