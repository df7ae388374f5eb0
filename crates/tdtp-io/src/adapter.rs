//! The database adapter contract.
//!
//! Adapters expose a capability set rather than one monolithic
//! interface: schema introspection, streaming-ish reads into packets,
//! strategy-based writes, transactions and raw query execution. The
//! umbrella [`Adapter`] trait is what the registry hands out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use tdtp_core::config::SourceKind;
use tdtp_core::packet::{Packet, Schema};
use tdtp_core::query::SelectStatement;
use tdtp_core::TdtpError;

/// Row write policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Upsert by primary key.
    Replace,
    /// Insert, silently dropping PK/unique violations.
    Ignore,
    /// Plain insert; the first constraint violation aborts the batch.
    Fail,
    /// Bulk path where the dialect has one, otherwise Replace.
    Copy,
}

/// Outcome of an import call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub inserted: u64,
    /// Rows dropped by the Ignore strategy.
    pub ignored: u64,
}

impl ImportSummary {
    pub fn merge(&mut self, other: ImportSummary) {
        self.inserted += other.inserted;
        self.ignored += other.ignored;
    }
}

/// Schema catalogue access.
#[async_trait]
pub trait SchemaReader: Send + Sync {
    async fn table_names(&self) -> Result<Vec<String>, TdtpError>;
    /// View names; views are always read-only.
    async fn view_names(&self) -> Result<Vec<String>, TdtpError>;
    async fn table_exists(&self, table: &str) -> Result<bool, TdtpError>;
    /// Field types, key flags and read-only flags (identity, computed,
    /// rowversion) for one table.
    async fn table_schema(&self, table: &str) -> Result<Schema, TdtpError>;
}

/// Table reads into packets.
#[async_trait]
pub trait DataReader: Send + Sync {
    /// Full table snapshot as `reference` packets.
    async fn export_table(&self, table: &str) -> Result<Vec<Packet>, TdtpError>;
    /// Query read as `response` packets. Pushes the query down as SQL
    /// when translatable, otherwise loads all rows and filters them
    /// in memory.
    async fn export_table_with_query(
        &self,
        query: &SelectStatement,
        sender: Option<&str>,
        recipient: Option<&str>,
    ) -> Result<Vec<Packet>, TdtpError>;
}

/// Strategy-based writes.
#[async_trait]
pub trait DataWriter: Send + Sync {
    async fn import_packet(
        &self,
        packet: &Packet,
        strategy: WriteStrategy,
    ) -> Result<ImportSummary, TdtpError>;

    async fn import_packets(
        &self,
        packets: &[Packet],
        strategy: WriteStrategy,
    ) -> Result<ImportSummary, TdtpError> {
        let mut summary = ImportSummary::default();
        for packet in packets {
            summary.merge(self.import_packet(packet, strategy).await?);
        }
        Ok(summary)
    }

    /// Atomic full-snapshot replacement: load into a staging table,
    /// then swap it in under the target name. A reader sees either the
    /// old snapshot or the new one, never a mix (where the dialect's
    /// rename is atomic).
    async fn import_snapshot(&self, packets: &[Packet]) -> Result<ImportSummary, TdtpError>;
}

/// An in-flight transaction. All operations inside see one consistent
/// snapshot per the dialect's isolation rules.
#[async_trait]
pub trait AdapterTx: Send {
    async fn execute(&mut self, sql: &str) -> Result<u64, TdtpError>;
    async fn commit(self: Box<Self>) -> Result<(), TdtpError>;
    async fn rollback(self: Box<Self>) -> Result<(), TdtpError>;
}

#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn AdapterTx>, TdtpError>;
}

/// Ad-hoc SELECT execution; the loader's path into a source.
#[async_trait]
pub trait RawQueryExecutor: Send + Sync {
    /// Run a SELECT and wrap the result as one `reference` packet named
    /// `result_table`.
    async fn execute_raw_query(
        &self,
        sql: &str,
        result_table: &str,
    ) -> Result<Packet, TdtpError>;
}

/// The full adapter surface.
#[async_trait]
pub trait Adapter:
    SchemaReader + DataReader + DataWriter + TransactionManager + RawQueryExecutor + std::fmt::Debug
{
    async fn ping(&self) -> Result<(), TdtpError>;
    async fn close(&self) -> Result<(), TdtpError>;
    fn database_type(&self) -> &'static str;
    async fn database_version(&self) -> Result<String, TdtpError>;
    /// Opt in to exporting read-only fields (dropped by default).
    fn set_include_read_only(&mut self, include: bool);
}

/// Factory signature: DSN in, connected adapter out.
pub type AdapterFactory =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Box<dyn Adapter>, TdtpError>> + Send + Sync>;

/// Maps source kinds to adapter factories.
pub struct AdapterRegistry {
    factories: HashMap<SourceKind, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        AdapterRegistry {
            factories: HashMap::new(),
        }
    }

    /// Registry with all built-in adapters.
    pub fn with_defaults() -> Self {
        let mut registry = AdapterRegistry::new();
        registry.register(SourceKind::Postgres, factory(|dsn| async move {
            let adapter = crate::postgres::PostgresAdapter::connect(&dsn).await?;
            Ok(Box::new(adapter) as Box<dyn Adapter>)
        }));
        registry.register(SourceKind::Mysql, factory(|dsn| async move {
            let adapter = crate::mysql::MySqlAdapter::connect(&dsn).await?;
            Ok(Box::new(adapter) as Box<dyn Adapter>)
        }));
        registry.register(SourceKind::Sqlite, factory(|dsn| async move {
            let adapter = crate::sqlite::SqliteAdapter::connect(&dsn).await?;
            Ok(Box::new(adapter) as Box<dyn Adapter>)
        }));
        registry.register(SourceKind::Mssql, factory(|dsn| async move {
            let adapter = crate::mssql::MssqlAdapter::connect(&dsn).await?;
            Ok(Box::new(adapter) as Box<dyn Adapter>)
        }));
        registry
    }

    pub fn register(&mut self, kind: SourceKind, factory: AdapterFactory) {
        self.factories.insert(kind, factory);
    }

    pub fn supports(&self, kind: SourceKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Connect an adapter for `kind` with the given DSN.
    pub async fn connect(
        &self,
        kind: SourceKind,
        dsn: &str,
    ) -> Result<Box<dyn Adapter>, TdtpError> {
        let factory = self.factories.get(&kind).ok_or_else(|| {
            TdtpError::Config(format!("no adapter registered for {}", kind.as_str()))
        })?;
        factory(dsn.to_string()).await
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Wrap an async connect function as a boxed registry factory.
pub fn factory<F, Fut>(connect: F) -> AdapterFactory
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Box<dyn Adapter>, TdtpError>> + Send + 'static,
{
    Arc::new(move |dsn| Box::pin(connect(dsn)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_its_defaults() {
        let registry = AdapterRegistry::with_defaults();
        for kind in [
            SourceKind::Postgres,
            SourceKind::Mysql,
            SourceKind::Sqlite,
            SourceKind::Mssql,
        ] {
            assert!(registry.supports(kind), "{}", kind.as_str());
        }
        assert!(!registry.supports(SourceKind::Tdtp));
    }

    #[tokio::test]
    async fn unknown_kind_is_a_config_error() {
        let registry = AdapterRegistry::new();
        let err = registry
            .connect(SourceKind::Postgres, "postgres://nowhere")
            .await
            .unwrap_err();
        assert!(matches!(err, TdtpError::Config(_)), "{err}");
    }

    #[test]
    fn import_summary_merges() {
        let mut a = ImportSummary { inserted: 3, ignored: 1 };
        a.merge(ImportSummary { inserted: 2, ignored: 0 });
        assert_eq!(a, ImportSummary { inserted: 5, ignored: 1 });
    }
}
