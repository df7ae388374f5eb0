//! # TDTP IO - Adapters, Brokers and File Sinks
//!
//! Everything that talks to the outside world on behalf of a TDTP
//! pipeline: the driver-agnostic database adapter contract with its
//! four implementations (PostgreSQL, MySQL, MS SQL Server, SQLite),
//! packet file reading/writing with multi-part support, the Kafka and
//! RabbitMQ broker clients behind the core's byte interface, and the
//! spreadsheet sink.

pub mod adapter;
pub mod adapter_common;
pub mod broker_kafka;
pub mod broker_rabbit;
pub mod dialect;
pub mod mssql;
pub mod mysql;
pub mod postgres;
pub mod sqlite;
pub mod tdtp_file;
pub mod xlsx;

pub use adapter::{
    Adapter, AdapterRegistry, AdapterTx, DataReader, DataWriter, ImportSummary, RawQueryExecutor,
    SchemaReader, TransactionManager, WriteStrategy,
};
pub use dialect::Dialect;
