//! # TDTP Core - Packet Model, Type System and Query Language
//!
//! This crate provides the foundational types for building TDTP data
//! pipelines. It defines the self-describing packet interchange format,
//! the canonical type system shared by every database adapter, the TDTQL
//! relational sub-language, and the pipeline configuration model.
//!
//! ## Key Components
//!
//! - **Packet Model**: schema-carrying, splittable, optionally compressed
//!   data packets used between adapters, the workspace, brokers and files
//! - **Row Codec**: the `|`-separated row encoding with backslash escaping
//! - **Type System**: canonical column types and a value converter with
//!   round-trip fidelity
//! - **TDTQL**: a small SQL subset with an AST, an in-memory executor and
//!   a SQL generator for push-down
//! - **Configuration**: YAML-based pipeline specification
//!
//! ## Example Usage
//!
//! ```rust
//! use tdtp_core::codec;
//!
//! let encoded = codec::encode_row(&[Some("a|b".into()), None, Some("c".into())]);
//! let decoded = codec::decode_row(&encoded).unwrap();
//! assert_eq!(decoded, vec![Some("a|b".to_string()), None, Some("c".to_string())]);
//! ```

pub mod broker;
pub mod codec;
pub mod config;
pub mod error;
pub mod generator;
pub mod packet;
pub mod query;
pub mod types;
pub mod wire;

pub use broker::{MessageBroker, ResultLog};
pub use error::TdtpError;
pub use generator::{generate_reference, generate_response, MAX_PART_BYTES};
pub use packet::{
    DataBlock, ExecutionResults, Field, Header, Packet, PacketKind, QueryContext, Row, Schema,
};
pub use types::{parse_value, format_value, BlobEncoding, FieldType, TypedValue};
pub use wire::{parse_packet, serialize_packet, PacketFormat};
