//! The TDTP packet model.
//!
//! A packet is the atomic unit shipped between adapters, the workspace,
//! brokers and files: a header, an ordered schema, a data block of
//! encoded rows, and an optional query context describing how the rows
//! were produced. Large result sets are split into parts that share a
//! batch identifier; [`Header::batch_id`] recovers it from the part
//! message id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TdtpError;
use crate::types::FieldType;

/// Packet kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketKind {
    /// Full table content, no originating query.
    Reference,
    /// Result of a query, carries a [`QueryContext`].
    Response,
    /// A query envelope (no data rows).
    Query,
}

impl PacketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::Reference => "reference",
            PacketKind::Response => "response",
            PacketKind::Query => "query",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TdtpError> {
        match s {
            "reference" => Ok(PacketKind::Reference),
            "response" => Ok(PacketKind::Response),
            "query" => Ok(PacketKind::Query),
            other => Err(TdtpError::Packet(format!("unknown packet kind {other:?}"))),
        }
    }
}

/// Packet header: identity, part framing and routing tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub kind: PacketKind,
    /// Table the rows belong to (or should be loaded into).
    pub table: String,
    /// `<batchId>-P<n>` for multi-part batches.
    pub message_id: String,
    /// 1-based part number.
    pub part_number: u32,
    /// Number of parts in the batch; `0` means unknown (streamed batch,
    /// end is signalled by channel close).
    pub total_parts: u32,
    /// Rows in this part.
    pub record_count: u64,
    /// Rows in the whole batch, when known.
    pub total_records: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// Message id of the query packet a response answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Header {
    /// The message id with the trailing `-P<n>` part suffix removed.
    ///
    /// Parts of one batch share this value; a message id without the
    /// suffix is its own batch id.
    pub fn batch_id(&self) -> &str {
        batch_id_of(&self.message_id)
    }
}

/// Strip a trailing `-P<digits>` suffix from a message id.
pub fn batch_id_of(message_id: &str) -> &str {
    if let Some(pos) = message_id.rfind("-P") {
        let suffix = &message_id[pos + 2..];
        if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            return &message_id[..pos];
        }
    }
    message_id
}

/// One column definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub ftype: FieldType,
    /// Declared length for Text/Blob columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    /// Precision for Decimal columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    /// Scale for Decimal columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    /// Zone name for zoned timestamps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    /// Part of the primary key.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_key: bool,
    /// Cannot be inserted or updated (identity, computed, rowversion).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
    /// Dialect-specific type nuance (`uniqueidentifier`, `money`,
    /// `datetime2`, `nvarchar`, ...). Informational to the core; round
    /// trips exactly when re-emitted to the originating dialect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
}

impl Field {
    pub fn new(name: impl Into<String>, ftype: FieldType) -> Self {
        Field {
            name: name.into(),
            ftype,
            length: None,
            precision: None,
            scale: None,
            timezone: None,
            is_key: false,
            read_only: false,
            subtype: None,
        }
    }

    pub fn key(mut self) -> Self {
        self.is_key = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    pub fn with_precision(mut self, precision: u32, scale: u32) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }
}

/// Ordered sequence of fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema(pub Vec<Field>);

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Schema(fields)
    }

    pub fn fields(&self) -> &[Field] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Case-insensitive field lookup, returns the column index.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|f| f.name.eq_ignore_ascii_case(name))
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.index_of(name).map(|i| &self.0[i])
    }

    /// Key columns, in schema order.
    pub fn key_fields(&self) -> Vec<&Field> {
        self.0.iter().filter(|f| f.is_key).collect()
    }

    /// Batch-invariant equality: equal length and equal `{name, type}`
    /// by index. Length/precision/subtype differences do not break a
    /// batch.
    pub fn equivalent(&self, other: &Schema) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(a, b)| a.name == b.name && a.ftype == b.ftype)
    }

    /// Schema with read-only fields dropped, with the retained column
    /// indexes (used to project rows the same way).
    pub fn without_read_only(&self) -> (Schema, Vec<usize>) {
        let mut kept = Vec::new();
        let mut idx = Vec::new();
        for (i, f) in self.0.iter().enumerate() {
            if !f.read_only {
                kept.push(f.clone());
                idx.push(i);
            }
        }
        (Schema(kept), idx)
    }
}

/// A single encoded row: `|`-separated column values with backslash
/// escaping (see [`crate::codec`]). An empty column denotes NULL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    pub value: String,
}

impl Row {
    pub fn new(value: impl Into<String>) -> Self {
        Row { value: value.into() }
    }
}

/// Compression tag for zstd-compressed packet payloads.
pub const COMPRESSION_ZSTD: &str = "zstd";

/// Packet data block: compression tag, payload checksum and rows.
///
/// When `compression` is set the block holds exactly one row whose value
/// is the encoded compressed payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub rows: Vec<Row>,
}

/// Execution statistics carried with a response batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResults {
    pub total_records_in_table: u64,
    pub records_after_filters: u64,
    pub records_returned: u64,
    pub more_data_available: bool,
    pub next_offset: u64,
}

/// The original query plus its execution statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryContext {
    pub query: String,
    pub results: ExecutionResults,
}

/// A self-describing TDTP packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    pub header: Header,
    pub schema: Schema,
    pub data: DataBlock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_context: Option<QueryContext>,
}

impl Packet {
    pub fn is_compressed(&self) -> bool {
        self.data.compression.is_some()
    }

    /// Sum of serialized row bytes in the data block.
    pub fn row_bytes(&self) -> usize {
        self.data.rows.iter().map(|r| r.value.len()).sum()
    }

    /// Checks that each row decodes to exactly `schema.len()` columns.
    pub fn validate_arity(&self) -> Result<(), TdtpError> {
        if self.is_compressed() {
            return Ok(());
        }
        let want = self.schema.len();
        for (i, row) in self.data.rows.iter().enumerate() {
            let cols = crate::codec::decode_row(&row.value)?;
            if cols.len() != want {
                return Err(TdtpError::Packet(format!(
                    "row {} of table {} has {} columns, schema has {}",
                    i + 1,
                    self.header.table,
                    cols.len(),
                    want
                )));
            }
        }
        Ok(())
    }
}

/// Validate a reassembled batch: one batch id, equivalent schemas, part
/// numbers covering `[1, total_parts]` without gaps or duplicates.
///
/// Returns the parts sorted by part number.
pub fn validate_batch(mut parts: Vec<Packet>) -> Result<Vec<Packet>, TdtpError> {
    let first = parts
        .first()
        .ok_or_else(|| TdtpError::Packet("empty batch".into()))?;
    let batch_id = first.header.batch_id().to_string();
    let schema = first.schema.clone();
    let total = first.header.total_parts;

    for p in &parts {
        if p.header.batch_id() != batch_id {
            return Err(TdtpError::Packet(format!(
                "mixed batches: {} and {}",
                batch_id,
                p.header.batch_id()
            )));
        }
        if !p.schema.equivalent(&schema) {
            return Err(TdtpError::SchemaMismatch(format!(
                "part {} of batch {} carries a different schema",
                p.header.part_number, batch_id
            )));
        }
        if p.header.total_parts != total {
            return Err(TdtpError::Packet(format!(
                "part {} of batch {} disagrees on total parts ({} vs {})",
                p.header.part_number, batch_id, p.header.total_parts, total
            )));
        }
    }

    parts.sort_by_key(|p| p.header.part_number);
    if total > 0 {
        let mut seen = 0u32;
        for p in &parts {
            let n = p.header.part_number;
            if n == seen {
                return Err(TdtpError::Packet(format!(
                    "duplicate part {n} in batch {batch_id}"
                )));
            }
            if n != seen + 1 {
                return Err(TdtpError::Packet(format!(
                    "missing part {} in batch {}",
                    seen + 1,
                    batch_id
                )));
            }
            seen = n;
        }
        if seen != total {
            return Err(TdtpError::Packet(format!(
                "batch {batch_id} has {seen} of {total} parts"
            )));
        }
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_id_strips_part_suffix() {
        assert_eq!(batch_id_of("abc-123-P7"), "abc-123");
        assert_eq!(batch_id_of("abc-123-P12"), "abc-123");
        assert_eq!(batch_id_of("abc-123"), "abc-123");
        // not a part suffix
        assert_eq!(batch_id_of("abc-Px"), "abc-Px");
        assert_eq!(batch_id_of("abc-P"), "abc-P");
    }

    #[test]
    fn schema_equivalence_ignores_decoration() {
        let a = Schema::new(vec![
            Field::new("id", FieldType::Integer).key(),
            Field::new("name", FieldType::Text).with_length(64),
        ]);
        let b = Schema::new(vec![
            Field::new("id", FieldType::Integer),
            Field::new("name", FieldType::Text).with_subtype("nvarchar"),
        ]);
        assert!(a.equivalent(&b));

        let c = Schema::new(vec![
            Field::new("id", FieldType::Integer),
            Field::new("name", FieldType::Blob),
        ]);
        assert!(!a.equivalent(&c));
    }

    #[test]
    fn read_only_projection() {
        let s = Schema::new(vec![
            Field::new("id", FieldType::Integer).key(),
            Field::new("version", FieldType::Blob).read_only(),
            Field::new("name", FieldType::Text),
        ]);
        let (kept, idx) = s.without_read_only();
        assert_eq!(kept.len(), 2);
        assert_eq!(idx, vec![0, 2]);
        assert_eq!(kept.fields()[1].name, "name");
    }

    #[test]
    fn case_insensitive_lookup() {
        let s = Schema::new(vec![Field::new("UserName", FieldType::Text)]);
        assert_eq!(s.index_of("username"), Some(0));
        assert_eq!(s.index_of("USERNAME"), Some(0));
        assert_eq!(s.index_of("missing"), None);
    }
}
