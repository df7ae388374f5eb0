//! Packet wire formats.
//!
//! Packets travel as self-describing XML or JSON documents with three
//! top-level sections (header, schema, data) plus an optional query
//! context. The parser auto-detects the format from the first byte of
//! payload. Compressed packets hold a single row whose value is the
//! base64 form of a zstd payload; the payload itself is a JSON array of
//! the logical row values, since row values may contain any character
//! and a line-joined payload would not be reversible.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::TdtpError;
use crate::packet::{
    DataBlock, ExecutionResults, Field, Header, Packet, PacketKind, QueryContext, Row, Schema,
    COMPRESSION_ZSTD,
};
use crate::types::FieldType;

/// On-disk / on-wire document format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketFormat {
    Xml,
    Json,
}

impl PacketFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            PacketFormat::Xml => "xml",
            PacketFormat::Json => "json",
        }
    }
}

/// Serialize a packet in the given format.
pub fn serialize_packet(packet: &Packet, format: PacketFormat) -> Result<Vec<u8>, TdtpError> {
    match format {
        PacketFormat::Json => serde_json::to_vec_pretty(packet)
            .map_err(|e| TdtpError::Packet(format!("json serialize: {e}"))),
        PacketFormat::Xml => serialize_xml(packet),
    }
}

/// Parse a packet from bytes, auto-detecting XML vs JSON.
///
/// Compressed packets are checksum-verified and decompressed here, so
/// callers always observe logical rows.
pub fn parse_packet(bytes: &[u8]) -> Result<Packet, TdtpError> {
    let first = bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .ok_or_else(|| TdtpError::Packet("empty packet document".into()))?;
    let mut packet = match first {
        b'<' => parse_xml(bytes)?,
        b'{' => serde_json::from_slice::<Packet>(bytes)
            .map_err(|e| TdtpError::Packet(format!("json parse: {e}")))?,
        other => {
            return Err(TdtpError::Packet(format!(
                "unrecognized packet document (leading byte 0x{other:02x})"
            )))
        }
    };
    if packet.is_compressed() {
        decompress_data(&mut packet)?;
    }
    Ok(packet)
}

/// Replace the data block rows with one compressed row.
///
/// Returns the compressed payload size. The checksum is the crc32 of
/// the compressed bytes, hex-encoded.
pub fn compress_data(packet: &mut Packet) -> Result<usize, TdtpError> {
    let values: Vec<&str> = packet.data.rows.iter().map(|r| r.value.as_str()).collect();
    let plain = serde_json::to_vec(&values)
        .map_err(|e| TdtpError::Packet(format!("compress: row payload: {e}")))?;
    let compressed = zstd::encode_all(plain.as_slice(), 0)
        .map_err(|e| TdtpError::Packet(format!("compress: zstd: {e}")))?;
    let checksum = format!("{:08x}", crc32fast::hash(&compressed));
    let size = compressed.len();
    packet.data = DataBlock {
        compression: Some(COMPRESSION_ZSTD.to_string()),
        checksum: Some(checksum),
        rows: vec![Row::new(BASE64.encode(compressed))],
    };
    Ok(size)
}

/// Compress only when worthwhile: at least 1 KiB of row bytes and at
/// least a 10 % reduction. Returns whether compression was applied.
pub fn maybe_compress(packet: &mut Packet) -> Result<bool, TdtpError> {
    const MIN_BYTES: usize = 1024;
    let before = packet.row_bytes();
    if packet.is_compressed() || before < MIN_BYTES {
        return Ok(false);
    }
    let original = packet.data.clone();
    let compressed = compress_data(packet)?;
    if compressed * 10 <= before * 9 {
        Ok(true)
    } else {
        packet.data = original;
        Ok(false)
    }
}

fn decompress_data(packet: &mut Packet) -> Result<(), TdtpError> {
    match packet.data.compression.as_deref() {
        Some(COMPRESSION_ZSTD) => {}
        Some(other) => {
            return Err(TdtpError::Packet(format!(
                "unknown compression {other:?}"
            )))
        }
        None => return Ok(()),
    }
    if packet.data.rows.len() != 1 {
        return Err(TdtpError::Packet(format!(
            "compressed packet must hold exactly one row, found {}",
            packet.data.rows.len()
        )));
    }
    let compressed = BASE64
        .decode(packet.data.rows[0].value.as_bytes())
        .map_err(|e| TdtpError::Packet(format!("compressed payload is not base64: {e}")))?;

    if let Some(expected) = packet.data.checksum.as_deref() {
        let actual = format!("{:08x}", crc32fast::hash(&compressed));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(TdtpError::Packet(format!(
                "checksum mismatch: expected {expected}, computed {actual}"
            )));
        }
    }

    let plain = zstd::decode_all(compressed.as_slice())
        .map_err(|e| TdtpError::Packet(format!("zstd decompress: {e}")))?;
    let values: Vec<String> = serde_json::from_slice(&plain)
        .map_err(|e| TdtpError::Packet(format!("decompressed payload: {e}")))?;
    packet.data = DataBlock {
        compression: None,
        checksum: None,
        rows: values.into_iter().map(Row::new).collect(),
    };
    Ok(())
}

// ---------------------------------------------------------------------------
// XML
// ---------------------------------------------------------------------------

fn serialize_xml(packet: &Packet) -> Result<Vec<u8>, TdtpError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    let xml = |e| TdtpError::Packet(format!("xml serialize: {e}"));

    writer.write_event(Event::Start(BytesStart::new("packet"))).map_err(xml)?;

    // header
    writer.write_event(Event::Start(BytesStart::new("header"))).map_err(xml)?;
    write_text_el(&mut writer, "kind", packet.header.kind.as_str())?;
    write_text_el(&mut writer, "table", &packet.header.table)?;
    write_text_el(&mut writer, "messageId", &packet.header.message_id)?;
    write_text_el(&mut writer, "partNumber", &packet.header.part_number.to_string())?;
    write_text_el(&mut writer, "totalParts", &packet.header.total_parts.to_string())?;
    write_text_el(&mut writer, "recordCount", &packet.header.record_count.to_string())?;
    write_text_el(&mut writer, "totalRecords", &packet.header.total_records.to_string())?;
    if let Some(sender) = &packet.header.sender {
        write_text_el(&mut writer, "sender", sender)?;
    }
    if let Some(recipient) = &packet.header.recipient {
        write_text_el(&mut writer, "recipient", recipient)?;
    }
    if let Some(reply_to) = &packet.header.reply_to {
        write_text_el(&mut writer, "replyTo", reply_to)?;
    }
    write_text_el(&mut writer, "createdAt", &packet.header.created_at.to_rfc3339())?;
    writer.write_event(Event::End(BytesEnd::new("header"))).map_err(xml)?;

    // schema
    writer.write_event(Event::Start(BytesStart::new("schema"))).map_err(xml)?;
    for field in packet.schema.fields() {
        let mut el = BytesStart::new("field");
        el.push_attribute(("name", field.name.as_str()));
        el.push_attribute(("type", field.ftype.as_str()));
        if let Some(length) = field.length {
            el.push_attribute(("length", length.to_string().as_str()));
        }
        if let Some(precision) = field.precision {
            el.push_attribute(("precision", precision.to_string().as_str()));
        }
        if let Some(scale) = field.scale {
            el.push_attribute(("scale", scale.to_string().as_str()));
        }
        if let Some(timezone) = &field.timezone {
            el.push_attribute(("timezone", timezone.as_str()));
        }
        if field.is_key {
            el.push_attribute(("key", "true"));
        }
        if field.read_only {
            el.push_attribute(("readOnly", "true"));
        }
        if let Some(subtype) = &field.subtype {
            el.push_attribute(("subtype", subtype.as_str()));
        }
        writer.write_event(Event::Empty(el)).map_err(xml)?;
    }
    writer.write_event(Event::End(BytesEnd::new("schema"))).map_err(xml)?;

    // data
    let mut data_el = BytesStart::new("data");
    if let Some(compression) = &packet.data.compression {
        data_el.push_attribute(("compression", compression.as_str()));
    }
    if let Some(checksum) = &packet.data.checksum {
        data_el.push_attribute(("checksum", checksum.as_str()));
    }
    writer.write_event(Event::Start(data_el)).map_err(xml)?;
    for row in &packet.data.rows {
        write_text_el(&mut writer, "row", &row.value)?;
    }
    writer.write_event(Event::End(BytesEnd::new("data"))).map_err(xml)?;

    // query context
    if let Some(ctx) = &packet.query_context {
        writer.write_event(Event::Start(BytesStart::new("queryContext"))).map_err(xml)?;
        write_text_el(&mut writer, "query", &ctx.query)?;
        let mut results = BytesStart::new("results");
        results.push_attribute((
            "totalRecordsInTable",
            ctx.results.total_records_in_table.to_string().as_str(),
        ));
        results.push_attribute((
            "recordsAfterFilters",
            ctx.results.records_after_filters.to_string().as_str(),
        ));
        results.push_attribute((
            "recordsReturned",
            ctx.results.records_returned.to_string().as_str(),
        ));
        results.push_attribute((
            "moreDataAvailable",
            if ctx.results.more_data_available { "true" } else { "false" },
        ));
        results.push_attribute(("nextOffset", ctx.results.next_offset.to_string().as_str()));
        writer.write_event(Event::Empty(results)).map_err(xml)?;
        writer.write_event(Event::End(BytesEnd::new("queryContext"))).map_err(xml)?;
    }

    writer.write_event(Event::End(BytesEnd::new("packet"))).map_err(xml)?;
    Ok(writer.into_inner())
}

fn write_text_el<W: std::io::Write>(
    writer: &mut Writer<W>,
    name: &str,
    text: &str,
) -> Result<(), TdtpError> {
    let xml = |e| TdtpError::Packet(format!("xml serialize: {e}"));
    writer.write_event(Event::Start(BytesStart::new(name))).map_err(xml)?;
    writer.write_event(Event::Text(BytesText::new(text))).map_err(xml)?;
    writer.write_event(Event::End(BytesEnd::new(name))).map_err(xml)?;
    Ok(())
}

fn parse_xml(bytes: &[u8]) -> Result<Packet, TdtpError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| TdtpError::Packet(format!("xml parse: not utf-8: {e}")))?;
    // no trim_text: row values may legitimately start or end with
    // whitespace; indentation arrives as ignorable text events instead
    let mut reader = Reader::from_str(text);

    let mut header: Option<Header> = None;
    let mut fields: Vec<Field> = Vec::new();
    let mut data = DataBlock::default();
    let mut query: Option<String> = None;
    let mut results: Option<ExecutionResults> = None;
    let mut saw_query_context = false;

    // header leaf accumulator
    let mut h_kind: Option<PacketKind> = None;
    let mut h = HeaderDraft::default();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| TdtpError::Packet(format!("xml parse: {e}")))?;
        match event {
            Event::Empty(el) => {
                let name = String::from_utf8_lossy(el.name().as_ref()).to_string();
                match name.as_str() {
                    "field" => fields.push(parse_field_el(&el)?),
                    "results" => results = Some(parse_results_el(&el)?),
                    "row" => data.rows.push(Row::new(String::new())),
                    "data" => {
                        data.compression = attr(&el, "compression")?;
                        data.checksum = attr(&el, "checksum")?;
                    }
                    "queryContext" => saw_query_context = true,
                    // an empty leaf contributes its default value
                    _ => {}
                }
            }
            Event::Start(el) => {
                let name = String::from_utf8_lossy(el.name().as_ref()).to_string();
                match name.as_str() {
                    "packet" | "header" | "schema" | "data" | "queryContext" => {
                        if name == "queryContext" {
                            saw_query_context = true;
                        }
                        if name == "data" {
                            data.compression = attr(&el, "compression")?;
                            data.checksum = attr(&el, "checksum")?;
                        }
                    }
                    "kind" => h_kind = Some(PacketKind::parse(&read_text(&mut reader, &el)?)?),
                    "table" => h.table = read_text(&mut reader, &el)?,
                    "messageId" => h.message_id = read_text(&mut reader, &el)?,
                    "partNumber" => h.part_number = parse_num(&read_text(&mut reader, &el)?, "partNumber")?,
                    "totalParts" => h.total_parts = parse_num(&read_text(&mut reader, &el)?, "totalParts")?,
                    "recordCount" => h.record_count = parse_num(&read_text(&mut reader, &el)?, "recordCount")?,
                    "totalRecords" => h.total_records = parse_num(&read_text(&mut reader, &el)?, "totalRecords")?,
                    "sender" => h.sender = Some(read_text(&mut reader, &el)?),
                    "recipient" => h.recipient = Some(read_text(&mut reader, &el)?),
                    "replyTo" => h.reply_to = Some(read_text(&mut reader, &el)?),
                    "createdAt" => {
                        let raw = read_text(&mut reader, &el)?;
                        h.created_at = Some(
                            DateTime::parse_from_rfc3339(&raw)
                                .map_err(|e| TdtpError::Packet(format!("createdAt: {e}")))?
                                .with_timezone(&Utc),
                        );
                    }
                    "field" => fields.push(parse_field_el(&el)?),
                    "row" => data.rows.push(Row::new(read_text(&mut reader, &el)?)),
                    "query" => query = Some(read_text(&mut reader, &el)?),
                    "results" => results = Some(parse_results_el(&el)?),
                    other => {
                        return Err(TdtpError::Packet(format!(
                            "xml parse: unexpected element <{other}>"
                        )))
                    }
                }
            }
            Event::End(el) => {
                if el.name().as_ref() == b"header" {
                    let kind = h_kind
                        .take()
                        .ok_or_else(|| TdtpError::Packet("header missing <kind>".into()))?;
                    header = Some(h.take().into_header(kind)?);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let header = header.ok_or_else(|| TdtpError::Packet("packet missing <header>".into()))?;
    let query_context = if saw_query_context {
        Some(QueryContext {
            query: query.unwrap_or_default(),
            results: results.unwrap_or_default(),
        })
    } else {
        None
    };
    Ok(Packet {
        header,
        schema: Schema::new(fields),
        data,
        query_context,
    })
}

#[derive(Default)]
struct HeaderDraft {
    table: String,
    message_id: String,
    part_number: u64,
    total_parts: u64,
    record_count: u64,
    total_records: u64,
    sender: Option<String>,
    recipient: Option<String>,
    reply_to: Option<String>,
    created_at: Option<DateTime<Utc>>,
}

impl HeaderDraft {
    fn take(&mut self) -> HeaderDraft {
        std::mem::take(self)
    }

    fn into_header(self, kind: PacketKind) -> Result<Header, TdtpError> {
        Ok(Header {
            kind,
            table: self.table,
            message_id: self.message_id,
            part_number: self.part_number as u32,
            total_parts: self.total_parts as u32,
            record_count: self.record_count,
            total_records: self.total_records,
            sender: self.sender,
            recipient: self.recipient,
            reply_to: self.reply_to,
            created_at: self.created_at.unwrap_or_else(Utc::now),
        })
    }
}

fn read_text(reader: &mut Reader<&[u8]>, el: &BytesStart) -> Result<String, TdtpError> {
    reader
        .read_text(el.to_end().name())
        .map(|t| t.into_owned())
        .map_err(|e| TdtpError::Packet(format!("xml parse: {e}")))
}

fn attr(el: &BytesStart, name: &str) -> Result<Option<String>, TdtpError> {
    match el
        .try_get_attribute(name)
        .map_err(|e| TdtpError::Packet(format!("xml parse: attribute {name}: {e}")))?
    {
        Some(a) => {
            let v = a
                .unescape_value()
                .map_err(|e| TdtpError::Packet(format!("xml parse: attribute {name}: {e}")))?;
            Ok(Some(v.into_owned()))
        }
        None => Ok(None),
    }
}

fn require_attr(el: &BytesStart, name: &str) -> Result<String, TdtpError> {
    attr(el, name)?.ok_or_else(|| {
        TdtpError::Packet(format!(
            "xml parse: <{}> missing {name} attribute",
            String::from_utf8_lossy(el.name().as_ref())
        ))
    })
}

fn parse_num(text: &str, what: &str) -> Result<u64, TdtpError> {
    text.trim()
        .parse::<u64>()
        .map_err(|_| TdtpError::Packet(format!("{what}: {text:?} is not a number")))
}

fn parse_field_el(el: &BytesStart) -> Result<Field, TdtpError> {
    let name = require_attr(el, "name")?;
    let ftype = FieldType::parse(&require_attr(el, "type")?)?;
    let mut field = Field::new(name, ftype);
    if let Some(length) = attr(el, "length")? {
        field.length = Some(parse_num(&length, "length")? as u32);
    }
    if let Some(precision) = attr(el, "precision")? {
        field.precision = Some(parse_num(&precision, "precision")? as u32);
    }
    if let Some(scale) = attr(el, "scale")? {
        field.scale = Some(parse_num(&scale, "scale")? as u32);
    }
    field.timezone = attr(el, "timezone")?;
    field.is_key = attr(el, "key")?.as_deref() == Some("true");
    field.read_only = attr(el, "readOnly")?.as_deref() == Some("true");
    field.subtype = attr(el, "subtype")?;
    Ok(field)
}

fn parse_results_el(el: &BytesStart) -> Result<ExecutionResults, TdtpError> {
    Ok(ExecutionResults {
        total_records_in_table: parse_num(&require_attr(el, "totalRecordsInTable")?, "totalRecordsInTable")?,
        records_after_filters: parse_num(&require_attr(el, "recordsAfterFilters")?, "recordsAfterFilters")?,
        records_returned: parse_num(&require_attr(el, "recordsReturned")?, "recordsReturned")?,
        more_data_available: require_attr(el, "moreDataAvailable")? == "true",
        next_offset: parse_num(&require_attr(el, "nextOffset")?, "nextOffset")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::batch_id_of;

    fn sample_packet() -> Packet {
        Packet {
            header: Header {
                kind: PacketKind::Response,
                table: "users".into(),
                message_id: "batch-7-P1".into(),
                part_number: 1,
                total_parts: 1,
                record_count: 2,
                total_records: 2,
                sender: Some("node-a".into()),
                recipient: None,
                reply_to: Some("query-3".into()),
                created_at: DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
                    .unwrap()
                    .with_timezone(&Utc),
            },
            schema: Schema::new(vec![
                Field::new("id", FieldType::Integer).key(),
                Field::new("name", FieldType::Text).with_length(64).with_subtype("nvarchar"),
            ]),
            data: DataBlock {
                compression: None,
                checksum: None,
                rows: vec![Row::new("1|Alice"), Row::new("2|Bob \\| Sons")],
            },
            query_context: Some(QueryContext {
                query: "SELECT * FROM users WHERE id > 0".into(),
                results: ExecutionResults {
                    total_records_in_table: 2,
                    records_after_filters: 2,
                    records_returned: 2,
                    more_data_available: false,
                    next_offset: 0,
                },
            }),
        }
    }

    fn assert_same(a: &Packet, b: &Packet) {
        assert_eq!(a.header.table, b.header.table);
        assert_eq!(a.header.message_id, b.header.message_id);
        assert_eq!(a.header.kind, b.header.kind);
        assert_eq!(a.header.record_count, b.header.record_count);
        assert_eq!(a.header.sender, b.header.sender);
        assert_eq!(a.header.reply_to, b.header.reply_to);
        assert!(a.schema.equivalent(&b.schema));
        assert_eq!(a.schema.fields()[1].length, b.schema.fields()[1].length);
        assert_eq!(a.schema.fields()[1].subtype, b.schema.fields()[1].subtype);
        assert_eq!(a.data.rows, b.data.rows);
        assert_eq!(
            a.query_context.as_ref().map(|c| c.results),
            b.query_context.as_ref().map(|c| c.results)
        );
    }

    #[test]
    fn json_roundtrip() {
        let packet = sample_packet();
        let bytes = serialize_packet(&packet, PacketFormat::Json).unwrap();
        let parsed = parse_packet(&bytes).unwrap();
        assert_same(&packet, &parsed);
    }

    #[test]
    fn xml_roundtrip() {
        let packet = sample_packet();
        let bytes = serialize_packet(&packet, PacketFormat::Xml).unwrap();
        let parsed = parse_packet(&bytes).unwrap();
        assert_same(&packet, &parsed);
    }

    #[test]
    fn batch_id_from_header() {
        assert_eq!(batch_id_of(&sample_packet().header.message_id), "batch-7");
    }

    #[test]
    fn compression_roundtrip_either_format() {
        let mut packet = sample_packet();
        // inflate the rows past the 1 KiB threshold
        packet.data.rows = (0..200)
            .map(|i| Row::new(format!("{i}|user-{i}-padding-padding-padding")))
            .collect();
        packet.header.record_count = 200;
        let original_rows = packet.data.rows.clone();

        assert!(maybe_compress(&mut packet).unwrap());
        assert!(packet.is_compressed());
        assert_eq!(packet.data.rows.len(), 1);

        for format in [PacketFormat::Xml, PacketFormat::Json] {
            let bytes = serialize_packet(&packet, format).unwrap();
            let parsed = parse_packet(&bytes).unwrap();
            assert!(!parsed.is_compressed());
            assert_eq!(parsed.data.rows, original_rows);
        }
    }

    #[test]
    fn small_packets_stay_uncompressed() {
        let mut packet = sample_packet();
        assert!(!maybe_compress(&mut packet).unwrap());
        assert!(!packet.is_compressed());
    }

    #[test]
    fn checksum_mismatch_is_detected() {
        let mut packet = sample_packet();
        packet.data.rows = (0..200).map(|i| Row::new(format!("{i}|x"))).collect();
        compress_data(&mut packet).unwrap();
        packet.data.checksum = Some("00000000".into());
        let bytes = serialize_packet(&packet, PacketFormat::Json).unwrap();
        let err = parse_packet(&bytes).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"), "{err}");
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let bytes = serialize_packet(&sample_packet(), PacketFormat::Xml).unwrap();
        let text = String::from_utf8(bytes).unwrap().replace(
            "<kind>response</kind>",
            "<kind>broadcast</kind>",
        );
        let err = parse_packet(text.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("unknown packet kind"), "{err}");
    }
}
