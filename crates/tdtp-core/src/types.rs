//! Canonical type system and value converter.
//!
//! Every adapter maps its dialect columns onto these nine canonical
//! types; values travel as strings inside rows and are parsed into
//! [`TypedValue`] wherever typed behavior is needed (comparison,
//! binding, DDL). Subtype tags on a field never affect parsing.

use std::cmp::Ordering;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TdtpError;
use crate::packet::Field;

/// Canonical column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Integer,
    Real,
    Decimal,
    Text,
    Boolean,
    Date,
    Datetime,
    Timestamp,
    Blob,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Integer => "integer",
            FieldType::Real => "real",
            FieldType::Decimal => "decimal",
            FieldType::Text => "text",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Datetime => "datetime",
            FieldType::Timestamp => "timestamp",
            FieldType::Blob => "blob",
        }
    }

    pub fn parse(s: &str) -> Result<Self, TdtpError> {
        match s {
            "integer" => Ok(FieldType::Integer),
            "real" => Ok(FieldType::Real),
            "decimal" => Ok(FieldType::Decimal),
            "text" => Ok(FieldType::Text),
            "boolean" => Ok(FieldType::Boolean),
            "date" => Ok(FieldType::Date),
            "datetime" => Ok(FieldType::Datetime),
            "timestamp" => Ok(FieldType::Timestamp),
            "blob" => Ok(FieldType::Blob),
            other => Err(TdtpError::Packet(format!("unknown field type {other:?}"))),
        }
    }

    /// True for types compared numerically.
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Real | FieldType::Decimal)
    }

    /// True for types compared chronologically.
    pub fn is_temporal(&self) -> bool {
        matches!(self, FieldType::Date | FieldType::Datetime | FieldType::Timestamp)
    }
}

/// Text form of a Blob column, taken from the field subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobEncoding {
    Hex,
    Base64,
}

impl BlobEncoding {
    /// The caller must declare the encoding through the field subtype.
    pub fn from_field(field: &Field) -> Result<Self, TdtpError> {
        match field.subtype.as_deref() {
            Some("hex") | Some("base16") => Ok(BlobEncoding::Hex),
            Some("base64") => Ok(BlobEncoding::Base64),
            Some(other) => Err(TdtpError::ValueParse(format!(
                "field {}: blob subtype {other:?} is not a known encoding",
                field.name
            ))),
            None => Err(TdtpError::ValueParse(format!(
                "field {}: blob fields must declare a hex or base64 subtype",
                field.name
            ))),
        }
    }
}

/// A parsed value: one active variant plus NULL.
///
/// Decimal keeps its formatting scale next to the value so canonical
/// strings round-trip; Blob keeps the text encoding it arrived in.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Null,
    Integer(i64),
    Real(f64),
    Decimal { value: f64, scale: Option<u32> },
    Text(String),
    Boolean(bool),
    Date(NaiveDate),
    Datetime(DateTime<FixedOffset>),
    Timestamp(DateTime<FixedOffset>),
    Blob(Vec<u8>, BlobEncoding),
}

impl TypedValue {
    pub fn is_null(&self) -> bool {
        matches!(self, TypedValue::Null)
    }
}

/// Parse a string representation under a field definition.
///
/// The string must be non-empty; empty columns decode to NULL before the
/// converter is involved.
pub fn parse_value(repr: &str, field: &Field) -> Result<TypedValue, TdtpError> {
    match field.ftype {
        FieldType::Integer => repr
            .parse::<i64>()
            .map(TypedValue::Integer)
            .map_err(|_| parse_err(field, repr, "a 64-bit integer")),
        FieldType::Real => parse_float(repr)
            .map(TypedValue::Real)
            .ok_or_else(|| parse_err(field, repr, "a decimal float")),
        FieldType::Decimal => parse_float(repr)
            .map(|value| TypedValue::Decimal {
                value,
                // the literal's own scale wins so its string form round-trips
                scale: decimal_scale(repr).or(field.scale),
            })
            .ok_or_else(|| parse_err(field, repr, "a decimal number")),
        FieldType::Text => Ok(TypedValue::Text(repr.to_string())),
        FieldType::Boolean => match repr {
            "1" | "true" | "TRUE" => Ok(TypedValue::Boolean(true)),
            "0" | "false" | "FALSE" => Ok(TypedValue::Boolean(false)),
            _ => Err(parse_err(field, repr, "a boolean")),
        },
        FieldType::Date => NaiveDate::parse_from_str(repr, "%Y-%m-%d")
            .map(TypedValue::Date)
            .map_err(|_| parse_err(field, repr, "a YYYY-MM-DD date")),
        FieldType::Datetime => parse_datetime(repr)
            .map(TypedValue::Datetime)
            .ok_or_else(|| parse_err(field, repr, "an ISO-8601 datetime")),
        FieldType::Timestamp => parse_datetime(repr)
            .map(TypedValue::Timestamp)
            .ok_or_else(|| parse_err(field, repr, "an ISO-8601 timestamp")),
        FieldType::Blob => {
            let encoding = BlobEncoding::from_field(field)?;
            let bytes = match encoding {
                BlobEncoding::Hex => hex::decode(repr)
                    .map_err(|_| parse_err(field, repr, "a hex-encoded blob"))?,
                BlobEncoding::Base64 => BASE64
                    .decode(repr)
                    .map_err(|_| parse_err(field, repr, "a base64-encoded blob"))?,
            };
            Ok(TypedValue::Blob(bytes, encoding))
        }
    }
}

/// Format a typed value back into its canonical string representation.
pub fn format_value(value: &TypedValue) -> String {
    match value {
        TypedValue::Null => String::new(),
        TypedValue::Integer(i) => i.to_string(),
        TypedValue::Real(f) => format_float(*f),
        TypedValue::Decimal { value, scale } => match scale {
            Some(s) => format!("{:.*}", *s as usize, value),
            None => format_float(*value),
        },
        TypedValue::Text(s) => s.clone(),
        TypedValue::Boolean(b) => if *b { "true" } else { "false" }.to_string(),
        TypedValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        TypedValue::Datetime(dt) | TypedValue::Timestamp(dt) => {
            dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
        }
        TypedValue::Blob(bytes, BlobEncoding::Hex) => hex::encode(bytes),
        TypedValue::Blob(bytes, BlobEncoding::Base64) => BASE64.encode(bytes),
    }
}

/// Natural ordering within one canonical type; `None` when the variants
/// differ or a float comparison is undefined.
pub fn compare_values(a: &TypedValue, b: &TypedValue) -> Option<Ordering> {
    match (a, b) {
        (TypedValue::Integer(x), TypedValue::Integer(y)) => Some(x.cmp(y)),
        (TypedValue::Real(x), TypedValue::Real(y)) => x.partial_cmp(y),
        (
            TypedValue::Decimal { value: x, .. },
            TypedValue::Decimal { value: y, .. },
        ) => x.partial_cmp(y),
        (TypedValue::Text(x), TypedValue::Text(y)) => Some(x.cmp(y)),
        (TypedValue::Boolean(x), TypedValue::Boolean(y)) => Some(x.cmp(y)),
        (TypedValue::Date(x), TypedValue::Date(y)) => Some(x.cmp(y)),
        (TypedValue::Datetime(x), TypedValue::Datetime(y))
        | (TypedValue::Timestamp(x), TypedValue::Timestamp(y)) => Some(x.cmp(y)),
        (TypedValue::Blob(x, _), TypedValue::Blob(y, _)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn parse_err(field: &Field, repr: &str, expected: &str) -> TdtpError {
    TdtpError::ValueParse(format!(
        "field {}: {repr:?} is not {expected}",
        field.name
    ))
}

/// Decimal float: optional leading `-`, digits, at most one point. The
/// stricter shape keeps `inf`/`nan`/exponent forms out of rows.
fn parse_float(repr: &str) -> Option<f64> {
    let body = repr.strip_prefix('-').unwrap_or(repr);
    if body.is_empty() {
        return None;
    }
    let mut dots = 0;
    for b in body.bytes() {
        match b {
            b'0'..=b'9' => {}
            b'.' => dots += 1,
            _ => return None,
        }
    }
    if dots > 1 || body.starts_with('.') || body.ends_with('.') {
        return None;
    }
    repr.parse::<f64>().ok()
}

fn format_float(f: f64) -> String {
    // shortest round-trip representation
    format!("{f}")
}

fn decimal_scale(repr: &str) -> Option<u32> {
    Some(match repr.split_once('.') {
        Some((_, frac)) => frac.len() as u32,
        None => 0,
    })
}

/// ISO-8601 with optional zone; naive inputs are taken as UTC. A space
/// separator is accepted alongside `T` since several dialects emit it.
fn parse_datetime(repr: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(repr) {
        return Some(dt);
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(repr, fmt) {
            return Some(Utc.from_utc_datetime(&naive).fixed_offset());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(ftype: FieldType) -> Field {
        Field::new("f", ftype)
    }

    #[test]
    fn integer_roundtrip() {
        for s in ["0", "42", "-7", "9223372036854775807"] {
            let v = parse_value(s, &field(FieldType::Integer)).unwrap();
            assert_eq!(format_value(&v), s);
        }
        assert!(parse_value("1.5", &field(FieldType::Integer)).is_err());
        assert!(parse_value("abc", &field(FieldType::Integer)).is_err());
    }

    #[test]
    fn real_rejects_non_decimal_forms() {
        assert!(parse_value("nan", &field(FieldType::Real)).is_err());
        assert!(parse_value("1e5", &field(FieldType::Real)).is_err());
        assert!(parse_value(".5", &field(FieldType::Real)).is_err());
        assert!(parse_value("1.", &field(FieldType::Real)).is_err());
        let v = parse_value("-3.25", &field(FieldType::Real)).unwrap();
        assert_eq!(format_value(&v), "-3.25");
    }

    #[test]
    fn decimal_scale_preserved() {
        let f = field(FieldType::Decimal).with_precision(10, 2);
        let v = parse_value("1.50", &f).unwrap();
        assert_eq!(format_value(&v), "1.50");

        // scale inferred from the literal when the field carries none
        let v = parse_value("2.125", &field(FieldType::Decimal)).unwrap();
        assert_eq!(format_value(&v), "2.125");

        let v = parse_value("2", &field(FieldType::Decimal)).unwrap();
        assert_eq!(format_value(&v), "2");
    }

    #[test]
    fn boolean_forms() {
        for (s, b) in [("1", true), ("true", true), ("TRUE", true), ("0", false), ("false", false), ("FALSE", false)] {
            assert_eq!(
                parse_value(s, &field(FieldType::Boolean)).unwrap(),
                TypedValue::Boolean(b)
            );
        }
        assert!(parse_value("yes", &field(FieldType::Boolean)).is_err());
    }

    #[test]
    fn temporal_roundtrip() {
        let v = parse_value("2024-03-09", &field(FieldType::Date)).unwrap();
        assert_eq!(format_value(&v), "2024-03-09");

        for s in ["2024-03-09T12:30:00Z", "2024-03-09T12:30:00+03:00"] {
            let v = parse_value(s, &field(FieldType::Datetime)).unwrap();
            assert_eq!(format_value(&v), s);
        }

        // naive input is taken as UTC
        let v = parse_value("2024-03-09 12:30:00", &field(FieldType::Timestamp)).unwrap();
        assert_eq!(format_value(&v), "2024-03-09T12:30:00Z");
    }

    #[test]
    fn blob_requires_declared_encoding() {
        assert!(parse_value("deadbeef", &field(FieldType::Blob)).is_err());

        let f = field(FieldType::Blob).with_subtype("hex");
        let v = parse_value("deadbeef", &f).unwrap();
        assert_eq!(format_value(&v), "deadbeef");

        let f = field(FieldType::Blob).with_subtype("base64");
        let v = parse_value("3q2+7w==", &f).unwrap();
        assert_eq!(v, TypedValue::Blob(vec![0xde, 0xad, 0xbe, 0xef], BlobEncoding::Base64));
        assert_eq!(format_value(&v), "3q2+7w==");
    }

    #[test]
    fn subtype_does_not_change_parse_outcome() {
        let plain = parse_value("42", &field(FieldType::Integer)).unwrap();
        let tagged = parse_value("42", &field(FieldType::Integer).with_subtype("money")).unwrap();
        assert_eq!(plain, tagged);
    }

    #[test]
    fn ordering_within_types() {
        use std::cmp::Ordering::*;
        assert_eq!(
            compare_values(&TypedValue::Integer(2), &TypedValue::Integer(10)),
            Some(Less)
        );
        assert_eq!(
            compare_values(&TypedValue::Boolean(false), &TypedValue::Boolean(true)),
            Some(Less)
        );
        assert_eq!(
            compare_values(&TypedValue::Text("10".into()), &TypedValue::Text("2".into())),
            Some(Less)
        );
        assert_eq!(
            compare_values(&TypedValue::Integer(1), &TypedValue::Text("1".into())),
            None
        );
    }
}
