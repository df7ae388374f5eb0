//! Row value codec.
//!
//! A row is one flat string of `|`-separated column values. Backslash is
//! the sole escape: `\|` is a literal pipe, `\\` a literal backslash. An
//! empty column denotes NULL. A trailing unpaired backslash is malformed.

use crate::error::TdtpError;

/// Encode a column vector into a row value.
///
/// `None` becomes an empty column. Escaping is backslash-first so the
/// encoding is unambiguous.
pub fn encode_row(columns: &[Option<String>]) -> String {
    let mut out = String::new();
    for (i, col) in columns.iter().enumerate() {
        if i > 0 {
            out.push('|');
        }
        if let Some(v) = col {
            for ch in v.chars() {
                match ch {
                    '\\' => out.push_str("\\\\"),
                    '|' => out.push_str("\\|"),
                    c => out.push(c),
                }
            }
        }
    }
    out
}

/// Decode a row value into a column vector.
///
/// Walks left to right; a backslash consumes the next character
/// literally, an unescaped `|` splits. Empty columns decode to `None`.
pub fn decode_row(value: &str) -> Result<Vec<Option<String>>, TdtpError> {
    let mut columns = Vec::new();
    let mut current = String::new();
    let mut escaped = false;

    for ch in value.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
        } else {
            match ch {
                '\\' => escaped = true,
                '|' => {
                    columns.push(finish_column(std::mem::take(&mut current)));
                }
                c => current.push(c),
            }
        }
    }
    if escaped {
        return Err(TdtpError::Packet(
            "malformed row: trailing escape character".into(),
        ));
    }
    columns.push(finish_column(current));
    Ok(columns)
}

fn finish_column(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Serialized length of one encoded column, without allocating.
pub fn encoded_len(column: Option<&str>) -> usize {
    match column {
        None => 0,
        Some(v) => v
            .chars()
            .map(|c| if c == '\\' || c == '|' { 2 } else { c.len_utf8() })
            .sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(cols: Vec<Option<&str>>) {
        let owned: Vec<Option<String>> = cols.iter().map(|c| c.map(String::from)).collect();
        let encoded = encode_row(&owned);
        assert_eq!(decode_row(&encoded).unwrap(), owned, "via {encoded:?}");
    }

    #[test]
    fn plain_values() {
        roundtrip(vec![Some("1"), Some("Alice"), Some("25")]);
    }

    #[test]
    fn pipe_and_backslash_escapes() {
        roundtrip(vec![Some("a|b")]);
        roundtrip(vec![Some("a\\b"), Some("|"), Some("\\")]);
        roundtrip(vec![Some("\\|"), Some("a\\|b|c")]);
    }

    #[test]
    fn null_columns() {
        roundtrip(vec![None, Some("x"), None]);
        assert_eq!(decode_row("||").unwrap(), vec![None, None, None]);
    }

    #[test]
    fn explicit_encoding() {
        assert_eq!(encode_row(&[Some("a|b".into())]), "a\\|b");
        assert_eq!(encode_row(&[Some("a\\b".into())]), "a\\\\b");
        assert_eq!(encode_row(&[None, None]), "|");
    }

    #[test]
    fn trailing_escape_is_an_error() {
        let err = decode_row("abc\\").unwrap_err();
        assert!(err.to_string().contains("trailing escape"));
    }

    #[test]
    fn encoded_len_matches_encode() {
        for v in ["plain", "a|b", "\\", "héllo|wörld\\x"] {
            assert_eq!(
                encoded_len(Some(v)),
                encode_row(&[Some(v.to_string())]).len()
            );
        }
        assert_eq!(encoded_len(None), 0);
    }
}
