//! TDTP packet files.
//!
//! Reading and writing packet documents on disk, including the
//! multi-part naming convention `<base>_part_<n>_of_<total>.<ext>`.
//! Multi-part sets are merged into one packet whose rows are the
//! concatenation of the parts in part order.

use std::path::{Path, PathBuf};

use tdtp_core::packet::{validate_batch, Packet};
use tdtp_core::wire::{parse_packet, serialize_packet, PacketFormat};
use tdtp_core::TdtpError;
use tracing::debug;

/// Read and parse one packet file; compressed payloads are verified and
/// decompressed by the parser.
pub fn read_packet_file(path: impl AsRef<Path>) -> Result<Packet, TdtpError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .map_err(|e| TdtpError::Packet(format!("read {}: {e}", path.display())))?;
    parse_packet(&bytes).map_err(|e| e.with_context(&format!("file {}", path.display())))
}

/// Serialize one packet to a file.
pub fn write_packet_file(
    path: impl AsRef<Path>,
    packet: &Packet,
    format: PacketFormat,
) -> Result<(), TdtpError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TdtpError::Output(format!("mkdir {}: {e}", parent.display())))?;
        }
    }
    let bytes = serialize_packet(packet, format)?;
    std::fs::write(path, bytes)
        .map_err(|e| TdtpError::Output(format!("write {}: {e}", path.display())))
}

/// Write a packet batch: a single part goes to `destination` directly,
/// several parts to `<base>_part_<n>_of_<total>.<ext>` siblings.
/// Returns the paths written.
pub fn write_packet_files(
    destination: impl AsRef<Path>,
    packets: &[Packet],
    format: PacketFormat,
) -> Result<Vec<PathBuf>, TdtpError> {
    let destination = destination.as_ref();
    if packets.len() <= 1 {
        let packet = packets
            .first()
            .ok_or_else(|| TdtpError::Output("nothing to write".into()))?;
        write_packet_file(destination, packet, format)?;
        return Ok(vec![destination.to_path_buf()]);
    }
    let total = packets.len() as u32;
    let mut written = Vec::with_capacity(packets.len());
    for (i, packet) in packets.iter().enumerate() {
        let path = part_path(destination, i as u32 + 1, total);
        write_packet_file(&path, packet, format)?;
        written.push(path);
    }
    Ok(written)
}

/// `./out/users.xml` → `./out/users_part_2_of_5.xml`
pub fn part_path(destination: &Path, part: u32, total: u32) -> PathBuf {
    let stem = destination
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = destination
        .extension()
        .map(|s| s.to_string_lossy().to_string());
    let name = match ext {
        Some(ext) => format!("{stem}_part_{part}_of_{total}.{ext}"),
        None => format!("{stem}_part_{part}_of_{total}"),
    };
    destination.with_file_name(name)
}

/// Parse `<base>_part_<n>_of_<total>.<ext>` from a path.
pub fn parse_part_path(path: &Path) -> Option<(String, u32, u32, Option<String>)> {
    let stem = path.file_stem()?.to_string_lossy();
    let ext = path.extension().map(|s| s.to_string_lossy().to_string());
    let marker = stem.rfind("_part_")?;
    let base = stem[..marker].to_string();
    let rest = &stem[marker + "_part_".len()..];
    let (part, total) = rest.split_once("_of_")?;
    Some((base, part.parse().ok()?, total.parse().ok()?, ext))
}

/// Read a multi-part set given any one of its part files, merging the
/// parts (in part order) into a single packet renamed to `alias`.
pub fn read_multi_part(path: impl AsRef<Path>, alias: &str) -> Result<Packet, TdtpError> {
    let path = path.as_ref();
    let (base, _, total, ext) = parse_part_path(path).ok_or_else(|| {
        TdtpError::Packet(format!(
            "{} does not follow the <base>_part_<n>_of_<total> naming convention",
            path.display()
        ))
    })?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut parts = Vec::with_capacity(total as usize);
    for n in 1..=total {
        let name = match &ext {
            Some(ext) => format!("{base}_part_{n}_of_{total}.{ext}"),
            None => format!("{base}_part_{n}_of_{total}"),
        };
        let part_path = dir.join(name);
        if !part_path.exists() {
            return Err(TdtpError::Packet(format!(
                "multi-part set {base}: part {n} of {total} is missing ({})",
                part_path.display()
            )));
        }
        parts.push(read_packet_file(&part_path)?);
    }
    debug!(parts = parts.len(), base, "multi-part set read");
    merge_parts(parts, alias)
}

/// Read a single-file source, renaming its table to `alias`.
pub fn read_single(path: impl AsRef<Path>, alias: &str) -> Result<Packet, TdtpError> {
    let mut packet = read_packet_file(path)?;
    packet.header.table = alias.to_string();
    Ok(packet)
}

/// Merge validated parts into one packet under `alias`.
pub fn merge_parts(parts: Vec<Packet>, alias: &str) -> Result<Packet, TdtpError> {
    let ordered = validate_batch(parts)?;
    let mut merged = ordered[0].clone();
    merged.data.rows = ordered.into_iter().flat_map(|p| p.data.rows).collect();
    merged.header.table = alias.to_string();
    merged.header.part_number = 1;
    merged.header.total_parts = 1;
    merged.header.record_count = merged.data.rows.len() as u64;
    merged.header.total_records = merged.header.record_count;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdtp_core::generator::generate_reference;
    use tdtp_core::packet::{Field, Row, Schema};
    use tdtp_core::types::FieldType;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", FieldType::Integer).key(),
            Field::new("v", FieldType::Text),
        ])
    }

    #[test]
    fn part_path_naming() {
        let p = part_path(Path::new("./out/users.xml"), 2, 5);
        assert_eq!(p, PathBuf::from("./out/users_part_2_of_5.xml"));
        assert_eq!(
            parse_part_path(&p),
            Some(("users".into(), 2, 5, Some("xml".into())))
        );
        assert_eq!(parse_part_path(Path::new("users.xml")), None);
    }

    #[test]
    fn single_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        let packets = generate_reference("t", &schema(), vec![Row::new("1|a"), Row::new("2|b")]);
        write_packet_files(&path, &packets, PacketFormat::Json).unwrap();

        let read = read_single(&path, "alias").unwrap();
        assert_eq!(read.header.table, "alias");
        assert_eq!(read.data.rows.len(), 2);
    }

    #[test]
    fn multi_part_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("big.xml");

        // three parts' worth of rows
        let rows: Vec<Row> = (0..3)
            .map(|i| {
                Row::new(format!(
                    "{i}|{}",
                    "x".repeat(tdtp_core::MAX_PART_BYTES / 2)
                ))
            })
            .collect();
        let packets = generate_reference("t", &schema(), rows.clone());
        assert_eq!(packets.len(), 3);
        let written = write_packet_files(&destination, &packets, PacketFormat::Xml).unwrap();
        assert_eq!(written.len(), 3);
        assert!(written[0].ends_with("big_part_1_of_3.xml"));

        let merged = read_multi_part(&written[1], "merged").unwrap();
        assert_eq!(merged.header.table, "merged");
        assert_eq!(merged.header.record_count, 3);
        assert_eq!(merged.data.rows, rows);
    }

    #[test]
    fn missing_part_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("set.xml");
        let rows: Vec<Row> = (0..3)
            .map(|i| {
                Row::new(format!(
                    "{i}|{}",
                    "x".repeat(tdtp_core::MAX_PART_BYTES / 2)
                ))
            })
            .collect();
        let packets = generate_reference("t", &schema(), rows);
        let written = write_packet_files(&destination, &packets, PacketFormat::Xml).unwrap();
        std::fs::remove_file(&written[2]).unwrap();

        let err = read_multi_part(&written[0], "x").unwrap_err();
        assert!(err.to_string().contains("part 3 of 3 is missing"), "{err}");
    }
}
