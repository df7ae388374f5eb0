//! Spreadsheet sink: one worksheet, a header row, one row per record.

use rust_xlsxwriter::Workbook;
use std::path::Path;

use tdtp_core::codec::decode_row;
use tdtp_core::packet::Packet;
use tdtp_core::types::FieldType;
use tdtp_core::TdtpError;

/// Excel caps worksheet names at 31 characters.
const MAX_SHEET_NAME: usize = 31;

/// Write a buffered packet as an XLSX workbook. Returns the number of
/// data rows written.
pub fn write_packet_xlsx(
    packet: &Packet,
    destination: impl AsRef<Path>,
    sheet: Option<&str>,
) -> Result<u64, TdtpError> {
    let destination = destination.as_ref();
    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TdtpError::Output(format!("mkdir {}: {e}", parent.display())))?;
        }
    }

    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    let name: String = sheet
        .unwrap_or(&packet.header.table)
        .chars()
        .take(MAX_SHEET_NAME)
        .collect();
    worksheet
        .set_name(&name)
        .map_err(|e| TdtpError::Output(format!("xlsx sheet name: {e}")))?;

    for (col, field) in packet.schema.fields().iter().enumerate() {
        worksheet
            .write_string(0, col as u16, &field.name)
            .map_err(|e| TdtpError::Output(format!("xlsx header: {e}")))?;
    }

    let mut written = 0u64;
    for (i, row) in packet.data.rows.iter().enumerate() {
        let columns = decode_row(&row.value)?;
        if columns.len() != packet.schema.len() {
            return Err(TdtpError::Packet(format!(
                "row {} has {} columns, schema has {}",
                i + 1,
                columns.len(),
                packet.schema.len()
            )));
        }
        let excel_row = i as u32 + 1;
        for (col, (value, field)) in columns.iter().zip(packet.schema.fields()).enumerate() {
            let col = col as u16;
            let Some(value) = value else { continue };
            let result = match field.ftype {
                FieldType::Integer | FieldType::Real | FieldType::Decimal => {
                    match value.parse::<f64>() {
                        Ok(number) => worksheet.write_number(excel_row, col, number),
                        Err(_) => worksheet.write_string(excel_row, col, value),
                    }
                }
                FieldType::Boolean => match value.as_str() {
                    "1" | "true" | "TRUE" => worksheet.write_boolean(excel_row, col, true),
                    "0" | "false" | "FALSE" => worksheet.write_boolean(excel_row, col, false),
                    _ => worksheet.write_string(excel_row, col, value),
                },
                _ => worksheet.write_string(excel_row, col, value),
            };
            result.map_err(|e| TdtpError::Output(format!("xlsx cell: {e}")))?;
        }
        written += 1;
    }

    workbook
        .save(destination)
        .map_err(|e| TdtpError::Output(format!("xlsx save {}: {e}", destination.display())))?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdtp_core::generator::generate_reference;
    use tdtp_core::packet::{Field, Row, Schema};

    #[test]
    fn writes_workbook_with_header_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.xlsx");
        let schema = Schema::new(vec![
            Field::new("id", FieldType::Integer).key(),
            Field::new("name", FieldType::Text),
            Field::new("active", FieldType::Boolean),
        ]);
        let packets = generate_reference(
            "users",
            &schema,
            vec![Row::new("1|Alice|true"), Row::new("2||false")],
        );
        let written = write_packet_xlsx(&packets[0], &path, None).unwrap();
        assert_eq!(written, 2);
        assert!(path.exists());
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn long_sheet_names_are_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.xlsx");
        let schema = Schema::new(vec![Field::new("id", FieldType::Integer)]);
        let packets = generate_reference(
            "a_very_long_result_table_name_indeed_beyond_excel",
            &schema,
            vec![Row::new("1")],
        );
        write_packet_xlsx(&packets[0], &path, None).unwrap();
        assert!(path.exists());
    }
}
