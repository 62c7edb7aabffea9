//! Spreadsheet export of the filtered event view.

use ftrack_core::EventRecord;
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use thiserror::Error;
use tracing::info;

pub const EXPORT_COLUMNS: [&str; 13] = [
    "Source",
    "Title",
    "Type",
    "From",
    "To",
    "Days",
    "Academic Year",
    "Role",
    "Participants",
    "Location",
    "Owner",
    "Owner Email",
    "Attachments",
];

const DAYS_COLUMN: u16 = 5;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to build workbook: {0}")]
    Workbook(#[from] XlsxError),
}

/// One text row per record, in the order given, matching [`EXPORT_COLUMNS`].
pub fn report_rows(records: &[EventRecord]) -> Vec<[String; 13]> {
    records
        .iter()
        .map(|r| {
            [
                r.source_kind.label().to_string(),
                r.title.clone(),
                r.event_type.clone(),
                r.from_date.clone().unwrap_or_default(),
                r.to_date.clone().unwrap_or_default(),
                r.duration_days().map(|d| d.to_string()).unwrap_or_default(),
                r.academic_year().unwrap_or_default(),
                r.role.map(|role| role.as_str().to_string()).unwrap_or_default(),
                r.participants_display(),
                r.location.clone().unwrap_or_default(),
                r.owner_name.clone(),
                r.owner_email.clone(),
                r.attachments.as_ref().map(|a| a.to_text()).unwrap_or_default(),
            ]
        })
        .collect()
}

/// Render `records` as an `.xlsx` workbook with a bold header row.
pub fn export_xlsx(records: &[EventRecord]) -> Result<Vec<u8>, ExportError> {
    let mut workbook = Workbook::new();
    let header = Format::new().set_bold();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name("Events")?;

    for (col, title) in EXPORT_COLUMNS.iter().enumerate() {
        worksheet.write_string_with_format(0, col as u16, *title, &header)?;
    }

    for (index, (record, row)) in records.iter().zip(report_rows(records)).enumerate() {
        let excel_row = (index + 1) as u32;
        for (col, value) in row.iter().enumerate() {
            let col = col as u16;
            match record.duration_days() {
                Some(days) if col == DAYS_COLUMN => {
                    worksheet.write_number(excel_row, col, days as f64)?;
                }
                _ => {
                    worksheet.write_string(excel_row, col, value.as_str())?;
                }
            }
        }
    }

    let bytes = workbook.save_to_buffer()?;
    info!(rows = records.len(), bytes = bytes.len(), "event report exported");
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftrack_core::{Attachments, EventRole, SourceKind};

    fn record() -> EventRecord {
        EventRecord {
            id: 7,
            source_kind: SourceKind::Faculty,
            title: "AI Bootcamp".into(),
            event_type: "Workshop".into(),
            from_date: Some("2024-01-10".into()),
            to_date: Some("2024-01-12".into()),
            role: Some(EventRole::Organized),
            participants: Some(40),
            location: None,
            attachments: Some(Attachments::Files(vec![
                "https://files.example/a.png".into(),
                "https://files.example/b.pdf".into(),
            ])),
            owner_name: "Asha Rao".into(),
            owner_email: "asha@example.edu".into(),
        }
    }

    #[test]
    fn rows_flatten_attachments_to_plain_urls() {
        let rows = report_rows(&[record()]);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row[0], "Faculty");
        assert_eq!(row[5], "3");
        assert_eq!(row[6], "2023-2024");
        assert_eq!(row[8], "40");
        assert_eq!(row[9], "");
        assert_eq!(row[12], "https://files.example/a.png, https://files.example/b.pdf");
    }

    #[test]
    fn empty_view_still_has_a_header() {
        let bytes = export_xlsx(&[]).unwrap();
        assert!(bytes.starts_with(b"PK"));
    }
}
