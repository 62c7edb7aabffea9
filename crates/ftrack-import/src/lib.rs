//! Department event spreadsheet import and the matching blank template.

use std::collections::BTreeMap;
use std::io::Cursor;

use calamine::{Data, Reader, Xlsx, XlsxError};
use chrono::{Duration, NaiveDate};
use ftrack_core::calendar::DATE_FORMAT;
use ftrack_core::DepartmentEventFields;
use rust_xlsxwriter::{Format, Note, Workbook};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "ftrack-import";

pub const TEMPLATE_HEADERS: [&str; 10] = [
    "Event Title",
    "Type",
    "Coordinator",
    "From Date (YYYY-MM-DD)",
    "To Date (YYYY-MM-DD)",
    "Participants",
    "Location",
    "Event Output",
    "Attachments Link",
    "Certificate Link (Optional)",
];

pub const TEMPLATE_SHEET: &str = "Template";
pub const TYPES_SHEET: &str = "Types";

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("cannot read workbook: {0}")]
    Workbook(#[from] XlsxError),
    #[error("workbook has no sheets")]
    NoSheets,
    #[error("no data found in file")]
    Empty,
    #[error("no valid rows to import")]
    NoValidRows,
    #[error("failed to build template: {0}")]
    Template(#[from] rust_xlsxwriter::XlsxError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
}

impl CellValue {
    fn from_data(data: &Data) -> Self {
        match data {
            Data::Int(i) => CellValue::Number(*i as f64),
            Data::Float(f) => CellValue::Number(*f),
            Data::String(s) => CellValue::Text(s.clone()),
            Data::Bool(b) => CellValue::Bool(*b),
            Data::DateTime(dt) => CellValue::Number(dt.as_f64()),
            Data::DateTimeIso(s) | Data::DurationIso(s) => CellValue::Text(s.clone()),
            Data::Error(_) | Data::Empty => CellValue::Empty,
        }
    }

    /// Trimmed text form; `None` for blank cells.
    pub fn text(&self) -> Option<String> {
        let text = match self {
            CellValue::Empty => return None,
            CellValue::Text(s) => s.trim().to_string(),
            CellValue::Number(n) if n.fract() == 0.0 => format!("{}", *n as i64),
            CellValue::Number(n) => n.to_string(),
            CellValue::Bool(b) => b.to_string(),
        };
        Some(text).filter(|t| !t.is_empty())
    }

    pub fn is_blank(&self) -> bool {
        self.text().is_none()
    }
}

/// A data row keyed by the header row's titles.
pub type SheetRow = BTreeMap<String, CellValue>;

/// Read the first sheet of an `.xlsx` file; the first row is the header.
pub fn read_rows(bytes: &[u8]) -> Result<Vec<SheetRow>, ImportError> {
    let mut workbook: Xlsx<_> = Xlsx::new(Cursor::new(bytes))?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or(ImportError::NoSheets)?;
    let range = workbook.worksheet_range(&sheet)?;

    let mut rows = range.rows();
    let header: Vec<String> = match rows.next() {
        Some(cells) => cells
            .iter()
            .map(|cell| CellValue::from_data(cell).text().unwrap_or_default())
            .collect(),
        None => return Err(ImportError::Empty),
    };

    let parsed: Vec<SheetRow> = rows
        .map(|cells| {
            header
                .iter()
                .enumerate()
                .filter(|(_, title)| !title.is_empty())
                .map(|(index, title)| {
                    let value = cells.get(index).map(CellValue::from_data).unwrap_or(CellValue::Empty);
                    (title.clone(), value)
                })
                .collect::<SheetRow>()
        })
        .filter(|row| row.values().any(|value| !value.is_blank()))
        .collect();

    if parsed.is_empty() {
        return Err(ImportError::Empty);
    }
    debug!(sheet = %sheet, rows = parsed.len(), "spreadsheet rows read");
    Ok(parsed)
}

/// Largest serial Excel accepts (9999-12-31).
pub const MAX_EXCEL_SERIAL: f64 = 2_958_465.0;

/// Convert a 1900-system serial day number to `yyyy-mm-dd`.
pub fn excel_serial_to_iso(serial: f64) -> Option<String> {
    if !serial.is_finite() || !(1.0..MAX_EXCEL_SERIAL + 1.0).contains(&serial) {
        return None;
    }
    let days = serial.floor() as i64;
    // Serial 60 is the nonexistent 1900-02-29; serials after it are offset by one day.
    let (base, offset) = match days {
        1..=59 => (NaiveDate::from_ymd_opt(1899, 12, 31)?, days),
        60 => (NaiveDate::from_ymd_opt(1900, 2, 28)?, 0),
        _ => (NaiveDate::from_ymd_opt(1899, 12, 30)?, days),
    };
    let date = base.checked_add_signed(Duration::try_days(offset)?)?;
    Some(date.format(DATE_FORMAT).to_string())
}

/// Leading integer of `text` (`"150 people"` → 150); 0 when there is none.
pub fn leading_integer(text: &str) -> i64 {
    let trimmed = text.trim_start();
    let (sign, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let end = digits
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(digits.len());
    digits[..end].parse::<i64>().map(|n| sign * n).unwrap_or(0)
}

fn date_cell(value: Option<&CellValue>) -> Option<String> {
    match value? {
        CellValue::Number(serial) => excel_serial_to_iso(*serial),
        CellValue::Text(text) => Some(text.trim().to_string()).filter(|t| !t.is_empty()),
        CellValue::Empty | CellValue::Bool(_) => None,
    }
}

fn participants_cell(value: Option<&CellValue>) -> i64 {
    match value {
        Some(CellValue::Number(n)) if n.is_finite() => n.trunc() as i64,
        Some(CellValue::Text(text)) => leading_integer(text),
        _ => 0,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub drafts: Vec<DepartmentEventFields>,
    /// Positions of dropped rows among the non-blank input rows, header counted as row 1.
    pub skipped: Vec<usize>,
}

/// Turn sheet rows into department event drafts owned by `department_id`.
///
/// Rows without a title, type, coordinator or location are skipped.
pub fn department_drafts(rows: &[SheetRow], department_id: i64) -> Result<ImportReport, ImportError> {
    let mut report = ImportReport::default();
    for (index, row) in rows.iter().enumerate() {
        let text = |header: &str| row.get(header).and_then(CellValue::text);
        let (Some(title), Some(event_type), Some(coordinator_name), Some(location)) = (
            text(TEMPLATE_HEADERS[0]),
            text(TEMPLATE_HEADERS[1]),
            text(TEMPLATE_HEADERS[2]),
            text(TEMPLATE_HEADERS[6]),
        ) else {
            report.skipped.push(index + 2);
            continue;
        };
        report.drafts.push(DepartmentEventFields {
            department_id,
            title,
            event_type,
            coordinator_name,
            from_date: date_cell(row.get(TEMPLATE_HEADERS[3])),
            to_date: date_cell(row.get(TEMPLATE_HEADERS[4])),
            participants: Some(participants_cell(row.get(TEMPLATE_HEADERS[5]))),
            location,
            output: text(TEMPLATE_HEADERS[7]),
            attachments: text(TEMPLATE_HEADERS[8]),
            certificate_link: text(TEMPLATE_HEADERS[9]),
        });
    }

    if report.drafts.is_empty() {
        return Err(ImportError::NoValidRows);
    }
    info!(
        department_id,
        drafts = report.drafts.len(),
        skipped = report.skipped.len(),
        "department import parsed"
    );
    Ok(report)
}

/// Blank import template: header row, one example row and a sheet of allowed types.
pub fn template_xlsx(types: &[String]) -> Result<Vec<u8>, ImportError> {
    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();

    let sheet = workbook.add_worksheet();
    sheet.set_name(TEMPLATE_SHEET)?;
    for (col, title) in TEMPLATE_HEADERS.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *title, &bold)?;
        sheet.set_column_width(col as u16, 24)?;
    }
    let example = [
        "National Conference on AI",
        "Conference",
        "Dr. Jane Doe",
        "2025-01-15",
        "2025-01-17",
        "",
        "Main Auditorium",
        "Discussed advancements in AI",
        "https://drive.google.com/attachments-sample",
        "https://drive.google.com/certificates-sample",
    ];
    for (col, value) in example.iter().enumerate() {
        if col == 5 {
            sheet.write_number(1, col as u16, 150)?;
        } else {
            sheet.write_string(1, col as u16, *value)?;
        }
    }
    let note = Note::new(format!("Allowed values: {}", types.join(", ")));
    sheet.insert_note(0, 1, &note)?;

    let types_sheet = workbook.add_worksheet();
    types_sheet.set_name(TYPES_SHEET)?;
    types_sheet.write_string_with_format(0, 0, "Allowed Types", &bold)?;
    for (index, event_type) in types.iter().enumerate() {
        types_sheet.write_string(index as u32 + 1, 0, event_type.as_str())?;
    }

    Ok(workbook.save_to_buffer()?)
}
