//! xlsx decode/encode for the incident sheet.

use std::collections::HashMap;
use std::io::Cursor;

use calamine::{open_workbook_from_rs, Data, Reader, Xlsx, XlsxError};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Timelike};
use insera_core::{Record, Table, COLUMNS};
use rust_xlsxwriter::{Format, Workbook};
use thiserror::Error;

pub const SHEET_NAME: &str = "Sheet1";
pub const EXPORT_FILE_NAME: &str = "updated_data.xlsx";
pub const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Excel's hard row limit, header included.
const MAX_SHEET_ROWS: usize = 1_048_576;

const DAY_FIRST_DATETIME_FORMATS: &[&str] = &[
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
    "%d/%m/%y %H:%M:%S",
    "%d/%m/%y %H:%M",
    "%d-%m-%y %H:%M:%S",
    "%d-%m-%y %H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

const DAY_FIRST_DATE_FORMATS: &[&str] = &[
    "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%d/%m/%y", "%d-%m-%y", "%d.%m.%y", "%Y-%m-%d",
];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("reading workbook: {0}")]
    Workbook(#[from] XlsxError),
    #[error("workbook has no sheet named {0:?}")]
    MissingSheet(String),
    #[error("sheet {SHEET_NAME:?} has no header row")]
    NoHeader,
    #[error("sheet {SHEET_NAME:?} is missing column {0:?}")]
    MissingColumn(&'static str),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("writing workbook: {0}")]
    Workbook(#[from] rust_xlsxwriter::XlsxError),
    #[error("{0} records exceed the sheet row limit")]
    TooManyRows(usize),
}

/// Column positions of the ten known fields inside the sheet, in `COLUMNS` order.
struct ColumnMap([usize; COLUMNS.len()]);

impl ColumnMap {
    fn from_header(header: &[Data]) -> Result<Self, ParseError> {
        let by_name: HashMap<String, usize> = header
            .iter()
            .enumerate()
            .map(|(idx, cell)| (cell_text(cell).trim().to_string(), idx))
            .collect();
        let mut positions = [0usize; COLUMNS.len()];
        for (slot, name) in positions.iter_mut().zip(COLUMNS) {
            *slot = *by_name.get(name).ok_or(ParseError::MissingColumn(name))?;
        }
        Ok(Self(positions))
    }

    fn cell<'r>(&self, row: &'r [Data], column: usize) -> &'r Data {
        row.get(self.0[column]).unwrap_or(&Data::Empty)
    }
}

/// Reads `Sheet1` of an xlsx payload into a table. Dates are parsed day-first;
/// unreadable dates and durations become `None`.
pub fn decode(bytes: &[u8]) -> Result<Table, ParseError> {
    let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(bytes))?;
    if !workbook.sheet_names().iter().any(|name| name == SHEET_NAME) {
        return Err(ParseError::MissingSheet(SHEET_NAME.to_string()));
    }
    let range = workbook.worksheet_range(SHEET_NAME)?;

    let mut rows = range.rows();
    let header = rows.next().ok_or(ParseError::NoHeader)?;
    let columns = ColumnMap::from_header(header)?;

    Ok(rows
        .filter(|row| !row.iter().all(|cell| matches!(cell, Data::Empty)))
        .map(|row| Record {
            incident: cell_text(columns.cell(row, 0)),
            customer_segment: cell_text(columns.cell(row, 1)),
            workzone: cell_text(columns.cell(row, 2)),
            ket_gaul: cell_text(columns.cell(row, 3)),
            compliance: cell_text(columns.cell(row, 4)),
            service_no: cell_text(columns.cell(row, 5)),
            reported_date: cell_datetime(columns.cell(row, 6)),
            ttr_customer: cell_number(columns.cell(row, 7)),
            jenis_ggn: cell_text(columns.cell(row, 8)),
            summary: cell_text(columns.cell(row, 9)),
        })
        .collect())
}

/// Writes the table as a single-sheet workbook with columns in `COLUMNS` order.
pub fn encode(table: &Table) -> Result<Vec<u8>, ExportError> {
    if table.len() >= MAX_SHEET_ROWS {
        return Err(ExportError::TooManyRows(table.len()));
    }

    let mut workbook = Workbook::new();
    let header_format = Format::new().set_bold();
    let date_format = Format::new().set_num_format("yyyy-mm-dd hh:mm:ss");

    let sheet = workbook.add_worksheet();
    sheet.set_name(SHEET_NAME)?;
    for (col, name) in COLUMNS.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *name, &header_format)?;
    }

    for (idx, r) in table.records().iter().enumerate() {
        let row = (idx + 1) as u32;
        let texts = [
            (0u16, &r.incident),
            (1, &r.customer_segment),
            (2, &r.workzone),
            (3, &r.ket_gaul),
            (4, &r.compliance),
            (5, &r.service_no),
            (8, &r.jenis_ggn),
            (9, &r.summary),
        ];
        for (col, text) in texts {
            if !text.is_empty() {
                sheet.write_string(row, col, text)?;
            }
        }
        if let Some(reported) = &r.reported_date {
            sheet.write_datetime_with_format(row, 6, reported, &date_format)?;
        }
        if let Some(ttr) = r.ttr_customer {
            sheet.write_number(row, 7, ttr)?;
        }
    }

    Ok(workbook.save_to_buffer()?)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Int(v) => v.to_string(),
        Data::Float(v) => float_text(*v),
        Data::Bool(v) => v.to_string(),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| float_text(dt.as_f64())),
        _ => String::new(),
    }
}

/// Integral floats print without a fraction so numeric service numbers read
/// the way they were typed.
fn float_text(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        v.to_string()
    }
}

fn cell_number(cell: &Data) -> Option<f64> {
    match cell {
        Data::Int(v) => Some(*v as f64),
        Data::Float(v) => Some(*v),
        Data::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}

fn cell_datetime(cell: &Data) -> Option<NaiveDateTime> {
    match cell {
        Data::DateTime(dt) if dt.is_datetime() => dt.as_datetime().map(round_to_second),
        Data::DateTimeIso(s) | Data::String(s) => parse_day_first(s),
        _ => None,
    }
}

/// `%Y` happily reads "24" as year 24, so short years only come out right
/// through the `%y` formats.
const MIN_FOUR_DIGIT_YEAR: i32 = 1000;

/// Day-first parse of a free-form date string; `None` when nothing fits.
pub fn parse_day_first(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let plausible = |dt: &NaiveDateTime| dt.year() >= MIN_FOUR_DIGIT_YEAR;
    DAY_FIRST_DATETIME_FORMATS
        .iter()
        .filter_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .find(plausible)
        .or_else(|| {
            DAY_FIRST_DATE_FORMATS
                .iter()
                .filter_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
                .filter_map(|d| d.and_hms_opt(0, 0, 0))
                .find(plausible)
        })
}

/// Excel stores datetimes as fractional days, which can land a hair off the
/// second they were written at.
fn round_to_second(dt: NaiveDateTime) -> NaiveDateTime {
    let truncated = dt.with_nanosecond(0).unwrap_or(dt);
    if dt.nanosecond() >= 500_000_000 {
        truncated + Duration::seconds(1)
    } else {
        truncated
    }
}
