use calamine::{open_workbook_auto_from_rs, Data, DataType, Range, Reader};
use std::io::Cursor;
use std::path::{Path, PathBuf};

use crate::error::{SyncError, SyncResult};
use crate::models::OutputTable;
use crate::types::{CellValue, RawRecord, RawTable};
use rust_xlsxwriter::{Format, FormatAlign, Workbook, Worksheet, XlsxError};

/// Sheet name of the processed artifact.
pub const PROCESSED_SHEET: &str = "Procesado";

/// Column index to Excel letter (0→A, 25→Z, 26→AA). Inverse of [`letter_to_col_index`].
pub fn col_index_to_letter(index: u32) -> String {
    let mut letters = Vec::new();
    let mut remaining = u64::from(index) + 1;
    while remaining > 0 {
        remaining -= 1;
        letters.push(char::from(b'A' + (remaining % 26) as u8));
        remaining /= 26;
    }
    letters.iter().rev().collect()
}

/// Excel letter to column index (A→0, AA→26). Case-insensitive; `None` on anything but letters.
pub fn letter_to_col_index(letters: &str) -> Option<u32> {
    if letters.is_empty() {
        return None;
    }
    let mut n: u32 = 0;
    for c in letters.chars() {
        if !c.is_ascii_alphabetic() {
            return None;
        }
        n = n * 26 + (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
    }
    Some(n - 1)
}

/// Zip local-file-header signature every xlsx starts with.
const XLSX_SIGNATURE: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

/// Reject content that cannot be an xlsx package before handing it to a parser.
pub fn validate_xlsx_bytes(bytes: &[u8]) -> SyncResult<()> {
    if bytes.is_empty() {
        return Err(SyncError::InvalidWorkbook("file is empty".to_string()));
    }
    if bytes.len() < XLSX_SIGNATURE.len() {
        return Err(SyncError::InvalidWorkbook("could not read header".to_string()));
    }
    if bytes[..4] != XLSX_SIGNATURE {
        return Err(SyncError::InvalidWorkbook("missing xlsx signature".to_string()));
    }
    Ok(())
}

fn cell_value(cell: &Data) -> CellValue {
    match cell {
        Data::Empty | Data::Error(_) => CellValue::Empty,
        Data::String(s) => CellValue::text(s.clone()),
        Data::Float(f) => CellValue::Number(*f),
        Data::Int(i) => CellValue::Number(*i as f64),
        Data::Bool(b) => CellValue::text(if *b { "TRUE" } else { "FALSE" }),
        Data::DateTime(_) | Data::DateTimeIso(_) => cell
            .as_date()
            .map(CellValue::Date)
            .unwrap_or_else(|| CellValue::text(cell.to_string())),
        Data::DurationIso(s) => CellValue::text(s.clone()),
    }
}

/// Range as a grid addressed by absolute 0-based (row, col). calamine ranges start at the
/// first non-empty cell, so leading rows/columns are padded back in.
fn range_to_grid(range: &Range<Data>) -> Vec<Vec<CellValue>> {
    let (start_row, start_col) = match range.start() {
        Some(s) => s,
        None => return Vec::new(),
    };
    let mut grid: Vec<Vec<CellValue>> = vec![Vec::new(); start_row as usize];
    for row in range.rows() {
        let mut cells = vec![CellValue::Empty; start_col as usize];
        cells.extend(row.iter().map(cell_value));
        grid.push(cells);
    }
    grid
}

/// Read one sheet of an in-memory workbook as an absolute grid.
pub fn read_sheet_grid(bytes: &[u8], sheet_name: &str) -> SyncResult<Vec<Vec<CellValue>>> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| SyncError::Read(e.to_string()))?;
    if !workbook.sheet_names().iter().any(|n| n == sheet_name) {
        return Err(SyncError::SheetNotFound(sheet_name.to_string()));
    }
    let range = workbook
        .worksheet_range(sheet_name)
        .map_err(|e| SyncError::Read(e.to_string()))?;
    Ok(range_to_grid(&range))
}

/// Read the first sheet of a raw export. The first `header_offset` rows are title/banner rows;
/// the next row is the header. Fully empty data rows are skipped.
pub fn read_raw_table(bytes: &[u8], header_offset: usize) -> SyncResult<RawTable> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| SyncError::Read(e.to_string()))?;
    let first = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| SyncError::Read("workbook has no sheets".to_string()))?;
    let range = workbook
        .worksheet_range(&first)
        .map_err(|e| SyncError::Read(e.to_string()))?;
    raw_table_from_grid(range_to_grid(&range), header_offset)
}

pub(crate) fn raw_table_from_grid(grid: Vec<Vec<CellValue>>, header_offset: usize) -> SyncResult<RawTable> {
    let header_cells = grid
        .get(header_offset)
        .ok_or(SyncError::UnrecognizedLayout(header_offset))?;
    let columns: Vec<(usize, String)> = header_cells
        .iter()
        .enumerate()
        .map(|(i, c)| (i, c.display()))
        .filter(|(_, h)| !h.is_empty())
        .collect();
    if columns.is_empty() {
        return Err(SyncError::UnrecognizedLayout(header_offset));
    }

    let mut headers: Vec<String> = Vec::with_capacity(columns.len());
    for (_, h) in &columns {
        // Repeated header text keeps the first column only.
        if !headers.contains(h) {
            headers.push(h.clone());
        }
    }

    let mut rows = Vec::new();
    for cells in grid.into_iter().skip(header_offset + 1) {
        if cells.iter().all(|c| c.is_missing()) {
            continue;
        }
        let mut record = RawRecord::new();
        for (idx, header) in &columns {
            if record.contains_key(header) {
                continue;
            }
            let value = cells.get(*idx).cloned().unwrap_or_default();
            record.insert(header.clone(), value);
        }
        rows.push(record);
    }
    Ok(RawTable { headers, rows })
}

/// Remove or replace characters that can corrupt Excel's sheet XML and cause "unreadable content".
/// Drops control chars (except tab, newline, CR).
pub fn sanitize_cell(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        let u = c as u32;
        if c == '\t' || c == '\n' || c == '\r' {
            out.push(c);
        } else if u < 0x20 || u == 0x7F || u == 0xFFFE || u == 0xFFFF {
            // skip control and invalid
        } else {
            out.push(c);
        }
    }
    out
}

const MIN_COLUMN_WIDTH: f64 = 10.0;
const MAX_COLUMN_WIDTH: f64 = 50.0;
/// Width of a `#,##0.00` amount column, whatever the magnitude.
const AMOUNT_COLUMN_WIDTH: f64 = 14.0;

/// One width per header: the widest of the header text and the column's
/// cells, at 1.2 units per character within [`MIN_COLUMN_WIDTH`, `MAX_COLUMN_WIDTH`].
fn column_widths(headers: &[String], rows: &[Vec<CellValue>]) -> Vec<f64> {
    let text_width = |chars: usize| (chars as f64 * 1.2).clamp(MIN_COLUMN_WIDTH, MAX_COLUMN_WIDTH);
    (0..headers.len())
        .map(|col| {
            rows.iter()
                .filter_map(|row| row.get(col))
                .map(|cell| match cell {
                    CellValue::Number(_) => AMOUNT_COLUMN_WIDTH,
                    other => text_width(other.display().chars().count()),
                })
                .fold(text_width(headers[col].chars().count()), f64::max)
        })
        .collect()
}

fn write_cell(
    worksheet: &mut Worksheet,
    row: u32,
    col: u16,
    value: &CellValue,
    number_format: &Format,
) -> Result<(), XlsxError> {
    match value {
        CellValue::Empty => Ok(()),
        CellValue::Number(n) if n.is_finite() => worksheet
            .write_number_with_format(row, col, *n, number_format)
            .map(|_| ()),
        CellValue::Number(_) => Ok(()),
        other => worksheet
            .write_string(row, col, sanitize_cell(&other.display()))
            .map(|_| ()),
    }
}

/// Build the one-sheet processed workbook in memory.
pub fn processed_workbook_bytes(table: &OutputTable) -> SyncResult<Vec<u8>> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(PROCESSED_SHEET)?;

    let header_format = Format::new()
        .set_bold()
        .set_background_color(rust_xlsxwriter::Color::RGB(0x2563EB))
        .set_font_color(rust_xlsxwriter::Color::RGB(0xFFFFFF));
    let amount_format = Format::new().set_num_format("#,##0.00").set_align(FormatAlign::Right);

    let headers = table.headers();
    let rows = table.rows();

    for (col, &w) in column_widths(&headers, &rows).iter().enumerate() {
        worksheet.set_column_width(col as u16, w)?;
    }
    for (col, header) in headers.iter().enumerate() {
        worksheet.write_string_with_format(0, col as u16, sanitize_cell(header), &header_format)?;
    }
    for (row_idx, row) in rows.iter().enumerate() {
        for (col, value) in row.iter().enumerate() {
            write_cell(worksheet, (row_idx + 1) as u32, col as u16, value, &amount_format)?;
        }
    }
    worksheet.set_freeze_panes(1, 0)?;

    Ok(workbook.save_to_buffer()?)
}

/// Default artifact location: `procesado_<source name>` in Downloads (or Desktop), never overwriting.
fn default_output_path(source_name: &str) -> Result<PathBuf, String> {
    let dir = dirs::download_dir()
        .or_else(dirs::desktop_dir)
        .ok_or("Could not find Downloads or Desktop folder.")?;
    let stem = Path::new(source_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("export");
    let mut p = dir.join(format!("procesado_{}.xlsx", stem));
    let mut counter = 2u32;
    while p.exists() {
        p = dir.join(format!("procesado_{}_{}.xlsx", stem, counter));
        counter += 1;
    }
    Ok(p)
}

/// Write the processed table to `path_override` (forced to `.xlsx`) or to the default location.
/// Returns the saved path.
pub fn export_processed_table(
    table: &OutputTable,
    path_override: Option<&str>,
    source_name: &str,
) -> Result<String, String> {
    let path = if let Some(p) = path_override.filter(|s| !s.trim().is_empty()) {
        let mut pb = PathBuf::from(p.trim());
        if pb.extension().map(|e| e.to_str()) != Some(Some("xlsx")) {
            pb.set_extension("xlsx");
        }
        pb
    } else {
        default_output_path(source_name)?
    };

    let path_str = path.to_str().ok_or("Invalid path characters.")?.to_string();
    let bytes = processed_workbook_bytes(table).map_err(|e| e.to_string())?;
    std::fs::write(&path, bytes).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            "Please close the file in Excel first.".to_string()
        } else {
            format!("Cannot write to file: {}", e)
        }
    })?;
    Ok(path_str)
}
