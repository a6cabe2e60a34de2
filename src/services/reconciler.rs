//! Appends processed rows to the shared monthly workbook without touching what is already there.
//!
//! The workbook is downloaded whole, the target sheet is read for its header and existing rows,
//! incoming rows that already exist (or repeat an earlier incoming row) are dropped, and the rest
//! are spliced in after the last used row. Upload is the only remote mutation and it happens once,
//! at the end, or not at all.

use crate::error::{SyncError, SyncResult};
use crate::events::EventSink;
use crate::excel::read_sheet_grid;
use crate::graph::DocumentStore;
use crate::models::schema::default_formula_columns;
use crate::models::{FormulaColumn, OutputTable};
use crate::retry::{RetryPolicy, Sleeper};
use crate::services::xlsx_package::{
    set_dimension, set_table_last_row, table_range, CellRange, NewCell, NewRow, SheetLayout, XlsxPackage,
};
use crate::types::{format_plain_number, parse_date, round_to, CellValue};
use serde::Serialize;
use std::collections::HashSet;

/// Decimal places numbers are rounded to before two cells are compared.
pub const COMPARISON_DECIMALS: i32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum AppendMode {
    /// Add rows after the last used row; existing rows are left byte-for-byte intact.
    #[default]
    PreserveExisting,
    /// Drop every body row and write the merged set again. Formulas typed by hand into
    /// existing rows are lost.
    RewriteBody,
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub sheet_name: String,
    /// 1-based row holding the column headers.
    pub header_row: u32,
    pub formula_columns: Vec<FormulaColumn>,
    pub mode: AppendMode,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            sheet_name: "Ventas".to_string(),
            header_row: 1,
            formula_columns: default_formula_columns(),
            mode: AppendMode::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendReport {
    pub appended: usize,
    pub duplicates: usize,
    pub first_row: Option<u32>,
    pub last_row: Option<u32>,
    pub uploaded: bool,
}

/// Result of merging rows into workbook bytes; `bytes` is `None` when nothing changed.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub bytes: Option<Vec<u8>>,
    pub report: AppendReport,
    /// Incoming headers that have no column in the destination sheet.
    pub unmapped: Vec<String>,
}

/// Canonical text of a cell for duplicate detection. Only numeric cells are compared as
/// numbers; text is trimmed and otherwise compared as written, except for dates.
pub fn normalize_for_comparison(value: &CellValue) -> String {
    match value {
        CellValue::Empty => String::new(),
        CellValue::Number(n) => canonical_number(*n),
        CellValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        CellValue::Text(s) => {
            let s = s.trim();
            if s.is_empty() || s == "None" || s.eq_ignore_ascii_case("nan") {
                return String::new();
            }
            // Text stays text: codes such as "007" and "7" are different values.
            match parse_date(s) {
                Some(d) => d.format("%Y-%m-%d").to_string(),
                None => strip_zero_fraction(s).to_string(),
            }
        }
    }
}

/// `"12.0"` → `"12"`, the artifact of a number stored as text. Leading zeros are kept.
fn strip_zero_fraction(s: &str) -> &str {
    match s.split_once('.') {
        Some((int, frac))
            if !int.trim_start_matches('-').is_empty()
                && int.trim_start_matches('-').bytes().all(|b| b.is_ascii_digit())
                && !frac.is_empty()
                && frac.bytes().all(|b| b == b'0') =>
        {
            int
        }
        _ => s,
    }
}

fn canonical_number(n: f64) -> String {
    if !n.is_finite() {
        return String::new();
    }
    let rounded = round_to(n, COMPARISON_DECIMALS);
    if rounded == 0.0 {
        return "0".to_string();
    }
    format_plain_number(rounded)
}

/// Where the value of one destination column comes from.
#[derive(Debug, Clone)]
enum ColumnSource {
    Incoming(usize),
    Formula(FormulaColumn),
    Unmapped,
}

/// Destination header and rows read from the target sheet.
#[derive(Debug, Clone)]
struct SheetSnapshot {
    header: Vec<String>,
    /// `(1-based row number, cells)` of every non-empty row below the header.
    body: Vec<(u32, Vec<CellValue>)>,
}

impl SheetSnapshot {
    fn read(bytes: &[u8], sheet_name: &str, header_row: u32) -> SyncResult<Self> {
        let grid = read_sheet_grid(bytes, sheet_name)?;
        let header_idx = header_row.saturating_sub(1) as usize;
        let mut header: Vec<String> = grid
            .get(header_idx)
            .map(|cells| cells.iter().map(|c| c.display()).collect())
            .unwrap_or_default();
        while header.last().map(|h| h.is_empty()).unwrap_or(false) {
            header.pop();
        }
        let body = grid
            .into_iter()
            .enumerate()
            .skip(header_idx + 1)
            .filter(|(_, cells)| cells.iter().any(|c| !c.is_missing()))
            .map(|(i, cells)| (i as u32 + 1, cells))
            .collect();
        Ok(Self { header, body })
    }

    fn last_row_with_values(&self) -> Option<u32> {
        self.body.last().map(|(n, _)| *n)
    }
}

fn column_sources(header: &[String], incoming: &OutputTable, formulas: &[FormulaColumn]) -> Vec<ColumnSource> {
    header
        .iter()
        .map(|h| {
            if h.is_empty() {
                ColumnSource::Unmapped
            } else if let Some(f) = formulas.iter().find(|f| &f.header == h) {
                ColumnSource::Formula(f.clone())
            } else if let Some(idx) = incoming.column_index(h) {
                ColumnSource::Incoming(idx)
            } else {
                ColumnSource::Unmapped
            }
        })
        .collect()
}

/// Comparison projection: every non-formula destination column, normalised.
fn comparison_key(sources: &[ColumnSource], value_at: impl Fn(usize, &ColumnSource) -> Option<CellValue>) -> Vec<String> {
    sources
        .iter()
        .enumerate()
        .filter(|(_, s)| !matches!(s, ColumnSource::Formula(_)))
        .map(|(i, s)| value_at(i, s).map(|v| normalize_for_comparison(&v)).unwrap_or_default())
        .collect()
}

fn to_new_cell(value: &CellValue) -> NewCell {
    match value {
        CellValue::Empty => NewCell::Text(String::new()),
        CellValue::Number(n) => NewCell::Number(*n),
        CellValue::Text(s) => NewCell::Text(s.clone()),
        CellValue::Date(_) => NewCell::Text(value.display()),
    }
}

fn existing_value(cells: &[CellValue]) -> impl Fn(usize, &ColumnSource) -> Option<CellValue> + '_ {
    move |col, _| cells.get(col).cloned()
}

fn incoming_value(cells: &[CellValue]) -> impl Fn(usize, &ColumnSource) -> Option<CellValue> + '_ {
    move |_, source| match source {
        ColumnSource::Incoming(idx) => cells.get(*idx).cloned(),
        _ => None,
    }
}

fn build_row(number: u32, sources: &[ColumnSource], value_at: impl Fn(usize, &ColumnSource) -> Option<CellValue>) -> NewRow {
    let cells = sources
        .iter()
        .enumerate()
        .filter_map(|(col, source)| {
            let cell = match source {
                ColumnSource::Formula(f) => NewCell::Formula(f.formula_for_row(number)),
                other => to_new_cell(&value_at(col, other)?),
            };
            Some((col as u32, cell))
        })
        .collect();
    NewRow { number, cells }
}

/// Table governing the sheet: the one whose range starts at (or else covers) the header row.
fn governing_table(package: &XlsxPackage, table_paths: &[String], header_row: u32) -> SyncResult<Option<(String, CellRange)>> {
    let mut covering = None;
    for path in table_paths {
        let xml = package.part_text(path)?;
        if let Some(range) = table_range(&xml) {
            if range.first_row == header_row {
                return Ok(Some((path.clone(), range)));
            }
            if covering.is_none() && range.contains_row(header_row) {
                covering = Some((path.clone(), range));
            }
        }
    }
    Ok(covering)
}

/// Merge `incoming` into the workbook `bytes`. Pure: no I/O, no events.
pub fn merge_into_workbook(bytes: &[u8], incoming: &OutputTable, options: &ReconcileOptions) -> SyncResult<MergeOutcome> {
    let mut package = XlsxPackage::from_bytes(bytes)?;
    let location = package.locate_sheet(&options.sheet_name)?;
    let snapshot = SheetSnapshot::read(bytes, &options.sheet_name, options.header_row)?;
    let sheet_xml = package.part_text(&location.sheet_path)?;
    let layout = SheetLayout::scan(&sheet_xml)?;
    let header_row = options.header_row.max(1);

    // A sheet without headers gets the incoming layout plus the formula columns.
    let write_header = snapshot.header.iter().all(|h| h.is_empty());
    if write_header && !snapshot.body.is_empty() {
        return Err(SyncError::InvalidWorkbook(format!(
            "sheet '{}' has data but no header in row {}",
            options.sheet_name, header_row
        )));
    }
    let header: Vec<String> = if write_header {
        incoming
            .headers()
            .into_iter()
            .chain(options.formula_columns.iter().map(|f| f.header.clone()))
            .collect()
    } else {
        snapshot.header.clone()
    };

    let sources = column_sources(&header, incoming, &options.formula_columns);
    let unmapped: Vec<String> = incoming
        .headers()
        .into_iter()
        .filter(|h| !header.contains(h))
        .collect();

    let incoming_rows = incoming.rows();

    let mut seen: HashSet<Vec<String>> = HashSet::new();
    let mut kept_existing: Vec<&[CellValue]> = Vec::new();
    for (_, cells) in &snapshot.body {
        if seen.insert(comparison_key(&sources, existing_value(cells))) {
            kept_existing.push(cells);
        }
    }

    let mut net_new: Vec<&[CellValue]> = Vec::new();
    let mut duplicates = 0usize;
    for cells in &incoming_rows {
        if seen.insert(comparison_key(&sources, incoming_value(cells))) {
            net_new.push(cells);
        } else {
            duplicates += 1;
        }
    }

    let mut report = AppendReport {
        appended: net_new.len(),
        duplicates,
        ..AppendReport::default()
    };
    if net_new.is_empty() {
        return Ok(MergeOutcome { bytes: None, report, unmapped });
    }

    let table = governing_table(&package, &location.table_paths, header_row)?;
    let last_valued = snapshot
        .last_row_with_values()
        .max(layout.last_row_with_values())
        .unwrap_or(0);

    let mut rows = Vec::new();
    let (from_row, styles) = match options.mode {
        AppendMode::PreserveExisting => {
            let table_end = table.as_ref().map(|(_, r)| r.last_row).unwrap_or(0);
            let start = header_row.max(last_valued).max(table_end) + 1;
            if write_header {
                rows.push(header_row_cells(header_row, &header));
            }
            (if write_header { header_row } else { start }, layout.template_styles(header_row, start))
        }
        AppendMode::RewriteBody => {
            let styles = layout.template_styles(header_row, u32::MAX);
            if write_header {
                rows.push(header_row_cells(header_row, &header));
            }
            for cells in &kept_existing {
                let number = header_row + 1 + rows.len() as u32 - u32::from(write_header);
                rows.push(build_row(number, &sources, existing_value(cells)));
            }
            (if write_header { header_row } else { header_row + 1 }, styles)
        }
    };

    let first_new = from_row + rows.len() as u32;
    for (i, cells) in net_new.iter().enumerate() {
        rows.push(build_row(first_new + i as u32, &sources, incoming_value(cells)));
    }
    let last_row = from_row + rows.len() as u32 - 1;

    let mut spliced = layout.splice(&sheet_xml, from_row, &rows, &styles);
    let last_col = header.len().saturating_sub(1) as u32;
    spliced = set_dimension(&spliced, last_row, last_col);
    package.set_part(&location.sheet_path, spliced.into_bytes());

    if let Some((path, range)) = table {
        let new_end = match options.mode {
            AppendMode::PreserveExisting => range.last_row.max(last_row),
            AppendMode::RewriteBody => last_row.max(header_row + 1),
        };
        let xml = set_table_last_row(&package.part_text(&path)?, new_end)?;
        package.set_part(&path, xml.into_bytes());
    }

    report.first_row = Some(first_new);
    report.last_row = Some(last_row);
    Ok(MergeOutcome {
        bytes: Some(package.to_bytes()?),
        report,
        unmapped,
    })
}

fn header_row_cells(number: u32, header: &[String]) -> NewRow {
    NewRow {
        number,
        cells: header
            .iter()
            .enumerate()
            .map(|(i, h)| (i as u32, NewCell::Text(h.clone())))
            .collect(),
    }
}

/// Download `path`, merge `incoming` into it and upload the result. Nothing is uploaded when
/// every incoming row already exists. Lock rejections on upload are retried per `retry`.
pub fn reconcile_and_append<D: DocumentStore + ?Sized, S: EventSink>(
    store: &D,
    path: &str,
    incoming: &OutputTable,
    options: &ReconcileOptions,
    retry: &RetryPolicy,
    sleeper: &dyn Sleeper,
    events: &mut S,
) -> SyncResult<AppendReport> {
    match reconcile_inner(store, path, incoming, options, retry, sleeper, events) {
        Ok(report) => Ok(report),
        Err(e) => {
            events.error(format!("Could not update '{}': {}", path, e));
            Err(e)
        }
    }
}

fn reconcile_inner<D: DocumentStore + ?Sized, S: EventSink>(
    store: &D,
    path: &str,
    incoming: &OutputTable,
    options: &ReconcileOptions,
    retry: &RetryPolicy,
    sleeper: &dyn Sleeper,
    events: &mut S,
) -> SyncResult<AppendReport> {
    events.info(format!("Downloading '{}'...", path));
    let bytes = store.download(path)?;
    tracing::debug!(path, size = bytes.len(), "remote workbook downloaded");

    let outcome = merge_into_workbook(&bytes, incoming, options)?;
    let mut report = outcome.report;
    if !outcome.unmapped.is_empty() {
        events.warning(format!(
            "Columns without a place in sheet '{}' were not written: {}.",
            options.sheet_name,
            outcome.unmapped.join(", ")
        ));
    }
    if report.duplicates > 0 {
        events.warning(format!(
            "{} rows already exist in '{}' and were skipped.",
            report.duplicates, options.sheet_name
        ));
    }

    let Some(new_bytes) = outcome.bytes else {
        events.info("No new rows to add. The remote file was not modified.");
        return Ok(report);
    };

    retry.run(sleeper, |attempt| {
        if attempt > 1 {
            tracing::info!(attempt, path, "retrying upload");
        }
        store.upload(path, &new_bytes)
    })?;
    report.uploaded = true;
    events.success(
        format!(
            "{} new rows added to '{}' (rows {}-{}).",
            report.appended,
            options.sheet_name,
            report.first_row.unwrap_or_default(),
            report.last_row.unwrap_or_default()
        ),
        Some(report.appended),
    );
    Ok(report)
}
