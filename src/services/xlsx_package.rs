//! Byte-level editing of an xlsx package held in memory.
//!
//! Only the parts that must change are rewritten (the target sheet, its table, nothing else);
//! every other zip entry is copied through as-is, and inside the sheet the XML of rows that are
//! kept is never re-serialized.

use crate::error::{SyncError, SyncResult};
use crate::excel::{col_index_to_letter, letter_to_col_index, sanitize_cell, validate_xlsx_bytes};
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use std::fmt;
use std::io::{Cursor, Read, Write};
use std::sync::OnceLock;
use zip::read::ZipArchive;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const WORKBOOK_PART: &str = "xl/workbook.xml";
const WORKBOOK_RELS_PART: &str = "xl/_rels/workbook.xml.rels";

/// All parts of an xlsx archive, in their original order.
#[derive(Debug, Clone)]
pub struct XlsxPackage {
    parts: Vec<(String, Vec<u8>)>,
}

impl XlsxPackage {
    /// Validate the signature and unpack every entry.
    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        validate_xlsx_bytes(bytes)?;
        let mut archive = ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| SyncError::InvalidWorkbook(format!("invalid zip: {}", e)))?;
        let mut parts = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().replace('\\', "/");
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            parts.push((name, data));
        }
        if !parts.iter().any(|(n, _)| n == WORKBOOK_PART) {
            return Err(SyncError::InvalidWorkbook(format!("{} is missing", WORKBOOK_PART)));
        }
        Ok(Self { parts })
    }

    pub fn part(&self, name: &str) -> Option<&[u8]> {
        self.parts
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d.as_slice())
    }

    pub fn part_text(&self, name: &str) -> SyncResult<String> {
        let data = self
            .part(name)
            .ok_or_else(|| SyncError::InvalidWorkbook(format!("{} is missing", name)))?;
        String::from_utf8(data.to_vec()).map_err(|e| SyncError::Xml(format!("{}: {}", name, e)))
    }

    /// Replace an existing part in place; unknown names are appended.
    pub fn set_part(&mut self, name: &str, data: Vec<u8>) {
        match self.parts.iter_mut().find(|(n, _)| n == name) {
            Some((_, d)) => *d = data,
            None => self.parts.push((name.to_string(), data)),
        }
    }

    pub fn part_names(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().map(|(n, _)| n.as_str())
    }

    pub fn to_bytes(&self) -> SyncResult<Vec<u8>> {
        let mut zip_writer = ZipWriter::new(Cursor::new(Vec::new()));
        let opts = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, data) in &self.parts {
            zip_writer.start_file(name.as_str(), opts)?;
            zip_writer.write_all(data)?;
        }
        Ok(zip_writer.finish()?.into_inner())
    }

    /// Worksheet part of `sheet_name` and the table parts attached to it.
    pub fn locate_sheet(&self, sheet_name: &str) -> SyncResult<SheetLocation> {
        let workbook = self.part_text(WORKBOOK_PART)?;
        let rel_id = sheet_relationship_id(&workbook, sheet_name)?
            .ok_or_else(|| SyncError::SheetNotFound(sheet_name.to_string()))?;

        let rels = self.part_text(WORKBOOK_RELS_PART)?;
        let target = relationships(&rels)?
            .into_iter()
            .find(|r| r.id == rel_id)
            .map(|r| r.target)
            .ok_or_else(|| SyncError::InvalidWorkbook(format!("no relationship {}", rel_id)))?;
        let sheet_path = resolve_target("xl", &target);

        let sheet_rels_path = sheet_rels_path(&sheet_path);
        let table_paths = match self.part(&sheet_rels_path) {
            Some(_) => {
                let base = parent_dir(&sheet_path);
                relationships(&self.part_text(&sheet_rels_path)?)?
                    .into_iter()
                    .filter(|r| r.kind.ends_with("/table"))
                    .map(|r| resolve_target(base, &r.target))
                    .collect()
            }
            None => Vec::new(),
        };
        Ok(SheetLocation { sheet_path, table_paths })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetLocation {
    pub sheet_path: String,
    pub table_paths: Vec<String>,
}

struct Relationship {
    id: String,
    kind: String,
    target: String,
}

fn attr_value(e: &BytesStart, local: &[u8]) -> SyncResult<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| SyncError::Xml(err.to_string()))?;
        if attr.key.local_name().as_ref() == local {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

fn sheet_relationship_id(workbook_xml: &str, sheet_name: &str) -> SyncResult<Option<String>> {
    let mut reader = Reader::from_str(workbook_xml);
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                if attr_value(&e, b"name")?.as_deref() == Some(sheet_name) {
                    return attr_value(&e, b"id");
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

fn relationships(rels_xml: &str) -> SyncResult<Vec<Relationship>> {
    let mut reader = Reader::from_str(rels_xml);
    let mut out = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                out.push(Relationship {
                    id: attr_value(&e, b"Id")?.unwrap_or_default(),
                    kind: attr_value(&e, b"Type")?.unwrap_or_default(),
                    target: attr_value(&e, b"Target")?.unwrap_or_default(),
                });
            }
            Event::Eof => return Ok(out),
            _ => {}
        }
    }
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

fn sheet_rels_path(sheet_path: &str) -> String {
    match sheet_path.rsplit_once('/') {
        Some((dir, file)) => format!("{}/_rels/{}.rels", dir, file),
        None => format!("_rels/{}.rels", sheet_path),
    }
}

/// Relationship target relative to `base_dir`, or absolute when it starts with `/`.
fn resolve_target(base_dir: &str, target: &str) -> String {
    let mut segments: Vec<&str> = if target.starts_with('/') {
        Vec::new()
    } else {
        base_dir.split('/').filter(|s| !s.is_empty()).collect()
    };
    for seg in target.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    segments.join("/")
}

/// A rectangular cell range such as `A1:AF100`. Rows are 1-based, columns 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRange {
    pub first_col: u32,
    pub first_row: u32,
    pub last_col: u32,
    pub last_row: u32,
}

fn split_cell_ref(cell: &str) -> Option<(u32, u32)> {
    let cell = cell.replace('$', "");
    let digits = cell.find(|c: char| c.is_ascii_digit())?;
    let (letters, number) = cell.split_at(digits);
    Some((letter_to_col_index(letters)?, number.parse().ok()?))
}

impl CellRange {
    pub fn parse(reference: &str) -> Option<Self> {
        let (first, last) = reference.split_once(':').unwrap_or((reference, reference));
        let (first_col, first_row) = split_cell_ref(first)?;
        let (last_col, last_row) = split_cell_ref(last)?;
        Some(Self { first_col, first_row, last_col, last_row })
    }

    pub fn contains_row(&self, row: u32) -> bool {
        (self.first_row..=self.last_row).contains(&row)
    }
}

impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}:{}{}",
            col_index_to_letter(self.first_col),
            self.first_row,
            col_index_to_letter(self.last_col),
            self.last_row
        )
    }
}

fn table_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(<table\b[^>]*?\sref=")([^"]+)(")"#).expect("table ref regex"))
}

fn autofilter_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(<autoFilter\b[^>]*?\sref=")([^"]+)(")"#).expect("autofilter ref regex"))
}

fn dimension_ref_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(<dimension\b[^>]*?\sref=")([^"]+)(")"#).expect("dimension ref regex"))
}

/// Declared range of a table part.
pub fn table_range(table_xml: &str) -> Option<CellRange> {
    table_ref_re()
        .captures(table_xml)
        .and_then(|c| c.get(2))
        .and_then(|m| CellRange::parse(m.as_str()))
}

fn with_last_row(xml: &str, re: &Regex, last_row: u32) -> String {
    re.replacen(xml, 1, |caps: &regex::Captures| match CellRange::parse(&caps[2]) {
        Some(range) => format!("{}{}{}", &caps[1], CellRange { last_row, ..range }, &caps[3]),
        None => caps[0].to_string(),
    })
    .into_owned()
}

/// Move the end row of a table (and of its auto filter) to `last_row`. Nothing else in the
/// part changes.
pub fn set_table_last_row(table_xml: &str, last_row: u32) -> SyncResult<String> {
    if table_range(table_xml).is_none() {
        return Err(SyncError::Xml("table part has no readable ref".to_string()));
    }
    let out = with_last_row(table_xml, table_ref_re(), last_row);
    Ok(with_last_row(&out, autofilter_ref_re(), last_row))
}

/// Update the sheet's `<dimension>` so it covers `last_row` and `last_col`.
pub fn set_dimension(sheet_xml: &str, last_row: u32, last_col: u32) -> String {
    dimension_ref_re()
        .replacen(sheet_xml, 1, |caps: &regex::Captures| match CellRange::parse(&caps[2]) {
            Some(range) => {
                let range = CellRange {
                    last_row,
                    last_col: range.last_col.max(last_col),
                    ..range
                };
                format!("{}{}{}", &caps[1], range, &caps[3])
            }
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Byte span of one `<row>` element of the sheet XML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSpan {
    pub number: u32,
    pub start: usize,
    pub end: usize,
    /// Any cell carries a value, inline string or formula.
    pub has_values: bool,
    /// `(column, style index)` of the row's cells.
    pub styles: Vec<(u32, String)>,
    /// Row-level attributes other than `r` and `spans`, raw (height, row style, hidden...).
    pub attrs: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SheetData {
    /// Offset of `</sheetData>`.
    Open { close_at: usize },
    /// Span of a self-closing `<sheetData/>`.
    Empty { start: usize, end: usize },
}

/// Row positions of a worksheet part.
#[derive(Debug, Clone)]
pub struct SheetLayout {
    pub rows: Vec<RowSpan>,
    sheet_data: SheetData,
}

impl SheetLayout {
    pub fn scan(sheet_xml: &str) -> SyncResult<Self> {
        let mut reader = Reader::from_str(sheet_xml);
        let mut rows = Vec::new();
        let mut sheet_data = None;
        let mut current: Option<RowSpan> = None;
        let mut last_number = 0u32;
        let mut last_col: Option<u32> = None;

        loop {
            let before = reader.buffer_position() as usize;
            let event = reader.read_event()?;
            let after = reader.buffer_position() as usize;
            match event {
                Event::Start(e) => match e.local_name().as_ref() {
                    b"row" => {
                        let number = row_number(&e, last_number)?;
                        last_number = number;
                        last_col = None;
                        current = Some(RowSpan {
                            number,
                            start: before,
                            end: before,
                            has_values: false,
                            styles: Vec::new(),
                            attrs: row_attributes(&e)?,
                        });
                    }
                    b"c" => {
                        if let Some(row) = current.as_mut() {
                            last_col = record_style(&e, row, last_col)?;
                        }
                    }
                    b"v" | b"f" | b"is" => {
                        if let Some(row) = current.as_mut() {
                            row.has_values = true;
                        }
                    }
                    _ => {}
                },
                Event::Empty(e) => match e.local_name().as_ref() {
                    b"row" => {
                        let number = row_number(&e, last_number)?;
                        last_number = number;
                        rows.push(RowSpan {
                            number,
                            start: before,
                            end: after,
                            has_values: false,
                            styles: Vec::new(),
                            attrs: row_attributes(&e)?,
                        });
                    }
                    b"c" => {
                        if let Some(row) = current.as_mut() {
                            last_col = record_style(&e, row, last_col)?;
                        }
                    }
                    // Shared-formula children are self-closing.
                    b"f" => {
                        if let Some(row) = current.as_mut() {
                            row.has_values = true;
                        }
                    }
                    b"sheetData" => sheet_data = Some(SheetData::Empty { start: before, end: after }),
                    _ => {}
                },
                Event::End(e) => match e.local_name().as_ref() {
                    b"row" => {
                        if let Some(mut row) = current.take() {
                            row.end = after;
                            rows.push(row);
                        }
                    }
                    b"sheetData" => sheet_data = Some(SheetData::Open { close_at: before }),
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        let sheet_data = sheet_data.ok_or_else(|| SyncError::Xml("worksheet has no sheetData".to_string()))?;
        Ok(Self { rows, sheet_data })
    }

    /// Last row with any value, formula or inline string.
    pub fn last_row_with_values(&self) -> Option<u32> {
        self.rows.iter().filter(|r| r.has_values).map(|r| r.number).max()
    }

    /// Cell styles of the last row between `after_row` (exclusive) and `before_row` (exclusive)
    /// that has values; new rows reuse them.
    pub fn template_styles(&self, after_row: u32, before_row: u32) -> Vec<(u32, String)> {
        self.rows
            .iter()
            .filter(|r| r.has_values && r.number > after_row && r.number < before_row)
            .max_by_key(|r| r.number)
            .map(|r| r.styles.clone())
            .unwrap_or_default()
    }

    /// Write `new_rows` into the sheet.
    ///
    /// An existing `<row>` is replaced when a new row takes its number, or when it holds values
    /// and sits at or below `from_row`. Replaced rows lend their own cell styles and row
    /// attributes to the new row; `styles` fills the columns they leave unstyled. Every other
    /// row, formatting-only rows below the written block included, is kept verbatim and in order.
    pub fn splice(&self, sheet_xml: &str, from_row: u32, new_rows: &[NewRow], styles: &[(u32, String)]) -> String {
        match self.sheet_data {
            SheetData::Empty { start, end } => {
                let rendered: String = new_rows.iter().map(|r| r.render(styles, &[])).collect();
                format!("{}<sheetData>{}</sheetData>{}", &sheet_xml[..start], rendered, &sheet_xml[end..])
            }
            SheetData::Open { close_at } => {
                let lowest = new_rows.iter().map(|r| r.number).min().unwrap_or(from_row).min(from_row);
                let cut = self
                    .rows
                    .iter()
                    .filter(|r| r.number >= lowest)
                    .map(|r| r.start)
                    .min()
                    .unwrap_or(close_at)
                    .min(close_at);
                let replaced = |r: &RowSpan| {
                    new_rows.iter().any(|n| n.number == r.number) || (r.has_values && r.number >= from_row)
                };

                // Existing tail rows and new rows, merged by row number.
                let mut tail: Vec<(u32, String)> = self
                    .rows
                    .iter()
                    .filter(|r| r.start >= cut && !replaced(r))
                    .map(|r| (r.number, sheet_xml[r.start..r.end].to_string()))
                    .collect();
                for row in new_rows {
                    let own = self.rows.iter().find(|r| r.number == row.number && r.start >= cut);
                    let rendered = match own {
                        Some(existing) => {
                            let mut merged = existing.styles.clone();
                            merged.extend(
                                styles
                                    .iter()
                                    .filter(|(c, _)| !existing.styles.iter().any(|(e, _)| e == c))
                                    .cloned(),
                            );
                            // Styled cells the new row does not write stay as blank styled cells.
                            let mut row = row.clone();
                            for (col, _) in &existing.styles {
                                if !row.cells.iter().any(|(c, _)| c == col) {
                                    row.cells.push((*col, NewCell::Text(String::new())));
                                }
                            }
                            row.render(&merged, &existing.attrs)
                        }
                        None => row.render(styles, &[]),
                    };
                    tail.push((row.number, rendered));
                }
                tail.sort_by_key(|(number, _)| *number);

                let body: String = tail.into_iter().map(|(_, xml)| xml).collect();
                format!("{}{}{}", &sheet_xml[..cut], body, &sheet_xml[close_at..])
            }
        }
    }
}

fn row_attributes(e: &BytesStart) -> SyncResult<Vec<(String, String)>> {
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| SyncError::Xml(err.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        if key == "r" || key == "spans" {
            continue;
        }
        attrs.push((key, String::from_utf8_lossy(&attr.value).into_owned()));
    }
    Ok(attrs)
}

fn row_number(e: &BytesStart, previous: u32) -> SyncResult<u32> {
    match attr_value(e, b"r")? {
        Some(r) => r
            .trim()
            .parse()
            .map_err(|_| SyncError::Xml(format!("bad row number '{}'", r))),
        None => Ok(previous + 1),
    }
}

fn record_style(e: &BytesStart, row: &mut RowSpan, last_col: Option<u32>) -> SyncResult<Option<u32>> {
    let col = match attr_value(e, b"r")? {
        Some(r) => split_cell_ref(&r).map(|(c, _)| c),
        None => Some(last_col.map(|c| c + 1).unwrap_or(0)),
    };
    if let (Some(col), Some(style)) = (col, attr_value(e, b"s")?) {
        row.styles.push((col, style));
    }
    Ok(col.or(last_col))
}

/// Value of a cell in a row being written.
#[derive(Debug, Clone, PartialEq)]
pub enum NewCell {
    Text(String),
    Number(f64),
    Formula(String),
}

/// A row to be written; `cells` are `(0-based column, value)`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRow {
    pub number: u32,
    pub cells: Vec<(u32, NewCell)>,
}

impl NewRow {
    fn render(&self, styles: &[(u32, String)], row_attrs: &[(String, String)]) -> String {
        let style_of = |col: u32| {
            styles
                .iter()
                .find(|(c, _)| *c == col)
                .map(|(_, s)| format!(r#" s="{}""#, s))
                .unwrap_or_default()
        };
        let mut out = format!(r#"<row r="{}""#, self.number);
        for (key, value) in row_attrs {
            out.push_str(&format!(r#" {}="{}""#, key, value));
        }
        out.push('>');
        let mut cells: Vec<&(u32, NewCell)> = self.cells.iter().collect();
        cells.sort_by_key(|(c, _)| *c);
        for (col, cell) in cells {
            let reference = format!("{}{}", col_index_to_letter(*col), self.number);
            let style = style_of(*col);
            match cell {
                NewCell::Text(s) => {
                    let s = sanitize_cell(s);
                    if s.is_empty() {
                        if !style.is_empty() {
                            out.push_str(&format!(r#"<c r="{}"{}/>"#, reference, style));
                        }
                        continue;
                    }
                    out.push_str(&format!(
                        r#"<c r="{}"{} t="inlineStr"><is><t xml:space="preserve">{}</t></is></c>"#,
                        reference,
                        style,
                        escape(s.as_str())
                    ));
                }
                NewCell::Number(n) if n.is_finite() => {
                    out.push_str(&format!(r#"<c r="{}"{}><v>{}</v></c>"#, reference, style, n));
                }
                NewCell::Number(_) => {}
                NewCell::Formula(f) => {
                    let f = f.strip_prefix('=').unwrap_or(f.as_str());
                    out.push_str(&format!(r#"<c r="{}"{}><f>{}</f></c>"#, reference, style, escape(f)));
                }
            }
        }
        out.push_str("</row>");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHEET: &str = concat!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
        r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">"#,
        r#"<dimension ref="A1:C3"/><sheetData>"#,
        r#"<row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c></row>"#,
        r#"<row r="2"><c r="A2" s="3" t="s"><v>2</v></c><c r="B2" s="4"><v>10</v></c><c r="C2" s="5"><f>B2*2</f><v>20</v></c></row>"#,
        r#"<row r="3"><c r="A3" s="3"/><c r="B3" s="4"/></row>"#,
        r#"<row r="4" spans="1:3"/>"#,
        r#"</sheetData><tableParts count="1"><tablePart r:id="rId1"/></tableParts></worksheet>"#
    );

    #[test]
    fn scan_finds_rows_and_values() {
        let layout = SheetLayout::scan(SHEET).expect("scan");
        let numbers: Vec<u32> = layout.rows.iter().map(|r| r.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(layout.last_row_with_values(), Some(2));
        assert!(!layout.rows[2].has_values);
        assert_eq!(&SHEET[layout.rows[0].start..layout.rows[0].end], r#"<row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c></row>"#);
        assert_eq!(
            layout.template_styles(1, 5),
            vec![(0, "3".to_string()), (1, "4".to_string()), (2, "5".to_string())]
        );
    }

    #[test]
    fn splice_fills_styled_row_and_keeps_rows_below() {
        let layout = SheetLayout::scan(SHEET).expect("scan");
        let rows = vec![NewRow {
            number: 3,
            cells: vec![
                (0, NewCell::Text("A & B".into())),
                (1, NewCell::Number(12.5)),
                (2, NewCell::Formula("B3*2".into())),
            ],
        }];
        let styles = layout.template_styles(1, 3);
        let out = layout.splice(SHEET, 3, &rows, &styles);
        let prefix_end = layout.rows[1].end;
        assert_eq!(&out[..prefix_end], &SHEET[..prefix_end]);
        assert!(out.contains(r#"<c r="A3" s="3" t="inlineStr"><is><t xml:space="preserve">A &amp; B</t></is></c>"#));
        assert!(out.contains(r#"<c r="B3" s="4"><v>12.5</v></c>"#));
        assert!(out.contains(r#"<c r="C3" s="5"><f>B3*2</f></c>"#));
        assert!(out.contains(r#"</c></row><row r="4" spans="1:3"/></sheetData>"#));
        assert!(out.ends_with(r#"</sheetData><tableParts count="1"><tablePart r:id="rId1"/></tableParts></worksheet>"#));
    }

    #[test]
    fn splice_replaces_valued_rows_only_from_the_rewrite_point() {
        let xml = concat!(
            r#"<worksheet><sheetData>"#,
            r#"<row r="1"><c r="A1"><v>1</v></c></row>"#,
            r#"<row r="2"><c r="A2"><v>2</v></c></row>"#,
            r#"<row r="3"><c r="A3"><v>3</v></c></row>"#,
            r#"<row r="7" ht="30" customHeight="1"><c r="A7" s="9"/><c r="D7" s="2"/></row>"#,
            r#"<row r="9" s="4" customFormat="1"/>"#,
            r#"</sheetData></worksheet>"#
        );
        let layout = SheetLayout::scan(xml).expect("scan");
        let rows = vec![
            NewRow { number: 2, cells: vec![(0, NewCell::Number(20.0))] },
            NewRow { number: 7, cells: vec![(0, NewCell::Number(70.0))] },
        ];
        let out = layout.splice(xml, 2, &rows, &[]);
        assert_eq!(
            out,
            concat!(
                r#"<worksheet><sheetData>"#,
                r#"<row r="1"><c r="A1"><v>1</v></c></row>"#,
                r#"<row r="2"><c r="A2"><v>20</v></c></row>"#,
                r#"<row r="7" ht="30" customHeight="1"><c r="A7" s="9"><v>70</v></c><c r="D7" s="2"/></row>"#,
                r#"<row r="9" s="4" customFormat="1"/>"#,
                r#"</sheetData></worksheet>"#
            )
        );
    }

    #[test]
    fn splice_expands_self_closing_sheet_data() {
        let xml = r#"<worksheet><dimension ref="A1"/><sheetData/></worksheet>"#;
        let layout = SheetLayout::scan(xml).expect("scan");
        let rows = vec![NewRow { number: 1, cells: vec![(0, NewCell::Text("x".into()))] }];
        let out = layout.splice(xml, 1, &rows, &[]);
        assert_eq!(
            out,
            r#"<worksheet><dimension ref="A1"/><sheetData><row r="1"><c r="A1" t="inlineStr"><is><t xml:space="preserve">x</t></is></c></row></sheetData></worksheet>"#
        );
    }

    #[test]
    fn table_and_filter_refs_move_together() {
        let xml = r#"<table xmlns="x" id="1" name="Ventas" displayName="Ventas" ref="A1:AF100" totalsRowShown="0"><autoFilter ref="A1:AF100"/><tableColumns count="32"/></table>"#;
        assert_eq!(
            table_range(xml),
            Some(CellRange { first_col: 0, first_row: 1, last_col: 31, last_row: 100 })
        );
        let out = set_table_last_row(xml, 105).expect("update");
        assert!(out.contains(r#"ref="A1:AF105" totalsRowShown"#));
        assert!(out.contains(r#"<autoFilter ref="A1:AF105"/>"#));
        assert!(out.contains(r#"<tableColumns count="32"/>"#));
    }

    #[test]
    fn dimension_grows_to_cover_new_rows() {
        let out = set_dimension(SHEET, 9, 1);
        assert!(out.contains(r#"<dimension ref="A1:C9"/>"#));
        let single = set_dimension(r#"<dimension ref="A1"/>"#, 4, 2);
        assert_eq!(single, r#"<dimension ref="A1:C4"/>"#);
    }

    #[test]
    fn relationship_targets_resolve_against_base() {
        assert_eq!(resolve_target("xl", "worksheets/sheet1.xml"), "xl/worksheets/sheet1.xml");
        assert_eq!(resolve_target("xl", "/xl/worksheets/sheet2.xml"), "xl/worksheets/sheet2.xml");
        assert_eq!(resolve_target("xl/worksheets", "../tables/table1.xml"), "xl/tables/table1.xml");
        assert_eq!(sheet_rels_path("xl/worksheets/sheet1.xml"), "xl/worksheets/_rels/sheet1.xml.rels");
    }

    #[test]
    fn non_zip_content_is_rejected() {
        assert!(matches!(XlsxPackage::from_bytes(b""), Err(SyncError::InvalidWorkbook(_))));
        assert!(matches!(XlsxPackage::from_bytes(b"PK\x03\x04garbage"), Err(SyncError::InvalidWorkbook(_))));
        assert!(matches!(XlsxPackage::from_bytes(b"<html>"), Err(SyncError::InvalidWorkbook(_))));
    }

    #[test]
    fn package_round_trip_locates_sheet_and_table() {
        use rust_xlsxwriter::{Table, TableColumn, Workbook};
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.set_name("Ventas").expect("name");
        sheet.write_string(0, 0, "Código").expect("write");
        sheet.write_string(0, 1, "Total").expect("write");
        sheet.write_number(1, 0, 1.0).expect("write");
        sheet.write_number(1, 1, 2.0).expect("write");
        let table = Table::new().set_columns(&[TableColumn::new().set_header("Código"), TableColumn::new().set_header("Total")]);
        sheet.add_table(0, 0, 1, 1, &table).expect("table");
        let bytes = workbook.save_to_buffer().expect("save");

        let package = XlsxPackage::from_bytes(&bytes).expect("package");
        let location = package.locate_sheet("Ventas").expect("sheet");
        assert_eq!(location.sheet_path, "xl/worksheets/sheet1.xml");
        assert_eq!(location.table_paths.len(), 1);
        let table_xml = package.part_text(&location.table_paths[0]).expect("table part");
        assert_eq!(table_range(&table_xml).map(|r| r.to_string()), Some("A1:B2".to_string()));
        assert!(matches!(package.locate_sheet("Nope"), Err(SyncError::SheetNotFound(_))));

        let again = XlsxPackage::from_bytes(&package.to_bytes().expect("zip")).expect("reopen");
        assert_eq!(again.part_names().count(), package.part_names().count());
    }
}
