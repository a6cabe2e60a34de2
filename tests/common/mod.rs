#![allow(dead_code)]

use rust_xlsxwriter::{Formula, Table, TableColumn, Workbook};
use sales_sync_lib::graph::{DocumentStore, DriveItem};
use sales_sync_lib::retry::Sleeper;
use sales_sync_lib::services::xlsx_package::XlsxPackage;
use sales_sync_lib::{SyncError, SyncResult};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::time::Duration;

/// Cell of a fixture sheet.
#[derive(Debug, Clone)]
pub enum V {
    S(String),
    N(f64),
    F(String),
    Blank,
}

pub fn s(text: &str) -> V {
    V::S(text.to_string())
}

/// One-sheet workbook: header in row 1, `rows` below, optionally governed by a table over
/// the header and every row.
pub fn sheet_bytes(sheet: &str, header: &[&str], rows: &[Vec<V>], with_table: bool) -> Vec<u8> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(sheet).expect("sheet name");
    if !with_table {
        for (c, h) in header.iter().enumerate() {
            worksheet.write_string(0, c as u16, *h).expect("header");
        }
    }
    for (r, row) in rows.iter().enumerate() {
        let r = r as u32 + 1;
        for (c, v) in row.iter().enumerate() {
            let c = c as u16;
            match v {
                V::S(text) => {
                    worksheet.write_string(r, c, text).expect("string");
                }
                V::N(n) => {
                    worksheet.write_number(r, c, *n).expect("number");
                }
                V::F(f) => {
                    worksheet.write_formula(r, c, Formula::new(f)).expect("formula");
                }
                V::Blank => {}
            }
        }
    }
    if with_table {
        let columns: Vec<TableColumn> = header.iter().map(|h| TableColumn::new().set_header(*h)).collect();
        let table = Table::new().set_columns(&columns);
        worksheet
            .add_table(0, 0, rows.len() as u32, header.len() as u16 - 1, &table)
            .expect("table");
    }
    workbook.save_to_buffer().expect("save")
}

/// Accounting export: `offset` banner rows, then the header, then the rows.
pub fn export_bytes(offset: u32, header: &[&str], rows: &[Vec<V>]) -> Vec<u8> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.write_string(0, 0, "Movimiento de ventas").expect("banner");
    if offset > 2 {
        worksheet.write_string(2, 0, "Generado el 18/03/2025").expect("banner");
    }
    for (c, h) in header.iter().enumerate() {
        worksheet.write_string(offset, c as u16, *h).expect("header");
    }
    for (r, row) in rows.iter().enumerate() {
        let r = offset + 1 + r as u32;
        for (c, v) in row.iter().enumerate() {
            let c = c as u16;
            match v {
                V::S(text) => {
                    worksheet.write_string(r, c, text).expect("string");
                }
                V::N(n) => {
                    worksheet.write_number(r, c, *n).expect("number");
                }
                V::F(f) => {
                    worksheet.write_formula(r, c, Formula::new(f)).expect("formula");
                }
                V::Blank => {}
            }
        }
    }
    workbook.save_to_buffer().expect("save")
}

pub fn sheet_xml(bytes: &[u8], sheet: &str) -> String {
    let package = XlsxPackage::from_bytes(bytes).expect("package");
    let location = package.locate_sheet(sheet).expect("sheet");
    package.part_text(&location.sheet_path).expect("sheet xml")
}

pub fn table_xml(bytes: &[u8], sheet: &str) -> String {
    let package = XlsxPackage::from_bytes(bytes).expect("package");
    let location = package.locate_sheet(sheet).expect("sheet");
    let path = location.table_paths.first().expect("table part");
    package.part_text(path).expect("table xml")
}

/// In-memory document store. `locked_uploads` upload calls are rejected with HTTP 423 first.
#[derive(Default)]
pub struct MemoryStore {
    pub files: RefCell<HashMap<String, Vec<u8>>>,
    pub uploads: Cell<usize>,
    pub locked_uploads: Cell<u32>,
}

impl MemoryStore {
    pub fn with_file(path: &str, bytes: Vec<u8>) -> Self {
        let store = Self::default();
        store.files.borrow_mut().insert(path.to_string(), bytes);
        store
    }

    pub fn file(&self, path: &str) -> Vec<u8> {
        self.files.borrow().get(path).cloned().expect("file present")
    }
}

impl DocumentStore for MemoryStore {
    fn download(&self, path: &str) -> SyncResult<Vec<u8>> {
        self.files
            .borrow()
            .get(path)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(path.to_string()))
    }

    fn upload(&self, path: &str, bytes: &[u8]) -> SyncResult<()> {
        if self.locked_uploads.get() > 0 {
            self.locked_uploads.set(self.locked_uploads.get() - 1);
            return Err(SyncError::Http {
                status: 423,
                body: "resourceLocked".to_string(),
            });
        }
        self.uploads.set(self.uploads.get() + 1);
        self.files.borrow_mut().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn list_children(&self, folder: &str) -> SyncResult<Vec<DriveItem>> {
        let prefix = format!("{}/", folder.trim_matches('/'));
        Ok(self
            .files
            .borrow()
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(|name| (k, name)))
            .filter(|(_, name)| !name.contains('/'))
            .map(|(k, name)| DriveItem {
                name: name.to_string(),
                path: k.clone(),
                is_folder: false,
                size: None,
            })
            .collect())
    }
}

#[derive(Default)]
pub struct RecordingSleeper {
    pub slept: RefCell<Vec<Duration>>,
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept.borrow_mut().push(duration);
    }
}
