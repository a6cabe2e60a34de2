mod common;

use common::{export_bytes, s, V};
use sales_sync_lib::events::{EventLog, Level};
use sales_sync_lib::excel::{export_processed_table, read_sheet_grid, PROCESSED_SHEET};
use sales_sync_lib::services::transformer::{transform_export, DEFAULT_HEADER_OFFSET};
use sales_sync_lib::types::CellValue;

const HEADER: &[&str] = &[
    "Tipo clasificación",
    "Código",
    "Nombre",
    "Número comprobante",
    "Consecutivo",
    "Factura proveedor",
    "Fecha elaboración",
    "Identificación",
    "Nombre tercero",
    "Cantidad",
    "Valor unitario",
    "Total",
    "Tasa de cambio",
    "Observaciones",
    "Vendedor",
    "Sucursal",
];

fn line(class: &str, doc: &str, seq: f64, party: &str, qty: f64, unit: f64, notes: &str) -> Vec<V> {
    vec![
        s(class),
        s("SV-01"),
        s("Soporte"),
        s(doc),
        V::N(seq),
        s("PROV-9"),
        s("14/03/2025"),
        s(party),
        s("Cliente Uno"),
        V::N(qty),
        V::N(unit),
        V::N(1.0),
        V::Blank,
        s(notes),
        s("V-01"),
        s("Principal"),
    ]
}

fn sample_export() -> Vec<u8> {
    export_bytes(
        DEFAULT_HEADER_OFFSET as u32,
        HEADER,
        &[
            line("Servicio", "FV-1", 120.0, "900123", 2.0, 50.0, "{4000} [VEN-7]"),
            line("Producto", "FV-2", 7.0, "800555", 1.0, 10.0, "{4100}"),
            line("", "FV-1", 121.0, "900123", 1.0, 1.0, "sin clasificar"),
            line("Servicio", "DS-1", 3.0, "", 2.0, 5.0, "(900123) {4000}"),
        ],
    )
}

#[test]
fn export_is_cleaned_joined_and_ordered() {
    let mut log = EventLog::new();
    let table = transform_export(&sample_export(), DEFAULT_HEADER_OFFSET, None, &mut log);

    // Unclassified row dropped; the DS-1 line is joined onto the FV-1 line.
    assert_eq!(table.len(), 2);
    let headers = table.headers();
    assert_eq!(headers[0], "Tipo Bien");
    assert!(headers.iter().any(|h| h == "REL_Total"));
    assert!(!headers.iter().any(|h| h == "Sucursal"));

    let first = &table.records[0];
    let main = first.main.as_ref().expect("main line");
    assert_eq!(main.document_number, "FLE-120");
    assert_eq!(main.total, 100.0);
    assert_eq!(main.exchange_rate, 4000.0);
    assert!((main.total_foreign - 0.025).abs() < 1e-9);
    assert_eq!(main.product_classification, "VEN-7");
    assert_eq!(main.seller_id, "V-01");
    let related = first.related.as_ref().expect("joined adjustment");
    assert_eq!(related.document_type, "DS-1");
    assert_eq!(related.total, 10.0);

    let second = table.records[1].main.as_ref().expect("main line");
    assert_eq!(second.document_number, "FSE-7");
    assert!(table.records[1].related.is_none());

    let last = log.events().last().expect("events");
    assert_eq!(last.level, Level::Success);
    assert_eq!(last.message, "Processing completed.");
}

#[test]
fn processed_workbook_round_trips_through_disk() {
    let mut log = EventLog::new();
    let table = transform_export(&sample_export(), DEFAULT_HEADER_OFFSET, None, &mut log);

    let dir = tempfile::tempdir().expect("temp dir");
    let target = dir.path().join("salida.csv");
    let saved = export_processed_table(&table, target.to_str(), "ventas.xlsx").expect("saved");
    assert!(saved.ends_with("salida.xlsx"));

    let bytes = std::fs::read(&saved).expect("read back");
    let grid = read_sheet_grid(&bytes, PROCESSED_SHEET).expect("processed sheet");
    let header: Vec<String> = grid[0].iter().map(|c| c.display()).collect();
    assert_eq!(header, table.headers());
    assert_eq!(grid.len(), 1 + table.len());

    let doc_col = table.column_index("Numero comprobante").expect("document number column");
    assert_eq!(grid[1][doc_col], CellValue::text("FLE-120"));
    let date_col = table.column_index("Fecha elaboración").expect("date column");
    assert_eq!(grid[1][date_col].display(), "14/03/2025");
}

#[test]
fn wrong_header_offset_yields_empty_table_and_error() {
    let bytes = export_bytes(2, HEADER, &[line("Servicio", "FV-1", 1.0, "1", 1.0, 1.0, "")]);
    let mut log = EventLog::new();
    let table = transform_export(&bytes, 40, None, &mut log);
    assert!(table.is_empty());
    assert!(log.has_errors());
    assert!(log.events()[0].message.contains("40"));
}

#[test]
fn non_workbook_bytes_are_reported_not_panicked() {
    let mut log = EventLog::new();
    let table = transform_export(b"<html>session expired</html>", DEFAULT_HEADER_OFFSET, None, &mut log);
    assert!(table.is_empty());
    assert!(log.has_errors());
}
