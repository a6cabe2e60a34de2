//! Sales export cleaning: raw extract in, canonical records out.
//!
//! Each step checks the columns it needs and is skipped with a warning when they are
//! missing; nothing in here fails the run. Every step reports to the event sink.

use crate::error::SyncError;
use crate::events::EventSink;
use crate::excel::read_raw_table;
use crate::models::schema::{
    FINAL_COLUMNS, AUXILIARY_FIELDS, CORE_FIELDS, DENY_LIST, PRIMARY_DOCUMENTS, RELATED_DOCUMENTS,
    SOURCE_HEADERS,
};
use crate::models::{CanonicalRecord, Field, OutputTable, SalesLine, Side};
use crate::rates::RateSource;
use crate::types::{parse_number, round_to, CellValue, RawRecord, RawTable};
use chrono::NaiveDate;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::OnceLock;

/// Decimal places kept on recomputed totals.
pub const AMOUNT_DECIMALS: i32 = 2;

/// Default number of banner rows above the header in the accounting export.
pub const DEFAULT_HEADER_OFFSET: usize = 7;

fn braces_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{(.*?)\}").expect("braces regex"))
}

fn parens_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\((.*?)\)").expect("parens regex"))
}

fn brackets_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(.*?)\]").expect("brackets regex"))
}

fn quotes_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""(.*?)""#).expect("quotes regex"))
}

/// First non-empty capture of `re` in `text`, trimmed.
fn extract_marked(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

fn is_related_document(document_type: &str) -> bool {
    RELATED_DOCUMENTS.contains(&document_type)
}

fn primary_prefix(document_type: &str) -> Option<&'static str> {
    PRIMARY_DOCUMENTS
        .iter()
        .find(|(marker, _)| *marker == document_type)
        .map(|(_, prefix)| *prefix)
}

fn field_names(fields: &[Field]) -> String {
    fields.iter().map(|f| f.header()).collect::<Vec<_>>().join(", ")
}

/// Read and transform an export held in memory. An unreadable file or one without columns
/// after `header_offset` rows yields an empty table and an error event.
pub fn transform_export<S: EventSink>(
    bytes: &[u8],
    header_offset: usize,
    rates: Option<&dyn RateSource>,
    events: &mut S,
) -> OutputTable {
    match read_raw_table(bytes, header_offset) {
        Ok(raw) => {
            events.info(format!(
                "File loaded after skipping the first {} rows. Initial rows: {}.",
                header_offset,
                raw.len()
            ));
            transform(raw, rates, events)
        }
        Err(SyncError::UnrecognizedLayout(_)) => {
            events.error(format!(
                "The file seems to have no data or headers after skipping the first {} rows. Check the file layout.",
                header_offset
            ));
            OutputTable::default()
        }
        Err(e) => {
            events.error(format!("Could not read the uploaded file: {}", e));
            OutputTable::default()
        }
    }
}

/// Run every cleaning step over a raw table.
pub fn transform<S: EventSink>(mut raw: RawTable, rates: Option<&dyn RateSource>, events: &mut S) -> OutputTable {
    report_schema_mismatch(&raw, events);
    filter_unclassified(&mut raw, events);
    prune_columns(&mut raw, events);

    let mut present = present_fields(&raw);
    let mut lines = map_lines(&raw, &present, events);

    recompute_totals(&mut lines, &present, events);
    synthesize_document_numbers(&mut lines, &mut present, events);
    apply_embedded_rates(&mut lines, &present, events);
    lookup_missing_rates(&mut lines, &present, rates, events);
    compute_foreign_totals(&mut lines, &mut present, events);
    annotate_from_notes(&mut lines, &present, events);

    let (records, joined) = join_related(lines, &present, events);
    let table = finalize(records, &present, joined, events);
    events.success("Processing completed.", Some(table.len()));
    table
}

fn source_header(field: Field) -> &'static str {
    field.header()
}

fn present_fields(raw: &RawTable) -> BTreeSet<Field> {
    SOURCE_HEADERS
        .iter()
        .filter(|(_, h)| raw.has_column(h))
        .map(|(f, _)| *f)
        .collect()
}

/// One warning for every core column the header row lacks.
fn report_schema_mismatch<S: EventSink>(raw: &RawTable, events: &mut S) {
    let missing: Vec<Field> = CORE_FIELDS
        .iter()
        .copied()
        .filter(|f| !raw.has_column(source_header(*f)))
        .collect();
    if !missing.is_empty() {
        events.warning(format!(
            "Schema mismatch: the export is missing the columns {}. Steps that need them will be skipped.",
            field_names(&missing)
        ));
    }
}

fn filter_unclassified<S: EventSink>(raw: &mut RawTable, events: &mut S) {
    let header = source_header(Field::Classification);
    if !raw.has_column(header) {
        events.warning(format!("Column '{}' not found. No empty rows were removed.", header));
        return;
    }
    let before = raw.len();
    raw.rows
        .retain(|r| r.get(header).map(|v| !v.is_missing()).unwrap_or(false));
    let removed = before - raw.len();
    events.success(
        format!(
            "Rows with empty '{}' removed: {}. Remaining rows: {}.",
            header,
            removed,
            raw.len()
        ),
        Some(removed),
    );
}

fn prune_columns<S: EventSink>(raw: &mut RawTable, events: &mut S) {
    let mut removed = Vec::new();
    let mut absent = Vec::new();
    for name in DENY_LIST {
        if raw.drop_column(name) {
            removed.push(*name);
        } else {
            absent.push(*name);
        }
    }
    if removed.is_empty() {
        events.info("None of the administrative columns were present. No columns removed.");
    } else {
        events.success(format!("Columns removed: {}.", removed.join(", ")), Some(removed.len()));
    }
    if !absent.is_empty() {
        events.warning(format!(
            "These columns marked for removal were not found: {}.",
            absent.join(", ")
        ));
    }
}

fn get<'a>(row: &'a RawRecord, field: Field) -> Option<&'a CellValue> {
    row.get(source_header(field))
}

fn text_of(row: &RawRecord, field: Field) -> String {
    get(row, field).map(|v| v.to_key()).unwrap_or_default()
}

/// Typed view of the raw rows. Unparseable numbers and dates are counted and defaulted.
fn map_lines<S: EventSink>(raw: &RawTable, present: &BTreeSet<Field>, events: &mut S) -> Vec<SalesLine> {
    let mut bad_numbers = 0usize;
    let mut bad_dates = 0usize;
    let mut number = |row: &RawRecord, field: Field| -> f64 {
        match get(row, field) {
            Some(v) if !v.is_missing() => v.to_number().unwrap_or_else(|| {
                bad_numbers += 1;
                0.0
            }),
            _ => 0.0,
        }
    };

    let mut lines = Vec::with_capacity(raw.len());
    for row in &raw.rows {
        let quantity = number(row, Field::Quantity);
        let unit_value = number(row, Field::UnitValue);
        let total = number(row, Field::Total);
        let exchange_rate = number(row, Field::ExchangeRate).max(0.0);
        let elaboration_date = match get(row, Field::ElaborationDate) {
            Some(v) if !v.is_missing() => {
                let d = v.to_date();
                if d.is_none() {
                    bad_dates += 1;
                }
                d
            }
            _ => None,
        };
        let sequence = get(row, Field::Sequence)
            .and_then(|v| v.to_number())
            .map(|n| n.round() as i64);

        lines.push(SalesLine {
            classification: text_of(row, Field::Classification),
            product_classification: text_of(row, Field::ProductClassification),
            line_code: text_of(row, Field::LineCode),
            line_description: text_of(row, Field::LineDescription),
            subline_code: text_of(row, Field::SublineCode),
            subline_description: text_of(row, Field::SublineDescription),
            item_code: text_of(row, Field::ItemCode),
            item_name: text_of(row, Field::ItemName),
            document_type: text_of(row, Field::DocumentType),
            document_number: String::new(),
            sequence,
            supplier_invoice: text_of(row, Field::SupplierInvoice),
            elaboration_date,
            party_id: text_of(row, Field::PartyId),
            party_name: text_of(row, Field::PartyName),
            seller_id: text_of(row, Field::SellerId),
            quantity,
            unit_value,
            total,
            exchange_rate,
            total_foreign: 0.0,
            notes: get(row, Field::Notes).map(|v| v.display()).unwrap_or_default(),
        });
    }

    if bad_numbers > 0 {
        events.warning(format!("{} numeric values could not be read and were set to 0.", bad_numbers));
    }
    if bad_dates > 0 && present.contains(&Field::ElaborationDate) {
        events.warning(format!(
            "{} values in '{}' are not valid dates and were left empty.",
            bad_dates,
            source_header(Field::ElaborationDate)
        ));
    }
    lines
}

fn missing_of(present: &BTreeSet<Field>, needed: &[Field]) -> Vec<Field> {
    needed.iter().copied().filter(|f| !present.contains(f)).collect()
}

fn recompute_totals<S: EventSink>(lines: &mut [SalesLine], present: &BTreeSet<Field>, events: &mut S) {
    let missing = missing_of(present, &[Field::Quantity, Field::UnitValue, Field::Total]);
    if !missing.is_empty() {
        events.warning(format!(
            "Columns {} not found. '{}' was not updated.",
            field_names(&missing),
            source_header(Field::Total)
        ));
        return;
    }
    for line in lines.iter_mut() {
        line.total = round_to(line.quantity * line.unit_value, AMOUNT_DECIMALS);
    }
    events.success(
        format!(
            "'{}' recomputed as '{}' × '{}'.",
            source_header(Field::Total),
            source_header(Field::Quantity),
            source_header(Field::UnitValue)
        ),
        Some(lines.len()),
    );
}

fn synthesize_document_numbers<S: EventSink>(
    lines: &mut [SalesLine],
    present: &mut BTreeSet<Field>,
    events: &mut S,
) {
    let missing = missing_of(present, &[Field::DocumentType, Field::Sequence, Field::SupplierInvoice]);
    if !missing.is_empty() {
        events.warning(format!(
            "Columns {} not found. '{}' was not created.",
            field_names(&missing),
            Field::DocumentNumber.header()
        ));
        return;
    }
    let mut filled = 0usize;
    for line in lines.iter_mut() {
        line.document_number = match (primary_prefix(&line.document_type), line.sequence) {
            (Some(prefix), Some(seq)) => {
                filled += 1;
                format!("{}{}", prefix, seq)
            }
            _ => String::new(),
        };
    }
    present.insert(Field::DocumentNumber);
    events.success(
        format!("Column '{}' created and filled.", Field::DocumentNumber.header()),
        Some(filled),
    );
}

fn apply_embedded_rates<S: EventSink>(lines: &mut [SalesLine], present: &BTreeSet<Field>, events: &mut S) {
    let missing = missing_of(present, &[Field::ExchangeRate, Field::Notes]);
    if !missing.is_empty() {
        events.warning(format!(
            "Columns {} not found. Embedded rates were not read.",
            field_names(&missing)
        ));
        return;
    }
    let mut updated = 0usize;
    for line in lines.iter_mut() {
        let rate = extract_marked(braces_re(), &line.notes)
            .and_then(|raw| parse_number(&raw))
            .filter(|r| *r >= 0.0);
        if let Some(rate) = rate {
            line.exchange_rate = rate;
            updated += 1;
        }
    }
    if updated > 0 {
        events.success(
            format!(
                "Updated {} rows of '{}' with rates found in '{}'.",
                updated,
                source_header(Field::ExchangeRate),
                source_header(Field::Notes)
            ),
            Some(updated),
        );
    }
}

fn lookup_missing_rates<S: EventSink>(
    lines: &mut [SalesLine],
    present: &BTreeSet<Field>,
    rates: Option<&dyn RateSource>,
    events: &mut S,
) {
    let Some(rates) = rates else {
        tracing::debug!("no rate source configured, skipping rate lookup");
        return;
    };
    let missing = missing_of(present, &[Field::ExchangeRate, Field::ElaborationDate]);
    if !missing.is_empty() {
        events.warning(format!(
            "Columns {} not found. Rates were not looked up.",
            field_names(&missing)
        ));
        return;
    }
    let mut cache: HashMap<NaiveDate, Option<f64>> = HashMap::new();
    let mut filled = 0usize;
    let mut unresolved = 0usize;
    for line in lines.iter_mut().filter(|l| l.exchange_rate == 0.0) {
        let Some(date) = line.elaboration_date else {
            continue;
        };
        let rate = *cache.entry(date).or_insert_with(|| rates.lookup_rate(date));
        match rate.filter(|r| r.is_finite() && *r > 0.0) {
            Some(r) => {
                line.exchange_rate = r;
                filled += 1;
            }
            None => unresolved += 1,
        }
    }
    if filled > 0 {
        events.success(
            format!("Filled {} empty rates from the exchange-rate service ({} dates queried).", filled, cache.len()),
            Some(filled),
        );
    }
    if unresolved > 0 {
        events.warning(format!("No rate available for {} rows; their rate stays empty.", unresolved));
    }
}

fn compute_foreign_totals<S: EventSink>(lines: &mut [SalesLine], present: &mut BTreeSet<Field>, events: &mut S) {
    let missing = missing_of(present, &[Field::Total, Field::ExchangeRate]);
    if !missing.is_empty() {
        events.warning(format!(
            "Columns {} not found. '{}' could not be computed.",
            field_names(&missing),
            Field::TotalForeign.header()
        ));
        return;
    }
    let mut zero_rate = 0usize;
    for line in lines.iter_mut() {
        // A zero rate is undefined, not a divisor.
        let rate = Some(line.exchange_rate).filter(|r| r.is_finite() && *r > 0.0);
        line.total_foreign = match rate {
            Some(r) => {
                let v = line.total / r;
                if v.is_finite() {
                    v
                } else {
                    0.0
                }
            }
            None => {
                zero_rate += 1;
                0.0
            }
        };
    }
    present.insert(Field::TotalForeign);
    events.success(
        format!("Column '{}' computed.", Field::TotalForeign.header()),
        Some(lines.len()),
    );
    if zero_rate > 0 {
        events.info(format!(
            "{} rows have no exchange rate; their '{}' is 0.",
            zero_rate,
            Field::TotalForeign.header()
        ));
    }
}

/// Classification, line and subline codes written into the notes as `[..]`, `(..)` and `".."`.
fn annotate_from_notes<S: EventSink>(lines: &mut [SalesLine], present: &BTreeSet<Field>, events: &mut S) {
    if !present.contains(&Field::Notes) {
        return;
    }
    let mut annotated = 0usize;
    for line in lines.iter_mut().filter(|l| !is_related_document(&l.document_type)) {
        let mut touched = false;
        if line.product_classification.is_empty() {
            if let Some(v) = extract_marked(brackets_re(), &line.notes) {
                line.product_classification = v;
                touched = true;
            }
        }
        if line.line_code.is_empty() {
            if let Some(v) = extract_marked(parens_re(), &line.notes) {
                line.line_code = v;
                touched = true;
            }
        }
        if line.subline_code.is_empty() {
            if let Some(v) = extract_marked(quotes_re(), &line.notes) {
                line.subline_code = v;
                touched = true;
            }
        }
        if touched {
            annotated += 1;
        }
    }
    if annotated > 0 {
        events.success(
            format!("Classification codes read from '{}' for {} rows.", source_header(Field::Notes), annotated),
            Some(annotated),
        );
    }
}

type JoinKey = (String, String);

/// Pair every primary document with at most one related document on
/// `(party_id, item_code) == (relation key, item_code)`. Pairing is one-to-one in file order;
/// unpaired lines on either side are kept as their own rows.
fn join_related<S: EventSink>(
    lines: Vec<SalesLine>,
    present: &BTreeSet<Field>,
    events: &mut S,
) -> (Vec<CanonicalRecord>, bool) {
    let unjoined = |lines: Vec<SalesLine>| {
        lines
            .into_iter()
            .map(|l| CanonicalRecord { main: Some(l), related: None })
            .collect::<Vec<_>>()
    };

    if !present.contains(&Field::DocumentType) {
        events.warning(format!(
            "Column '{}' not found. Documents were not related.",
            source_header(Field::DocumentType)
        ));
        return (unjoined(lines), false);
    }

    events.info("Relating sales documents with their adjustment documents...");
    let mut primary = Vec::new();
    let mut related = Vec::new();
    let mut other = Vec::new();
    for line in lines {
        if primary_prefix(&line.document_type).is_some() {
            primary.push(line);
        } else if is_related_document(&line.document_type) {
            related.push(line);
        } else {
            other.push(line);
        }
    }

    if related.is_empty() {
        events.warning(format!(
            "No {} documents found to relate. The output will not have related columns.",
            RELATED_DOCUMENTS.join(" or ")
        ));
        let mut all = primary;
        all.extend(other);
        return (unjoined(all), false);
    }

    let missing = missing_of(present, &[Field::PartyId, Field::ItemCode, Field::Notes]);
    if !missing.is_empty() {
        events.warning(format!(
            "Columns {} not found. Documents were not related.",
            field_names(&missing)
        ));
        let mut all = primary;
        all.extend(related);
        all.extend(other);
        return (unjoined(all), false);
    }

    let mut by_key: HashMap<JoinKey, VecDeque<usize>> = HashMap::new();
    for (idx, line) in related.iter().enumerate() {
        if let Some(relation) = extract_marked(parens_re(), &line.notes) {
            by_key
                .entry((relation, line.item_code.clone()))
                .or_default()
                .push_back(idx);
        }
    }

    let mut taken = vec![false; related.len()];
    let mut slots: Vec<Option<usize>> = Vec::with_capacity(primary.len());
    for line in &primary {
        let slot = if line.party_id.is_empty() {
            None
        } else {
            by_key
                .get_mut(&(line.party_id.clone(), line.item_code.clone()))
                .and_then(|q| q.pop_front())
        };
        if let Some(i) = slot {
            taken[i] = true;
        }
        slots.push(slot);
    }

    let mut related: Vec<Option<SalesLine>> = related.into_iter().map(Some).collect();
    let mut records = Vec::with_capacity(primary.len() + related.len() + other.len());
    let mut matched = 0usize;
    for (line, slot) in primary.into_iter().zip(slots) {
        let rel = slot.and_then(|i| related[i].take());
        if rel.is_some() {
            matched += 1;
        }
        records.push(CanonicalRecord { main: Some(line), related: rel });
    }
    let unmatched_primary = records.len() - matched;
    let mut unmatched_related = 0usize;
    for (i, rel) in related.iter_mut().enumerate() {
        if !taken[i] {
            if let Some(line) = rel.take() {
                unmatched_related += 1;
                records.push(CanonicalRecord { main: None, related: Some(line) });
            }
        }
    }
    if !other.is_empty() {
        events.info(format!(
            "{} rows of other document types kept without a related document.",
            other.len()
        ));
    }
    records.extend(unjoined(other));

    events.success(
        format!(
            "Documents related: {} pairs, {} sales documents and {} adjustment documents without a pair kept.",
            matched, unmatched_primary, unmatched_related
        ),
        Some(matched),
    );
    (records, true)
}

fn finalize<S: EventSink>(
    records: Vec<CanonicalRecord>,
    present: &BTreeSet<Field>,
    joined: bool,
    events: &mut S,
) -> OutputTable {
    events.info("Organizing the final column layout...");
    if present.contains(&Field::Classification) {
        let (mut services, mut products) = (0usize, 0usize);
        for line in records.iter().filter_map(|r| r.main.as_ref()) {
            match line.classification.as_str() {
                "Servicio" => services += 1,
                "Producto" => products += 1,
                _ => {}
            }
        }
        events.info(format!(
            "Column '{}' renamed to '{}'; {} 'Servicio' → 'S', {} 'Producto' → 'P'.",
            source_header(Field::Classification),
            crate::models::schema::ASSET_TYPE_HEADER,
            services,
            products
        ));
    }

    let columns = FINAL_COLUMNS
        .iter()
        .copied()
        .filter(|c| match c.side {
            Side::Main => present.contains(&c.field) || AUXILIARY_FIELDS.contains(&c.field),
            Side::Related => joined && present.contains(&c.field),
        })
        .collect::<Vec<_>>();

    events.success("Columns reorganized.", Some(columns.len()));
    OutputTable { columns, records }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use crate::models::OutputColumn;

    const HEADERS: &[&str] = &[
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
        "Sucursal",
        "Bodega",
    ];

    fn row(values: &[CellValue]) -> RawRecord {
        HEADERS
            .iter()
            .zip(values.iter())
            .map(|(h, v)| (h.to_string(), v.clone()))
            .collect()
    }

    fn t(s: &str) -> CellValue {
        CellValue::text(s)
    }

    fn n(v: f64) -> CellValue {
        CellValue::Number(v)
    }

    #[allow(clippy::too_many_arguments)]
    fn sale(class: &str, code: &str, doc: &str, seq: f64, party: CellValue, qty: f64, unit: f64, rate: CellValue, notes: &str) -> RawRecord {
        row(&[
            t(class),
            t(code),
            t("Item"),
            t(doc),
            n(seq),
            t("PROV-1"),
            t("14/03/2025"),
            party,
            t("Cliente"),
            n(qty),
            n(unit),
            n(999.0),
            rate,
            t(notes),
            t("Main"),
            t("B1"),
        ])
    }

    fn table(rows: Vec<RawRecord>) -> RawTable {
        RawTable {
            headers: HEADERS.iter().map(|h| h.to_string()).collect(),
            rows,
        }
    }

    fn col(side: Side, field: Field) -> OutputColumn {
        OutputColumn { side, field }
    }

    struct FixedRate(f64);

    impl RateSource for FixedRate {
        fn lookup_rate(&self, _date: NaiveDate) -> Option<f64> {
            Some(self.0)
        }
    }

    #[test]
    fn basic_cleaning_drops_unclassified_rows_and_admin_columns() {
        let mut rows = Vec::new();
        for i in 0..10 {
            let class = if i % 5 == 0 { "" } else { "Servicio" };
            rows.push(sale(class, "A", "FV-1", i as f64, n(900.0), 1.0, 10.0, n(0.0), ""));
        }
        let mut log = EventLog::new();
        let out = transform(table(rows), None, &mut log);
        assert_eq!(out.len(), 8);
        let headers = out.headers();
        assert_eq!(headers[0], "Tipo Bien");
        assert!(!headers.iter().any(|h| h == "Sucursal" || h == "Bodega" || h == "Tipo clasificación"));
        assert_eq!(out.records[0].cell(col(Side::Main, Field::Classification)), t("S"));
    }

    #[test]
    fn totals_are_recomputed_over_stale_values() {
        let rows = vec![sale("Producto", "A", "FV-1", 1.0, n(1.0), 3.0, 2.5, n(0.0), "")];
        let out = transform(table(rows), None, &mut EventLog::new());
        let line = out.records[0].main.as_ref().expect("main line");
        assert_eq!(line.total, 7.5);
    }

    #[test]
    fn unparseable_quantities_coerce_to_zero() {
        let mut r = sale("Producto", "A", "FV-1", 1.0, n(1.0), 0.0, 2.5, n(0.0), "");
        r.insert("Cantidad".into(), t("n/a"));
        let mut log = EventLog::new();
        let out = transform(table(vec![r]), None, &mut log);
        let line = out.records[0].main.as_ref().expect("main line");
        assert_eq!(line.quantity, 0.0);
        assert_eq!(line.total, 0.0);
        assert!(log.warnings().any(|e| e.message.contains("could not be read")));
    }

    #[test]
    fn document_numbers_follow_primary_markers() {
        let rows = vec![
            sale("Servicio", "A", "FV-1", 120.0, n(1.0), 1.0, 1.0, n(0.0), ""),
            sale("Servicio", "B", "FV-2", 7.0, n(1.0), 1.0, 1.0, n(0.0), ""),
            sale("Servicio", "C", "NC-1", 8.0, n(1.0), 1.0, 1.0, n(0.0), ""),
        ];
        let out = transform(table(rows), None, &mut EventLog::new());
        let numbers: Vec<String> = out
            .records
            .iter()
            .map(|r| r.main.as_ref().map(|l| l.document_number.clone()).unwrap_or_default())
            .collect();
        assert_eq!(numbers, vec!["FLE-120", "FSE-7", ""]);
        assert!(out.columns.contains(&col(Side::Main, Field::DocumentNumber)));
    }

    #[test]
    fn embedded_rate_overrides_empty_rate() {
        let rows = vec![
            sale("Servicio", "A", "FV-1", 1.0, n(1.0), 2.0, 4061.36, t(""), "rate {4,061.36} applies"),
            sale("Servicio", "B", "FV-1", 2.0, n(1.0), 1.0, 100.0, t("3,900.50"), "no braces here"),
            sale("Servicio", "C", "FV-1", 3.0, n(1.0), 1.0, 100.0, n(4000.0), "bad {abc}"),
        ];
        let out = transform(table(rows), None, &mut EventLog::new());
        let rates: Vec<f64> = out.records.iter().map(|r| r.main.as_ref().map(|l| l.exchange_rate).unwrap_or(-1.0)).collect();
        assert_eq!(rates, vec![4061.36, 3900.5, 4000.0]);
        let first = out.records[0].main.as_ref().expect("main");
        assert!((first.total_foreign - 2.0).abs() < 1e-9);
    }

    #[test]
    fn zero_rate_yields_zero_foreign_total() {
        let rows = vec![sale("Servicio", "A", "FV-1", 1.0, n(1.0), 2.0, 10.0, n(0.0), "")];
        let out = transform(table(rows), None, &mut EventLog::new());
        let line = out.records[0].main.as_ref().expect("main");
        assert_eq!(line.total, 20.0);
        assert_eq!(line.total_foreign, 0.0);
        assert!(line.total_foreign.is_finite());
    }

    #[test]
    fn rate_lookup_only_fills_rows_still_without_rate() {
        let rows = vec![
            sale("Servicio", "A", "FV-1", 1.0, n(1.0), 1.0, 4000.0, n(0.0), ""),
            sale("Servicio", "B", "FV-1", 2.0, n(1.0), 1.0, 4000.0, n(3500.0), ""),
        ];
        let source = FixedRate(4000.0);
        let out = transform(table(rows), Some(&source), &mut EventLog::new());
        let a = out.records[0].main.as_ref().expect("main");
        let b = out.records[1].main.as_ref().expect("main");
        assert_eq!(a.exchange_rate, 4000.0);
        assert_eq!(a.total_foreign, 1.0);
        assert_eq!(b.exchange_rate, 3500.0);
    }

    #[test]
    fn join_pairs_primary_with_related_and_keeps_the_unpaired() {
        let rows = vec![
            sale("Servicio", "A", "FV-1", 1.0, n(900123.0), 1.0, 10.0, n(0.0), ""),
            sale("Servicio", "B", "FV-1", 2.0, n(900123.0), 1.0, 10.0, n(0.0), ""),
            sale("Servicio", "A", "DS-1", 3.0, t("555"), 1.0, 8.0, n(0.0), "cost for (900123)"),
            sale("Servicio", "Z", "FC-1", 4.0, t("555"), 1.0, 9.0, n(0.0), "cost for (111)"),
        ];
        let mut log = EventLog::new();
        let out = transform(table(rows), None, &mut log);
        assert_eq!(out.len(), 3);

        let first = &out.records[0];
        assert_eq!(first.main.as_ref().map(|l| l.item_code.as_str()), Some("A"));
        assert_eq!(first.related.as_ref().map(|l| l.total), Some(8.0));

        let second = &out.records[1];
        assert_eq!(second.main.as_ref().map(|l| l.item_code.as_str()), Some("B"));
        assert!(second.related.is_none());

        let orphan = &out.records[2];
        assert!(orphan.main.is_none());
        assert_eq!(orphan.related.as_ref().map(|l| l.document_type.as_str()), Some("FC-1"));
        assert_eq!(orphan.cell(col(Side::Main, Field::Total)), CellValue::Empty);

        assert!(out.columns.contains(&col(Side::Related, Field::Total)));
        assert!(out.columns.contains(&col(Side::Related, Field::TotalForeign)));
    }

    #[test]
    fn one_related_document_pairs_with_only_one_primary() {
        let rows = vec![
            sale("Servicio", "A", "FV-1", 1.0, n(42.0), 1.0, 10.0, n(0.0), ""),
            sale("Servicio", "A", "FV-2", 2.0, n(42.0), 1.0, 10.0, n(0.0), ""),
            sale("Servicio", "A", "DS-1", 3.0, t("7"), 1.0, 8.0, n(0.0), "(42)"),
        ];
        let out = transform(table(rows), None, &mut EventLog::new());
        assert_eq!(out.len(), 2);
        assert!(out.records[0].related.is_some());
        assert!(out.records[1].related.is_none());
    }

    #[test]
    fn without_related_documents_no_related_columns_appear() {
        let rows = vec![sale("Servicio", "A", "FV-1", 1.0, n(1.0), 1.0, 10.0, n(0.0), "")];
        let mut log = EventLog::new();
        let out = transform(table(rows), None, &mut log);
        assert!(out.columns.iter().all(|c| c.side == Side::Main));
        assert!(log.warnings().any(|e| e.message.contains("No DS-1 or FC-1")));
    }

    #[test]
    fn column_contract_is_final_list_intersected_with_present() {
        let rows = vec![sale("Producto", "A", "FV-1", 1.0, n(1.0), 1.0, 10.0, n(0.0), "")];
        let out = transform(table(rows), None, &mut EventLog::new());
        let headers = out.headers();
        let expected = vec![
            "Tipo Bien",
            "Clasificación Producto",
            "Línea",
            "Descripción Línea",
            "Sublínea",
            "Descripción Sublínea",
            "Código",
            "Nombre",
            "Número comprobante",
            "Numero comprobante",
            "Fecha elaboración",
            "Identificación",
            "Nombre tercero",
            "Vendedor",
            "Cantidad",
            "Valor unitario",
            "Total",
            "Tasa de cambio",
            "Valor Total ME",
            "Observaciones",
        ];
        assert_eq!(headers, expected);
    }

    #[test]
    fn missing_columns_skip_steps_with_warnings() {
        let raw = RawTable {
            headers: vec!["Tipo clasificación".into(), "Código".into()],
            rows: vec![[("Tipo clasificación".to_string(), t("Servicio")), ("Código".to_string(), t("A"))]
                .into_iter()
                .collect()],
        };
        let mut log = EventLog::new();
        let out = transform(raw, None, &mut log);
        assert_eq!(out.len(), 1);
        assert!(log.warnings().any(|e| e.message.starts_with("Schema mismatch")));
        assert!(!out.columns.contains(&col(Side::Main, Field::Total)));
        assert!(!out.columns.contains(&col(Side::Main, Field::TotalForeign)));
        assert!(out.columns.contains(&col(Side::Main, Field::SellerId)));
    }

    #[test]
    fn annotations_fill_classification_codes() {
        let rows = vec![sale("Producto", "A", "FV-1", 1.0, n(1.0), 1.0, 10.0, n(0.0), r#"[EQ] (L01) "S07" extra"#)];
        let out = transform(table(rows), None, &mut EventLog::new());
        let line = out.records[0].main.as_ref().expect("main");
        assert_eq!(line.product_classification, "EQ");
        assert_eq!(line.line_code, "L01");
        assert_eq!(line.subline_code, "S07");
    }

    #[test]
    fn unreadable_bytes_yield_empty_output_and_error_event() {
        let mut log = EventLog::new();
        let out = transform_export(b"not a workbook", DEFAULT_HEADER_OFFSET, None, &mut log);
        assert!(out.is_empty());
        assert!(log.has_errors());
    }
}
