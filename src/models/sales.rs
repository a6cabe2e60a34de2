use super::schema::{Field, OutputColumn, Side, ASSET_TYPE_CODES};
use crate::types::CellValue;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Goods classification of a sales line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetType {
    Service,
    Product,
    /// Any classification text other than the two known values, kept verbatim.
    Other(String),
}

impl AssetType {
    pub fn from_classification(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(match text {
            "Servicio" => AssetType::Service,
            "Producto" => AssetType::Product,
            other => AssetType::Other(other.to_string()),
        })
    }

    /// Single-letter code written to the output (`S` / `P`).
    pub fn code(&self) -> &str {
        let name = match self {
            AssetType::Service => "Servicio",
            AssetType::Product => "Producto",
            AssetType::Other(s) => return s,
        };
        ASSET_TYPE_CODES
            .iter()
            .find(|(from, _)| *from == name)
            .map(|(_, code)| *code)
            .unwrap_or(name)
    }
}

/// One document line of the sales export, typed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SalesLine {
    pub classification: String,
    pub product_classification: String,
    pub line_code: String,
    pub line_description: String,
    pub subline_code: String,
    pub subline_description: String,
    pub item_code: String,
    pub item_name: String,
    pub document_type: String,
    pub document_number: String,
    pub sequence: Option<i64>,
    pub supplier_invoice: String,
    pub elaboration_date: Option<NaiveDate>,
    pub party_id: String,
    pub party_name: String,
    pub seller_id: String,
    pub quantity: f64,
    pub unit_value: f64,
    pub total: f64,
    pub exchange_rate: f64,
    pub total_foreign: f64,
    pub notes: String,
}

fn text_cell(s: &str) -> CellValue {
    CellValue::text(s.trim())
}

impl SalesLine {
    pub fn asset_type(&self) -> Option<AssetType> {
        AssetType::from_classification(&self.classification)
    }

    /// Cell value of one field as it appears in the output.
    pub fn cell(&self, field: Field) -> CellValue {
        match field {
            Field::Classification => self
                .asset_type()
                .map(|a| CellValue::text(a.code()))
                .unwrap_or_default(),
            Field::ProductClassification => text_cell(&self.product_classification),
            Field::LineCode => text_cell(&self.line_code),
            Field::LineDescription => text_cell(&self.line_description),
            Field::SublineCode => text_cell(&self.subline_code),
            Field::SublineDescription => text_cell(&self.subline_description),
            Field::ItemCode => text_cell(&self.item_code),
            Field::ItemName => text_cell(&self.item_name),
            Field::DocumentType => text_cell(&self.document_type),
            Field::DocumentNumber => text_cell(&self.document_number),
            Field::Sequence => self
                .sequence
                .map(|n| CellValue::Number(n as f64))
                .unwrap_or_default(),
            Field::SupplierInvoice => text_cell(&self.supplier_invoice),
            Field::ElaborationDate => self.elaboration_date.map(CellValue::Date).unwrap_or_default(),
            Field::PartyId => text_cell(&self.party_id),
            Field::PartyName => text_cell(&self.party_name),
            Field::SellerId => text_cell(&self.seller_id),
            Field::Quantity => CellValue::Number(self.quantity),
            Field::UnitValue => CellValue::Number(self.unit_value),
            Field::Total => CellValue::Number(self.total),
            Field::ExchangeRate => CellValue::Number(self.exchange_rate),
            Field::TotalForeign => CellValue::Number(self.total_foreign),
            Field::Notes => text_cell(&self.notes),
        }
    }
}

/// Output unit of the transformer: a primary (or unpaired) line and, when one matched,
/// the related adjustment document joined onto it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub main: Option<SalesLine>,
    pub related: Option<SalesLine>,
}

impl CanonicalRecord {
    pub fn cell(&self, column: OutputColumn) -> CellValue {
        let line = match column.side {
            Side::Main => self.main.as_ref(),
            Side::Related => self.related.as_ref(),
        };
        line.map(|l| l.cell(column.field)).unwrap_or_default()
    }
}

/// The transformer's result: ordered columns plus one record per output row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputTable {
    pub columns: Vec<OutputColumn>,
    pub records: Vec<CanonicalRecord>,
}

impl OutputTable {
    pub fn headers(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.header()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rows as cells in column order.
    pub fn rows(&self) -> Vec<Vec<CellValue>> {
        self.records
            .iter()
            .map(|r| self.columns.iter().map(|c| r.cell(*c)).collect())
            .collect()
    }

    pub fn column_index(&self, header: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.header() == header)
    }
}
