//! Column contract of the sales export and of the reporting workbook.
//!
//! Business logic addresses columns through [`Field`]; the header text of the source
//! export only appears in [`SOURCE_HEADERS`].

use serde::{Deserialize, Serialize};

/// Logical field of a sales document line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Classification,
    ProductClassification,
    LineCode,
    LineDescription,
    SublineCode,
    SublineDescription,
    ItemCode,
    ItemName,
    DocumentType,
    DocumentNumber,
    Sequence,
    SupplierInvoice,
    ElaborationDate,
    PartyId,
    PartyName,
    SellerId,
    Quantity,
    UnitValue,
    Total,
    ExchangeRate,
    TotalForeign,
    Notes,
}

/// Source header text for every field read from the export.
/// `DocumentNumber` and `TotalForeign` are synthesized and never read.
pub const SOURCE_HEADERS: &[(Field, &str)] = &[
    (Field::Classification, "Tipo clasificación"),
    (Field::ProductClassification, "Clasificación Producto"),
    (Field::LineCode, "Línea"),
    (Field::LineDescription, "Descripción Línea"),
    (Field::SublineCode, "Sublínea"),
    (Field::SublineDescription, "Descripción Sublínea"),
    (Field::ItemCode, "Código"),
    (Field::ItemName, "Nombre"),
    (Field::DocumentType, "Número comprobante"),
    (Field::Sequence, "Consecutivo"),
    (Field::SupplierInvoice, "Factura proveedor"),
    (Field::ElaborationDate, "Fecha elaboración"),
    (Field::PartyId, "Identificación"),
    (Field::PartyName, "Nombre tercero"),
    (Field::SellerId, "Vendedor"),
    (Field::Quantity, "Cantidad"),
    (Field::UnitValue, "Valor unitario"),
    (Field::Total, "Total"),
    (Field::ExchangeRate, "Tasa de cambio"),
    (Field::Notes, "Observaciones"),
];

/// Columns required for the export to be recognised at all; listed in the schema-mismatch warning.
pub const CORE_FIELDS: &[Field] = &[
    Field::Classification,
    Field::ItemCode,
    Field::DocumentType,
    Field::PartyId,
    Field::Quantity,
    Field::UnitValue,
    Field::Total,
];

impl Field {
    /// Header text in the export and in the output (except `Classification`, see [`output_header`]).
    pub fn header(self) -> &'static str {
        match self {
            Field::DocumentNumber => "Numero comprobante",
            Field::TotalForeign => "Valor Total ME",
            other => SOURCE_HEADERS
                .iter()
                .find(|(f, _)| *f == other)
                .map(|(_, h)| *h)
                .unwrap_or(""),
        }
    }
}

/// Administrative columns removed before any other processing.
pub const DENY_LIST: &[&str] = &[
    "Sucursal",
    "Centro costo",
    "Fecha creación",
    "Fecha modificación",
    "Correo electrónico",
    "Tipo de registro",
    "Referencia fábrica",
    "Bodega",
    "Identificación Vendedor",
    "Nombre vendedor",
    "Valor desc.",
    "Base AIU",
    "Impuesto cargo",
    "Valor Impuesto Cargo",
    "Impuesto Cargo 2",
    "Valor Impuesto Cargo 2",
    "Impuesto retención",
    "Valor Impuesto Retención",
    "Base retención (ICA/IVA)",
    "Cargo en totales",
    "Descuento en totales",
    "Moneda",
    "Forma pago",
    "Fecha vencimiento",
    "Nombre contacto",
];

/// Primary sales documents and the prefix of the reference synthesized for each.
pub const PRIMARY_DOCUMENTS: &[(&str, &str)] = &[("FV-1", "FLE-"), ("FV-2", "FSE-")];

/// Adjustment documents joined onto primary documents.
pub const RELATED_DOCUMENTS: &[&str] = &["DS-1", "FC-1"];

/// Output header of the classification column and the codes of its two known values.
pub const ASSET_TYPE_HEADER: &str = "Tipo Bien";
pub const ASSET_TYPE_CODES: &[(&str, &str)] = &[("Servicio", "S"), ("Producto", "P")];

/// Prefix for columns of the related document in the joined output.
pub const RELATED_PREFIX: &str = "REL_";

/// Columns guaranteed to exist in the output, empty unless filled from the export or the notes.
pub const AUXILIARY_FIELDS: &[Field] = &[
    Field::SellerId,
    Field::ProductClassification,
    Field::LineCode,
    Field::LineDescription,
    Field::SublineCode,
    Field::SublineDescription,
];

/// Which document of a joined row a column belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Main,
    Related,
}

/// One column of the processed output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputColumn {
    pub side: Side,
    pub field: Field,
}

const fn main(field: Field) -> OutputColumn {
    OutputColumn { side: Side::Main, field }
}

const fn rel(field: Field) -> OutputColumn {
    OutputColumn { side: Side::Related, field }
}

/// Final order of the processed output. Any column not listed here is dropped.
pub const FINAL_COLUMNS: &[OutputColumn] = &[
    main(Field::Classification),
    main(Field::ProductClassification),
    main(Field::LineCode),
    main(Field::LineDescription),
    main(Field::SublineCode),
    main(Field::SublineDescription),
    main(Field::ItemCode),
    main(Field::ItemName),
    main(Field::DocumentType),
    main(Field::DocumentNumber),
    main(Field::ElaborationDate),
    main(Field::PartyId),
    main(Field::PartyName),
    main(Field::SellerId),
    main(Field::Quantity),
    main(Field::UnitValue),
    main(Field::Total),
    main(Field::ExchangeRate),
    main(Field::TotalForeign),
    main(Field::Notes),
    rel(Field::DocumentType),
    rel(Field::Sequence),
    rel(Field::SupplierInvoice),
    rel(Field::PartyId),
    rel(Field::PartyName),
    rel(Field::Quantity),
    rel(Field::UnitValue),
    rel(Field::ExchangeRate),
    rel(Field::Total),
    rel(Field::TotalForeign),
];

impl OutputColumn {
    pub fn header(&self) -> String {
        match (self.side, self.field) {
            (Side::Main, Field::Classification) => ASSET_TYPE_HEADER.to_string(),
            (Side::Main, f) => f.header().to_string(),
            (Side::Related, f) => format!("{}{}", RELATED_PREFIX, f.header()),
        }
    }
}

/// A derived column of the reporting workbook, written as a formula on every appended row.
/// `{row}` in the template is replaced by the 1-based row number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormulaColumn {
    pub header: String,
    pub template: String,
}

impl FormulaColumn {
    pub fn new(header: &str, template: &str) -> Self {
        Self {
            header: header.to_string(),
            template: template.to_string(),
        }
    }

    pub fn formula_for_row(&self, row: u32) -> String {
        self.template.replace("{row}", &row.to_string())
    }
}

/// Derived columns of the monthly sales workbook. Column letters follow the layout of
/// [`FINAL_COLUMNS`] (`N` = seller, `Q` = total, `AC` = related total).
pub fn default_formula_columns() -> Vec<FormulaColumn> {
    vec![
        FormulaColumn::new(
            "Nombre Vendedor",
            r#"IFERROR(VLOOKUP(N{row},Vendedores!A:B,2,FALSE),"")"#,
        ),
        FormulaColumn::new("Diferencia", "Q{row}-AC{row}"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_headers_follow_source_names() {
        assert_eq!(main(Field::Classification).header(), "Tipo Bien");
        assert_eq!(main(Field::DocumentNumber).header(), "Numero comprobante");
        assert_eq!(rel(Field::TotalForeign).header(), "REL_Valor Total ME");
        assert_eq!(rel(Field::DocumentType).header(), "REL_Número comprobante");
    }

    #[test]
    fn formula_template_is_row_parameterized() {
        let col = FormulaColumn::new("Diferencia", "Q{row}-AC{row}");
        assert_eq!(col.formula_for_row(105), "Q105-AC105");
    }

    #[test]
    fn default_formula_letters_match_final_layout() {
        let letter_of = |c: OutputColumn| {
            let idx = FINAL_COLUMNS.iter().position(|x| *x == c).expect("column listed");
            crate::excel::col_index_to_letter(idx as u32)
        };
        assert_eq!(letter_of(main(Field::SellerId)), "N");
        assert_eq!(letter_of(main(Field::Total)), "Q");
        assert_eq!(letter_of(rel(Field::Total)), "AC");
    }
}
