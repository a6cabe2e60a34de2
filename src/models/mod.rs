pub mod sales;
pub mod schema;

pub use sales::{AssetType, CanonicalRecord, OutputTable, SalesLine};
pub use schema::{Field, FormulaColumn, OutputColumn, Side};
