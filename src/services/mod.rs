pub mod reconciler;
pub mod transformer;
pub mod xlsx_package;
