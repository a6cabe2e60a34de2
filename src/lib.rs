pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod excel;
pub mod graph;
pub mod models;
pub mod rates;
pub mod retry;
pub mod services;
pub mod types;

pub use config::AppConfig;
pub use error::{SyncError, SyncResult};
pub use events::{EventLog, EventSink, Level, StatusEvent};
pub use models::{CanonicalRecord, Field, OutputTable, SalesLine};
pub use services::reconciler::{reconcile_and_append, AppendMode, AppendReport, ReconcileOptions};
pub use services::transformer::{transform, transform_export};
