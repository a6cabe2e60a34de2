//! Operator actions. Each one reads its inputs, runs the core, and folds every failure into a
//! serialisable result so a front end never sees a panic or a bare error type.

use crate::config::AppConfig;
use crate::error::SyncError;
use crate::events::{EventLog, EventSink, StatusEvent};
use crate::excel::{self, validate_xlsx_bytes};
use crate::graph::{self, DocumentStore, DriveItem};
use crate::models::OutputTable;
use crate::rates::{DatosAbiertosRates, RateSource, RateWorkbook};
use crate::retry::{RetryPolicy, Sleeper};
use crate::services::reconciler::{reconcile_and_append, AppendMode, ReconcileOptions};
use crate::services::transformer::transform_export;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

const MAX_INPUT_BYTES: u64 = 100 * 1024 * 1024;

/// Sheet of the rate workbook holding the date/rate table.
pub const RATE_SHEET: &str = "TRM";

#[derive(Debug, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationResult {
    fn ok() -> Self {
        Self { valid: true, error: None }
    }

    fn invalid(msg: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(msg.into()),
        }
    }
}

/// Where empty exchange rates are filled from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "path")]
pub enum RateChoice {
    /// Leave empty rates at 0.
    None,
    /// Public open-data endpoint.
    #[default]
    OpenData,
    /// Rate workbook on the local disk.
    Workbook(String),
    /// The configured rate workbook in the document library.
    RemoteWorkbook,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessPayload {
    pub input_path: String,
    pub output_path: Option<String>,
    pub header_offset: Option<usize>,
    #[serde(default)]
    pub rates: RateChoice,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResult {
    pub ok: bool,
    pub rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub events: Vec<StatusEvent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    #[serde(flatten)]
    pub process: ProcessPayload,
    /// Target workbook; when absent this month's file in the configured folder is used.
    pub remote_path: Option<String>,
    #[serde(default)]
    pub rewrite: bool,
    #[serde(default)]
    pub skip_artifact: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendResult {
    pub ok: bool,
    pub appended_count: usize,
    pub duplicate_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub events: Vec<StatusEvent>,
}

impl AppendResult {
    fn failed(error: String, events: EventLog) -> Self {
        Self {
            ok: false,
            appended_count: 0,
            duplicate_count: 0,
            remote_path: None,
            output_path: None,
            error: Some(error),
            events: events.into_events(),
        }
    }
}

/// Check that a file on disk can be read as an xlsx and is not held open by Excel.
pub fn validate_excel_file(path: &str) -> Result<ValidationResult, String> {
    let path = Path::new(path);
    if !path.exists() {
        return Ok(ValidationResult::invalid("File not found."));
    }
    let metadata = fs::metadata(path).map_err(|e| e.to_string())?;
    if metadata.len() > MAX_INPUT_BYTES {
        return Ok(ValidationResult::invalid("File too large (max 100MB)."));
    }
    let bytes = fs::read(path).map_err(|e| format!("Could not open: {}", e))?;
    if let Err(e) = validate_xlsx_bytes(&bytes) {
        return Ok(ValidationResult::invalid(e.to_string()));
    }
    match fs::OpenOptions::new().write(true).open(path) {
        Ok(_) => Ok(ValidationResult::ok()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Ok(ValidationResult::invalid(
            "Excel file is open. Please close it and try again.",
        )),
        Err(e) => Err(e.to_string()),
    }
}

pub fn validate_excel_bytes(bytes: &[u8]) -> ValidationResult {
    match validate_xlsx_bytes(bytes) {
        Ok(()) => ValidationResult::ok(),
        Err(e) => ValidationResult::invalid(e.to_string()),
    }
}

fn read_input(path: &str) -> Result<Vec<u8>, String> {
    let validation = validate_excel_file(path)?;
    if let Some(error) = validation.error {
        return Err(error);
    }
    fs::read(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            "File not found.".to_string()
        } else {
            format!("Could not read file: {}", e)
        }
    })
}

fn build_rate_source(
    choice: &RateChoice,
    config: &AppConfig,
    store: Option<&dyn DocumentStore>,
    events: &mut EventLog,
) -> Result<Option<Box<dyn RateSource>>, String> {
    let source: Box<dyn RateSource> = match choice {
        RateChoice::None => return Ok(None),
        RateChoice::OpenData => Box::new(
            DatosAbiertosRates::new(&config.http.rates_url, config.timeout()).map_err(|e| e.to_string())?,
        ),
        RateChoice::Workbook(path) => {
            let bytes = fs::read(path).map_err(|e| format!("Could not read rate workbook: {}", e))?;
            let rates = RateWorkbook::from_bytes(&bytes, RATE_SHEET).map_err(|e| e.to_string())?;
            events.info(format!("Rate workbook loaded: {} dated rates.", rates.len()));
            Box::new(rates)
        }
        RateChoice::RemoteWorkbook => {
            let store = store.ok_or("The remote rate workbook needs a connection to the document library.")?;
            let item = existing_file(store, &config.remote.rate_workbook)
                .map_err(|e| format!("Rate workbook unavailable: {}", e))?;
            let bytes = store
                .download(&item.path)
                .map_err(|e| format!("Could not download rate workbook: {}", e))?;
            let rates = RateWorkbook::from_bytes(&bytes, RATE_SHEET).map_err(|e| e.to_string())?;
            events.info(format!("Rate workbook loaded: {} dated rates.", rates.len()));
            Box::new(rates)
        }
    };
    Ok(Some(source))
}

/// The file at `path`, checked before it is downloaded. A folder there counts as missing.
fn existing_file(store: &dyn DocumentStore, path: &str) -> Result<DriveItem, SyncError> {
    let item = store.item(path)?;
    if item.is_folder {
        return Err(SyncError::NotFound(path.to_string()));
    }
    tracing::debug!(path = %item.path, size = ?item.size, "remote file found");
    Ok(item)
}

fn source_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("export.xlsx")
        .to_string()
}

fn run_transform(
    payload: &ProcessPayload,
    config: &AppConfig,
    store: Option<&dyn DocumentStore>,
    events: &mut EventLog,
) -> Result<OutputTable, String> {
    let bytes = read_input(&payload.input_path)?;
    let rates = build_rate_source(&payload.rates, config, store, events)?;
    let offset = payload.header_offset.unwrap_or(config.workbook.header_offset);
    Ok(transform_export(&bytes, offset, rates.as_deref(), events))
}

fn write_artifact(payload: &ProcessPayload, table: &OutputTable, events: &mut EventLog) -> Result<String, String> {
    let saved = excel::export_processed_table(table, payload.output_path.as_deref(), &source_name(&payload.input_path))?;
    events.success(format!("Processed file saved to {}", saved), Some(table.len()));
    Ok(saved)
}

/// Clean an export and save the processed workbook.
pub fn process_export(config: &AppConfig, payload: &ProcessPayload) -> ProcessResult {
    let mut events = EventLog::new();
    let table = match run_transform(payload, config, None, &mut events) {
        Ok(t) => t,
        Err(e) => {
            events.error(e.clone());
            return ProcessResult {
                ok: false,
                rows: 0,
                output_path: None,
                error: Some(e),
                events: events.into_events(),
            };
        }
    };
    if table.is_empty() {
        let error = if events.has_errors() {
            "The file could not be processed.".to_string()
        } else {
            "No rows left after cleaning.".to_string()
        };
        return ProcessResult {
            ok: false,
            rows: 0,
            output_path: None,
            error: Some(error),
            events: events.into_events(),
        };
    }
    let rows = table.len();
    match write_artifact(payload, &table, &mut events) {
        Ok(path) => ProcessResult {
            ok: true,
            rows,
            output_path: Some(path),
            error: None,
            events: events.into_events(),
        },
        Err(e) => {
            events.error(e.clone());
            ProcessResult {
                ok: false,
                rows,
                output_path: None,
                error: Some(e),
                events: events.into_events(),
            }
        }
    }
}

/// Clean an export and append its new rows to the shared workbook.
pub fn sync_export(
    config: &AppConfig,
    payload: &SyncPayload,
    store: &dyn DocumentStore,
    sleeper: &dyn Sleeper,
    today: NaiveDate,
) -> AppendResult {
    let mut events = EventLog::new();
    let table = match run_transform(&payload.process, config, Some(store), &mut events) {
        Ok(t) => t,
        Err(e) => {
            events.error(e.clone());
            return AppendResult::failed(e, events);
        }
    };
    if table.is_empty() {
        let error = "Nothing to append: the processed table is empty.".to_string();
        events.warning(error.clone());
        return AppendResult::failed(error, events);
    }

    let output_path = if payload.skip_artifact {
        None
    } else {
        match write_artifact(&payload.process, &table, &mut events) {
            Ok(p) => Some(p),
            Err(e) => {
                // The remote append does not depend on the local copy.
                events.warning(format!("Processed file not saved: {}", e));
                None
            }
        }
    };

    let remote_path = match &payload.remote_path {
        Some(p) => p.clone(),
        None => match locate_monthly_file(config, store, today, &mut events) {
            Ok(Some(item)) => item.path,
            Ok(None) => {
                return AppendResult {
                    output_path,
                    ..AppendResult::failed("No workbook for the current month was found.".to_string(), events)
                }
            }
            Err(e) => {
                events.error(e.clone());
                return AppendResult {
                    output_path,
                    ..AppendResult::failed(e, events)
                };
            }
        },
    };

    let options = ReconcileOptions {
        sheet_name: config.workbook.sheet_name.clone(),
        mode: if payload.rewrite {
            AppendMode::RewriteBody
        } else {
            AppendMode::PreserveExisting
        },
        ..ReconcileOptions::default()
    };
    let result = reconcile_and_append(
        store,
        &remote_path,
        &table,
        &options,
        &RetryPolicy::default(),
        sleeper,
        &mut events,
    );
    match result {
        Ok(report) => AppendResult {
            ok: true,
            appended_count: report.appended,
            duplicate_count: report.duplicates,
            remote_path: Some(remote_path),
            output_path,
            error: None,
            events: events.into_events(),
        },
        Err(e) => AppendResult {
            remote_path: Some(remote_path),
            output_path,
            ..AppendResult::failed(describe(&e), events)
        },
    }
}

fn describe(e: &SyncError) -> String {
    match e {
        SyncError::Locked { .. } => format!("{} Close the workbook in Excel and try again.", e),
        other => other.to_string(),
    }
}

/// Find this month's workbook in the configured folder.
pub fn locate_monthly_file(
    config: &AppConfig,
    store: &dyn DocumentStore,
    today: NaiveDate,
    events: &mut EventLog,
) -> Result<Option<DriveItem>, String> {
    let folder = &config.remote.monthly_folder;
    let month = graph::month_name_es(chrono::Datelike::month(&today)).unwrap_or_default();
    events.info(format!("Looking for the '{}' workbook in '{}'...", month, folder));
    let found = graph::locate_monthly_file(store, folder, today).map_err(|e| e.to_string())?;
    match &found {
        Some(item) => events.success(format!("Monthly workbook found: {}", item.name), None),
        None => events.warning(format!("No workbook for '{}' found in '{}'.", month, folder)),
    }
    Ok(found)
}

/// Rate effective on `date` from the open-data endpoint.
pub fn lookup_rate(config: &AppConfig, date: NaiveDate) -> Result<Option<f64>, String> {
    let source = DatosAbiertosRates::new(&config.http.rates_url, config.timeout()).map_err(|e| e.to_string())?;
    Ok(source.lookup_rate(date))
}
