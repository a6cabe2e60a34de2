use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Downloaded or uploaded content is not a usable xlsx package.
    #[error("Not a valid Excel file: {0}")]
    InvalidWorkbook(String),

    #[error("Sheet '{0}' not found.")]
    SheetNotFound(String),

    /// No header columns after skipping the leading non-data rows.
    #[error("Unrecognized file layout: no columns after skipping {0} rows.")]
    UnrecognizedLayout(usize),

    #[error("Could not read Excel file: {0}")]
    Read(String),

    #[error("Could not write Excel file: {0}")]
    Write(String),

    #[error("Malformed workbook XML: {0}")]
    Xml(String),

    #[error("Zip error: {0}")]
    Zip(String),

    #[error("Request failed ({status}): {body}")]
    Http { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote file is locked; gave up after {attempts} attempts.")]
    Locked { attempts: u32 },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<zip::result::ZipError> for SyncError {
    fn from(e: zip::result::ZipError) -> Self {
        SyncError::Zip(e.to_string())
    }
}

impl From<quick_xml::Error> for SyncError {
    fn from(e: quick_xml::Error) -> Self {
        SyncError::Xml(e.to_string())
    }
}

impl From<rust_xlsxwriter::XlsxError> for SyncError {
    fn from(e: rust_xlsxwriter::XlsxError) -> Self {
        SyncError::Write(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            SyncError::Network("Check your internet connection and try again.".to_string())
        } else {
            SyncError::Network(e.to_string())
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
