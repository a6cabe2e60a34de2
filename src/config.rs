use crate::error::{SyncError, SyncResult};
use crate::rates::DEFAULT_RATES_URL;
use crate::services::transformer::DEFAULT_HEADER_OFFSET;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_GRAPH_URL: &str = "https://graph.microsoft.com";
pub const DEFAULT_LOGIN_URL: &str = "https://login.microsoftonline.com";
pub const DEFAULT_MONTHLY_FOLDER: &str = "Ventas con ciudad 2025";
pub const DEFAULT_RATE_WORKBOOK: &str = "Documentos compartidos/01 Archivos Area Administrativa/TRM.xlsx";
pub const DEFAULT_SHEET_NAME: &str = "Ventas";

/// Client-credential triple for the document store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub remote: RemoteConfig,
    pub workbook: WorkbookConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    #[serde(skip_serializing)]
    pub client_secret: Option<String>,
    pub hostname: Option<String>,
    pub site_name: Option<String>,
    pub monthly_folder: String,
    pub rate_workbook: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkbookConfig {
    pub sheet_name: String,
    pub header_offset: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub rates_url: String,
    pub graph_url: String,
    pub login_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl AppConfig {
    /// Load from the process environment after reading `.env` if present.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());
        Self {
            remote: RemoteConfig {
                tenant_id: get("SYNC_TENANT_ID"),
                client_id: get("SYNC_CLIENT_ID"),
                client_secret: get("SYNC_CLIENT_SECRET"),
                hostname: get("SYNC_HOSTNAME"),
                site_name: get("SYNC_SITE_NAME"),
                monthly_folder: or("SYNC_MONTHLY_FOLDER", DEFAULT_MONTHLY_FOLDER),
                rate_workbook: or("SYNC_RATE_WORKBOOK", DEFAULT_RATE_WORKBOOK),
            },
            workbook: WorkbookConfig {
                sheet_name: or("SYNC_SHEET_NAME", DEFAULT_SHEET_NAME),
                header_offset: get("SYNC_HEADER_OFFSET")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_HEADER_OFFSET),
            },
            http: HttpConfig {
                timeout_secs: get("SYNC_HTTP_TIMEOUT_SECS")
                    .and_then(|v| v.parse().ok())
                    .filter(|v| *v > 0)
                    .unwrap_or(30),
                rates_url: or("SYNC_RATES_URL", DEFAULT_RATES_URL),
                graph_url: or("SYNC_GRAPH_URL", DEFAULT_GRAPH_URL),
                login_url: or("SYNC_LOGIN_URL", DEFAULT_LOGIN_URL),
            },
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.http.timeout_secs)
    }

    pub fn graph_credentials(&self) -> SyncResult<GraphCredentials> {
        let required = |value: &Option<String>, name: &str| {
            value
                .clone()
                .ok_or_else(|| SyncError::Config(format!("{} not set in environment or .env", name)))
        };
        Ok(GraphCredentials {
            tenant_id: required(&self.remote.tenant_id, "SYNC_TENANT_ID")?,
            client_id: required(&self.remote.client_id, "SYNC_CLIENT_ID")?,
            client_secret: required(&self.remote.client_secret, "SYNC_CLIENT_SECRET")?,
        })
    }

    /// `(hostname, site name)` of the document library.
    pub fn site(&self) -> SyncResult<(String, String)> {
        let hostname = self
            .remote
            .hostname
            .clone()
            .ok_or_else(|| SyncError::Config("SYNC_HOSTNAME not set in environment or .env".to_string()))?;
        let site = self
            .remote
            .site_name
            .clone()
            .ok_or_else(|| SyncError::Config("SYNC_SITE_NAME not set in environment or .env".to_string()))?;
        Ok((hostname, site))
    }

    pub fn has_remote(&self) -> bool {
        self.graph_credentials().is_ok() && self.site().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> AppConfig {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let c = config(&[]);
        assert_eq!(c.workbook.sheet_name, "Ventas");
        assert_eq!(c.workbook.header_offset, 7);
        assert_eq!(c.timeout(), Duration::from_secs(30));
        assert_eq!(c.remote.monthly_folder, DEFAULT_MONTHLY_FOLDER);
        assert!(!c.has_remote());
    }

    #[test]
    fn missing_credential_is_named() {
        let c = config(&[("SYNC_TENANT_ID", "t"), ("SYNC_CLIENT_ID", "c"), ("SYNC_CLIENT_SECRET", "  ")]);
        match c.graph_credentials() {
            Err(SyncError::Config(msg)) => assert!(msg.contains("SYNC_CLIENT_SECRET")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn overrides_are_read() {
        let c = config(&[
            ("SYNC_HEADER_OFFSET", "3"),
            ("SYNC_HTTP_TIMEOUT_SECS", "0"),
            ("SYNC_GRAPH_URL", "http://127.0.0.1:9"),
            ("SYNC_HOSTNAME", "contoso.sharepoint.com"),
            ("SYNC_SITE_NAME", "Ventas"),
        ]);
        assert_eq!(c.workbook.header_offset, 3);
        assert_eq!(c.http.timeout_secs, 30);
        assert_eq!(c.http.graph_url, "http://127.0.0.1:9");
        assert_eq!(c.site().expect("site").0, "contoso.sharepoint.com");
    }
}
