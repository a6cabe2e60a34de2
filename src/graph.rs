//! Remote document library (SharePoint via Microsoft Graph).

use crate::config::AppConfig;
use crate::error::{SyncError, SyncResult};
use chrono::{Datelike, NaiveDate};
use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};
use url::Url;

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
const XLSX_CONTENT_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// File or folder in the drive, addressed by its path from the drive root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    pub name: String,
    pub path: String,
    pub is_folder: bool,
    pub size: Option<u64>,
}

/// Operations the sync needs from a file store. Paths are relative to the drive root.
pub trait DocumentStore {
    fn download(&self, path: &str) -> SyncResult<Vec<u8>>;

    /// Full overwrite of the file at `path`.
    fn upload(&self, path: &str, bytes: &[u8]) -> SyncResult<()>;

    fn list_children(&self, folder: &str) -> SyncResult<Vec<DriveItem>>;

    /// Metadata of the item at `path`; [`SyncError::NotFound`] carries `path` when absent.
    fn item(&self, path: &str) -> SyncResult<DriveItem> {
        let folder = parent_of(path);
        let name = path.trim_matches('/').rsplit('/').next().unwrap_or_default();
        self.list_children(folder)?
            .into_iter()
            .find(|i| i.name == name)
            .ok_or_else(|| SyncError::NotFound(path.to_string()))
    }

    /// Items under `folder` whose name contains `query` (case-insensitive).
    fn find(&self, folder: &str, query: &str) -> SyncResult<Vec<DriveItem>> {
        let q = query.to_lowercase();
        Ok(self
            .list_children(folder)?
            .into_iter()
            .filter(|item| item.name.to_lowercase().contains(&q))
            .collect())
    }
}

/// Authenticated Graph session bound to one site's default drive.
pub struct GraphClient {
    client: Client,
    base: Url,
    token: String,
    site_id: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

fn parse_base(raw: &str) -> SyncResult<Url> {
    Url::parse(raw).map_err(|e| SyncError::Config(format!("invalid URL '{}': {}", raw, e)))
}

fn check(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(match status.as_u16() {
        401 | 403 => SyncError::Auth(if body.is_empty() { status.to_string() } else { body }),
        404 => SyncError::NotFound(body),
        code => SyncError::Http { status: code, body },
    })
}

/// Client-credential token for Graph.
pub fn acquire_token(client: &Client, config: &AppConfig) -> SyncResult<String> {
    let credentials = config.graph_credentials()?;
    let mut url = parse_base(&config.http.login_url)?;
    url.path_segments_mut()
        .map_err(|_| SyncError::Config("login URL cannot be a base".to_string()))?
        .pop_if_empty()
        .extend([credentials.tenant_id.as_str(), "oauth2", "v2.0", "token"]);

    let response = client
        .post(url)
        .form(&[
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("scope", GRAPH_SCOPE),
            ("grant_type", "client_credentials"),
        ])
        .send()?;
    let response = check(response).map_err(|e| match e {
        SyncError::Http { status, body } => SyncError::Auth(format!("token request failed ({}): {}", status, body)),
        other => other,
    })?;
    let token: TokenResponse = response
        .json()
        .map_err(|e| SyncError::Auth(format!("unexpected token response: {}", e)))?;
    Ok(token.access_token)
}

impl GraphClient {
    /// Get a token and resolve the configured site.
    pub fn connect(config: &AppConfig) -> SyncResult<Self> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        let base = parse_base(&config.http.graph_url)?;
        let (hostname, site_name) = config.site()?;
        let token = acquire_token(&client, config)?;
        tracing::info!("graph token acquired");

        let mut graph = Self {
            client,
            base,
            token,
            site_id: String::new(),
        };
        let host_segment = format!("{}:", hostname);
        let url = graph.endpoint(&["v1.0", "sites", host_segment.as_str(), "sites", site_name.as_str()])?;
        let site: serde_json::Value = graph.get_json(url)?;
        graph.site_id = site
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SyncError::NotFound(format!("site '{}' on {}", site_name, hostname)))?
            .to_string();
        tracing::info!(site_id = %graph.site_id, "site resolved");
        Ok(graph)
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    fn endpoint(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::Config("graph URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// `.../drive/root:/{path}` or `.../drive/root:/{path}:/{action}`; each path segment is encoded.
    fn item_url(&self, path: &str, action: Option<&str>) -> SyncResult<Url> {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.trim().is_empty()).collect();
        if parts.is_empty() {
            return self.endpoint(&["v1.0", "sites", self.site_id.as_str(), "drive", "root"]);
        }
        let mut segments: Vec<String> = vec![
            "v1.0".into(),
            "sites".into(),
            self.site_id.clone(),
            "drive".into(),
            "root:".into(),
        ];
        segments.extend(parts.iter().map(|s| s.to_string()));
        if let Some(action) = action {
            if let Some(last) = segments.last_mut() {
                last.push(':');
            }
            segments.push(action.to_string());
        }
        let refs: Vec<&str> = segments.iter().map(|s| s.as_str()).collect();
        self.endpoint(&refs)
    }

    fn get_json(&self, url: Url) -> SyncResult<serde_json::Value> {
        tracing::debug!(%url, "GET");
        let response = self.client.get(url).bearer_auth(&self.token).send()?;
        check(response)?
            .json()
            .map_err(|e| SyncError::Network(format!("Invalid JSON: {}", e)))
    }

    fn items(&self, url: Url, folder: &str) -> SyncResult<Vec<DriveItem>> {
        let value = self.get_json(url)?;
        Ok(value
            .get("value")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(|i| drive_item(i, folder)).collect())
            .unwrap_or_default())
    }
}

fn parent_of(path: &str) -> &str {
    path.trim_matches('/').rsplit_once('/').map(|(p, _)| p).unwrap_or("")
}

/// Item path from `parentReference.path` (`/drive/root:/A/B`), falling back to `folder`.
fn drive_item(value: &serde_json::Value, folder: &str) -> Option<DriveItem> {
    let name = value.get("name")?.as_str()?.to_string();
    let parent = value
        .get("parentReference")
        .and_then(|p| p.get("path"))
        .and_then(|p| p.as_str())
        .and_then(|p| p.split("root:").last())
        .map(|p| p.trim_matches('/').to_string())
        .unwrap_or_else(|| folder.trim_matches('/').to_string());
    let path = if parent.is_empty() {
        name.clone()
    } else {
        format!("{}/{}", parent, name)
    };
    Some(DriveItem {
        path,
        is_folder: value.get("folder").is_some(),
        size: value.get("size").and_then(|s| s.as_u64()),
        name,
    })
}

impl DocumentStore for GraphClient {
    fn item(&self, path: &str) -> SyncResult<DriveItem> {
        let value = self.get_json(self.item_url(path, None)?).map_err(|e| match e {
            SyncError::NotFound(_) => SyncError::NotFound(path.to_string()),
            other => other,
        })?;
        drive_item(&value, parent_of(path)).ok_or_else(|| SyncError::NotFound(path.to_string()))
    }

    fn download(&self, path: &str) -> SyncResult<Vec<u8>> {
        let url = self.item_url(path, Some("content"))?;
        tracing::debug!(%url, "download");
        let response = self.client.get(url).bearer_auth(&self.token).send()?;
        let response = check(response).map_err(|e| match e {
            SyncError::NotFound(_) => SyncError::NotFound(path.to_string()),
            other => other,
        })?;
        Ok(response.bytes()?.to_vec())
    }

    fn upload(&self, path: &str, bytes: &[u8]) -> SyncResult<()> {
        let url = self.item_url(path, Some("content"))?;
        tracing::debug!(%url, size = bytes.len(), "upload");
        let response = self
            .client
            .put(url)
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, XLSX_CONTENT_TYPE)
            .body(bytes.to_vec())
            .send()?;
        check(response)?;
        Ok(())
    }

    fn list_children(&self, folder: &str) -> SyncResult<Vec<DriveItem>> {
        let url = if folder.trim_matches('/').is_empty() {
            self.endpoint(&["v1.0", "sites", self.site_id.as_str(), "drive", "root", "children"])?
        } else {
            self.item_url(folder, Some("children"))?
        };
        self.items(url, folder)
    }

    fn find(&self, folder: &str, query: &str) -> SyncResult<Vec<DriveItem>> {
        let search = format!("search(q='{}')", query.replace('\'', "''"));
        let url = if folder.trim_matches('/').is_empty() {
            self.endpoint(&["v1.0", "sites", self.site_id.as_str(), "drive", "root", search.as_str()])?
        } else {
            self.item_url(folder, Some(&search))?
        };
        self.items(url, folder)
    }
}

const MONTHS_ES: [&str; 12] = [
    "enero",
    "febrero",
    "marzo",
    "abril",
    "mayo",
    "junio",
    "julio",
    "agosto",
    "septiembre",
    "octubre",
    "noviembre",
    "diciembre",
];

pub fn month_name_es(month: u32) -> Option<&'static str> {
    MONTHS_ES.get(month.checked_sub(1)? as usize).copied()
}

fn has_month_number(name: &str, month: u32) -> bool {
    name.split(|c: char| !c.is_ascii_digit())
        .filter(|run| !run.is_empty() && run.len() <= 2)
        .any(|run| run.parse::<u32>().ok() == Some(month))
}

/// Pick the monthly workbook among `items`: an `.xlsx` whose name has the Spanish month name,
/// preferring one that also has the month number.
pub fn select_monthly_file(items: &[DriveItem], month: u32) -> Option<&DriveItem> {
    let month_name = month_name_es(month)?;
    let candidates: Vec<&DriveItem> = items
        .iter()
        .filter(|i| !i.is_folder)
        .filter(|i| i.name.to_lowercase().ends_with(".xlsx"))
        .filter(|i| i.name.to_lowercase().contains(month_name))
        .collect();
    candidates
        .iter()
        .find(|i| has_month_number(&i.name, month))
        .or_else(|| candidates.first())
        .copied()
}

/// Find this month's workbook in `folder`.
pub fn locate_monthly_file<D: DocumentStore + ?Sized>(store: &D, folder: &str, today: NaiveDate) -> SyncResult<Option<DriveItem>> {
    let month = today.month();
    let month_name = month_name_es(month).unwrap_or_default();
    let items = store.find(folder, month_name)?;
    tracing::debug!(folder, month_name, found = items.len(), "monthly file search");
    Ok(select_monthly_file(&items, month).cloned())
}
