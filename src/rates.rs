//! Exchange-rate sources. A missing rate is never an error: every failure is `None`.

use crate::error::{SyncError, SyncResult};
use crate::excel::read_sheet_grid;
use crate::types::CellValue;
use chrono::NaiveDate;
use reqwest::blocking::Client;
use std::time::Duration;

/// Most recent rate effective on or before `date`.
pub trait RateSource {
    fn lookup_rate(&self, date: NaiveDate) -> Option<f64>;
}

pub const DEFAULT_RATES_URL: &str = "https://www.datos.gov.co/resource/mcec-87by.json";

/// Open-data (Socrata) representative market rate endpoint.
pub struct DatosAbiertosRates {
    client: Client,
    base_url: String,
}

impl DatosAbiertosRates {
    pub fn new(base_url: &str, timeout: Duration) -> SyncResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn fetch(&self, date: NaiveDate) -> SyncResult<Option<f64>> {
        let filter = format!("vigenciadesde <= '{}T00:00:00.000'", date.format("%Y-%m-%d"));
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("$where", filter.as_str()),
                ("$order", "vigenciadesde DESC"),
                ("$limit", "1"),
            ])
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Http {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        let body: serde_json::Value = response
            .json()
            .map_err(|e| SyncError::Network(format!("Invalid JSON: {}", e)))?;
        Ok(parse_rate_rows(&body))
    }
}

/// First row's `valor`, as number or numeric string.
fn parse_rate_rows(body: &serde_json::Value) -> Option<f64> {
    let first = body.as_array()?.first()?;
    let valor = first.get("valor")?;
    valor
        .as_f64()
        .or_else(|| valor.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
        .filter(|r| r.is_finite() && *r > 0.0)
}

impl RateSource for DatosAbiertosRates {
    fn lookup_rate(&self, date: NaiveDate) -> Option<f64> {
        match self.fetch(date) {
            Ok(rate) => {
                if rate.is_none() {
                    tracing::debug!(%date, "no rate published on or before date");
                }
                rate
            }
            Err(e) => {
                tracing::warn!(%date, error = %e, "rate lookup failed");
                None
            }
        }
    }
}

/// Rate table read from a workbook: first column holding dates, first numeric column after it
/// holding the rate. Rows are kept sorted by date.
#[derive(Debug, Clone, Default)]
pub struct RateWorkbook {
    entries: Vec<(NaiveDate, f64)>,
}

impl RateWorkbook {
    pub fn from_bytes(bytes: &[u8], sheet_name: &str) -> SyncResult<Self> {
        let grid = read_sheet_grid(bytes, sheet_name)?;
        Ok(Self::from_grid(&grid))
    }

    pub(crate) fn from_grid(grid: &[Vec<CellValue>]) -> Self {
        let mut entries = Vec::new();
        for row in grid {
            let Some(date_idx) = row.iter().position(|c| c.to_date().is_some()) else {
                continue;
            };
            let date = match row[date_idx].to_date() {
                Some(d) => d,
                None => continue,
            };
            let rate = row
                .iter()
                .skip(date_idx + 1)
                .find_map(|c| c.to_number())
                .filter(|r| *r > 0.0);
            if let Some(rate) = rate {
                entries.push((date, rate));
            }
        }
        entries.sort_by_key(|(d, _)| *d);
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RateSource for RateWorkbook {
    fn lookup_rate(&self, date: NaiveDate) -> Option<f64> {
        let idx = self.entries.partition_point(|(d, _)| *d <= date);
        idx.checked_sub(1).map(|i| self.entries[i].1)
    }
}
