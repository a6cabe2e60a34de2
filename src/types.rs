use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One scalar read from a spreadsheet cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum CellValue {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl CellValue {
    pub fn text(s: impl Into<String>) -> Self {
        let s = s.into();
        if s.trim().is_empty() {
            CellValue::Empty
        } else {
            CellValue::Text(s)
        }
    }

    /// Empty cells and whitespace-only text both count as missing (pandas `NaN` semantics).
    pub fn is_missing(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            CellValue::Number(n) => n.is_nan(),
            CellValue::Date(_) => false,
        }
    }

    /// Plain display text, the way the value would be typed into a cell.
    pub fn display(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Text(s) => s.trim().to_string(),
            CellValue::Number(n) => format_plain_number(*n),
            CellValue::Date(d) => d.format("%d/%m/%Y").to_string(),
        }
    }

    /// Numeric coercion: numbers pass through, text is parsed after stripping thousands
    /// separators and whitespace. Anything else (or unparseable text) is `None`.
    pub fn to_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) if n.is_finite() => Some(*n),
            CellValue::Text(s) => parse_number(s),
            _ => None,
        }
    }

    /// Date coercion: spreadsheet dates pass through, text is tried as `dd/mm/yyyy` then ISO.
    pub fn to_date(&self) -> Option<NaiveDate> {
        match self {
            CellValue::Date(d) => Some(*d),
            CellValue::Text(s) => parse_date(s),
            _ => None,
        }
    }

    /// Identity-style text: whole numbers lose their `.0` (an ID read as float `9001.0` becomes `9001`).
    pub fn to_key(&self) -> String {
        match self {
            CellValue::Number(n) if n.is_finite() && n.fract() == 0.0 => format!("{}", *n as i64),
            other => other.display(),
        }
    }
}

/// Parse numeric text, tolerating `,` thousands separators and surrounding spaces.
pub fn parse_number(s: &str) -> Option<f64> {
    let cleaned: String = s.chars().filter(|c| *c != ',' && !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|n| n.is_finite())
}

const DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%Y-%m-%d", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }
    None
}

/// Round half away from zero to `decimals` places; non-finite input becomes 0.
pub fn round_to(n: f64, decimals: i32) -> f64 {
    if !n.is_finite() {
        return 0.0;
    }
    let factor = 10f64.powi(decimals);
    let rounded = (n * factor).round() / factor;
    if rounded.is_finite() {
        rounded
    } else {
        n
    }
}

/// Number without float noise in the integer case (`5.0` → `5`).
pub fn format_plain_number(n: f64) -> String {
    if !n.is_finite() {
        return String::new();
    }
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// One row of the original extract, keyed by the human-assigned header text.
pub type RawRecord = IndexMap<String, CellValue>;

/// The raw extract after the header offset has been applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<RawRecord>,
}

impl RawTable {
    pub fn has_column(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Remove a column from the header and every row. Returns false when it was absent.
    pub fn drop_column(&mut self, name: &str) -> bool {
        let before = self.headers.len();
        self.headers.retain(|h| h != name);
        if self.headers.len() == before {
            return false;
        }
        for row in &mut self.rows {
            row.shift_remove(name);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_coercion_strips_thousands_separators() {
        assert_eq!(CellValue::text("4,061.36").to_number(), Some(4061.36));
        assert_eq!(CellValue::text(" 12 ").to_number(), Some(12.0));
        assert_eq!(CellValue::text("abc").to_number(), None);
        assert_eq!(CellValue::Empty.to_number(), None);
        assert_eq!(CellValue::Number(f64::NAN).to_number(), None);
    }

    #[test]
    fn date_coercion_accepts_day_first_and_iso() {
        let expected = NaiveDate::from_ymd_opt(2025, 3, 14);
        assert_eq!(CellValue::text("14/03/2025").to_date(), expected);
        assert_eq!(CellValue::text("2025-03-14").to_date(), expected);
        assert_eq!(CellValue::text("2025-03-14 00:00:00").to_date(), expected);
        assert_eq!(CellValue::text("not a date").to_date(), None);
    }

    #[test]
    fn rounding_clears_float_noise() {
        assert_eq!(round_to(0.1 + 0.2, 2), 0.3);
        assert_eq!(round_to(2.675_000_1, 2), 2.68);
        assert_eq!(round_to(f64::NAN, 2), 0.0);
        assert_eq!(round_to(f64::INFINITY, 2), 0.0);
    }

    #[test]
    fn keys_drop_float_artifacts() {
        assert_eq!(CellValue::Number(900123456.0).to_key(), "900123456");
        assert_eq!(CellValue::text(" A-1 ").to_key(), "A-1");
        assert_eq!(CellValue::Number(2.5).to_key(), "2.5");
    }

    #[test]
    fn drop_column_removes_from_rows() {
        let mut t = RawTable {
            headers: vec!["A".into(), "B".into()],
            rows: vec![[("A".to_string(), CellValue::text("x")), ("B".to_string(), CellValue::Number(1.0))]
                .into_iter()
                .collect()],
        };
        assert!(t.drop_column("B"));
        assert!(!t.drop_column("B"));
        assert_eq!(t.headers, vec!["A".to_string()]);
        assert!(!t.rows[0].contains_key("B"));
    }
}
