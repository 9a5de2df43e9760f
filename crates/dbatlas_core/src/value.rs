use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// A single cell as returned by a driver.
///
/// Drivers convert their native row types into this enum before anything in
/// the core looks at a row, so catalog mapping and charset recovery only deal
/// with one value representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// JSON/JSONB kept as its textual form.
    Json(String),
    /// Decimal stored as string to preserve exact precision.
    Decimal(String),
    DateTime(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
    Array(Vec<Value>),
}

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// String form of scalar values. `None` for NULL, blobs and arrays.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Text(s) | Value::Json(s) | Value::Decimal(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::DateTime(dt) => Some(dt.to_rfc3339()),
            Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Value::Time(t) => Some(t.format("%H:%M:%S").to_string()),
            Value::Null | Value::Bytes(_) | Value::Array(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Text(s) | Value::Decimal(s) => {
                let trimmed = s.trim();
                trimmed
                    .parse::<i64>()
                    .ok()
                    .or_else(|| trimmed.parse::<f64>().ok().map(|f| f as i64))
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Text(s) | Value::Decimal(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Interprets catalog-style boolean columns.
    ///
    /// Catalog views disagree on how they spell a flag: PostgreSQL returns a
    /// real boolean, MySQL `'YES'`/`'NO'` or `0`/`1`, Oracle `'Y'`/`'N'`.
    pub fn as_flag(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Text(s) | Value::Decimal(s) => matches!(
                s.trim().to_ascii_uppercase().as_str(),
                "YES" | "Y" | "TRUE" | "T" | "1" | "PRI"
            ),
            _ => false,
        }
    }

    pub fn as_display_string(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bytes(b) => format!("<{} bytes>", b.len()),
            Value::Array(items) => {
                let parts: Vec<String> = items.iter().map(Value::as_display_string).collect();
                format!("[{}]", parts.join(", "))
            }
            other => other.as_text().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_display_string())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}
