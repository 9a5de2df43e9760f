use crate::{DbError, Value};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One result row keyed by the column names the driver reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRow {
    fields: IndexMap<String, Value>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pairs column names with values positionally.
    pub fn from_columns(names: &[String], values: Vec<Value>) -> Self {
        names.iter().cloned().zip(values).collect()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    /// Exact-name lookup. Mapping code goes through `FieldAliases` instead.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn map_values(self, mut f: impl FnMut(Value) -> Value) -> Self {
        self.fields
            .into_iter()
            .map(|(name, value)| (name, f(value)))
            .collect()
    }
}

impl FromIterator<(String, Value)> for RawRow {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Metadata for a result column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    /// Column name as returned by the database.
    pub name: String,

    /// Database-specific type name (e.g., "varchar", "int4", "NUMBER").
    pub type_name: String,

    pub nullable: bool,
}

/// Pull-based row source that must be closed once the caller is done with it.
#[async_trait]
pub trait RowCursor: Send {
    /// Next row, or `None` once exhausted.
    async fn next_row(&mut self) -> Result<Option<RawRow>, DbError>;

    /// Release the server-side cursor. Called exactly once.
    async fn close(&mut self) -> Result<(), DbError>;
}

/// What a driver handed back, before any mapping code sees it.
pub enum RawResult {
    /// Field names plus positional rows (MySQL).
    TupleRows {
        fields: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    /// Typed column descriptions plus positional rows (PostgreSQL).
    RowsObject {
        columns: Vec<ColumnMeta>,
        rows: Vec<Vec<Value>>,
    },
    /// Already keyed rows (Oracle, small results).
    DirectArray(Vec<RawRow>),
    /// Streaming result set (Oracle, large results).
    Cursor(Box<dyn RowCursor>),
}

impl std::fmt::Debug for RawResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawResult::TupleRows { fields, rows } => f
                .debug_struct("TupleRows")
                .field("fields", fields)
                .field("rows", &rows.len())
                .finish(),
            RawResult::RowsObject { columns, rows } => f
                .debug_struct("RowsObject")
                .field("columns", columns)
                .field("rows", &rows.len())
                .finish(),
            RawResult::DirectArray(rows) => f.debug_tuple("DirectArray").field(&rows.len()).finish(),
            RawResult::Cursor(_) => f.write_str("Cursor(..)"),
        }
    }
}

/// Flattens any driver result shape into keyed rows.
///
/// This is the only place that inspects the shape; everything downstream
/// works on `Vec<RawRow>`.
pub async fn normalize(result: RawResult) -> Result<Vec<RawRow>, DbError> {
    match result {
        RawResult::TupleRows { fields, rows } => Ok(rows
            .into_iter()
            .map(|values| RawRow::from_columns(&fields, values))
            .collect()),
        RawResult::RowsObject { columns, rows } => {
            let names: Vec<String> = columns.into_iter().map(|c| c.name).collect();
            Ok(rows
                .into_iter()
                .map(|values| RawRow::from_columns(&names, values))
                .collect())
        }
        RawResult::DirectArray(rows) => Ok(rows),
        RawResult::Cursor(cursor) => CursorScope::new(cursor).drain().await,
    }
}

/// Owns a cursor and guarantees it is closed.
///
/// `drain` and `close` close it explicitly. If the scope is dropped while the
/// cursor is still open (for example when the owning task is cancelled
/// mid-iteration), the close is handed to the runtime.
pub struct CursorScope {
    cursor: Option<Box<dyn RowCursor>>,
}

impl CursorScope {
    pub fn new(cursor: Box<dyn RowCursor>) -> Self {
        Self {
            cursor: Some(cursor),
        }
    }

    pub async fn next_row(&mut self) -> Result<Option<RawRow>, DbError> {
        match self.cursor.as_mut() {
            Some(cursor) => cursor.next_row().await,
            None => Ok(None),
        }
    }

    pub async fn close(mut self) -> Result<(), DbError> {
        match self.cursor.take() {
            Some(mut cursor) => cursor.close().await,
            None => Ok(()),
        }
    }

    /// Reads every remaining row, then closes.
    ///
    /// A pull error wins over a close error; the latter is only logged.
    pub async fn drain(mut self) -> Result<Vec<RawRow>, DbError> {
        let mut rows = Vec::new();

        loop {
            match self.next_row().await {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => break,
                Err(pull_error) => {
                    if let Err(close_error) = self.close().await {
                        log::warn!(
                            "[QUERY] Cursor close failed after fetch error: {}",
                            close_error
                        );
                    }
                    return Err(pull_error);
                }
            }
        }

        self.close().await?;
        Ok(rows)
    }
}

impl Drop for CursorScope {
    fn drop(&mut self) {
        let Some(mut cursor) = self.cursor.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = cursor.close().await {
                        log::warn!("[QUERY] Deferred cursor close failed: {}", e);
                    }
                });
            }
            Err(_) => log::warn!("[QUERY] Cursor dropped outside a runtime; not closed"),
        }
    }
}
