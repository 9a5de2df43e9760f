use serde::{Deserialize, Serialize};

/// Canonical, dialect-independent description of a database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaInfo {
    /// Tables in the order the catalog query returned them.
    pub tables: Vec<TableInfo>,

    /// `None` when the dialect has no recent-query source. An empty list
    /// also covers "source present but unreadable".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_queries: Option<Vec<RecentQuery>>,

    /// Tables left out because a required per-table query failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_tables: Vec<SkippedTable>,
}

impl SchemaInfo {
    pub fn table(&self, schema: Option<&str>, name: &str) -> Option<&TableInfo> {
        self.tables
            .iter()
            .find(|t| t.name == name && (schema.is_none() || t.schema.as_deref() == schema))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub schema: Option<String>,
    pub name: String,
    pub comment: Option<String>,
    pub columns: Vec<ColumnInfo>,
    pub constraints: Vec<ConstraintInfo>,
    pub indexes: Vec<IndexInfo>,
}

impl TableInfo {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default_value: Option<String>,
    pub is_primary_key: bool,
    pub is_foreign_key: bool,
    pub reference: Option<ColumnReference>,
    pub comment: Option<String>,
}

/// Target of a foreign key column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnReference {
    pub schema: Option<String>,
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    PrimaryKey,
    ForeignKey,
    Unique,
    Check,
}

impl ConstraintKind {
    /// Accepts both the information_schema spelling (`PRIMARY KEY`) and
    /// Oracle's one-letter codes (`P`, `R`, `U`, `C`).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PRIMARY KEY" | "PRIMARY_KEY" | "P" => Some(ConstraintKind::PrimaryKey),
            "FOREIGN KEY" | "FOREIGN_KEY" | "R" => Some(ConstraintKind::ForeignKey),
            "UNIQUE" | "U" => Some(ConstraintKind::Unique),
            "CHECK" | "C" => Some(ConstraintKind::Check),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintInfo {
    pub name: String,
    pub kind: ConstraintKind,
    pub columns: Vec<String>,
    /// Check expression, when the catalog exposes it.
    pub definition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
    /// Access method (btree, hash, BITMAP, ...).
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentQuery {
    pub query_text: String,
    pub calls: i64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedTable {
    pub schema: Option<String>,
    pub name: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_kind_accepts_catalog_spellings() {
        assert_eq!(ConstraintKind::parse("PRIMARY KEY"), Some(ConstraintKind::PrimaryKey));
        assert_eq!(ConstraintKind::parse("R"), Some(ConstraintKind::ForeignKey));
        assert_eq!(ConstraintKind::parse("unique"), Some(ConstraintKind::Unique));
        assert_eq!(ConstraintKind::parse("C"), Some(ConstraintKind::Check));
        assert_eq!(ConstraintKind::parse("EXCLUDE"), None);
    }

    #[test]
    fn empty_optional_sections_are_not_serialized() {
        let json = serde_json::to_value(SchemaInfo::default()).expect("serializes");
        assert_eq!(json, serde_json::json!({ "tables": [] }));
    }
}
