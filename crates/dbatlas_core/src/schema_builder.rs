use crate::schema::{ColumnInfo, ColumnReference, ConstraintInfo, ConstraintKind, IndexInfo};
use indexmap::IndexMap;

/// Collects FK rows by local column and stitches them onto `ColumnInfo`.
///
/// Catalog queries return one row per FK column. The first reference seen
/// for a column wins.
#[derive(Default)]
pub struct ForeignKeyBuilder {
    references: IndexMap<String, ColumnReference>,
}

impl ForeignKeyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_column(&mut self, column: String, reference: ColumnReference) {
        self.references.entry(column).or_insert(reference);
    }

    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    /// Marks matching columns as foreign keys. Returns FK columns that did
    /// not match any listed column.
    pub fn apply(mut self, columns: &mut [ColumnInfo]) -> Vec<String> {
        for column in columns.iter_mut() {
            if let Some(reference) = self.references.shift_remove(&column.name) {
                column.is_foreign_key = true;
                column.reference = Some(reference);
            }
        }
        self.references.into_keys().collect()
    }
}

/// Groups index rows by index name, keeping first-seen order.
#[derive(Default)]
pub struct IndexBuilder {
    map: IndexMap<String, IndexInfo>,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column to an index. Creates the index if it doesn't exist.
    pub fn add_column(
        &mut self,
        name: String,
        column: Option<String>,
        is_unique: bool,
        method: Option<String>,
    ) {
        let entry = self.map.entry(name.clone()).or_insert_with(|| IndexInfo {
            name,
            columns: Vec::new(),
            is_unique,
            method,
        });

        if let Some(column) = column
            && !entry.columns.contains(&column)
        {
            entry.columns.push(column);
        }
    }

    pub fn build(self) -> Vec<IndexInfo> {
        self.map.into_values().collect()
    }
}

/// Groups constraint rows by constraint name, keeping first-seen order.
#[derive(Default)]
pub struct ConstraintBuilder {
    map: IndexMap<String, ConstraintInfo>,
}

impl ConstraintBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_column(
        &mut self,
        name: String,
        kind: ConstraintKind,
        column: Option<String>,
        definition: Option<String>,
    ) {
        let entry = self
            .map
            .entry(name.clone())
            .or_insert_with(|| ConstraintInfo {
                name,
                kind,
                columns: Vec::new(),
                definition: None,
            });

        if entry.definition.is_none() {
            entry.definition = definition;
        }

        if let Some(column) = column
            && !entry.columns.contains(&column)
        {
            entry.columns.push(column);
        }
    }

    /// Column names covered by a primary key constraint.
    pub fn primary_key_columns(&self) -> Vec<String> {
        self.map
            .values()
            .filter(|c| c.kind == ConstraintKind::PrimaryKey)
            .flat_map(|c| c.columns.iter().cloned())
            .collect()
    }

    pub fn build(self) -> Vec<ConstraintInfo> {
        self.map.into_values().collect()
    }
}
