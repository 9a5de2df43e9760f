//! Business metadata read from the tenant's own metadata schema.
//!
//! The metadata schema (`dbatlas_meta` by default) is curated by people, not
//! generated: relationships the catalog can't see, code tables and their
//! labels, a glossary, and reusable query patterns. None of it is required.
//! A database without the schema gets an empty cache, and an unreadable
//! table only empties its own collection.

use crate::binding::NamedParams;
use crate::catalog::{DialectCatalog, QueryDef};
use crate::fields::FieldAliases;
use crate::handle::PooledHandle;
use crate::introspect::run_catalog_query;
use crate::params::Dialect;
use crate::RawRow;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Builds a record from one metadata row. Rows missing a required field are
/// dropped.
pub trait MetadataRecord: Sized {
    fn from_row(fields: &FieldAliases<'_>, row: &RawRow) -> Option<Self>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRelationship {
    pub source_table: String,
    pub source_column: String,
    pub target_table: String,
    pub target_column: String,
    /// Free text such as `one_to_many`.
    pub relationship_type: Option<String>,
    pub description: Option<String>,
}

impl MetadataRecord for TableRelationship {
    fn from_row(fields: &FieldAliases<'_>, row: &RawRow) -> Option<Self> {
        Some(Self {
            source_table: fields.non_empty_text(row, "source_table")?,
            source_column: fields.non_empty_text(row, "source_column")?,
            target_table: fields.non_empty_text(row, "target_table")?,
            target_column: fields.non_empty_text(row, "target_column")?,
            relationship_type: fields.non_empty_text(row, "relationship_type"),
            description: fields.non_empty_text(row, "description"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamingConvention {
    /// Name fragment, e.g. `_cd` or `dt_`.
    pub pattern: String,
    pub meaning: String,
    pub example: Option<String>,
}

impl MetadataRecord for NamingConvention {
    fn from_row(fields: &FieldAliases<'_>, row: &RawRow) -> Option<Self> {
        Some(Self {
            pattern: fields.non_empty_text(row, "pattern")?,
            meaning: fields.non_empty_text(row, "meaning")?,
            example: fields.non_empty_text(row, "example"),
        })
    }
}

/// A lookup table mapping codes to human labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeTable {
    pub code_table: String,
    pub code_column: String,
    pub label_column: String,
    pub description: Option<String>,
}

impl MetadataRecord for CodeTable {
    fn from_row(fields: &FieldAliases<'_>, row: &RawRow) -> Option<Self> {
        Some(Self {
            code_table: fields.non_empty_text(row, "code_table")?,
            code_column: fields.non_empty_text(row, "code_column")?,
            label_column: fields.non_empty_text(row, "label_column")?,
            description: fields.non_empty_text(row, "description"),
        })
    }
}

/// Which code table explains the values of a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnCodeMapping {
    pub table_name: String,
    pub column_name: String,
    pub code_table: String,
}

impl MetadataRecord for ColumnCodeMapping {
    fn from_row(fields: &FieldAliases<'_>, row: &RawRow) -> Option<Self> {
        Some(Self {
            table_name: fields.non_empty_text(row, "table_name")?,
            column_name: fields.non_empty_text(row, "column_name")?,
            code_table: fields.non_empty_text(row, "code_table")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeAlias {
    pub code_table: String,
    pub code_value: String,
    pub alias: String,
}

impl MetadataRecord for CodeAlias {
    fn from_row(fields: &FieldAliases<'_>, row: &RawRow) -> Option<Self> {
        Some(Self {
            code_table: fields.non_empty_text(row, "code_table")?,
            code_value: fields.text(row, "code_value")?,
            alias: fields.non_empty_text(row, "alias")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlossaryTerm {
    pub term: String,
    pub definition: String,
    /// SQL fragment the term expands to, when it has one.
    pub sql_expression: Option<String>,
}

impl MetadataRecord for GlossaryTerm {
    fn from_row(fields: &FieldAliases<'_>, row: &RawRow) -> Option<Self> {
        Some(Self {
            term: fields.non_empty_text(row, "term")?,
            definition: fields.non_empty_text(row, "definition")?,
            sql_expression: fields.non_empty_text(row, "sql_expression"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlossaryAlias {
    pub term: String,
    pub alias: String,
}

impl MetadataRecord for GlossaryAlias {
    fn from_row(fields: &FieldAliases<'_>, row: &RawRow) -> Option<Self> {
        Some(Self {
            term: fields.non_empty_text(row, "term")?,
            alias: fields.non_empty_text(row, "alias")?,
        })
    }
}

/// Overrides a term's definition inside one business context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlossaryContext {
    pub term: String,
    pub context: String,
    pub definition: String,
}

impl MetadataRecord for GlossaryContext {
    fn from_row(fields: &FieldAliases<'_>, row: &RawRow) -> Option<Self> {
        Some(Self {
            term: fields.non_empty_text(row, "term")?,
            context: fields.non_empty_text(row, "context")?,
            definition: fields.non_empty_text(row, "definition")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPattern {
    pub pattern_id: String,
    pub name: String,
    pub description: Option<String>,
    pub sql_template: String,
}

impl MetadataRecord for QueryPattern {
    fn from_row(fields: &FieldAliases<'_>, row: &RawRow) -> Option<Self> {
        Some(Self {
            pattern_id: fields.non_empty_text(row, "pattern_id")?,
            name: fields.non_empty_text(row, "name")?,
            description: fields.non_empty_text(row, "description"),
            sql_template: fields.non_empty_text(row, "sql_template")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternParameter {
    pub pattern_id: String,
    pub param_name: String,
    pub param_type: Option<String>,
    pub default_value: Option<String>,
    pub description: Option<String>,
}

impl MetadataRecord for PatternParameter {
    fn from_row(fields: &FieldAliases<'_>, row: &RawRow) -> Option<Self> {
        Some(Self {
            pattern_id: fields.non_empty_text(row, "pattern_id")?,
            param_name: fields.non_empty_text(row, "param_name")?,
            param_type: fields.non_empty_text(row, "param_type"),
            default_value: fields.text(row, "default_value"),
            description: fields.non_empty_text(row, "description"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternKeyword {
    pub pattern_id: String,
    pub keyword: String,
}

impl MetadataRecord for PatternKeyword {
    fn from_row(fields: &FieldAliases<'_>, row: &RawRow) -> Option<Self> {
        Some(Self {
            pattern_id: fields.non_empty_text(row, "pattern_id")?,
            keyword: fields.non_empty_text(row, "keyword")?,
        })
    }
}

/// Everything read from one database's metadata schema.
///
/// Either fully loaded or `MetadataCache::empty`; readers never see a cache
/// that is still being filled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataCache {
    pub dialect: Dialect,
    pub loaded_at: DateTime<Utc>,
    pub table_relationships: Vec<TableRelationship>,
    pub naming_conventions: Vec<NamingConvention>,
    pub code_tables: Vec<CodeTable>,
    pub column_code_mappings: Vec<ColumnCodeMapping>,
    pub code_aliases: Vec<CodeAlias>,
    pub glossary_terms: Vec<GlossaryTerm>,
    pub glossary_aliases: Vec<GlossaryAlias>,
    pub glossary_contexts: Vec<GlossaryContext>,
    pub query_patterns: Vec<QueryPattern>,
    pub pattern_parameters: Vec<PatternParameter>,
    pub pattern_keywords: Vec<PatternKeyword>,
}

impl MetadataCache {
    pub fn empty(dialect: Dialect) -> Self {
        Self {
            dialect,
            loaded_at: Utc::now(),
            table_relationships: Vec::new(),
            naming_conventions: Vec::new(),
            code_tables: Vec::new(),
            column_code_mappings: Vec::new(),
            code_aliases: Vec::new(),
            glossary_terms: Vec::new(),
            glossary_aliases: Vec::new(),
            glossary_contexts: Vec::new(),
            query_patterns: Vec::new(),
            pattern_parameters: Vec::new(),
            pattern_keywords: Vec::new(),
        }
    }

    /// Record count per collection, in catalog order.
    pub fn collection_sizes(&self) -> [(&'static str, usize); 11] {
        let [a, b, c, d, e, f, g, h, i, j, k] = DialectCatalog::metadata_query_names();
        [
            (a, self.table_relationships.len()),
            (b, self.naming_conventions.len()),
            (c, self.code_tables.len()),
            (d, self.column_code_mappings.len()),
            (e, self.code_aliases.len()),
            (f, self.glossary_terms.len()),
            (g, self.glossary_aliases.len()),
            (h, self.glossary_contexts.len()),
            (i, self.query_patterns.len()),
            (j, self.pattern_parameters.len()),
            (k, self.pattern_keywords.len()),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.collection_sizes().iter().all(|(_, len)| *len == 0)
    }

    pub fn glossary_term(&self, term: &str) -> Option<&GlossaryTerm> {
        self.glossary_terms
            .iter()
            .find(|t| t.term.eq_ignore_ascii_case(term))
            .or_else(|| {
                let alias = self
                    .glossary_aliases
                    .iter()
                    .find(|a| a.alias.eq_ignore_ascii_case(term))?;
                self.glossary_terms
                    .iter()
                    .find(|t| t.term.eq_ignore_ascii_case(&alias.term))
            })
    }

    pub fn code_table_for(&self, table: &str, column: &str) -> Option<&CodeTable> {
        let mapping = self.column_code_mappings.iter().find(|m| {
            m.table_name.eq_ignore_ascii_case(table) && m.column_name.eq_ignore_ascii_case(column)
        })?;
        self.code_tables
            .iter()
            .find(|c| c.code_table.eq_ignore_ascii_case(&mapping.code_table))
    }
}

/// Reads the metadata schema behind `handle`.
///
/// Never fails. A missing schema, a failed schema check, or a failed collection
/// query are logged and yield empty collections.
pub async fn load_metadata_cache(
    handle: &dyn PooledHandle,
    catalog: &DialectCatalog,
) -> MetadataCache {
    let started = Instant::now();
    let dialect = catalog.dialect;
    let params = NamedParams::new().with("schema", catalog.metadata_schema.clone());

    let check = run_catalog_query(
        handle,
        "metadata_schema_check",
        &catalog.metadata_schema_check,
        &params,
    )
    .await;

    match check {
        Ok(rows) if !rows.is_empty() => {}
        Ok(_) => {
            log::warn!(
                "[CACHE] Metadata schema '{}' not found, using empty cache",
                catalog.metadata_schema
            );
            return MetadataCache::empty(dialect);
        }
        Err(e) => {
            log::warn!(
                "[CACHE] Checking metadata schema '{}' failed, using empty cache: {}",
                catalog.metadata_schema,
                e
            );
            return MetadataCache::empty(dialect);
        }
    }

    let q = &catalog.metadata_queries;
    let (
        table_relationships,
        naming_conventions,
        code_tables,
        column_code_mappings,
        code_aliases,
        glossary_terms,
        glossary_aliases,
        glossary_contexts,
        query_patterns,
        pattern_parameters,
        pattern_keywords,
    ) = futures::join!(
        load_collection(handle, dialect, "table_relationships", &q.table_relationships, &params),
        load_collection(handle, dialect, "naming_conventions", &q.naming_conventions, &params),
        load_collection(handle, dialect, "code_tables", &q.code_tables, &params),
        load_collection(handle, dialect, "column_code_mappings", &q.column_code_mappings, &params),
        load_collection(handle, dialect, "code_aliases", &q.code_aliases, &params),
        load_collection(handle, dialect, "glossary_terms", &q.glossary_terms, &params),
        load_collection(handle, dialect, "glossary_aliases", &q.glossary_aliases, &params),
        load_collection(handle, dialect, "glossary_contexts", &q.glossary_contexts, &params),
        load_collection(handle, dialect, "query_patterns", &q.query_patterns, &params),
        load_collection(handle, dialect, "pattern_parameters", &q.pattern_parameters, &params),
        load_collection(handle, dialect, "pattern_keywords", &q.pattern_keywords, &params),
    );

    let cache = MetadataCache {
        dialect,
        loaded_at: Utc::now(),
        table_relationships,
        naming_conventions,
        code_tables,
        column_code_mappings,
        code_aliases,
        glossary_terms,
        glossary_aliases,
        glossary_contexts,
        query_patterns,
        pattern_parameters,
        pattern_keywords,
    };

    log::info!(
        "[CACHE] Loaded metadata from '{}' in {:.2?}: {:?}",
        catalog.metadata_schema,
        started.elapsed(),
        cache.collection_sizes()
    );

    cache
}

async fn load_collection<T: MetadataRecord>(
    handle: &dyn PooledHandle,
    dialect: Dialect,
    name: &str,
    query: &QueryDef,
    params: &NamedParams,
) -> Vec<T> {
    let rows = match run_catalog_query(handle, name, query, params).await {
        Ok(rows) => rows,
        Err(e) => {
            log::warn!("[CACHE] Metadata collection '{}' unavailable: {}", name, e);
            return Vec::new();
        }
    };

    let fields = FieldAliases::for_dialect(dialect).with_mapping(&query.result_mapping);
    let records: Vec<T> = rows.iter().filter_map(|row| T::from_row(&fields, row)).collect();

    if records.len() < rows.len() {
        log::debug!(
            "[CACHE] {}: dropped {} incomplete rows",
            name,
            rows.len() - records.len()
        );
    }

    records
}

pub(crate) type SharedLoad = Shared<BoxFuture<'static, Arc<MetadataCache>>>;

/// Cache plus the single in-flight load for one connection entry.
///
/// `generation` is bumped by refresh and invalidate so that a load started
/// before either does not store its result afterwards.
#[derive(Default)]
pub(crate) struct CacheSlot {
    pub(crate) cache: Option<Arc<MetadataCache>>,
    pub(crate) in_flight: Option<SharedLoad>,
    pub(crate) generation: u64,
}

impl CacheSlot {
    pub(crate) fn state(&self) -> CacheState {
        if self.cache.is_some() {
            CacheState::Ready
        } else if self.in_flight.is_some() {
            CacheState::Loading
        } else {
            CacheState::Unloaded
        }
    }

    pub(crate) fn reset(&mut self) {
        self.cache = None;
        self.in_flight = None;
        self.generation += 1;
    }

    /// Stores a finished load if nothing reset the slot meanwhile.
    pub(crate) fn complete(&mut self, generation: u64, cache: &Arc<MetadataCache>) -> bool {
        if self.generation != generation {
            return false;
        }
        self.cache = Some(Arc::clone(cache));
        self.in_flight = None;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    Unloaded,
    Loading,
    Ready,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    #[test]
    fn empty_cache_has_eleven_empty_collections() {
        let cache = MetadataCache::empty(Dialect::Mysql);
        let sizes = cache.collection_sizes();
        assert_eq!(sizes.len(), 11);
        assert!(cache.is_empty());
        assert_eq!(cache.dialect, Dialect::Mysql);
    }

    #[test]
    fn records_read_upper_case_rows() {
        let fields = FieldAliases::for_dialect(Dialect::Oracle);
        let row = RawRow::new()
            .with("TERM", "active customer")
            .with("DEFINITION", "Ordered in the last 90 days")
            .with("SQL_EXPRESSION", Value::Null);

        let term = GlossaryTerm::from_row(&fields, &row).expect("complete row");
        assert_eq!(term.term, "active customer");
        assert_eq!(term.sql_expression, None);
    }

    #[test]
    fn incomplete_rows_are_dropped() {
        let fields = FieldAliases::for_dialect(Dialect::Postgres);
        let row = RawRow::new().with("pattern_id", "p1");
        assert!(PatternKeyword::from_row(&fields, &row).is_none());
    }

    #[test]
    fn glossary_lookup_follows_aliases() {
        let mut cache = MetadataCache::empty(Dialect::Postgres);
        cache.glossary_terms.push(GlossaryTerm {
            term: "churn".into(),
            definition: "Customers lost in a period".into(),
            sql_expression: None,
        });
        cache.glossary_aliases.push(GlossaryAlias {
            term: "churn".into(),
            alias: "attrition".into(),
        });

        assert_eq!(
            cache.glossary_term("Attrition").map(|t| t.term.as_str()),
            Some("churn")
        );
        assert!(cache.glossary_term("revenue").is_none());
    }

    #[test]
    fn code_table_lookup_goes_through_column_mapping() {
        let mut cache = MetadataCache::empty(Dialect::Mysql);
        cache.code_tables.push(CodeTable {
            code_table: "order_status".into(),
            code_column: "code".into(),
            label_column: "label".into(),
            description: None,
        });
        cache.column_code_mappings.push(ColumnCodeMapping {
            table_name: "orders".into(),
            column_name: "status_cd".into(),
            code_table: "order_status".into(),
        });

        assert!(cache.code_table_for("ORDERS", "STATUS_CD").is_some());
        assert!(cache.code_table_for("orders", "id").is_none());
    }

    #[test]
    fn stale_load_does_not_overwrite_after_reset() {
        let mut slot = CacheSlot::default();
        let started_at = slot.generation;
        slot.reset();

        let cache = Arc::new(MetadataCache::empty(Dialect::Oracle));
        assert!(!slot.complete(started_at, &cache));
        assert_eq!(slot.state(), CacheState::Unloaded);

        assert!(slot.complete(slot.generation, &cache));
        assert_eq!(slot.state(), CacheState::Ready);
    }
}
