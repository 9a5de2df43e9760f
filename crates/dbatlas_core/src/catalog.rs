use crate::binding::placeholder_names;
use crate::params::Dialect;
use crate::DbError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

const METADATA_SCHEMA_TOKEN: &str = "{metadata_schema}";

const METADATA_COLLECTIONS: [&str; 11] = [
    "table_relationships",
    "naming_conventions",
    "code_tables",
    "column_code_mappings",
    "code_aliases",
    "glossary_terms",
    "glossary_aliases",
    "glossary_contexts",
    "query_patterns",
    "pattern_parameters",
    "pattern_keywords",
];

/// One parameterized catalog query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDef {
    pub sql: String,

    /// Named parameters the SQL expects, without the leading colon.
    #[serde(default)]
    pub params: Vec<String>,

    /// Optional queries yield no rows on failure instead of an error.
    #[serde(default)]
    pub optional: bool,

    /// Canonical field name → raw column name overrides.
    #[serde(default)]
    pub result_mapping: BTreeMap<String, String>,
}

impl QueryDef {
    fn validate(&self, name: &str) -> Result<(), DbError> {
        let mut found = placeholder_names(&self.sql);
        let mut declared = self.params.clone();
        found.sort();
        declared.sort();
        declared.dedup();

        if found != declared {
            return Err(DbError::Catalog(format!(
                "query '{}' declares params {:?} but its SQL uses {:?}",
                name, declared, found
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntrospectionQueries {
    pub tables: QueryDef,
    pub columns: QueryDef,
    pub foreign_keys: QueryDef,
    pub constraints: QueryDef,
    pub indexes: QueryDef,
    #[serde(default)]
    pub recent_queries: Option<QueryDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataQueries {
    pub table_relationships: QueryDef,
    pub naming_conventions: QueryDef,
    pub code_tables: QueryDef,
    pub column_code_mappings: QueryDef,
    pub code_aliases: QueryDef,
    pub glossary_terms: QueryDef,
    pub glossary_aliases: QueryDef,
    pub glossary_contexts: QueryDef,
    pub query_patterns: QueryDef,
    pub pattern_parameters: QueryDef,
    pub pattern_keywords: QueryDef,
}

impl MetadataQueries {
    fn all_mut(&mut self) -> [(&'static str, &mut QueryDef); 11] {
        let [a, b, c, d, e, f, g, h, i, j, k] = METADATA_COLLECTIONS;
        [
            (a, &mut self.table_relationships),
            (b, &mut self.naming_conventions),
            (c, &mut self.code_tables),
            (d, &mut self.column_code_mappings),
            (e, &mut self.code_aliases),
            (f, &mut self.glossary_terms),
            (g, &mut self.glossary_aliases),
            (h, &mut self.glossary_contexts),
            (i, &mut self.query_patterns),
            (j, &mut self.pattern_parameters),
            (k, &mut self.pattern_keywords),
        ]
    }
}

/// Statements that create the metadata schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DdlDef {
    pub statements: Vec<String>,
}

/// Declarative per-dialect description of how to introspect a database.
///
/// Loaded from embedded JSON for the built-in dialects. `from_json` accepts
/// any resource of the same shape, which is how another dialect plugs into
/// the introspection engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialectCatalog {
    pub dialect: Dialect,
    pub excluded_schemas: Vec<String>,
    pub queries: IntrospectionQueries,
    pub metadata_schema: String,
    /// Returns at least one row when the metadata schema exists. Takes
    /// `:schema`.
    pub metadata_schema_check: QueryDef,
    pub metadata_queries: MetadataQueries,
    #[serde(default)]
    pub ddl: Option<DdlDef>,
}

impl DialectCatalog {
    /// Parses, substitutes `{metadata_schema}` and validates a catalog.
    pub fn from_json(json: &str) -> Result<Self, DbError> {
        let mut catalog: DialectCatalog =
            serde_json::from_str(json).map_err(|e| DbError::Catalog(e.to_string()))?;
        catalog.prepare()?;
        Ok(catalog)
    }

    /// The embedded catalog for a built-in dialect, parsed once per process.
    pub fn builtin(dialect: Dialect) -> Result<Arc<DialectCatalog>, DbError> {
        static POSTGRES: LazyLock<Result<Arc<DialectCatalog>, String>> =
            LazyLock::new(|| load_embedded(include_str!("../catalogs/postgres.json")));
        static MYSQL: LazyLock<Result<Arc<DialectCatalog>, String>> =
            LazyLock::new(|| load_embedded(include_str!("../catalogs/mysql.json")));
        static ORACLE: LazyLock<Result<Arc<DialectCatalog>, String>> =
            LazyLock::new(|| load_embedded(include_str!("../catalogs/oracle.json")));

        let loaded = match dialect {
            Dialect::Postgres => &*POSTGRES,
            Dialect::Mysql => &*MYSQL,
            Dialect::Oracle => &*ORACLE,
        };

        let catalog = loaded.clone().map_err(DbError::Catalog)?;
        if catalog.dialect != dialect {
            return Err(DbError::Catalog(format!(
                "embedded catalog for {} declares dialect {}",
                dialect, catalog.dialect
            )));
        }
        Ok(catalog)
    }

    /// Case-insensitive check against the dialect's system schemas.
    ///
    /// An entry ending in `*` matches every schema with that prefix
    /// (`pg_temp_*` covers `pg_temp_3`).
    pub fn is_excluded(&self, schema: &str) -> bool {
        self.excluded_schemas.iter().any(|excluded| {
            match excluded.strip_suffix('*') {
                Some(prefix) => schema
                    .get(..prefix.len())
                    .is_some_and(|head| head.eq_ignore_ascii_case(prefix)),
                None => excluded.eq_ignore_ascii_case(schema),
            }
        })
    }

    pub fn metadata_query_names() -> [&'static str; 11] {
        METADATA_COLLECTIONS
    }

    fn prepare(&mut self) -> Result<(), DbError> {
        if self.metadata_schema.trim().is_empty() {
            return Err(DbError::Catalog("metadataSchema must not be empty".into()));
        }

        let quoted = self.dialect.quote_identifier(&self.metadata_schema);

        for (name, query) in self.metadata_queries.all_mut() {
            query.sql = query.sql.replace(METADATA_SCHEMA_TOKEN, &quoted);
            query.validate(name)?;
        }

        if let Some(ddl) = self.ddl.as_mut() {
            for statement in ddl.statements.iter_mut() {
                *statement = statement.replace(METADATA_SCHEMA_TOKEN, &quoted);
            }
        }

        self.metadata_schema_check.validate("metadata_schema_check")?;
        self.queries.tables.validate("tables")?;
        self.queries.columns.validate("columns")?;
        self.queries.foreign_keys.validate("foreign_keys")?;
        self.queries.constraints.validate("constraints")?;
        self.queries.indexes.validate("indexes")?;
        if let Some(recent) = &self.queries.recent_queries {
            recent.validate("recent_queries")?;
        }

        Ok(())
    }
}

fn load_embedded(json: &str) -> Result<Arc<DialectCatalog>, String> {
    DialectCatalog::from_json(json)
        .map(Arc::new)
        .map_err(|e| e.to_string())
}
