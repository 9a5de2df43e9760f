use dbatlas_core::{ConnectionParams, Dialect, DialectCatalog, RawRow, Value};
use serde_json::json;

/// SQL fragments of `sentinel_catalog`, for scripting a `FakeDriver`.
pub mod sql {
    pub const TABLES: &str = "catalog_tables";
    pub const COLUMNS: &str = "catalog_columns";
    pub const FOREIGN_KEYS: &str = "catalog_foreign_keys";
    pub const CONSTRAINTS: &str = "catalog_constraints";
    pub const INDEXES: &str = "catalog_indexes";
    pub const RECENT_QUERIES: &str = "catalog_recent_queries";
    pub const METADATA_SCHEMA_CHECK: &str = "meta_schema_check";

    /// Fragment of the metadata query for one collection.
    pub fn metadata(collection: &str) -> String {
        format!("meta_{}", collection)
    }
}

pub fn row(pairs: &[(&str, Value)]) -> RawRow {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

/// Same row with upper-cased column names, the way Oracle reports them.
pub fn upper_case(row: RawRow) -> RawRow {
    row.iter()
        .map(|(name, value)| (name.to_ascii_uppercase(), value.clone()))
        .collect()
}

pub fn table_row(schema: &str, name: &str) -> RawRow {
    row(&[
        ("table_schema", Value::text(schema)),
        ("table_name", Value::text(name)),
        ("table_comment", Value::Null),
    ])
}

pub fn column_row(name: &str, data_type: &str, nullable: bool, primary_key: bool) -> RawRow {
    row(&[
        ("column_name", Value::text(name)),
        ("data_type", Value::text(data_type)),
        ("is_nullable", Value::text(if nullable { "YES" } else { "NO" })),
        ("column_default", Value::Null),
        ("is_primary_key", Value::Bool(primary_key)),
        ("column_comment", Value::Null),
    ])
}

pub fn foreign_key_row(
    constraint: &str,
    column: &str,
    referenced_schema: &str,
    referenced_table: &str,
    referenced_column: &str,
) -> RawRow {
    row(&[
        ("constraint_name", Value::text(constraint)),
        ("column_name", Value::text(column)),
        ("referenced_schema", Value::text(referenced_schema)),
        ("referenced_table", Value::text(referenced_table)),
        ("referenced_column", Value::text(referenced_column)),
    ])
}

pub fn constraint_row(name: &str, kind: &str, column: Option<&str>) -> RawRow {
    row(&[
        ("constraint_name", Value::text(name)),
        ("constraint_type", Value::text(kind)),
        ("column_name", Value::from(column)),
        ("definition", Value::Null),
    ])
}

pub fn index_row(name: &str, column: &str, unique: bool, method: &str) -> RawRow {
    row(&[
        ("index_name", Value::text(name)),
        ("column_name", Value::text(column)),
        ("is_unique", Value::Bool(unique)),
        ("index_method", Value::text(method)),
    ])
}

pub fn recent_query_row(text: &str, calls: i64, avg_latency_ms: f64) -> RawRow {
    row(&[
        ("query_text", Value::text(text)),
        ("calls", Value::Int(calls)),
        ("avg_latency_ms", Value::Float(avg_latency_ms)),
    ])
}

pub fn glossary_term_row(term: &str, definition: &str) -> RawRow {
    row(&[
        ("term", Value::text(term)),
        ("definition", Value::text(definition)),
        ("sql_expression", Value::Null),
    ])
}

pub fn code_table_row(code_table: &str, code_column: &str, label_column: &str) -> RawRow {
    row(&[
        ("code_table", Value::text(code_table)),
        ("code_column", Value::text(code_column)),
        ("label_column", Value::text(label_column)),
        ("description", Value::Null),
    ])
}

/// Parameters for a fake tenant; `database` makes them distinct.
pub fn params(dialect: Dialect, database: &str) -> ConnectionParams {
    ConnectionParams::new(dialect, "db.internal", "atlas", database).with_password("secret")
}

/// A catalog with short, distinct SQL per query (see [`sql`]), shaped like
/// the embedded ones.
pub fn sentinel_catalog(dialect: Dialect) -> DialectCatalog {
    let excluded = match dialect {
        Dialect::Postgres => json!(["pg_catalog", "information_schema", "pg_temp_*"]),
        Dialect::Mysql => json!(["information_schema", "mysql", "performance_schema", "sys"]),
        Dialect::Oracle => json!(["SYS", "SYSTEM"]),
    };

    let per_table = |fragment: &str| {
        json!({
            "sql": format!("SELECT * FROM {} WHERE s = :schema AND t = :table", fragment),
            "params": ["schema", "table"]
        })
    };

    let mut metadata_queries = serde_json::Map::new();
    for collection in DialectCatalog::metadata_query_names() {
        metadata_queries.insert(
            camel_case(collection),
            json!({
                "sql": format!("SELECT * FROM {{metadata_schema}}.{}", sql::metadata(collection)),
                "params": []
            }),
        );
    }

    let catalog = json!({
        "dialect": dialect.as_str(),
        "excludedSchemas": excluded,
        "queries": {
            "tables": {
                "sql": format!("SELECT * FROM {} WHERE scope = :database", sql::TABLES),
                "params": ["database"]
            },
            "columns": per_table(sql::COLUMNS),
            "foreignKeys": per_table(sql::FOREIGN_KEYS),
            "constraints": per_table(sql::CONSTRAINTS),
            "indexes": per_table(sql::INDEXES),
            "recentQueries": {
                "sql": format!("SELECT * FROM {}", sql::RECENT_QUERIES),
                "params": [],
                "optional": true
            }
        },
        "metadataSchema": "dbatlas_meta",
        "metadataSchemaCheck": {
            "sql": format!("SELECT 1 FROM {} WHERE name = :schema", sql::METADATA_SCHEMA_CHECK),
            "params": ["schema"]
        },
        "metadataQueries": metadata_queries,
        "ddl": {
            "statements": [
                "CREATE SCHEMA {metadata_schema}",
                "CREATE TABLE {metadata_schema}.meta_glossary_terms (term TEXT)"
            ]
        }
    });

    match DialectCatalog::from_json(&catalog.to_string()) {
        Ok(catalog) => catalog,
        Err(e) => panic!("sentinel catalog should be valid: {e}"),
    }
}

fn camel_case(snake: &str) -> String {
    let mut out = String::with_capacity(snake.len());
    let mut upper = false;
    for ch in snake.chars() {
        if ch == '_' {
            upper = true;
        } else if upper {
            out.push(ch.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}
