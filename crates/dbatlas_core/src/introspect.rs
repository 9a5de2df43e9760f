use crate::binding::{NamedParams, bind_named, sql_preview};
use crate::catalog::{DialectCatalog, QueryDef};
use crate::fields::FieldAliases;
use crate::handle::PooledHandle;
use crate::params::{Dialect, IdentifierCase};
use crate::schema::{
    ColumnInfo, ColumnReference, ConstraintKind, IndexInfo, RecentQuery, SchemaInfo, SkippedTable,
    TableInfo,
};
use crate::schema_builder::{ConstraintBuilder, ForeignKeyBuilder, IndexBuilder};
use crate::{DbError, RawRow};
use std::time::Instant;

/// Runs one catalog query against a handle.
///
/// Only the parameters the query declares are bound. When the query is
/// optional, an execution failure is logged and reported as no rows.
pub async fn run_catalog_query(
    handle: &dyn PooledHandle,
    name: &str,
    query: &QueryDef,
    params: &NamedParams,
) -> Result<Vec<RawRow>, DbError> {
    let statement = bind_named(
        &query.sql,
        &params.subset(&query.params),
        handle.dialect().placeholder_style(),
    )?;

    log::debug!(
        "[QUERY] {} {} params={}",
        name,
        sql_preview(&statement.sql),
        statement.masked_params()
    );

    match handle.query(&statement).await {
        Ok(rows) => Ok(rows),
        Err(e) if query.optional => {
            log::warn!("[QUERY] Optional query '{}' failed, using no rows: {}", name, e);
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

/// Builds the canonical schema description for the database behind `handle`.
///
/// `target_database` narrows the table listing: a database name on MySQL, an
/// owner on Oracle, a schema on PostgreSQL. When absent, MySQL and Oracle
/// fall back to the connection's current database or schema, while
/// PostgreSQL lists every schema that is not excluded.
///
/// Tables come back in catalog order. A failure of the table listing aborts
/// the call; a transient failure of one table's queries moves that table to
/// `skipped_tables` and extraction continues.
pub async fn extract_schema(
    handle: &dyn PooledHandle,
    catalog: &DialectCatalog,
    target_database: Option<&str>,
) -> Result<SchemaInfo, DbError> {
    let started = Instant::now();
    let dialect = catalog.dialect;
    let queries = &catalog.queries;

    let scope = NamedParams::new().with(
        "database",
        target_database.map(|db| scope_identifier(dialect, db)),
    );

    let table_rows = run_catalog_query(handle, "tables", &queries.tables, &scope).await?;
    let aliases = FieldAliases::for_dialect(dialect).with_mapping(&queries.tables.result_mapping);

    let mut info = SchemaInfo::default();
    let mut excluded = 0usize;

    for row in &table_rows {
        let Some(name) = aliases.non_empty_text(row, "table_name") else {
            log::warn!("[SCHEMA] Table row without a name, ignoring");
            continue;
        };
        let schema = aliases.non_empty_text(row, "table_schema");

        if let Some(owner) = &schema
            && catalog.is_excluded(owner)
        {
            excluded += 1;
            continue;
        }

        let comment = aliases.non_empty_text(row, "table_comment");

        match extract_table(handle, catalog, &scope, schema.clone(), name.clone(), comment).await {
            Ok(table) => info.tables.push(table),
            Err(e) if e.is_transient() => {
                log::warn!(
                    "[SCHEMA] Skipping table {}: {}",
                    qualified(schema.as_deref(), &name),
                    e
                );
                info.skipped_tables.push(SkippedTable {
                    schema,
                    name,
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }

    if let Some(recent) = &queries.recent_queries {
        let rows = run_catalog_query(handle, "recent_queries", recent, &scope).await?;
        info.recent_queries = Some(map_recent_queries(dialect, recent, &rows));
    }

    log::info!(
        "[SCHEMA] Extracted {} tables ({} excluded, {} skipped) in {:.2?}",
        info.tables.len(),
        excluded,
        info.skipped_tables.len(),
        started.elapsed()
    );

    Ok(info)
}

async fn extract_table(
    handle: &dyn PooledHandle,
    catalog: &DialectCatalog,
    scope: &NamedParams,
    schema: Option<String>,
    name: String,
    comment: Option<String>,
) -> Result<TableInfo, DbError> {
    let dialect = catalog.dialect;
    let queries = &catalog.queries;

    let params = scope
        .clone()
        .with(
            "schema",
            schema.as_deref().map(|s| scope_identifier(dialect, s)),
        )
        .with("table", scope_identifier(dialect, &name));

    let (column_rows, fk_rows, constraint_rows, index_rows) = futures::try_join!(
        run_catalog_query(handle, "columns", &queries.columns, &params),
        run_catalog_query(handle, "foreign_keys", &queries.foreign_keys, &params),
        run_catalog_query(handle, "constraints", &queries.constraints, &params),
        run_catalog_query(handle, "indexes", &queries.indexes, &params),
    )?;

    let mut columns = map_columns(dialect, &queries.columns, &column_rows);

    let constraints = map_constraints(dialect, &queries.constraints, &constraint_rows);
    let primary_keys = constraints.primary_key_columns();
    for column in columns.iter_mut() {
        if primary_keys.contains(&column.name) {
            column.is_primary_key = true;
        }
    }

    let foreign_keys = map_foreign_keys(dialect, &queries.foreign_keys, &fk_rows);
    let unmatched = foreign_keys.apply(&mut columns);
    if !unmatched.is_empty() {
        log::debug!(
            "[SCHEMA] {}: foreign key columns not in column list: {:?}",
            qualified(schema.as_deref(), &name),
            unmatched
        );
    }

    Ok(TableInfo {
        schema,
        name,
        comment,
        columns,
        constraints: constraints.build(),
        indexes: map_indexes(dialect, &queries.indexes, &index_rows),
    })
}

/// Oracle stores unquoted identifiers upper-cased; other dialects take the
/// name as given.
fn scope_identifier(dialect: Dialect, identifier: &str) -> String {
    match dialect.identifier_case() {
        IdentifierCase::Upper => IdentifierCase::Upper.apply(identifier),
        IdentifierCase::Lower => identifier.to_string(),
    }
}

fn qualified(schema: Option<&str>, name: &str) -> String {
    match schema {
        Some(schema) => format!("{}.{}", schema, name),
        None => name.to_string(),
    }
}

fn map_columns(dialect: Dialect, query: &QueryDef, rows: &[RawRow]) -> Vec<ColumnInfo> {
    let aliases = FieldAliases::for_dialect(dialect).with_mapping(&query.result_mapping);

    rows.iter()
        .filter_map(|row| {
            let name = aliases.non_empty_text(row, "column_name")?;
            Some(ColumnInfo {
                name,
                data_type: aliases.text(row, "data_type").unwrap_or_default(),
                nullable: aliases.flag(row, "is_nullable"),
                default_value: aliases.text(row, "column_default"),
                is_primary_key: aliases.flag(row, "is_primary_key"),
                is_foreign_key: false,
                reference: None,
                comment: aliases.non_empty_text(row, "column_comment"),
            })
        })
        .collect()
}

fn map_foreign_keys(dialect: Dialect, query: &QueryDef, rows: &[RawRow]) -> ForeignKeyBuilder {
    let aliases = FieldAliases::for_dialect(dialect).with_mapping(&query.result_mapping);
    let mut builder = ForeignKeyBuilder::new();

    for row in rows {
        let (Some(column), Some(table), Some(target)) = (
            aliases.non_empty_text(row, "column_name"),
            aliases.non_empty_text(row, "referenced_table"),
            aliases.non_empty_text(row, "referenced_column"),
        ) else {
            continue;
        };

        builder.add_column(
            column,
            ColumnReference {
                schema: aliases.non_empty_text(row, "referenced_schema"),
                table,
                column: target,
            },
        );
    }

    builder
}

fn map_constraints(dialect: Dialect, query: &QueryDef, rows: &[RawRow]) -> ConstraintBuilder {
    let aliases = FieldAliases::for_dialect(dialect).with_mapping(&query.result_mapping);
    let mut builder = ConstraintBuilder::new();

    for row in rows {
        let Some(name) = aliases.non_empty_text(row, "constraint_name") else {
            continue;
        };
        let raw_kind = aliases.text(row, "constraint_type").unwrap_or_default();
        let Some(kind) = ConstraintKind::parse(&raw_kind) else {
            log::debug!("[SCHEMA] Ignoring constraint {} of type '{}'", name, raw_kind);
            continue;
        };

        builder.add_column(
            name,
            kind,
            aliases.non_empty_text(row, "column_name"),
            aliases.non_empty_text(row, "definition"),
        );
    }

    builder
}

fn map_indexes(dialect: Dialect, query: &QueryDef, rows: &[RawRow]) -> Vec<IndexInfo> {
    let aliases = FieldAliases::for_dialect(dialect).with_mapping(&query.result_mapping);
    let mut builder = IndexBuilder::new();

    for row in rows {
        let Some(name) = aliases.non_empty_text(row, "index_name") else {
            continue;
        };

        builder.add_column(
            name,
            aliases.non_empty_text(row, "column_name"),
            aliases.flag(row, "is_unique"),
            aliases.non_empty_text(row, "index_method"),
        );
    }

    builder.build()
}

fn map_recent_queries(dialect: Dialect, query: &QueryDef, rows: &[RawRow]) -> Vec<RecentQuery> {
    let aliases = FieldAliases::for_dialect(dialect).with_mapping(&query.result_mapping);

    rows.iter()
        .filter_map(|row| {
            Some(RecentQuery {
                query_text: aliases.non_empty_text(row, "query_text")?,
                calls: aliases.int(row, "calls").unwrap_or(0),
                avg_latency_ms: aliases.float(row, "avg_latency_ms").unwrap_or(0.0),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    #[test]
    fn oracle_scope_is_upper_cased() {
        assert_eq!(scope_identifier(Dialect::Oracle, "hr"), "HR");
        assert_eq!(scope_identifier(Dialect::Mysql, "Shop"), "Shop");
        assert_eq!(scope_identifier(Dialect::Postgres, "public"), "public");
    }

    #[test]
    fn columns_read_through_either_case() {
        let query = QueryDef {
            sql: "SELECT 1".into(),
            params: Vec::new(),
            optional: false,
            result_mapping: Default::default(),
        };
        let rows = vec![
            RawRow::new()
                .with("COLUMN_NAME", "ID")
                .with("DATA_TYPE", "NUMBER")
                .with("IS_NULLABLE", "N")
                .with("IS_PRIMARY_KEY", "Y"),
            RawRow::new()
                .with("column_name", "NOTE")
                .with("data_type", "VARCHAR2")
                .with("is_nullable", "Y")
                .with("column_comment", "   "),
        ];

        let columns = map_columns(Dialect::Oracle, &query, &rows);
        assert_eq!(columns.len(), 2);
        assert!(columns[0].is_primary_key);
        assert!(!columns[0].nullable);
        assert!(columns[1].nullable);
        assert_eq!(columns[1].comment, None);
    }

    #[test]
    fn recent_queries_use_result_mapping() {
        let query = QueryDef {
            sql: "SELECT 1".into(),
            params: Vec::new(),
            optional: true,
            result_mapping: [("query_text".to_string(), "SQL_TEXT".to_string())]
                .into_iter()
                .collect(),
        };
        let rows = vec![
            RawRow::new()
                .with("SQL_TEXT", "SELECT * FROM orders")
                .with("CALLS", Value::Int(12))
                .with("AVG_LATENCY_MS", Value::Decimal("1.5".into())),
            RawRow::new().with("CALLS", Value::Int(3)),
        ];

        let recent = map_recent_queries(Dialect::Oracle, &query, &rows);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].calls, 12);
        assert_eq!(recent[0].avg_latency_ms, 1.5);
    }
}
