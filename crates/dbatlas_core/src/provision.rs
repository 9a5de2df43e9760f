use crate::binding::{BoundStatement, sql_preview};
use crate::catalog::DialectCatalog;
use crate::handle::PooledHandle;
use crate::DbError;

/// Creates the metadata schema and its eleven tables.
///
/// Runs the catalog's DDL statements in order and stops at the first
/// failure. Statements are idempotent (`IF NOT EXISTS`), so running this
/// against an existing schema is harmless. Returns how many statements ran.
pub async fn provision_metadata_schema(
    handle: &dyn PooledHandle,
    catalog: &DialectCatalog,
) -> Result<usize, DbError> {
    let ddl = catalog.ddl.as_ref().ok_or_else(|| {
        DbError::NotSupported(format!(
            "the {} catalog has no metadata schema DDL",
            catalog.dialect
        ))
    })?;

    for (i, statement) in ddl.statements.iter().enumerate() {
        log::debug!("[SCHEMA] DDL {}/{}: {}", i + 1, ddl.statements.len(), sql_preview(statement));

        handle
            .query(&BoundStatement::plain(statement.as_str()))
            .await
            .map_err(|e| {
                log::error!("[SCHEMA] Metadata schema DDL failed at statement {}: {}", i + 1, e);
                e
            })?;
    }

    log::info!(
        "[SCHEMA] Provisioned metadata schema '{}' ({} statements)",
        catalog.metadata_schema,
        ddl.statements.len()
    );

    Ok(ddl.statements.len())
}
