use crate::binding::{BoundStatement, NamedParams, bind_named};
use crate::params::{ConnectionParams, Dialect};
use crate::row::{RawResult, RawRow, normalize};
use crate::DbError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Pool sizing handed to a driver when it opens a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_size: u32,
    /// Upper bound on waiting for a pooled connection, including the first
    /// connect.
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Factory for pooled handles.
///
/// Implementations are registered on the `ConnectionManager` by dialect.
/// Each engine (PostgreSQL, MySQL, Oracle) provides its own driver crate.
#[async_trait]
pub trait DbDriver: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Open a pool for `params` and verify it can reach the server.
    async fn connect(
        &self,
        params: &ConnectionParams,
        pool: &PoolSettings,
    ) -> Result<Arc<dyn PooledHandle>, DbError>;
}

/// A pool of connections to one database, shared by every caller of one
/// connection entry.
///
/// Drivers only implement `query_raw`, returning whatever result shape is
/// natural for them; `query` normalizes it.
#[async_trait]
pub trait PooledHandle: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Execute one statement and return the driver's native result shape.
    async fn query_raw(&self, statement: &BoundStatement) -> Result<RawResult, DbError>;

    async fn query(&self, statement: &BoundStatement) -> Result<Vec<RawRow>, DbError> {
        let raw = self.query_raw(statement).await?;
        normalize(raw).await
    }

    /// Bind `:name` placeholders for this dialect, then query.
    async fn query_named(&self, sql: &str, params: &NamedParams) -> Result<Vec<RawRow>, DbError> {
        let statement = bind_named(sql, params, self.dialect().placeholder_style())?;
        self.query(&statement).await
    }

    /// Check that a pooled connection can still reach the server.
    async fn ping(&self) -> Result<(), DbError>;

    /// Release every pooled connection. Later queries fail.
    async fn close(&self) -> Result<(), DbError>;
}
