use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use async_trait::async_trait;
use bb8::{Pool, RunError};
use bb8_postgres::PostgresConnectionManager;
use dbatlas_core::{
    BoundStatement, ColumnMeta, ConnectionParams, DbDriver, DbError, Dialect, ErrorLocation,
    ExposeSecret, FormattedError, PoolSettings, PooledHandle, RawResult, Value, mask_host,
};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Config, NoTls};

type PgPool = Pool<PostgresConnectionManager<NoTls>>;

pub struct PostgresDriver;

impl PostgresDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PostgresDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DbDriver for PostgresDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn connect(
        &self,
        params: &ConnectionParams,
        pool: &PoolSettings,
    ) -> Result<Arc<dyn PooledHandle>, DbError> {
        let host = params.host.clone();
        let port = params.effective_port();

        log::info!(
            "[CONNECT] Opening PostgreSQL pool at {}:{} as {} (database: {}, max: {})",
            mask_host(&host),
            port,
            params.user,
            params.database,
            pool.max_size
        );

        let mut config = Config::new();
        config
            .host(&host)
            .port(port)
            .user(&params.user)
            .password(params.password.expose_secret())
            .dbname(&params.database)
            .application_name("dbatlas")
            .connect_timeout(pool.acquire_timeout);

        let manager = PostgresConnectionManager::new(config, NoTls);
        let pg_pool = Pool::builder()
            .max_size(pool.max_size.max(1))
            .connection_timeout(pool.acquire_timeout)
            .build(manager)
            .await
            .map_err(|e| format_pg_connect_error(&e, &host, port))?;

        let handle = PostgresHandle {
            pool: RwLock::new(Some(pg_pool)),
            host,
            port,
        };

        // Building the pool does not open a connection; make sure one works.
        handle.ping().await?;

        log::info!("[POOL] PostgreSQL pool ready");
        Ok(Arc::new(handle))
    }
}

/// Pooled PostgreSQL connections for one connection entry.
pub struct PostgresHandle {
    pool: RwLock<Option<PgPool>>,
    host: String,
    port: u16,
}

impl PostgresHandle {
    fn pool(&self) -> Result<PgPool, DbError> {
        read_or_recover(&self.pool)
            .clone()
            .ok_or_else(|| DbError::ConnectionFailed("handle closed".to_string()))
    }

    fn pool_error(&self, e: RunError<tokio_postgres::Error>) -> DbError {
        match e {
            RunError::User(e) => format_pg_connect_error(&e, &self.host, self.port),
            RunError::TimedOut => {
                log::warn!("[POOL] Timed out waiting for a PostgreSQL connection");
                DbError::Timeout
            }
        }
    }
}

#[async_trait]
impl PooledHandle for PostgresHandle {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn query_raw(&self, statement: &BoundStatement) -> Result<RawResult, DbError> {
        let start = Instant::now();
        let values = statement.positional()?;

        let pool = self.pool()?;
        let conn = pool.get().await.map_err(|e| self.pool_error(e))?;

        let prepared = conn
            .prepare(&statement.sql)
            .await
            .map_err(|e| format_pg_error(&e))?;

        if prepared.params().len() != values.len() {
            return Err(DbError::invalid_params(format!(
                "statement expects {} parameters, {} bound",
                prepared.params().len(),
                values.len()
            )));
        }

        let params: Vec<Box<dyn ToSql + Sync + Send>> = values
            .iter()
            .zip(prepared.params())
            .map(|(value, ty)| value_to_param(value, ty))
            .collect();
        let param_refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let rows = conn
            .query(&prepared, &param_refs)
            .await
            .map_err(|e| format_pg_error(&e))?;

        let columns: Vec<ColumnMeta> = prepared
            .columns()
            .iter()
            .map(|col| ColumnMeta {
                name: col.name().to_string(),
                type_name: col.type_().name().to_string(),
                nullable: true,
            })
            .collect();

        let result_rows: Vec<Vec<Value>> = rows
            .iter()
            .map(|row| {
                (0..columns.len())
                    .map(|i| postgres_value_to_value(row, i))
                    .collect()
            })
            .collect();

        log::debug!(
            "[QUERY] PostgreSQL returned {} rows in {:.2?}",
            result_rows.len(),
            start.elapsed()
        );

        Ok(RawResult::RowsObject {
            columns,
            rows: result_rows,
        })
    }

    async fn ping(&self) -> Result<(), DbError> {
        let pool = self.pool()?;
        let conn = pool.get().await.map_err(|e| self.pool_error(e))?;

        conn.simple_query("SELECT 1")
            .await
            .map_err(|e| format_pg_error(&e))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), DbError> {
        // Connections close as the last pool clone drops; checked-out ones
        // finish their current statement first.
        if write_or_recover(&self.pool).take().is_some() {
            log::info!(
                "[POOL] Closed PostgreSQL pool for {}:{}",
                mask_host(&self.host),
                self.port
            );
        }
        Ok(())
    }
}

/// Converts a bound value for the type PostgreSQL inferred for its placeholder.
fn value_to_param(value: &Value, ty: &Type) -> Box<dyn ToSql + Sync + Send> {
    match ty.name() {
        "bool" => Box::new(if value.is_null() {
            None
        } else {
            Some(value.as_flag())
        }),
        "int2" => Box::new(value.as_i64().and_then(|v| i16::try_from(v).ok())),
        "int4" => Box::new(value.as_i64().and_then(|v| i32::try_from(v).ok())),
        "int8" => Box::new(value.as_i64()),
        "float4" => Box::new(value.as_f64().map(|v| v as f32)),
        "float8" => Box::new(value.as_f64()),
        "bytea" => Box::new(match value {
            Value::Bytes(bytes) => Some(bytes.clone()),
            _ => None,
        }),
        _ => Box::new(if value.is_null() {
            None
        } else {
            Some(value.as_display_string())
        }),
    }
}

fn postgres_value_to_value(row: &tokio_postgres::Row, idx: usize) -> Value {
    let col_type = row.columns()[idx].type_();

    match col_type.name() {
        "bool" => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        "int2" => row
            .try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),
        "int4" => row
            .try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),
        "int8" => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),
        "oid" => row
            .try_get::<_, Option<u32>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),
        "float4" => row
            .try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Float(v as f64))
            .unwrap_or(Value::Null),
        "float8" => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),
        "bytea" => row
            .try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),
        "json" | "jsonb" => row
            .try_get::<_, Option<serde_json::Value>>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Json(v.to_string()))
            .unwrap_or(Value::Null),
        "timestamptz" => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .ok()
            .flatten()
            .map(Value::DateTime)
            .unwrap_or(Value::Null),
        "timestamp" => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map(|naive| Value::DateTime(naive.and_utc()))
            .unwrap_or(Value::Null),
        "date" => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .ok()
            .flatten()
            .map(Value::Date)
            .unwrap_or(Value::Null),
        "time" => row
            .try_get::<_, Option<chrono::NaiveTime>>(idx)
            .ok()
            .flatten()
            .map(Value::Time)
            .unwrap_or(Value::Null),
        "_text" | "_name" | "_varchar" => row
            .try_get::<_, Option<Vec<Option<String>>>>(idx)
            .ok()
            .flatten()
            .map(|items| Value::Array(items.into_iter().map(Value::from).collect()))
            .unwrap_or(Value::Null),
        other => match row.try_get::<_, Option<String>>(idx) {
            Ok(Some(text)) => Value::Text(text),
            Ok(None) => Value::Null,
            Err(_) => {
                log::debug!(
                    "[QUERY] No conversion for PostgreSQL type '{}'; cast it to text in the query",
                    other
                );
                Value::Null
            }
        },
    }
}

fn format_pg_error(e: &tokio_postgres::Error) -> DbError {
    if let Some(db_error) = e.as_db_error() {
        let mut formatted =
            FormattedError::new(db_error.message()).with_code(db_error.code().code());

        if let Some(detail) = db_error.detail() {
            formatted = formatted.with_detail(detail);
        }
        if let Some(hint) = db_error.hint() {
            formatted = formatted.with_hint(hint);
        }

        let location = ErrorLocation::new()
            .with_schema(db_error.schema())
            .with_table(db_error.table())
            .with_column(db_error.column())
            .with_constraint(db_error.constraint());

        let error = formatted.with_location(location).into_query_error();
        log::error!("[QUERY] PostgreSQL query failed: {}", error);
        return error;
    }

    if e.is_closed() {
        return DbError::ConnectionFailed(format!("PostgreSQL connection closed: {}", e));
    }

    DbError::QueryFailed(e.to_string())
}

fn format_pg_connect_error(e: &tokio_postgres::Error, host: &str, port: u16) -> DbError {
    let msg = e.to_string();
    let source = std::error::Error::source(e)
        .map(|s| s.to_string())
        .unwrap_or_default();

    let error = if msg.contains("Connection refused") || source.contains("Connection refused") {
        DbError::ConnectionFailed(format!(
            "Connection refused at {}:{}. Is PostgreSQL running?",
            mask_host(host),
            port
        ))
    } else if let Some(db_error) = e.as_db_error() {
        match db_error.code().code() {
            "28P01" | "28000" => DbError::ConnectionFailed(
                "Authentication failed. Check username and password.".to_string(),
            ),
            "3D000" => DbError::ConnectionFailed("Database does not exist.".to_string()),
            _ => FormattedError::new(db_error.message())
                .with_code(db_error.code().code())
                .into_connection_error(),
        }
    } else if msg.contains("timed out") || source.contains("timed out") {
        DbError::ConnectionFailed(format!(
            "Timed out connecting to {}:{}",
            mask_host(host),
            port
        ))
    } else if source.is_empty() {
        DbError::ConnectionFailed(msg)
    } else {
        DbError::ConnectionFailed(format!("{}: {}", msg, source))
    };

    log::error!("[CONNECT] PostgreSQL connection failed: {}", error);
    error
}

fn read_or_recover<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poison_err) => {
            log::warn!("[CLEANUP] Recovering from poisoned pool lock");
            poison_err.into_inner()
        }
    }
}

fn write_or_recover<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poison_err) => {
            log::warn!("[CLEANUP] Recovering from poisoned pool lock");
            poison_err.into_inner()
        }
    }
}
