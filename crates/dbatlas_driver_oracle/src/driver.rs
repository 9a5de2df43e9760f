use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use dbatlas_core::{
    BoundParams, BoundStatement, ConnectionParams, DbDriver, DbError, Dialect, ExposeSecret,
    FormattedError, PoolSettings, PooledHandle, RawResult, RawRow, Value, mask_host,
};
use oracle::pool::{GetMode, Pool, PoolBuilder};
use oracle::sql_type::{FromSql, OracleType, ToSql};
use oracle::{Connection, Row};
use tokio::sync::mpsc;

use crate::cursor::{OracleCursor, RowSender, join_worker};

/// Rows read before deciding between a direct array and a streaming cursor.
const FETCH_BATCH: usize = 100;

pub struct OracleDriver;

impl OracleDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OracleDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DbDriver for OracleDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Oracle
    }

    async fn connect(
        &self,
        params: &ConnectionParams,
        pool: &PoolSettings,
    ) -> Result<Arc<dyn PooledHandle>, DbError> {
        let host = params.host.clone();
        let port = params.effective_port();
        let connect_string = connect_string(&host, port, params.database_or_service());

        log::info!(
            "[CONNECT] Opening Oracle pool at {}:{} as {} (service: {}, max: {})",
            mask_host(&host),
            port,
            params.user,
            params.database_or_service(),
            pool.max_size
        );

        let user = params.user.clone();
        let password = params.password.expose_secret().to_string();
        let max_size = pool.max_size.max(1);
        let acquire_timeout = pool.acquire_timeout;

        let oracle_pool = blocking(move || {
            PoolBuilder::new(user, password, connect_string)
                .max_connections(max_size)
                .get_mode(GetMode::TimedWait(acquire_timeout))
                .build()
        })
        .await?
        .map_err(|e| format_oracle_connect_error(&e, &host, port))?;

        let handle = OracleHandle {
            pool: RwLock::new(Some(Arc::new(oracle_pool))),
            host,
            port,
        };

        handle.ping().await?;

        log::info!("[POOL] Oracle pool ready");
        Ok(Arc::new(handle))
    }
}

/// Oracle session pool for one connection entry.
///
/// Statements run on Tokio's blocking pool. Small results come back as a
/// keyed array; anything larger than one fetch batch is streamed through an
/// `OracleCursor` that must be closed.
pub struct OracleHandle {
    pool: RwLock<Option<Arc<Pool>>>,
    host: String,
    port: u16,
}

impl OracleHandle {
    fn pool(&self) -> Result<Arc<Pool>, DbError> {
        read_or_recover(&self.pool)
            .clone()
            .ok_or_else(|| DbError::ConnectionFailed("handle closed".to_string()))
    }
}

#[async_trait]
impl PooledHandle for OracleHandle {
    fn dialect(&self) -> Dialect {
        Dialect::Oracle
    }

    async fn query_raw(&self, statement: &BoundStatement) -> Result<RawResult, DbError> {
        let pool = self.pool()?;
        let sql = statement.sql.clone();
        let params = statement.params.clone();
        let (host, port) = (self.host.clone(), self.port);

        let (tx, mut rx) = mpsc::channel(FETCH_BATCH);
        let worker = tokio::task::spawn_blocking(move || {
            if let Err(e) = stream_statement(&pool, &sql, &params, &tx, &host, port) {
                // The reader may already be gone; nothing left to report to.
                let _ = tx.blocking_send(Err(e));
            }
        });

        let mut first_batch = Vec::new();
        while first_batch.len() < FETCH_BATCH {
            match rx.recv().await {
                Some(Ok(row)) => first_batch.push(row),
                Some(Err(e)) => {
                    rx.close();
                    join_worker(worker).await?;
                    return Err(e);
                }
                None => {
                    join_worker(worker).await?;
                    return Ok(RawResult::DirectArray(first_batch));
                }
            }
        }

        log::debug!("[QUERY] Oracle result exceeds {} rows, streaming", FETCH_BATCH);
        Ok(RawResult::Cursor(Box::new(OracleCursor::new(
            first_batch,
            rx,
            worker,
        ))))
    }

    async fn ping(&self) -> Result<(), DbError> {
        let pool = self.pool()?;
        let (host, port) = (self.host.clone(), self.port);

        blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| format_oracle_connect_error(&e, &host, port))?;
            conn.ping().map_err(|e| format_oracle_query_error(&e))
        })
        .await?
    }

    async fn close(&self) -> Result<(), DbError> {
        if write_or_recover(&self.pool).take().is_some() {
            log::info!(
                "[POOL] Closed Oracle pool for {}:{}",
                mask_host(&self.host),
                self.port
            );
        }
        Ok(())
    }
}

/// Runs one statement on a pooled session and pushes its rows into `tx`.
///
/// Statements that return no result set (DDL, DML) send nothing. Fetching
/// stops once the receiver is closed.
fn stream_statement(
    pool: &Pool,
    sql: &str,
    params: &BoundParams,
    tx: &RowSender,
    host: &str,
    port: u16,
) -> Result<(), DbError> {
    let start = Instant::now();
    let mut conn: Connection = pool
        .get()
        .map_err(|e| format_oracle_connect_error(&e, host, port))?;
    conn.set_autocommit(true);

    let mut stmt = conn
        .statement(sql)
        .build()
        .map_err(|e| format_oracle_query_error(&e))?;

    match params {
        BoundParams::Positional(values) => {
            for (idx, value) in values.iter().enumerate() {
                let bind = to_bind(value);
                stmt.bind(idx + 1, bind.as_ref())
                    .map_err(|e| format_oracle_query_error(&e))?;
            }
        }
        BoundParams::Named(pairs) => {
            for (name, value) in pairs {
                let bind = to_bind(value);
                stmt.bind(name.as_str(), bind.as_ref())
                    .map_err(|e| format_oracle_query_error(&e))?;
            }
        }
    }

    if !stmt.is_query() {
        stmt.execute(&[]).map_err(|e| format_oracle_query_error(&e))?;
        log::debug!("[QUERY] Oracle statement executed in {:.2?}", start.elapsed());
        return Ok(());
    }

    let rows = stmt.query(&[]).map_err(|e| format_oracle_query_error(&e))?;
    let columns: Vec<(String, OracleType)> = rows
        .column_info()
        .iter()
        .map(|info| (info.name().to_string(), info.oracle_type().clone()))
        .collect();

    let mut fetched = 0usize;
    for row in rows {
        let row = row.map_err(|e| format_oracle_query_error(&e))?;
        let raw: RawRow = columns
            .iter()
            .enumerate()
            .map(|(idx, (name, ty))| (name.clone(), oracle_value_to_value(&row, idx, ty)))
            .collect();

        if tx.blocking_send(Ok(raw)).is_err() {
            log::debug!("[QUERY] Oracle cursor closed after {} rows", fetched);
            return Ok(());
        }
        fetched += 1;
    }

    log::debug!(
        "[QUERY] Oracle returned {} rows in {:.2?}",
        fetched,
        start.elapsed()
    );
    Ok(())
}

fn to_bind(value: &Value) -> Box<dyn ToSql> {
    match value {
        Value::Null => Box::new(None::<String>),
        Value::Bool(b) => Box::new(i64::from(*b)),
        Value::Int(i) => Box::new(*i),
        Value::Float(f) => Box::new(*f),
        Value::Text(s) | Value::Json(s) | Value::Decimal(s) => Box::new(s.clone()),
        Value::Bytes(bytes) => Box::new(bytes.clone()),
        Value::DateTime(dt) => Box::new(*dt),
        Value::Date(d) => Box::new(*d),
        Value::Time(_) | Value::Array(_) => Box::new(value.as_display_string()),
    }
}

fn oracle_value_to_value(row: &Row, idx: usize, ty: &OracleType) -> Value {
    let value = match ty {
        // NUMBER(p, 0) with up to 18 digits always fits an i64
        OracleType::Number(precision, 0) if (1..=18).contains(precision) => {
            get::<i64>(row, idx).map(|v| v.map(Value::Int))
        }
        OracleType::Number(..) | OracleType::Float(_) => get::<String>(row, idx).map(|v| v.map(Value::Decimal)),
        OracleType::BinaryFloat | OracleType::BinaryDouble => get::<f64>(row, idx).map(|v| v.map(Value::Float)),
        OracleType::Date | OracleType::Timestamp(_) => {
            get::<NaiveDateTime>(row, idx).map(|v| v.map(|naive| Value::DateTime(naive.and_utc())))
        }
        OracleType::TimestampTZ(_) | OracleType::TimestampLTZ(_) => {
            get::<DateTime<FixedOffset>>(row, idx)
                .map(|v| v.map(|dt| Value::DateTime(dt.with_timezone(&Utc))))
        }
        OracleType::Raw(_) | OracleType::LongRaw | OracleType::BLOB => {
            get::<Vec<u8>>(row, idx).map(|v| v.map(Value::Bytes))
        }
        OracleType::Boolean => get::<bool>(row, idx).map(|v| v.map(Value::Bool)),
        _ => get::<String>(row, idx).map(|v| v.map(Value::Text)),
    };

    match value {
        Ok(Some(value)) => value,
        Ok(None) => Value::Null,
        Err(e) => {
            log::debug!(
                "[QUERY] Oracle column {} ({}) fell back to text: {}",
                idx,
                ty,
                e
            );
            get::<String>(row, idx)
                .ok()
                .flatten()
                .map(Value::Text)
                .unwrap_or(Value::Null)
        }
    }
}

fn get<T: FromSql>(row: &Row, idx: usize) -> oracle::Result<Option<T>> {
    row.get::<usize, Option<T>>(idx)
}

async fn blocking<T, F>(work: F) -> Result<T, DbError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| DbError::QueryFailed(format!("Oracle worker failed: {}", e)))
}

fn connect_string(host: &str, port: u16, service: &str) -> String {
    format!("//{}:{}/{}", host, port, service)
}

/// Splits `ORA-00942: table or view does not exist` into code and message.
fn split_ora_message(raw: &str) -> (Option<&str>, &str) {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find("ORA-") else {
        return (None, trimmed);
    };

    let rest = &trimmed[start..];
    match rest.split_once(':') {
        Some((code, message)) if code.len() == 9 => (Some(code), message.trim()),
        _ => (None, trimmed),
    }
}

fn format_oracle_connect_error(e: &oracle::Error, host: &str, port: u16) -> DbError {
    let raw = e.to_string();
    let (code, message) = split_ora_message(&raw);

    let error = match code {
        Some("ORA-12541") | Some("ORA-12545") => DbError::ConnectionFailed(format!(
            "No listener at {}:{}. Is Oracle running?",
            mask_host(host),
            port
        )),
        Some("ORA-01017") => DbError::ConnectionFailed(
            "Invalid username or password.".to_string(),
        ),
        Some("ORA-12514") => DbError::ConnectionFailed(
            "The listener does not know the requested service name.".to_string(),
        ),
        Some("ORA-12170") => DbError::Timeout,
        Some(code) => FormattedError::new(message)
            .with_code(code)
            .into_connection_error(),
        None => DbError::ConnectionFailed(raw.clone()),
    };

    log::error!("[CONNECT] Oracle connection failed: {}", error);
    error
}

fn format_oracle_query_error(e: &oracle::Error) -> DbError {
    let raw = e.to_string();
    let (code, message) = split_ora_message(&raw);

    let error = match code {
        Some("ORA-01013") => DbError::QueryFailed("Query cancelled.".to_string()),
        Some(code) => FormattedError::new(message).with_code(code).into_query_error(),
        None => DbError::QueryFailed(raw.clone()),
    };

    log::error!("[QUERY] Oracle query failed: {}", error);
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
