use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use async_trait::async_trait;
use dbatlas_core::{
    BoundStatement, ConnectionParams, DbDriver, DbError, Dialect, ExposeSecret, FormattedError,
    PoolSettings, PooledHandle, RawResult, Value, mask_host,
};
use mysql::consts::ColumnType;
use mysql::prelude::*;
use mysql::{OptsBuilder, Pool, PoolConstraints, PoolOpts};

/// Character set id MySQL reports for binary strings.
const BINARY_CHARSET: u16 = 63;

pub struct MysqlDriver;

impl MysqlDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MysqlDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DbDriver for MysqlDriver {
    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    async fn connect(
        &self,
        params: &ConnectionParams,
        pool: &PoolSettings,
    ) -> Result<Arc<dyn PooledHandle>, DbError> {
        let host = params.host.clone();
        let port = params.effective_port();

        log::info!(
            "[CONNECT] Opening MySQL pool at {}:{} as {} (database: {:?}, max: {})",
            mask_host(&host),
            port,
            params.user,
            params.database,
            pool.max_size
        );

        let constraints =
            PoolConstraints::new(0, pool.max_size.max(1) as usize).unwrap_or_default();

        let database = (!params.database.trim().is_empty()).then(|| params.database.clone());
        let opts = OptsBuilder::new()
            .ip_or_hostname(Some(host.clone()))
            .tcp_port(port)
            .user(Some(params.user.clone()))
            .pass(Some(params.password.expose_secret().to_string()))
            .db_name(database)
            .tcp_connect_timeout(Some(pool.acquire_timeout))
            .pool_opts(PoolOpts::default().with_constraints(constraints));

        let mysql_pool = blocking(move || Pool::new(opts))
            .await?
            .map_err(|e| format_mysql_error(&e, &host, port))?;

        let handle = MysqlHandle {
            pool: RwLock::new(Some(mysql_pool)),
            host,
            port,
        };

        handle.ping().await?;

        log::info!("[POOL] MySQL pool ready");
        Ok(Arc::new(handle))
    }
}

/// Pooled MySQL connections for one connection entry.
///
/// The `mysql` crate is blocking; every round trip runs on Tokio's blocking
/// pool.
pub struct MysqlHandle {
    pool: RwLock<Option<Pool>>,
    host: String,
    port: u16,
}

impl MysqlHandle {
    fn pool(&self) -> Result<Pool, DbError> {
        read_or_recover(&self.pool)
            .clone()
            .ok_or_else(|| DbError::ConnectionFailed("handle closed".to_string()))
    }
}

#[async_trait]
impl PooledHandle for MysqlHandle {
    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    async fn query_raw(&self, statement: &BoundStatement) -> Result<RawResult, DbError> {
        let pool = self.pool()?;
        let sql = statement.sql.clone();
        let values: Vec<mysql::Value> = statement
            .positional()?
            .iter()
            .map(value_to_mysql_value)
            .collect();
        let (host, port) = (self.host.clone(), self.port);

        blocking(move || {
            let start = Instant::now();
            let mut conn = pool
                .get_conn()
                .map_err(|e| format_mysql_error(&e, &host, port))?;

            // Parameterless statements use the text protocol, which also
            // accepts statements the server refuses to prepare.
            let (columns, rows) = if values.is_empty() {
                let mut result = conn
                    .query_iter(sql.as_str())
                    .map_err(|e| format_mysql_query_error(&e))?;
                let columns = result.columns().as_ref().to_vec();
                let rows = result
                    .by_ref()
                    .collect::<Result<Vec<mysql::Row>, _>>()
                    .map_err(|e| format_mysql_query_error(&e))?;
                (columns, rows)
            } else {
                let mut result = conn
                    .exec_iter(sql.as_str(), mysql::Params::Positional(values))
                    .map_err(|e| format_mysql_query_error(&e))?;
                let columns = result.columns().as_ref().to_vec();
                let rows = result
                    .by_ref()
                    .collect::<Result<Vec<mysql::Row>, _>>()
                    .map_err(|e| format_mysql_query_error(&e))?;
                (columns, rows)
            };

            let fields = columns.iter().map(|c| c.name_str().to_string()).collect();
            let rows: Vec<Vec<Value>> = rows
                .iter()
                .map(|row| {
                    columns
                        .iter()
                        .enumerate()
                        .map(|(idx, col)| mysql_value_to_value(row, idx, col))
                        .collect()
                })
                .collect();

            log::debug!(
                "[QUERY] MySQL returned {} rows in {:.2?}",
                rows.len(),
                start.elapsed()
            );

            Ok(RawResult::TupleRows { fields, rows })
        })
        .await?
    }

    async fn ping(&self) -> Result<(), DbError> {
        let pool = self.pool()?;
        let (host, port) = (self.host.clone(), self.port);

        blocking(move || {
            let mut conn = pool
                .get_conn()
                .map_err(|e| format_mysql_error(&e, &host, port))?;
            conn.query_drop("SELECT 1")
                .map_err(|e| format_mysql_query_error(&e))
        })
        .await?
    }

    async fn close(&self) -> Result<(), DbError> {
        if write_or_recover(&self.pool).take().is_some() {
            log::info!(
                "[POOL] Closed MySQL pool for {}:{}",
                mask_host(&self.host),
                self.port
            );
        }
        Ok(())
    }
}

async fn blocking<T, F>(work: F) -> Result<T, DbError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| DbError::QueryFailed(format!("MySQL worker failed: {}", e)))
}

fn value_to_mysql_value(value: &Value) -> mysql::Value {
    use chrono::{Datelike, Timelike};

    match value {
        Value::Null => mysql::Value::NULL,
        Value::Bool(b) => mysql::Value::Int(i64::from(*b)),
        Value::Int(i) => mysql::Value::Int(*i),
        Value::Float(f) => mysql::Value::Double(*f),
        Value::Text(s) | Value::Json(s) | Value::Decimal(s) => {
            mysql::Value::Bytes(s.as_bytes().to_vec())
        }
        Value::Bytes(bytes) => mysql::Value::Bytes(bytes.clone()),
        Value::DateTime(dt) => mysql::Value::Date(
            dt.year() as u16,
            dt.month() as u8,
            dt.day() as u8,
            dt.hour() as u8,
            dt.minute() as u8,
            dt.second() as u8,
            dt.timestamp_subsec_micros(),
        ),
        Value::Date(d) => {
            mysql::Value::Date(d.year() as u16, d.month() as u8, d.day() as u8, 0, 0, 0, 0)
        }
        Value::Time(t) => mysql::Value::Time(
            false,
            0,
            t.hour() as u8,
            t.minute() as u8,
            t.second() as u8,
            t.nanosecond() / 1_000,
        ),
        Value::Array(_) => mysql::Value::Bytes(value.as_display_string().into_bytes()),
    }
}

fn mysql_value_to_value(row: &mysql::Row, idx: usize, col: &mysql::Column) -> Value {
    let col_type = col.column_type();

    let Some(raw) = row.as_ref(idx) else {
        return Value::Null;
    };

    match raw {
        mysql::Value::NULL => Value::Null,

        // TINYINT(1) is MySQL's boolean type
        mysql::Value::Int(v) if col_type == ColumnType::MYSQL_TYPE_TINY && col.column_length() == 1 => {
            Value::Bool(*v != 0)
        }
        mysql::Value::Int(v) => Value::Int(*v),

        // UNSIGNED BIGINT can exceed i64::MAX
        mysql::Value::UInt(v) => match i64::try_from(*v) {
            Ok(v) => Value::Int(v),
            Err(_) => Value::Text(v.to_string()),
        },

        mysql::Value::Float(v) => Value::Float(f64::from(*v)),
        mysql::Value::Double(v) => Value::Float(*v),

        mysql::Value::Date(year, month, day, hour, minute, second, micros) => {
            let Some(date) =
                chrono::NaiveDate::from_ymd_opt(i32::from(*year), u32::from(*month), u32::from(*day))
            else {
                return Value::Null;
            };

            if col_type == ColumnType::MYSQL_TYPE_DATE {
                return Value::Date(date);
            }

            date.and_hms_micro_opt(
                u32::from(*hour),
                u32::from(*minute),
                u32::from(*second),
                *micros,
            )
            .map(|naive| Value::DateTime(naive.and_utc()))
            .unwrap_or(Value::Null)
        }

        mysql::Value::Time(negative, days, hours, minutes, seconds, micros) => {
            if !negative && *days == 0 {
                if let Some(time) = chrono::NaiveTime::from_hms_micro_opt(
                    u32::from(*hours),
                    u32::from(*minutes),
                    u32::from(*seconds),
                    *micros,
                ) {
                    return Value::Time(time);
                }
            }
            Value::Text(format!(
                "{}{}:{:02}:{:02}",
                if *negative { "-" } else { "" },
                u32::from(*hours) + days * 24,
                minutes,
                seconds
            ))
        }

        // Text protocol: everything arrives as bytes, typed by the column.
        mysql::Value::Bytes(bytes) => text_protocol_value(bytes, col, col_type),
    }
}

fn text_protocol_value(bytes: &[u8], col: &mysql::Column, col_type: ColumnType) -> Value {
    if col.character_set() == BINARY_CHARSET && is_string_type(col_type) {
        return Value::Bytes(bytes.to_vec());
    }

    let text = String::from_utf8_lossy(bytes).into_owned();

    match col_type {
        ColumnType::MYSQL_TYPE_TINY if col.column_length() == 1 => {
            Value::Bool(text.trim() != "0")
        }
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => text
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or(Value::Text(text)),
        ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => text
            .parse::<f64>()
            .map(Value::Float)
            .unwrap_or(Value::Text(text)),
        ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => Value::Decimal(text),
        ColumnType::MYSQL_TYPE_JSON => Value::Json(text),
        ColumnType::MYSQL_TYPE_DATETIME | ColumnType::MYSQL_TYPE_TIMESTAMP => {
            chrono::NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
                .map(|naive| Value::DateTime(naive.and_utc()))
                .unwrap_or(Value::Text(text))
        }
        ColumnType::MYSQL_TYPE_DATE => chrono::NaiveDate::parse_from_str(&text, "%Y-%m-%d")
            .map(Value::Date)
            .unwrap_or(Value::Text(text)),
        ColumnType::MYSQL_TYPE_TIME => chrono::NaiveTime::parse_from_str(&text, "%H:%M:%S%.f")
            .map(Value::Time)
            .unwrap_or(Value::Text(text)),
        _ => Value::Text(text),
    }
}

fn is_string_type(col_type: ColumnType) -> bool {
    matches!(
        col_type,
        ColumnType::MYSQL_TYPE_BLOB
            | ColumnType::MYSQL_TYPE_TINY_BLOB
            | ColumnType::MYSQL_TYPE_MEDIUM_BLOB
            | ColumnType::MYSQL_TYPE_LONG_BLOB
            | ColumnType::MYSQL_TYPE_VAR_STRING
            | ColumnType::MYSQL_TYPE_STRING
            | ColumnType::MYSQL_TYPE_VARCHAR
    )
}

fn format_mysql_error(e: &mysql::Error, host: &str, port: u16) -> DbError {
    let msg = e.to_string();

    let error = if msg.contains("Connection refused") {
        DbError::ConnectionFailed(format!(
            "Connection refused at {}:{}. Is MySQL running?",
            mask_host(host),
            port
        ))
    } else if msg.contains("Access denied") {
        DbError::ConnectionFailed(
            "Access denied for user. Check username and password.".to_string(),
        )
    } else if msg.contains("Unknown database") {
        DbError::ConnectionFailed("Database does not exist.".to_string())
    } else if msg.contains("caching_sha2_password")
        || msg.contains("Authentication requires secure connection")
    {
        DbError::ConnectionFailed(
            "Authentication failed. The server requires a secure connection for \
             caching_sha2_password; use mysql_native_password for this account."
                .to_string(),
        )
    } else {
        DbError::ConnectionFailed(msg)
    };

    log::error!("[CONNECT] MySQL connection failed: {}", error);
    error
}

fn format_mysql_query_error(e: &mysql::Error) -> DbError {
    let error = match e {
        mysql::Error::MySqlError(mysql_err) => {
            let mut formatted =
                FormattedError::new(mysql_err.message.clone()).with_code(mysql_err.code.to_string());

            if !mysql_err.state.is_empty() {
                formatted = formatted.with_detail(format!("State: {}", mysql_err.state));
            }

            formatted.into_query_error()
        }
        mysql::Error::IoError(io) => DbError::ConnectionFailed(format!("MySQL I/O error: {}", io)),
        _ => DbError::QueryFailed(e.to_string()),
    };

    log::error!("[QUERY] MySQL query failed: {}", error);
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
