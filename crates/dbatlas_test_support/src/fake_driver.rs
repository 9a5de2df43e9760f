use async_trait::async_trait;
use dbatlas_core::{
    BoundStatement, ColumnMeta, ConnectionParams, DbDriver, DbError, Dialect, PoolSettings,
    PooledHandle, RawResult, RawRow, RowCursor, Value,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum FakeQueryOutcome {
    Rows(Vec<RawRow>),
    Error(String),
    Timeout,
}

impl FakeQueryOutcome {
    fn into_result(self) -> Result<Vec<RawRow>, DbError> {
        match self {
            Self::Rows(rows) => Ok(rows),
            Self::Error(message) => Err(DbError::query_failed(message)),
            Self::Timeout => Err(DbError::Timeout),
        }
    }
}

/// Which raw result shape the fake hands back for successful queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FakeShape {
    #[default]
    DirectArray,
    TupleRows,
    RowsObject,
    Cursor,
}

#[derive(Debug, Clone, Default)]
pub struct FakeDriverStats {
    pub connect_calls: usize,
    pub executed_statements: Vec<BoundStatement>,
    pub close_calls: usize,
    pub cursor_closes: usize,
}

impl FakeDriverStats {
    /// Number of executed statements whose SQL contains `fragment`.
    pub fn executions_matching(&self, fragment: &str) -> usize {
        self.executed_statements
            .iter()
            .filter(|statement| statement.sql.contains(fragment))
            .count()
    }
}

#[derive(Debug, Clone)]
struct FakeRule {
    fragment: String,
    /// Only match when one of the bound values equals this.
    bound_value: Option<Value>,
    outcome: FakeQueryOutcome,
}

impl FakeRule {
    fn matches(&self, statement: &BoundStatement) -> bool {
        if !statement.sql.contains(&self.fragment) {
            return false;
        }

        match &self.bound_value {
            None => true,
            Some(expected) => bound_values(statement).any(|value| value == expected),
        }
    }
}

fn bound_values(statement: &BoundStatement) -> Box<dyn Iterator<Item = &Value> + '_> {
    match &statement.params {
        dbatlas_core::BoundParams::Positional(values) => Box::new(values.iter()),
        dbatlas_core::BoundParams::Named(values) => Box::new(values.iter().map(|(_, v)| v)),
    }
}

#[derive(Default)]
struct FakeDriverState {
    rules: RwLock<Vec<FakeRule>>,
    default_outcome: RwLock<Option<FakeQueryOutcome>>,
    shape: RwLock<FakeShape>,
    delay: RwLock<Option<Duration>>,
    cursor_error_after: RwLock<Option<usize>>,
    executed_statements: Mutex<Vec<BoundStatement>>,
    connect_calls: AtomicUsize,
    close_calls: AtomicUsize,
    cursor_closes: AtomicUsize,
    ping_error: RwLock<Option<String>>,
    connect_error: RwLock<Option<String>>,
    close_error: RwLock<Option<String>>,
}

impl FakeDriverState {
    /// Rules bound to a value win over plain ones; otherwise first
    /// registered wins. Unmatched SQL returns the default outcome, or no
    /// rows.
    fn outcome_for(&self, statement: &BoundStatement) -> FakeQueryOutcome {
        let rules = rwlock_read(&self.rules);

        rules
            .iter()
            .filter(|rule| rule.bound_value.is_some())
            .chain(rules.iter().filter(|rule| rule.bound_value.is_none()))
            .find(|rule| rule.matches(statement))
            .map(|rule| rule.outcome.clone())
            .or_else(|| rwlock_read(&self.default_outcome).clone())
            .unwrap_or(FakeQueryOutcome::Rows(Vec::new()))
    }

    fn set_rule(&self, fragment: String, bound_value: Option<Value>, outcome: FakeQueryOutcome) {
        let mut rules = rwlock_write(&self.rules);

        match rules
            .iter_mut()
            .find(|rule| rule.fragment == fragment && rule.bound_value == bound_value)
        {
            Some(existing) => existing.outcome = outcome,
            None => rules.push(FakeRule {
                fragment,
                bound_value,
                outcome,
            }),
        }
    }
}

/// Scriptable driver. Handles it opens share its rules and statistics.
#[derive(Clone)]
pub struct FakeDriver {
    dialect: Dialect,
    state: Arc<FakeDriverState>,
}

impl FakeDriver {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            state: Arc::new(FakeDriverState::default()),
        }
    }

    pub fn with_rows(self, fragment: impl Into<String>, rows: Vec<RawRow>) -> Self {
        self.state
            .set_rule(fragment.into(), None, FakeQueryOutcome::Rows(rows));
        self
    }

    /// Rows for SQL containing `fragment` when `bound` is among the bound values.
    pub fn with_rows_when(
        self,
        fragment: impl Into<String>,
        bound: impl Into<Value>,
        rows: Vec<RawRow>,
    ) -> Self {
        self.state.set_rule(
            fragment.into(),
            Some(bound.into()),
            FakeQueryOutcome::Rows(rows),
        );
        self
    }

    pub fn with_error(self, fragment: impl Into<String>, message: impl Into<String>) -> Self {
        self.state
            .set_rule(fragment.into(), None, FakeQueryOutcome::Error(message.into()));
        self
    }

    pub fn with_error_when(
        self,
        fragment: impl Into<String>,
        bound: impl Into<Value>,
        message: impl Into<String>,
    ) -> Self {
        self.state.set_rule(
            fragment.into(),
            Some(bound.into()),
            FakeQueryOutcome::Error(message.into()),
        );
        self
    }

    pub fn with_timeout(self, fragment: impl Into<String>) -> Self {
        self.state
            .set_rule(fragment.into(), None, FakeQueryOutcome::Timeout);
        self
    }

    pub fn with_default_error(self, message: impl Into<String>) -> Self {
        *rwlock_write(&self.state.default_outcome) = Some(FakeQueryOutcome::Error(message.into()));
        self
    }

    pub fn with_shape(self, shape: FakeShape) -> Self {
        *rwlock_write(&self.state.shape) = shape;
        self
    }

    /// Every connect and query sleeps this long (on the Tokio clock) before
    /// answering.
    pub fn with_delay(self, delay: Duration) -> Self {
        *rwlock_write(&self.state.delay) = Some(delay);
        self
    }

    /// Cursor results fail on the pull after `rows` rows.
    pub fn with_cursor_error_after(self, rows: usize) -> Self {
        *rwlock_write(&self.state.cursor_error_after) = Some(rows);
        self
    }

    pub fn with_ping_error(self, message: impl Into<String>) -> Self {
        *rwlock_write(&self.state.ping_error) = Some(message.into());
        self
    }

    pub fn with_connect_error(self, message: impl Into<String>) -> Self {
        *rwlock_write(&self.state.connect_error) = Some(message.into());
        self
    }

    pub fn with_close_error(self, message: impl Into<String>) -> Self {
        *rwlock_write(&self.state.close_error) = Some(message.into());
        self
    }

    pub fn set_outcome(&self, fragment: impl Into<String>, outcome: FakeQueryOutcome) {
        self.state.set_rule(fragment.into(), None, outcome);
    }

    pub fn stats(&self) -> FakeDriverStats {
        FakeDriverStats {
            connect_calls: self.state.connect_calls.load(Ordering::SeqCst),
            executed_statements: mutex_lock(&self.state.executed_statements).clone(),
            close_calls: self.state.close_calls.load(Ordering::SeqCst),
            cursor_closes: self.state.cursor_closes.load(Ordering::SeqCst),
        }
    }

    pub fn as_driver_arc(self) -> Arc<dyn DbDriver> {
        Arc::new(self)
    }

    /// A handle that skips `connect`, for driving engine functions directly.
    pub fn handle(&self) -> Arc<dyn PooledHandle> {
        Arc::new(FakeHandle::new(self.dialect, Arc::clone(&self.state)))
    }
}

#[async_trait]
impl DbDriver for FakeDriver {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn connect(
        &self,
        _params: &ConnectionParams,
        _pool: &PoolSettings,
    ) -> Result<Arc<dyn PooledHandle>, DbError> {
        self.state.connect_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *rwlock_read(&self.state.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(message) = rwlock_read(&self.state.connect_error).clone() {
            return Err(DbError::ConnectionFailed(message));
        }

        Ok(self.handle())
    }
}

pub struct FakeHandle {
    dialect: Dialect,
    state: Arc<FakeDriverState>,
    closed: AtomicBool,
}

impl FakeHandle {
    fn new(dialect: Dialect, state: Arc<FakeDriverState>) -> Self {
        Self {
            dialect,
            state,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn shape_rows(&self, rows: Vec<RawRow>) -> RawResult {
        let shape = *rwlock_read(&self.state.shape);

        match shape {
            FakeShape::DirectArray => RawResult::DirectArray(rows),
            FakeShape::TupleRows => {
                let (fields, rows) = positional(rows);
                RawResult::TupleRows { fields, rows }
            }
            FakeShape::RowsObject => {
                let (fields, rows) = positional(rows);
                let columns = fields
                    .into_iter()
                    .map(|name| ColumnMeta {
                        name,
                        type_name: "text".to_string(),
                        nullable: true,
                    })
                    .collect();
                RawResult::RowsObject { columns, rows }
            }
            FakeShape::Cursor => RawResult::Cursor(Box::new(FakeCursor {
                rows: rows.into(),
                pulled: 0,
                error_after: *rwlock_read(&self.state.cursor_error_after),
                state: Arc::clone(&self.state),
            })),
        }
    }
}

/// Column names in first-seen order plus values aligned to them.
fn positional(rows: Vec<RawRow>) -> (Vec<String>, Vec<Vec<Value>>) {
    let mut fields: Vec<String> = Vec::new();
    for row in &rows {
        for name in row.column_names() {
            if !fields.iter().any(|f| f == name) {
                fields.push(name.to_string());
            }
        }
    }

    let values = rows
        .iter()
        .map(|row| {
            fields
                .iter()
                .map(|name| row.get(name).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect();

    (fields, values)
}

#[async_trait]
impl PooledHandle for FakeHandle {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn query_raw(&self, statement: &BoundStatement) -> Result<RawResult, DbError> {
        if self.is_closed() {
            return Err(DbError::ConnectionFailed("handle closed".to_string()));
        }

        mutex_lock(&self.state.executed_statements).push(statement.clone());

        let delay = *rwlock_read(&self.state.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let rows = self.state.outcome_for(statement).into_result()?;
        Ok(self.shape_rows(rows))
    }

    async fn ping(&self) -> Result<(), DbError> {
        if self.is_closed() {
            return Err(DbError::ConnectionFailed("handle closed".to_string()));
        }

        match rwlock_read(&self.state.ping_error).clone() {
            Some(message) => Err(DbError::ConnectionFailed(message)),
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), DbError> {
        self.closed.store(true, Ordering::SeqCst);
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);

        match rwlock_read(&self.state.close_error).clone() {
            Some(message) => Err(DbError::ConnectionFailed(message)),
            None => Ok(()),
        }
    }
}

struct FakeCursor {
    rows: VecDeque<RawRow>,
    pulled: usize,
    error_after: Option<usize>,
    state: Arc<FakeDriverState>,
}

#[async_trait]
impl RowCursor for FakeCursor {
    async fn next_row(&mut self) -> Result<Option<RawRow>, DbError> {
        if self.error_after.is_some_and(|limit| self.pulled >= limit) {
            return Err(DbError::query_failed("cursor fetch failed"));
        }

        self.pulled += 1;
        Ok(self.rows.pop_front())
    }

    async fn close(&mut self) -> Result<(), DbError> {
        self.state.cursor_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn rwlock_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poison_error) => poison_error.into_inner(),
    }
}

fn rwlock_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poison_error) => poison_error.into_inner(),
    }
}

fn mutex_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poison_error) => poison_error.into_inner(),
    }
}
