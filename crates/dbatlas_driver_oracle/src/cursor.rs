use std::collections::VecDeque;

use async_trait::async_trait;
use dbatlas_core::{DbError, RawRow, RowCursor};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) type RowSender = mpsc::Sender<Result<RawRow, DbError>>;
pub(crate) type RowReceiver = mpsc::Receiver<Result<RawRow, DbError>>;

/// Rows streamed from a blocking worker that holds the Oracle result set.
///
/// The worker stops fetching as soon as the receiving side is closed, which
/// releases the statement and returns the session to the pool.
pub(crate) struct OracleCursor {
    buffered: VecDeque<RawRow>,
    rows: RowReceiver,
    worker: Option<JoinHandle<()>>,
}

impl OracleCursor {
    pub(crate) fn new(buffered: Vec<RawRow>, rows: RowReceiver, worker: JoinHandle<()>) -> Self {
        Self {
            buffered: buffered.into(),
            rows,
            worker: Some(worker),
        }
    }
}

#[async_trait]
impl RowCursor for OracleCursor {
    async fn next_row(&mut self) -> Result<Option<RawRow>, DbError> {
        if let Some(row) = self.buffered.pop_front() {
            return Ok(Some(row));
        }

        match self.rows.recv().await {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), DbError> {
        self.buffered.clear();
        self.rows.close();

        match self.worker.take() {
            Some(worker) => join_worker(worker).await,
            None => Ok(()),
        }
    }
}

pub(crate) async fn join_worker(worker: JoinHandle<()>) -> Result<(), DbError> {
    worker
        .await
        .map_err(|e| DbError::QueryFailed(format!("Oracle worker failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbatlas_core::Value;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn numbered(n: i64) -> RawRow {
        RawRow::new().with("N", Value::Int(n))
    }

    #[tokio::test]
    async fn buffered_rows_come_before_streamed_rows() {
        let (tx, rx) = mpsc::channel(4);
        let worker = tokio::task::spawn_blocking(move || {
            for n in 3..5 {
                if tx.blocking_send(Ok(numbered(n))).is_err() {
                    break;
                }
            }
        });

        let mut cursor = OracleCursor::new(vec![numbered(1), numbered(2)], rx, worker);
        let mut seen = Vec::new();
        while let Some(row) = cursor.next_row().await.expect("row") {
            seen.push(row.get("N").and_then(Value::as_i64).expect("number"));
        }

        assert_eq!(seen, vec![1, 2, 3, 4]);
        cursor.close().await.expect("close");
    }

    #[tokio::test]
    async fn close_stops_a_worker_blocked_on_a_full_channel() {
        let sent = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel(2);
        let worker = {
            let sent = Arc::clone(&sent);
            tokio::task::spawn_blocking(move || {
                for n in 0.. {
                    if tx.blocking_send(Ok(numbered(n))).is_err() {
                        break;
                    }
                    sent.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        let mut cursor = OracleCursor::new(Vec::new(), rx, worker);
        cursor.next_row().await.expect("first row");
        cursor.close().await.expect("worker exits");

        assert!(sent.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn worker_errors_surface_from_next_row() {
        let (tx, rx) = mpsc::channel(2);
        let worker = tokio::task::spawn_blocking(move || {
            let _ = tx.blocking_send(Err(DbError::query_failed("ORA-01013: user requested cancel")));
        });

        let mut cursor = OracleCursor::new(Vec::new(), rx, worker);
        let err = cursor.next_row().await.expect_err("fetch fails");
        assert!(matches!(err, DbError::QueryFailed(_)));
        cursor.close().await.expect("close");
    }
}
