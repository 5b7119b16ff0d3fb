//! In-process [`ConnectionSource`] that records statements instead of
//! talking to a database.
//!
//! Used as the test double for the connection manager and everything built
//! on it. It counts acquires and releases, keeps an ordered statement log,
//! returns canned row sets, and can be scripted to fail statements whose
//! text contains a given fragment (for example a deadlock on `INSERT`).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::DbError;
use crate::source::{ConnectionSource, PooledConnection, QueryParam, RowSet};

/// One statement seen by a [`MemoryConnection`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedStatement {
    /// Sequence number of the connection that ran it.
    pub connection: u64,
    /// Statement text (`BEGIN`, `COMMIT`, `ROLLBACK` for control statements).
    pub sql: String,
    /// Bound parameters.
    pub params: Vec<QueryParam>,
}

#[derive(Debug)]
struct ScriptedFailure {
    fragment: String,
    code: Option<String>,
    message: String,
    remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_connection: AtomicU64,
    acquired: AtomicUsize,
    released: AtomicUsize,
    fail_acquire: AtomicBool,
    closed: AtomicBool,
    latency_ms: AtomicU64,
    statements: Mutex<Vec<RecordedStatement>>,
    failures: Mutex<Vec<ScriptedFailure>>,
    responses: Mutex<Vec<(String, RowSet)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryState {
    fn take_failure(&self, sql: &str) -> Option<DbError> {
        let mut failures = lock(&self.failures);
        let failure = failures
            .iter_mut()
            .find(|f| sql.contains(&f.fragment) && f.remaining != Some(0))?;
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
        Some(DbError::backend(
            failure.code.as_deref(),
            failure.message.clone(),
        ))
    }

    fn response_for(&self, sql: &str) -> RowSet {
        lock(&self.responses)
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, set)| set.clone())
            .unwrap_or_default()
    }
}

/// A scripted in-memory connection pool.
///
/// Cloning shares the same counters and scripts.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    state: Arc<MemoryState>,
}

impl MemorySource {
    /// Create an empty source: every statement succeeds with no rows.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail statements containing `fragment` with the given code and message.
    ///
    /// `times` limits how many statements fail; `None` fails every match.
    pub fn fail_matching(&self, fragment: &str, code: Option<&str>, message: &str, times: Option<u32>) {
        lock(&self.state.failures).push(ScriptedFailure {
            fragment: fragment.to_owned(),
            code: code.map(str::to_owned),
            message: message.to_owned(),
            remaining: times,
        });
    }

    /// Return `rows` for statements containing `fragment`.
    pub fn respond_with(&self, fragment: &str, rows: RowSet) {
        lock(&self.state.responses).push((fragment.to_owned(), rows));
    }

    /// Make every subsequent [`acquire`](ConnectionSource::acquire) fail.
    pub fn set_fail_acquire(&self, fail: bool) {
        self.state.fail_acquire.store(fail, Ordering::SeqCst);
    }

    /// Sleep this long inside every statement.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.state.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Connections handed out so far.
    pub fn acquired(&self) -> usize {
        self.state.acquired.load(Ordering::SeqCst)
    }

    /// Connections returned so far.
    pub fn released(&self) -> usize {
        self.state.released.load(Ordering::SeqCst)
    }

    /// Whether [`close`](ConnectionSource::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Connections currently checked out.
    pub fn outstanding(&self) -> usize {
        self.acquired().saturating_sub(self.released())
    }

    /// Every statement run so far, in order.
    pub fn statements(&self) -> Vec<RecordedStatement> {
        lock(&self.state.statements).clone()
    }

    /// Statement texts run so far, in order.
    pub fn statement_texts(&self) -> Vec<String> {
        lock(&self.state.statements)
            .iter()
            .map(|s| s.sql.clone())
            .collect()
    }
}

impl ConnectionSource for MemorySource {
    type Connection = MemoryConnection;

    async fn acquire(&self) -> Result<MemoryConnection, DbError> {
        if self.state.fail_acquire.load(Ordering::SeqCst) {
            return Err(DbError::backend(None, "Unable to acquire connection."));
        }
        if self.is_closed() {
            return Err(DbError::backend(None, "Connection source is closed."));
        }
        let id = self.state.next_connection.fetch_add(1, Ordering::SeqCst);
        self.state.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            id,
            state: Arc::clone(&self.state),
            in_transaction: false,
        })
    }

    async fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

/// A connection handed out by [`MemorySource`].
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    state: Arc<MemoryState>,
    in_transaction: bool,
}

impl MemoryConnection {
    async fn run(&self, sql: &str, params: &[QueryParam]) -> Result<RowSet, DbError> {
        let latency = self.state.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        lock(&self.state.statements).push(RecordedStatement {
            connection: self.id,
            sql: sql.to_owned(),
            params: params.to_vec(),
        });

        match self.state.take_failure(sql) {
            Some(err) => Err(err),
            None => Ok(self.state.response_for(sql)),
        }
    }
}

impl PooledConnection for MemoryConnection {
    async fn execute(&mut self, query: &str, params: &[QueryParam]) -> Result<RowSet, DbError> {
        self.run(query, params).await
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        self.run("BEGIN", &[]).await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.run("COMMIT", &[]).await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.run("ROLLBACK", &[]).await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), DbError> {
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.in_transaction {
            lock(&self.state.statements).push(RecordedStatement {
                connection: self.id,
                sql: String::from("ABORT"),
                params: Vec::new(),
            });
        }
        self.state.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counts_acquire_and_release() {
        let source = MemorySource::new();
        let conn = source.acquire().await.unwrap();
        assert_eq!(source.outstanding(), 1);
        drop(conn);
        assert_eq!(source.acquired(), 1);
        assert_eq!(source.released(), 1);
    }

    #[tokio::test]
    async fn scripted_failure_runs_out() {
        let source = MemorySource::new();
        source.fail_matching("INSERT", Some("40P01"), "deadlock detected", Some(1));
        let mut conn = source.acquire().await.unwrap();

        let first = conn.execute("INSERT INTO t VALUES ($1)", &[QueryParam::Int(1)]).await;
        assert!(matches!(first, Err(DbError::Backend { .. })));
        let second = conn.execute("INSERT INTO t VALUES ($1)", &[QueryParam::Int(1)]).await;
        assert!(second.is_ok());
        assert_eq!(source.statements().len(), 2);
    }

    #[tokio::test]
    async fn canned_response() {
        let source = MemorySource::new();
        let mut row = crate::source::Row::new();
        row.insert(String::from("n"), serde_json::Value::from(1));
        source.respond_with(
            "SELECT",
            RowSet {
                rows: vec![row],
                rows_affected: 1,
            },
        );
        let mut conn = source.acquire().await.unwrap();
        let set = conn.execute("SELECT 1 AS n", &[]).await.unwrap();
        assert_eq!(set.rows.len(), 1);
    }

    #[tokio::test]
    async fn dropping_open_transaction_is_recorded() {
        let source = MemorySource::new();
        let mut conn = source.acquire().await.unwrap();
        conn.begin().await.unwrap();
        drop(conn);
        assert_eq!(source.statement_texts(), vec!["BEGIN", "ABORT"]);
    }

    #[tokio::test]
    async fn closed_source_refuses_acquire() {
        let source = MemorySource::new();
        source.close().await;
        assert!(source.is_closed());
        assert!(source.acquire().await.is_err());
    }
}
