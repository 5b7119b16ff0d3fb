//! Connection and transaction lifecycle management.
//!
//! [`ConnectionManager`] is the only owner of pooled connections. A
//! one-shot query checks a connection out for exactly one statement; a
//! named transaction keeps its connection until it is committed or rolled
//! back. Finalizing a transaction that is not open is a logged no-op so
//! cleanup paths may commit or roll back defensively.
//!
//! A transaction may also take named application locks. They belong to the
//! transaction and are released with it, whether it commits, rolls back,
//! or is rolled back by the watchdog.
//!
//! Construct one manager per process and share it behind an [`Arc`].

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use census_types::{BackgroundTask, TransactionId};

use crate::error::DbError;
use crate::source::{ConnectionSource, PooledConnection, QueryParam, RowSet};

/// Default maximum lifetime of a transaction before the watchdog rolls it back.
const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(120);

/// Default interval between watchdog passes.
const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);

/// Default timeout for [`ConnectionManager::with_transaction`].
const DEFAULT_SCOPED_TIMEOUT: Duration = Duration::from_secs(120);

/// Finalized transactions remembered by [`ConnectionManager::transaction_state`].
const FINISHED_HISTORY: usize = 256;

/// Transaction lifetime settings.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Age after which an open transaction is force-rolled back.
    pub max_lifetime: Duration,
    /// How often the watchdog looks for expired transactions.
    pub watchdog_interval: Duration,
    /// Timeout applied by `with_transaction` when the caller gives none.
    pub default_timeout: Duration,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_lifetime: DEFAULT_MAX_LIFETIME,
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            default_timeout: DEFAULT_SCOPED_TIMEOUT,
        }
    }
}

impl TransactionConfig {
    /// Set the maximum transaction lifetime.
    #[must_use]
    pub const fn with_max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.max_lifetime = max_lifetime;
        self
    }

    /// Set the watchdog interval.
    #[must_use]
    pub const fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    /// Set the default scoped-transaction timeout.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// Begun and not yet finalized.
    Active,
    /// Committed; the connection has been released.
    Committed,
    /// Rolled back (or failed to commit); the connection has been released.
    RolledBack,
}

/// Read-only view of one open transaction.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionInfo {
    /// Transaction identifier.
    pub id: TransactionId,
    /// Always [`TransactionState::Active`] for a listed transaction.
    pub state: TransactionState,
    /// Wall-clock begin time.
    pub started_at: DateTime<Utc>,
    /// Time since begin.
    pub age: Duration,
}

#[derive(Debug, Clone, Copy)]
enum Finalize {
    Commit,
    Rollback,
}

impl Finalize {
    const fn label(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Rollback => "rollback",
        }
    }
}

#[derive(Debug)]
struct TransactionEntry<C> {
    connection: Option<C>,
}

/// One open transaction. The entry mutex serializes statements on its
/// connection and orders them against commit/rollback.
#[derive(Debug)]
struct TransactionSlot<C> {
    started_at: Instant,
    started_wall: DateTime<Utc>,
    entry: tokio::sync::Mutex<TransactionEntry<C>>,
}

type SlotMap<C> = HashMap<TransactionId, Arc<TransactionSlot<C>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the connection source and the map of open transactions.
pub struct ConnectionManager<S: ConnectionSource> {
    source: S,
    config: TransactionConfig,
    transactions: Mutex<SlotMap<S::Connection>>,
    finished: Mutex<VecDeque<(TransactionId, TransactionState)>>,
    application_locks: Mutex<HashMap<String, TransactionId>>,
    application_lock_released: Notify,
}

impl<S: ConnectionSource> std::fmt::Debug for ConnectionManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("open_transactions", &self.transaction_count())
            .field("application_locks", &lock(&self.application_locks).len())
            .finish_non_exhaustive()
    }
}

impl<S: ConnectionSource> ConnectionManager<S> {
    /// Create a manager over `source` with default transaction settings.
    pub fn new(source: S) -> Self {
        Self::with_config(source, TransactionConfig::default())
    }

    /// Create a manager over `source` with explicit transaction settings.
    pub fn with_config(source: S, config: TransactionConfig) -> Self {
        Self {
            source,
            config,
            transactions: Mutex::new(HashMap::new()),
            finished: Mutex::new(VecDeque::with_capacity(FINISHED_HISTORY)),
            application_locks: Mutex::new(HashMap::new()),
            application_lock_released: Notify::new(),
        }
    }

    /// The underlying connection source.
    pub const fn source(&self) -> &S {
        &self.source
    }

    /// The transaction settings in effect.
    pub const fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Run one statement.
    ///
    /// With a transaction ID the statement runs on that transaction's
    /// connection. Without one, a connection is checked out for this
    /// statement alone and returned whether or not it succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NoSuchTransaction`] if `transaction` is not open,
    /// or the connection source's error if acquisition or the statement
    /// fails.
    pub async fn execute_query(
        &self,
        query: &str,
        params: &[QueryParam],
        transaction: Option<TransactionId>,
    ) -> Result<RowSet, DbError> {
        let Some(id) = transaction else {
            let mut conn = self.source.acquire().await?;
            let result = conn.execute(query, params).await;
            drop(conn);
            return result.inspect_err(|e| tracing::error!(error = %e, "Query failed"));
        };

        let slot = self.slot(id)?;
        let mut entry = slot.entry.lock().await;
        let conn = entry
            .connection
            .as_mut()
            .ok_or(DbError::NoSuchTransaction { id })?;
        conn.execute(query, params).await.inspect_err(|e| {
            tracing::error!(transaction_id = %id, error = %e, "Query failed in transaction");
        })
    }

    /// Check out a connection, open a transaction on it, and register it.
    ///
    /// # Errors
    ///
    /// Returns the connection source's error if acquisition or `BEGIN`
    /// fails. The connection is released and nothing is registered.
    pub async fn begin_transaction(&self) -> Result<TransactionId, DbError> {
        let mut conn = self.source.acquire().await?;
        if let Err(e) = conn.begin().await {
            tracing::error!(error = %e, "Failed to begin transaction");
            return Err(e);
        }

        let id = TransactionId::new();
        let slot = TransactionSlot {
            started_at: Instant::now(),
            started_wall: Utc::now(),
            entry: tokio::sync::Mutex::new(TransactionEntry {
                connection: Some(conn),
            }),
        };
        lock(&self.transactions).insert(id, Arc::new(slot));

        tracing::info!(transaction_id = %id, "Transaction started");
        Ok(id)
    }

    /// Commit a transaction and release its connection.
    ///
    /// Unknown or already finalized IDs are a logged no-op.
    ///
    /// # Errors
    ///
    /// Returns the commit error. The connection is released and the
    /// transaction forgotten either way.
    pub async fn commit_transaction(&self, id: TransactionId) -> Result<(), DbError> {
        self.finalize(id, Finalize::Commit).await
    }

    /// Roll back a transaction and release its connection.
    ///
    /// Unknown or already finalized IDs are a logged no-op.
    ///
    /// # Errors
    ///
    /// Returns the rollback error. The connection is released and the
    /// transaction forgotten either way.
    pub async fn rollback_transaction(&self, id: TransactionId) -> Result<(), DbError> {
        self.finalize(id, Finalize::Rollback).await
    }

    /// Kept for callers that always close in a cleanup block.
    ///
    /// Connections are never held outside a transaction or a single
    /// statement, so there is nothing to close.
    pub fn close_connection(&self) {
        tracing::trace!(open_transactions = self.transaction_count(), "close_connection is a no-op");
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` succeeds, rolls back when it fails or runs past
    /// `timeout` (the configured default when `None`). A rollback failure is
    /// logged and the original error returned.
    ///
    /// # Errors
    ///
    /// Returns `f`'s error, [`DbError::TransactionTimeout`] on timeout, or
    /// the begin/commit error.
    pub async fn with_transaction<F, Fut, T, E>(&self, f: F, timeout: Option<Duration>) -> Result<T, E>
    where
        F: FnOnce(TransactionId) -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: From<DbError> + Send,
    {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let id = self.begin_transaction().await?;

        match tokio::time::timeout(timeout, f(id)).await {
            Ok(Ok(value)) => {
                self.commit_transaction(id).await?;
                Ok(value)
            }
            Ok(Err(e)) => {
                self.rollback_logged(id).await;
                Err(e)
            }
            Err(_) => {
                tracing::warn!(transaction_id = %id, timeout_ms = timeout.as_millis(), "Transaction timed out");
                self.rollback_logged(id).await;
                Err(DbError::TransactionTimeout { id, timeout }.into())
            }
        }
    }

    /// Force-roll back every transaction older than the configured maximum
    /// lifetime. Returns how many were rolled back.
    pub async fn rollback_expired(&self) -> usize {
        let max_lifetime = self.config.max_lifetime;
        let expired: Vec<(TransactionId, Duration)> = lock(&self.transactions)
            .iter()
            .filter_map(|(id, slot)| {
                let age = slot.started_at.elapsed();
                (age > max_lifetime).then_some((*id, age))
            })
            .collect();

        for (id, age) in &expired {
            tracing::warn!(
                transaction_id = %id,
                age_ms = age.as_millis(),
                "Rolling back transaction that exceeded its maximum lifetime"
            );
            self.rollback_logged(*id).await;
        }
        expired.len()
    }

    /// Run [`rollback_expired`](Self::rollback_expired) on the configured
    /// watchdog interval until the returned task is stopped.
    pub fn spawn_watchdog(self: &Arc<Self>) -> BackgroundTask {
        let manager = Arc::clone(self);
        BackgroundTask::spawn_periodic("transaction-watchdog", self.config.watchdog_interval, move || {
            let manager = Arc::clone(&manager);
            async move {
                let rolled_back = manager.rollback_expired().await;
                if rolled_back > 0 {
                    tracing::warn!(rolled_back, "Watchdog rolled back expired transactions");
                }
            }
        })
    }

    /// Snapshot of the open transactions.
    pub fn active_transactions(&self) -> Vec<TransactionInfo> {
        lock(&self.transactions)
            .iter()
            .map(|(id, slot)| TransactionInfo {
                id: *id,
                state: TransactionState::Active,
                started_at: slot.started_wall,
                age: slot.started_at.elapsed(),
            })
            .collect()
    }

    /// Number of open transactions.
    pub fn transaction_count(&self) -> usize {
        lock(&self.transactions).len()
    }

    /// State of transaction `id`.
    ///
    /// `Active` while it is open, then `Committed` or `RolledBack` once
    /// finalized. A failed commit counts as rolled back. Only the most
    /// recent finalized transactions are remembered; older and unknown IDs
    /// return `None`.
    pub fn transaction_state(&self, id: TransactionId) -> Option<TransactionState> {
        if lock(&self.transactions).contains_key(&id) {
            return Some(TransactionState::Active);
        }
        lock(&self.finished)
            .iter()
            .rev()
            .find(|(finished, _)| *finished == id)
            .map(|(_, state)| *state)
    }

    /// Take the application lock `name` for transaction `id`, waiting up
    /// to `max_wait` while another transaction holds it.
    ///
    /// The lock is held until it is released explicitly or the transaction
    /// is finalized. Taking a lock the transaction already holds succeeds
    /// at once; holds are not counted.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NoSuchTransaction`] if `id` is not open, or
    /// [`DbError::ApplicationLockTimeout`] if another transaction still
    /// holds the lock when `max_wait` elapses.
    pub async fn acquire_application_lock(
        &self,
        id: TransactionId,
        name: &str,
        max_wait: Duration,
    ) -> Result<(), DbError> {
        let started = Instant::now();
        let deadline = started.checked_add(max_wait);

        loop {
            let notified = self.application_lock_released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let Some(holder) = self.try_application_lock(id, name)? else {
                tracing::debug!(transaction_id = %id, lock_name = name, "Application lock acquired");
                return Ok(());
            };

            if deadline.is_some_and(|d| Instant::now() >= d) {
                let waited = started.elapsed();
                tracing::warn!(
                    transaction_id = %id,
                    lock_name = name,
                    holder = %holder,
                    waited_ms = waited.as_millis(),
                    "Application lock acquisition timed out"
                );
                return Err(DbError::ApplicationLockTimeout {
                    name: name.to_owned(),
                    holder,
                    waited,
                });
            }

            match deadline {
                Some(at) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release application lock `name` before transaction `id` ends.
    /// Returns `false` if `id` does not hold it.
    pub fn release_application_lock(&self, id: TransactionId, name: &str) -> bool {
        let released = {
            let mut locks = lock(&self.application_locks);
            let held = locks.get(name) == Some(&id);
            if held {
                locks.remove(name);
            }
            held
        };
        if released {
            self.application_lock_released.notify_waiters();
            tracing::debug!(transaction_id = %id, lock_name = name, "Application lock released");
        } else {
            tracing::warn!(transaction_id = %id, lock_name = name, "Application lock not held by transaction");
        }
        released
    }

    /// The transaction holding application lock `name`, if any.
    pub fn application_lock_holder(&self, name: &str) -> Option<TransactionId> {
        lock(&self.application_locks).get(name).copied()
    }

    /// Take `name` for `id` if it is free or already ours; otherwise return
    /// the current holder.
    fn try_application_lock(&self, id: TransactionId, name: &str) -> Result<Option<TransactionId>, DbError> {
        // The transactions map stays locked so a concurrent finalize cannot
        // miss a lock taken for the transaction it is removing.
        let transactions = lock(&self.transactions);
        if !transactions.contains_key(&id) {
            return Err(DbError::NoSuchTransaction { id });
        }
        let mut locks = lock(&self.application_locks);
        let holder = match locks.get(name).copied() {
            Some(holder) if holder != id => Some(holder),
            _ => {
                locks.insert(name.to_owned(), id);
                None
            }
        };
        drop(locks);
        drop(transactions);
        Ok(holder)
    }

    fn release_application_locks_of(&self, id: TransactionId) {
        let released = {
            let mut locks = lock(&self.application_locks);
            let before = locks.len();
            locks.retain(|_, holder| *holder != id);
            before.saturating_sub(locks.len())
        };
        self.application_lock_released.notify_waiters();
        if released > 0 {
            tracing::debug!(transaction_id = %id, released, "Application locks released with transaction");
        }
    }

    fn record_finished(&self, id: TransactionId, state: TransactionState) {
        let mut finished = lock(&self.finished);
        if finished.len() >= FINISHED_HISTORY {
            finished.pop_front();
        }
        finished.push_back((id, state));
    }

    fn slot(&self, id: TransactionId) -> Result<Arc<TransactionSlot<S::Connection>>, DbError> {
        lock(&self.transactions)
            .get(&id)
            .cloned()
            .ok_or(DbError::NoSuchTransaction { id })
    }

    async fn rollback_logged(&self, id: TransactionId) {
        if let Err(e) = self.rollback_transaction(id).await {
            tracing::error!(transaction_id = %id, error = %e, "Rollback failed");
        }
    }

    async fn finalize(&self, id: TransactionId, action: Finalize) -> Result<(), DbError> {
        let removed = lock(&self.transactions).remove(&id);
        let Some(slot) = removed else {
            tracing::warn!(
                transaction_id = %id,
                action = action.label(),
                "No connection found for transaction, already finalized"
            );
            return Ok(());
        };

        let mut entry = slot.entry.lock().await;
        let Some(mut conn) = entry.connection.take() else {
            self.release_application_locks_of(id);
            return Ok(());
        };

        let result = match action {
            Finalize::Commit => conn.commit().await,
            Finalize::Rollback => conn.rollback().await,
        };
        drop(conn);
        drop(entry);

        let state = match (action, &result) {
            (Finalize::Commit, Ok(())) => TransactionState::Committed,
            _ => TransactionState::RolledBack,
        };
        self.record_finished(id, state);
        self.release_application_locks_of(id);

        match &result {
            Ok(()) => match action {
                Finalize::Commit => tracing::info!(transaction_id = %id, "Transaction committed"),
                Finalize::Rollback => tracing::info!(transaction_id = %id, "Transaction rolled back"),
            },
            Err(e) => tracing::error!(
                transaction_id = %id,
                action = action.label(),
                error = %e,
                "Failed to finalize transaction"
            ),
        }
        result
    }
}
