//! The ingest service: one connection manager and one task queue per process.
//!
//! Uploaded files arrive here already parsed into rows. [`IngestService::stage_file`]
//! splits a file's rows into chunks and schedules a single batch task for
//! the file. Each chunk is inserted in its own transaction and retried on
//! deadlock, so one bad chunk does not undo the others.

use std::sync::Arc;

use serde::Serialize;

use census_db::{ConnectionManager, ConnectionSource, DbError, PostgresPool, QueryParam};
use census_scheduler::{QueueStats, TaskOptions, TaskQueue};
use census_types::{BackgroundTask, TaskId};

use crate::config::IngestConfig;
use crate::error::IngestError;

/// Result of inserting one chunk of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkOutcome {
    /// Position of the chunk within the file.
    pub index: usize,
    /// Rows in the chunk.
    pub rows: usize,
    /// Rows the database reported as inserted (0 if the chunk failed).
    pub inserted: u64,
    /// Failure message, after any deadlock retries.
    pub error: Option<String>,
}

/// Per-chunk outcome of staging one file.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    /// The staged file.
    pub file_id: String,
    /// ID of the batch task that ran the inserts.
    pub task_id: TaskId,
    /// Rows submitted.
    pub rows: usize,
    /// Rows inserted across all successful chunks.
    pub inserted: u64,
    /// One entry per chunk, in file order.
    pub chunks: Vec<ChunkOutcome>,
}

impl StageReport {
    /// Chunks that failed.
    pub fn failed_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.error.is_some()).count()
    }

    /// Whether every chunk was inserted.
    pub fn is_complete(&self) -> bool {
        self.failed_chunks() == 0
    }
}

/// Wires the connection manager, the task queue, and their background
/// maintenance tasks.
pub struct IngestService<S: ConnectionSource> {
    manager: Arc<ConnectionManager<S>>,
    queue: TaskQueue,
    background: Vec<BackgroundTask>,
}

impl<S: ConnectionSource> std::fmt::Debug for IngestService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestService")
            .field("manager", &self.manager)
            .field("queue", &self.queue)
            .field("background", &self.background)
            .finish()
    }
}

impl IngestService<PostgresPool> {
    /// Connect to `PostgreSQL` and start the service.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Database`] if the pool cannot connect.
    pub async fn connect(config: &IngestConfig) -> Result<Self, IngestError> {
        let pool = PostgresPool::connect(&config.postgres_config()).await?;
        Ok(Self::from_source(pool, config))
    }
}

impl<S: ConnectionSource> IngestService<S> {
    /// Start the service over any connection source.
    ///
    /// Spawns the lock sweeper and the transaction watchdog, so this must be
    /// called inside a Tokio runtime.
    pub fn from_source(source: S, config: &IngestConfig) -> Self {
        let manager = Arc::new(ConnectionManager::with_config(
            source,
            config.transaction_config(),
        ));
        let queue = TaskQueue::new(config.queue_config());
        let background = vec![queue.spawn_lock_sweeper(), manager.spawn_watchdog()];

        tracing::info!(
            concurrency = queue.config().concurrency,
            staging_table = %queue.config().staging_table,
            "Ingest service started"
        );

        Self {
            manager,
            queue,
            background,
        }
    }

    /// The shared connection manager.
    pub const fn manager(&self) -> &Arc<ConnectionManager<S>> {
        &self.manager
    }

    /// The shared task queue.
    pub const fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Queue depth, running count, and held locks.
    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Run `SELECT 1` on a fresh connection.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Database`] if the database is unreachable.
    pub async fn health_check(&self) -> Result<(), IngestError> {
        self.manager.execute_query("SELECT 1", &[], None).await?;
        Ok(())
    }

    /// Insert a file's rows with default scheduling options.
    ///
    /// # Errors
    ///
    /// See [`stage_file_with`](Self::stage_file_with).
    pub async fn stage_file(
        &self,
        file_id: &str,
        insert_sql: &str,
        rows: Vec<Vec<QueryParam>>,
        chunk_size: usize,
    ) -> Result<StageReport, IngestError> {
        self.stage_file_with(file_id, insert_sql, rows, chunk_size, TaskOptions::new())
            .await
    }

    /// Insert a file's rows as one batch task of `chunk_size`-row
    /// transactions. A zero `chunk_size` is treated as one.
    ///
    /// Chunk failures are reported in the [`StageReport`], not as an error.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Scheduling`] if the batch could not take its
    /// locks or its dependencies did not finish in time.
    pub async fn stage_file_with(
        &self,
        file_id: &str,
        insert_sql: &str,
        rows: Vec<Vec<QueryParam>>,
        chunk_size: usize,
        options: TaskOptions,
    ) -> Result<StageReport, IngestError> {
        let task_id = options.id.unwrap_or_default();
        let total = rows.len();
        let chunks = split_chunks(rows, chunk_size.max(1));
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();

        if chunks.is_empty() {
            tracing::debug!(file_id, "No rows to stage");
            return Ok(StageReport {
                file_id: file_id.to_owned(),
                task_id,
                rows: 0,
                inserted: 0,
                chunks: Vec::new(),
            });
        }

        let sql: Arc<str> = Arc::from(insert_sql);
        let sub_tasks: Vec<_> = chunks
            .into_iter()
            .map(|chunk| {
                let manager = Arc::clone(&self.manager);
                let sql = Arc::clone(&sql);
                let chunk = Arc::new(chunk);
                move || {
                    let manager = Arc::clone(&manager);
                    let sql = Arc::clone(&sql);
                    let chunk = Arc::clone(&chunk);
                    async move { insert_chunk(&manager, &sql, &chunk).await }
                }
            })
            .collect();

        tracing::info!(file_id, task_id = %task_id, rows = total, chunks = sizes.len(), "Staging file");
        let results = self
            .queue
            .add_batch_task(file_id, sub_tasks, options.with_id(task_id))
            .await?;

        let chunks: Vec<ChunkOutcome> = results
            .into_iter()
            .zip(sizes)
            .enumerate()
            .map(|(index, (result, rows))| match result {
                Ok(inserted) => ChunkOutcome {
                    index,
                    rows,
                    inserted,
                    error: None,
                },
                Err(e) => ChunkOutcome {
                    index,
                    rows,
                    inserted: 0,
                    error: Some(e.to_string()),
                },
            })
            .collect();

        let report = StageReport {
            file_id: file_id.to_owned(),
            task_id,
            rows: total,
            inserted: chunks.iter().fold(0_u64, |sum, c| sum.saturating_add(c.inserted)),
            chunks,
        };
        if report.is_complete() {
            tracing::info!(file_id, inserted = report.inserted, "File staged");
        } else {
            tracing::warn!(
                file_id,
                inserted = report.inserted,
                failed_chunks = report.failed_chunks(),
                "File staged with failed chunks"
            );
        }
        Ok(report)
    }

    /// Stop background maintenance and close the connection source.
    pub async fn shutdown(self) {
        for task in self.background {
            task.stop().await;
        }
        self.manager.source().close().await;
        tracing::info!("Ingest service stopped");
    }
}

/// Insert one chunk in its own transaction.
async fn insert_chunk<S: ConnectionSource>(
    manager: &ConnectionManager<S>,
    sql: &str,
    rows: &[Vec<QueryParam>],
) -> Result<u64, DbError> {
    manager
        .with_transaction(
            |tx| async move {
                let mut inserted = 0_u64;
                for row in rows {
                    let set = manager.execute_query(sql, row, Some(tx)).await?;
                    inserted = inserted.saturating_add(set.rows_affected);
                }
                Ok::<_, DbError>(inserted)
            },
            None,
        )
        .await
}

fn split_chunks<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        chunks.push(items.by_ref().take(size).collect());
    }
    chunks
}
