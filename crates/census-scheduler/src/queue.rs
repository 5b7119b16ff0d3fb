//! Bounded-concurrency priority queue for database write tasks.
//!
//! Every submitted task runs through the same pipeline:
//!
//! 1. wait until its dependencies are no longer in flight,
//! 2. take a concurrency slot (priority order) and a start-rate token,
//! 3. acquire its resource locks in the given order,
//! 4. run its work through the deadlock-retry executor,
//! 5. release its locks in reverse order and free the slot.
//!
//! Each task is spawned onto the Tokio runtime when it is submitted, so
//! it makes progress whether or not the caller polls the returned future,
//! and the submitting methods must be called from within a runtime.
//! Dropping the returned future detaches the task; it does not cancel it.
//! Locks and the slot are held by guards, so step 5 also happens when the
//! work fails or panics.

use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, join_all};
use serde::Serialize;

use census_types::{BackgroundTask, DeadlockClassify, LockId, TaskId};

use crate::dependency::DependencyTracker;
use crate::error::QueueError;
use crate::gate::PriorityGate;
use crate::lock_registry::{LockConfig, LockRegistry, LockSnapshot};
use crate::rate_limit::RateLimiter;
use crate::retry::{RetryPolicy, run_with_retry};

/// Hard ceiling on concurrently executing tasks, matched to the
/// connection pool size.
pub const MAX_CONCURRENCY: usize = 12;

/// Default staging table locked by every batch task.
pub const DEFAULT_STAGING_TABLE: &str = "temporarymeasurements";

/// Default start-rate window.
const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(1);

/// Default starts allowed per window, as a multiple of the concurrency.
const DEFAULT_BURST_MULTIPLIER: usize = 2;

/// Queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum concurrently executing tasks, at most [`MAX_CONCURRENCY`].
    pub concurrency: usize,
    /// Start-rate window.
    pub rate_window: Duration,
    /// Starts allowed per window, as a multiple of `concurrency`.
    pub burst_multiplier: usize,
    /// Table-level resource locked by every batch task.
    pub staging_table: String,
    /// Bound on dependency waits; unbounded when `None`.
    pub dependency_timeout: Option<Duration>,
    /// Lock registry settings.
    pub locks: LockConfig,
    /// Retry policy for tasks that do not set their own.
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(MAX_CONCURRENCY)
    }
}

impl QueueConfig {
    /// Settings with `concurrency` clamped to `1..=MAX_CONCURRENCY`.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.clamp(1, MAX_CONCURRENCY),
            rate_window: DEFAULT_RATE_WINDOW,
            burst_multiplier: DEFAULT_BURST_MULTIPLIER,
            staging_table: String::from(DEFAULT_STAGING_TABLE),
            dependency_timeout: None,
            locks: LockConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Set the start-rate window and burst multiplier. A zero multiplier
    /// disables rate limiting.
    #[must_use]
    pub const fn with_rate_limit(mut self, window: Duration, burst_multiplier: usize) -> Self {
        self.rate_window = window;
        self.burst_multiplier = burst_multiplier;
        self
    }

    /// Set the staging table locked by batch tasks.
    #[must_use]
    pub fn with_staging_table(mut self, table: impl Into<String>) -> Self {
        self.staging_table = table.into();
        self
    }

    /// Bound dependency waits.
    #[must_use]
    pub const fn with_dependency_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dependency_timeout = timeout;
        self
    }

    /// Set the lock registry settings.
    #[must_use]
    pub const fn with_locks(mut self, locks: LockConfig) -> Self {
        self.locks = locks;
        self
    }

    /// Set the default retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn rate_limit(&self) -> usize {
        self.concurrency.saturating_mul(self.burst_multiplier)
    }
}

/// Per-task scheduling options.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Task ID; generated when `None`. Pre-assign it so other tasks can
    /// depend on this one.
    pub id: Option<TaskId>,
    /// Higher runs first.
    pub priority: i32,
    /// Tasks that must finish before this one starts.
    pub dependencies: Vec<TaskId>,
    /// Resource names to lock, in acquisition order.
    pub resource_locks: Vec<String>,
    /// Lock owner; the task ID when `None`. Tasks sharing an owner share
    /// its locks reentrantly.
    pub lock_owner: Option<String>,
    /// Retry policy; the queue default when `None`.
    pub retry: Option<RetryPolicy>,
}

impl TaskOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a pre-assigned task ID.
    #[must_use]
    pub const fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add a dependency.
    #[must_use]
    pub fn depends_on(mut self, id: TaskId) -> Self {
        self.dependencies.push(id);
        self
    }

    /// Add a resource lock.
    #[must_use]
    pub fn lock(mut self, resource: impl Into<String>) -> Self {
        self.resource_locks.push(resource.into());
        self
    }

    /// Set the lock owner.
    #[must_use]
    pub fn with_lock_owner(mut self, owner: impl Into<String>) -> Self {
        self.lock_owner = Some(owner.into());
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Read-only queue projection for operational visibility.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Submitted tasks that do not hold a concurrency slot yet, whether
    /// they wait on dependencies or on the slot itself.
    pub size: usize,
    /// Tasks holding a slot (acquiring locks or running).
    pub pending: usize,
    /// Configured concurrency.
    pub concurrency: usize,
    /// Submitted tasks that have not finished, including those waiting on
    /// dependencies.
    pub in_flight: usize,
    /// Number of held resource locks.
    pub active_locks: usize,
    /// Every held resource lock.
    pub locks: Vec<LockSnapshot>,
}

#[derive(Debug)]
struct LockRequest {
    resource: String,
    owner: String,
}

#[derive(Debug)]
struct TaskPlan {
    id: TaskId,
    priority: i32,
    dependencies: Vec<TaskId>,
    locks: Vec<LockRequest>,
}

/// Releases held locks in reverse acquisition order when dropped.
struct HeldLocks {
    registry: Arc<LockRegistry>,
    ids: Vec<LockId>,
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        while let Some(lock_id) = self.ids.pop() {
            self.registry.release(lock_id);
        }
    }
}

#[derive(Debug)]
struct QueueInner {
    config: QueueConfig,
    locks: Arc<LockRegistry>,
    gate: Arc<PriorityGate>,
    rate: RateLimiter,
    dependencies: Arc<DependencyTracker>,
    batch_owner: String,
}

impl QueueInner {
    async fn execute<B, Fut, R, E>(&self, plan: TaskPlan, body: B) -> Result<R, QueueError<E>>
    where
        B: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let id = plan.id;
        self.dependencies
            .wait_for(id, &plan.dependencies, self.config.dependency_timeout)
            .await
            .map_err(|t| QueueError::DependencyTimeout {
                dependency: t.dependency,
                waited: t.waited,
            })?;

        let _slot = self.gate.acquire(plan.priority).await;
        self.rate.acquire().await;

        let mut held = HeldLocks {
            registry: Arc::clone(&self.locks),
            ids: Vec::with_capacity(plan.locks.len()),
        };
        for request in &plan.locks {
            let lock_id = self.locks.acquire(&request.resource, &request.owner).await?;
            held.ids.push(lock_id);
        }

        tracing::debug!(task_id = %id, priority = plan.priority, locks = held.ids.len(), "Task started");
        let output = body().await;
        drop(held);
        tracing::debug!(task_id = %id, "Task finished");
        Ok(output)
    }
}

/// Start `task` on the runtime now and return a future over its result.
fn spawn_task<T, E>(
    id: TaskId,
    task: impl Future<Output = Result<T, QueueError<E>>> + Send + 'static,
) -> BoxFuture<'static, Result<T, QueueError<E>>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let handle = tokio::spawn(task);
    Box::pin(async move {
        handle.await.unwrap_or_else(|err| {
            let reason = if err.is_panic() {
                let payload = err.into_panic();
                panic_message(payload.as_ref())
            } else {
                String::from("cancelled")
            };
            tracing::error!(task_id = %id, reason = %reason, "Task aborted");
            Err(QueueError::Aborted { task: id, reason })
        })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("panicked"))
}

/// Bounded-concurrency, lock-aware task queue.
///
/// Cheap to clone; clones share the same slots, locks, and in-flight set.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    /// Create a queue with its own lock registry.
    pub fn new(config: QueueConfig) -> Self {
        let locks = Arc::new(LockRegistry::new(config.locks.clone()));
        Self::with_registry(config, locks)
    }

    /// Create a queue over an existing lock registry.
    pub fn with_registry(mut config: QueueConfig, locks: Arc<LockRegistry>) -> Self {
        config.concurrency = config.concurrency.clamp(1, MAX_CONCURRENCY);
        let rate = RateLimiter::new(config.rate_limit(), config.rate_window);
        let gate = Arc::new(PriorityGate::new(config.concurrency));
        let batch_owner = format!("batch:{}", config.staging_table);

        tracing::info!(
            concurrency = config.concurrency,
            rate_limit = rate.limit(),
            staging_table = %config.staging_table,
            "Task queue created"
        );

        Self {
            inner: Arc::new(QueueInner {
                config,
                locks,
                gate,
                rate,
                dependencies: Arc::new(DependencyTracker::new()),
                batch_owner,
            }),
        }
    }

    /// The queue settings.
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// The lock registry used by this queue.
    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.inner.locks
    }

    /// Submit one unit of work.
    ///
    /// The task is registered as in flight and spawned immediately, so
    /// tasks submitted afterwards can depend on it and it runs even if the
    /// returned future is never polled. The future resolves to the work's
    /// result.
    ///
    /// # Errors
    ///
    /// The future yields [`QueueError::Task`] with the work's own error
    /// (after deadlock retries), a scheduling error if a lock or
    /// dependency wait timed out, or [`QueueError::Aborted`] if the work
    /// panicked.
    pub fn add_transaction_task<F, Fut, T, E>(
        &self,
        work: F,
        options: TaskOptions,
    ) -> BoxFuture<'static, Result<T, QueueError<E>>>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: DeadlockClassify + Display + Send + 'static,
    {
        let id = options.id.unwrap_or_default();
        let in_flight = self.inner.dependencies.register(id);
        let retry = options.retry.clone().unwrap_or_else(|| self.inner.config.retry.clone());
        let owner = options.lock_owner.clone().unwrap_or_else(|| id.to_string());
        let plan = TaskPlan {
            id,
            priority: options.priority,
            dependencies: options.dependencies,
            locks: options
                .resource_locks
                .into_iter()
                .map(|resource| LockRequest {
                    resource,
                    owner: owner.clone(),
                })
                .collect(),
        };
        let inner = Arc::clone(&self.inner);

        spawn_task(id, async move {
            let _in_flight = in_flight;
            inner
                .execute::<_, _, _, E>(plan, || async move { run_with_retry(&retry, work).await })
                .await?
                .map_err(QueueError::Task)
        })
    }

    /// Submit a batch of sub-tasks for one file.
    ///
    /// The batch locks `file:<file_id>` and the staging table for its whole
    /// duration, then runs every sub-task concurrently, each through the
    /// deadlock-retry executor on its own. Two batches for the same file
    /// never overlap; batches for different files share the staging-table
    /// lock with each other and run concurrently.
    ///
    /// Extra `resource_locks` in `options` are acquired after those two;
    /// entries naming the file lock or the staging table are skipped since
    /// the batch already holds them.
    /// The future yields one result per sub-task, in order.
    ///
    /// # Errors
    ///
    /// The future yields a scheduling error if a lock or dependency wait
    /// timed out, or [`QueueError::Aborted`] if a sub-task panicked;
    /// sub-task failures are reported per element instead.
    pub fn add_batch_task<F, Fut, T, E>(
        &self,
        file_id: &str,
        sub_tasks: Vec<F>,
        options: TaskOptions,
    ) -> BoxFuture<'static, Result<Vec<Result<T, E>>, QueueError<E>>>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: DeadlockClassify + Display + Send + 'static,
    {
        let id = options.id.unwrap_or_default();
        let in_flight = self.inner.dependencies.register(id);
        let retry = options.retry.clone().unwrap_or_else(|| self.inner.config.retry.clone());
        let owner = options.lock_owner.clone().unwrap_or_else(|| id.to_string());

        let file_lock = format!("file:{file_id}");
        let staging_table = &self.inner.config.staging_table;
        let extras: Vec<LockRequest> = options
            .resource_locks
            .into_iter()
            .filter(|resource| *resource != file_lock && resource != staging_table)
            .map(|resource| LockRequest {
                resource,
                owner: owner.clone(),
            })
            .collect();
        let mut locks = vec![
            LockRequest {
                resource: file_lock,
                owner,
            },
            LockRequest {
                resource: staging_table.clone(),
                owner: self.inner.batch_owner.clone(),
            },
        ];
        locks.extend(extras);

        let plan = TaskPlan {
            id,
            priority: options.priority,
            dependencies: options.dependencies,
            locks,
        };
        let inner = Arc::clone(&self.inner);
        let file_id = file_id.to_owned();

        spawn_task(id, async move {
            let _in_flight = in_flight;
            let count = sub_tasks.len();
            let results = inner
                .execute::<_, _, _, E>(plan, || async {
                    tracing::info!(task_id = %id, file_id = %file_id, sub_tasks = count, "Batch started");
                    join_all(sub_tasks.into_iter().map(|work| {
                        let retry = &retry;
                        async move { run_with_retry(retry, work).await }
                    }))
                    .await
                })
                .await?;

            let failed = results.iter().filter(|r| r.is_err()).count();
            if failed > 0 {
                tracing::warn!(task_id = %id, file_id = %file_id, sub_tasks = count, failed, "Batch finished with failures");
            } else {
                tracing::info!(task_id = %id, file_id = %file_id, sub_tasks = count, "Batch finished");
            }
            Ok(results)
        })
    }

    /// Current queue depth, running count, and held locks.
    pub fn stats(&self) -> QueueStats {
        let locks = self.inner.locks.snapshot();
        let in_flight = self.inner.dependencies.in_flight_count();
        let pending = self.inner.gate.running();
        QueueStats {
            size: in_flight.saturating_sub(pending),
            pending,
            concurrency: self.inner.config.concurrency,
            in_flight,
            active_locks: locks.len(),
            locks,
        }
    }

    /// Start the periodic lock-expiry sweep.
    pub fn spawn_lock_sweeper(&self) -> BackgroundTask {
        self.inner.locks.spawn_sweeper()
    }
}
