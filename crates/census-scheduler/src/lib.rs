//! Write scheduling for census ingestion.
//!
//! Serializes conflicting database writes issued by concurrent ingestion
//! jobs without exhausting the connection pool.
//!
//! # Architecture
//!
//! ```text
//! TaskQueue::add_transaction_task / add_batch_task
//!     |
//!     +-- DependencyTracker  wait for in-flight dependencies
//!     +-- PriorityGate       concurrency ceiling, priority order
//!     +-- RateLimiter        sliding-window start rate
//!     +-- LockRegistry       named advisory locks (reentrant, expiring)
//!     +-- run_with_retry     deadlock retry with backoff + jitter
//! ```
//!
//! # Modules
//!
//! - [`queue`] -- The task queue, its options, and stats
//! - [`lock_registry`] -- Named advisory locks and the expiry sweep
//! - [`retry`] -- Deadlock-aware retry policy and executor
//! - [`dependency`] -- In-flight task registry for dependency waits
//! - [`gate`] -- Priority-ordered concurrency gate
//! - [`rate_limit`] -- Sliding-window start-rate limiter
//! - [`error`] -- Lock and queue error types

pub mod dependency;
pub mod error;
pub mod gate;
pub mod lock_registry;
pub mod queue;
pub mod rate_limit;
pub mod retry;

// Re-export primary types for convenience.
pub use dependency::{DependencyTimeout, DependencyTracker, InFlight};
pub use error::{LockError, QueueError};
pub use gate::{PriorityGate, SlotPermit};
pub use lock_registry::{LockConfig, LockRegistry, LockSnapshot};
pub use queue::{DEFAULT_STAGING_TABLE, MAX_CONCURRENCY, QueueConfig, QueueStats, TaskOptions, TaskQueue};
pub use rate_limit::RateLimiter;
pub use retry::{RetryPolicy, run_with_retry};
