//! Shared identifiers and primitives for the census ingestion write scheduler.
//!
//! Every other crate in the workspace depends on this one. It holds the
//! pieces that both the data layer and the task queue need without either
//! depending on the other.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID v7 identifiers for transactions, locks, and tasks
//! - [`classify`] -- Deadlock-class error detection shared by the retry executor
//! - [`background`] -- Stoppable handle for periodic maintenance tasks

pub mod background;
pub mod classify;
pub mod ids;

pub use background::BackgroundTask;
pub use classify::{DeadlockClassify, is_deadlock_signal};
pub use ids::{LockId, TaskId, TransactionId};
