//! Data layer for the census ingestion write scheduler.
//!
//! Owns every pooled database connection. Callers either run a one-shot
//! statement (a connection is checked out for that statement alone) or open
//! a named transaction that keeps its connection until commit or rollback.
//!
//! # Architecture
//!
//! ```text
//! ConnectionManager<S>
//!     |
//!     +-- one-shot query -----> S::acquire() -> execute -> drop (release)
//!     |
//!     +-- begin_transaction --> S::acquire() -> BEGIN -> transaction map
//!         |-- execute_query(.., Some(id))  (serialized per transaction)
//!         |-- acquire_application_lock     (held until finalize)
//!         +-- commit / rollback            (remove, finalize, release)
//!
//! S = PostgresPool (sqlx PgPool) | MemorySource (in-process double)
//! ```
//!
//! # Modules
//!
//! - [`connection_manager`] -- Transaction lifecycle, one-shot queries, watchdog
//! - [`source`] -- The `ConnectionSource` / `PooledConnection` seam
//! - [`postgres`] -- `PostgreSQL` connection pool and configuration
//! - [`memory`] -- Scripted in-memory connection source
//! - [`error`] -- Shared error types

pub mod connection_manager;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod source;

// Re-export primary types for convenience.
pub use connection_manager::{ConnectionManager, TransactionConfig, TransactionInfo, TransactionState};
pub use error::DbError;
pub use memory::{MemoryConnection, MemorySource, RecordedStatement};
pub use postgres::{IsolationLevel, PgPooledConnection, PostgresConfig, PostgresPool};
pub use source::{ConnectionSource, PooledConnection, QueryParam, Row, RowSet};
