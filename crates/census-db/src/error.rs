//! Error types for the data layer.
//!
//! All errors are propagated via [`DbError`] which wraps the underlying
//! [`sqlx`] error or a driver-agnostic backend failure, plus the
//! transaction bookkeeping failures raised by the connection manager.

use std::time::Duration;

use census_types::{DeadlockClassify, TransactionId, is_deadlock_signal};

/// Errors that can occur in the data layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A query named a transaction that is not open.
    #[error("No connection found for transaction: {id}")]
    NoSuchTransaction {
        /// The unknown or already finalized transaction.
        id: TransactionId,
    },

    /// A scoped transaction outlived its timeout and was rolled back.
    #[error("Transaction {id} timed out after {timeout:?}")]
    TransactionTimeout {
        /// The transaction that timed out.
        id: TransactionId,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// Another transaction held an application lock for the whole wait.
    #[error("Application lock {name} held by transaction {holder} after {waited:?}")]
    ApplicationLockTimeout {
        /// The contended lock name.
        name: String,
        /// The transaction holding it.
        holder: TransactionId,
        /// How long the caller waited.
        waited: Duration,
    },

    /// A non-`sqlx` connection source reported a failure.
    #[error("Backend error{}: {message}", .code.as_deref().map(|c| format!(" [{c}]")).unwrap_or_default())]
    Backend {
        /// Engine error code, when the backend reports one.
        code: Option<String>,
        /// Engine error message.
        message: String,
    },
}

impl DbError {
    /// Build a [`DbError::Backend`] from a code and message.
    pub fn backend(code: Option<&str>, message: impl Into<String>) -> Self {
        Self::Backend {
            code: code.map(str::to_owned),
            message: message.into(),
        }
    }
}

impl DeadlockClassify for DbError {
    fn is_deadlock(&self) -> bool {
        match self {
            Self::Postgres(sqlx::Error::Database(db)) => {
                is_deadlock_signal(db.code().as_deref(), db.message())
            }
            Self::Backend { code, message } => is_deadlock_signal(code.as_deref(), message),
            Self::Postgres(_)
            | Self::Config(_)
            | Self::NoSuchTransaction { .. }
            | Self::TransactionTimeout { .. }
            | Self::ApplicationLockTimeout { .. } => false,
        }
    }
}
