//! Error types for the ingest service.

use census_db::DbError;
use census_scheduler::QueueError;

use crate::config::ConfigError;

/// Errors surfaced by [`IngestService`](crate::IngestService).
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Configuration could not be loaded.
    #[error("configuration error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },

    /// The database could not be reached or rejected a statement.
    #[error("database error: {source}")]
    Database {
        /// The underlying database error.
        #[from]
        source: DbError,
    },

    /// A staging batch could not be scheduled (lock or dependency timeout).
    #[error("scheduling error: {source}")]
    Scheduling {
        /// The underlying queue error.
        #[from]
        source: QueueError<DbError>,
    },
}
