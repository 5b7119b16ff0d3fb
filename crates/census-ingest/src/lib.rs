//! Composition root for census ingestion.
//!
//! Loads the YAML configuration and builds one connection manager and one
//! task queue for the process. Parsed upload files are staged through
//! [`IngestService::stage_file`], which turns each file into a single batch
//! task of chunked insert transactions.
//!
//! # Architecture
//!
//! ```text
//! census-ingest.yaml --> IngestConfig
//!                           |
//!                           v
//! IngestService ---------- ConnectionManager<S> (+ transaction watchdog)
//!     |                       ^
//!     +-- stage_file ------> TaskQueue.add_batch_task
//!                               |-- lock file:<id>, lock staging table
//!                               +-- per chunk: run_with_retry(with_transaction(INSERT ...))
//! ```
//!
//! # Modules
//!
//! - [`config`] -- YAML configuration and conversions into runtime settings
//! - [`service`] -- `IngestService` and per-file staging reports
//! - [`error`] -- Service error type

pub mod config;
pub mod error;
pub mod service;

// Re-export primary types for convenience.
pub use config::{ConfigError, IngestConfig};
pub use error::IngestError;
pub use service::{ChunkOutcome, IngestService, StageReport};
