//! # Sluice Sink
//!
//! The downstream half of the replication pipeline:
//!
//! - [`checkpoint`] — replicated binlog/GTID checkpoint store with
//!   snapshot, flush, rollback, load and clear semantics.
//! - [`meta`] — bootstrap positions from a dumper metadata file.
//! - [`backend`] — transactional DML batching engine converting row changes
//!   into optimized SQL and committing with retry.
//! - [`sqlgen`] — SQL generation: per-row DML, multi-VALUES REPLACE
//!   coalescing, grouped batch statements.
//! - [`conn`] — thin connection seams over the downstream database;
//!   [`testing`] scripts them for tests.

#![warn(clippy::all, clippy::pedantic)]

pub mod backend;
pub mod checkpoint;
pub mod conn;
pub mod meta;
pub mod sqlgen;
pub mod testing;

use std::time::Duration;

pub use backend::{MysqlBackend, SinkConfig};
pub use checkpoint::{CheckpointConfig, RemoteCheckpoint, SnapshotInfo};
pub use conn::{ConnPool, DbErrorKind, DbOpError, SinkConn};
pub use meta::DumpMeta;

/// Errors surfaced by the sink side of the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Duplicate-key failure downstream. Non-retryable: the operator must
    /// restart the stream after resolving the conflict.
    #[error("duplicate entry: {0}")]
    DuplicateEntry(String),

    /// The downstream is missing a table or database the stream writes to.
    #[error("downstream schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Transient transaction failure: connection drops, timeouts,
    /// deadlocks, lock waits. Retried with backoff.
    #[error("transaction error: {0}")]
    Txn(String),

    /// A statement exceeded its write deadline.
    #[error("statement timed out after {0:?}")]
    Timeout(Duration),

    /// An internal ordering or bookkeeping rule was broken.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The dumper metadata file could not be parsed.
    #[error("metadata file error: {0}")]
    Meta(String),

    /// Filesystem error reading bootstrap metadata.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Serialized table metadata failed to round-trip.
    #[error("table info serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Model-level parse failure (GTID sets in stored checkpoints).
    #[error(transparent)]
    Model(#[from] sluice_model::ModelError),

    /// The surrounding context was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl SinkError {
    /// Whether the error may resolve on retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Txn(_) | Self::Timeout(_))
    }
}

impl From<DbOpError> for SinkError {
    fn from(err: DbOpError) -> Self {
        match err.kind {
            DbErrorKind::DuplicateEntry => Self::DuplicateEntry(err.message),
            DbErrorKind::UnknownTable | DbErrorKind::UnknownDatabase => {
                Self::SchemaMismatch(err.message)
            }
            DbErrorKind::Cancelled => Self::Cancelled,
            DbErrorKind::Transient | DbErrorKind::UnknownSystemVariable => Self::Txn(err.message),
        }
    }
}
