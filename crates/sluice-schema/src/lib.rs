//! # Sluice Schema
//!
//! Versioned catalog of upstream schemas, tables, columns and indexes.
//!
//! The store keeps an immutable [`SchemaSnapshot`] per schema version.
//! Applying a DDL job computes the next snapshot from the previous one plus
//! the job delta; readers resolve row events against the highest snapshot
//! whose version is at or below the event's commit timestamp.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod snapshot;
pub mod storage;

pub use snapshot::SchemaSnapshot;
pub use storage::SchemaStorage;

/// Errors from snapshot lookup and DDL application.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// A schema id could not be resolved.
    #[error("schema {0} not found")]
    SchemaNotFound(i64),

    /// A table id could not be resolved.
    #[error("table {0} not found")]
    TableNotFound(i64),

    /// A DDL job is inconsistent with the current snapshot.
    #[error("schema conflict applying job {job_id} ({query}): {reason}")]
    Conflict {
        /// The offending job id.
        job_id: i64,
        /// The original DDL statement.
        query: String,
        /// Why the job could not be applied.
        reason: String,
    },

    /// A job that must carry table metadata did not.
    #[error("job {0} carries no table info")]
    MissingTableInfo(i64),
}
