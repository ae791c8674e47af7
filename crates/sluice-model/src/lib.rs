//! # Sluice Model
//!
//! Shared data model for the Sluice replication core: replication-log
//! positions and GTID sets, table keyspace spans, raw KV entries, row-level
//! change events, table metadata, and DDL jobs.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod ddl;
pub mod event;
pub mod position;
pub mod span;
pub mod table;

pub use ddl::{BinlogInfo, DdlJob, DdlJobType, RenameTablesArgs};
pub use event::{
    Column, ColumnFlags, OpType, RawKvEntry, RowChange, SqlValue, TxnCallback,
    TxnCallbackableEvent, TxnEvent,
};
pub use position::{BinlogPosition, GtidSet, Location};
pub use span::Span;
pub use table::{ColumnMeta, IndexMeta, TableInfo, TableRef};

/// A monotonic timestamp drawn from the upstream cluster's clock.
///
/// Two kinds share this representation: per-row commit timestamps and
/// resolved watermarks ("no event with `commit_ts <= resolved_ts` will ever
/// appear").
pub type Ts = u64;

/// Errors from model-level parsing and validation.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// A GTID set or interval could not be parsed.
    #[error("invalid GTID set {text:?}: {reason}")]
    InvalidGtidSet {
        /// The offending text.
        text: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A DDL job carried malformed or inconsistent raw arguments.
    #[error("invalid DDL job {job_id}: {reason}")]
    InvalidDdlJob {
        /// The job id.
        job_id: i64,
        /// What was wrong with it.
        reason: String,
    },

    /// A JSON payload failed to decode.
    #[error("json decode error: {0}")]
    Json(#[from] serde_json::Error),
}
