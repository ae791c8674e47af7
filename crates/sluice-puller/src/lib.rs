//! # Sluice Puller
//!
//! The upstream half of the replication pipeline:
//!
//! - [`ddl_puller`] — tails the system DDL job queue, decodes jobs, filters
//!   them against user rules, applies them to the schema store, and advances
//!   a monotonic schema-resolved timestamp.
//! - [`source_manager`] — owns per-table subscriptions over the streaming KV
//!   client and routes raw entries into the sort engine.
//! - [`sorter`] — bounded-memory commit-ts sorter for the DDL stream.
//! - [`engine`] / [`client`] / [`mounter`] — contracts for the sort engine,
//!   the shared KV client, and raw-entry decoding. The concrete
//!   implementations (gRPC streaming, on-disk sorting) live outside this
//!   crate; [`testing`] provides in-memory doubles.

#![warn(clippy::all, clippy::pedantic)]

pub mod client;
pub mod ddl_puller;
pub mod engine;
pub mod filter;
pub mod mounter;
pub mod sorter;
pub mod source_manager;
pub mod testing;

use bytes::Bytes;

pub use client::{MetaResolver, SharedKvClient, SplitPredicate, SystemTableMeta, TablePuller};
pub use ddl_puller::{DdlEntry, DdlJobPuller, DdlPuller};
pub use engine::{EnginePosition, SortEngine};
pub use filter::{RuleFilter, TableFilter};
pub use source_manager::{SourceManager, SplitUpdateMode};

/// Errors surfaced by the puller side of the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PullerError {
    /// Model-level decode failure.
    #[error(transparent)]
    Model(#[from] sluice_model::ModelError),

    /// Schema store rejected a DDL job.
    #[error(transparent)]
    Schema(#[from] sluice_schema::SchemaError),

    /// A DDL KV entry could not be decoded into a job.
    #[error("cannot decode DDL job from key {key:?}: {reason}")]
    DecodeJob {
        /// The raw key, for diagnostics.
        key: Bytes,
        /// Why decoding failed.
        reason: String,
    },

    /// System-table metadata for the DDL job queue could not be resolved.
    #[error("cannot resolve DDL job table metadata: {0}")]
    MetaNotFound(String),

    /// A rename moved a previously filtered-out table into the replicated
    /// set; the source rows were never replicated, so the stream cannot
    /// continue safely.
    #[error("sync rename table failed for table {table_id}, query: {query}")]
    SyncRenameTable {
        /// The physical table id being renamed.
        table_id: i64,
        /// The rename statement.
        query: String,
    },

    /// A DDL turned an eligible table ineligible; continuing would risk
    /// data loss, so the operator must intervene.
    #[error(
        "an eligible table became ineligible after DDL [{query}]; this may cause data loss: \
         pause the stream, set force-replicate, and resume to replicate it anyway"
    )]
    EligibleBecameIneligible {
        /// The offending DDL statement.
        query: String,
    },

    /// The sort engine failed to close; treated as fatal.
    #[error("sort engine close failed: {0}")]
    EngineClose(String),

    /// A per-table subscription failed.
    #[error("table subscription failed: {0}")]
    Subscription(String),

    /// A pipeline channel closed while the component was still running.
    #[error("channel closed")]
    ChannelClosed,

    /// The surrounding context was cancelled.
    #[error("cancelled")]
    Cancelled,
}
