//! Streaming KV client and per-table puller contracts.
//!
//! The concrete client (gRPC pool, region cache, lock resolver) lives
//! outside this crate. Two shapes are supported, fixed at source-manager
//! construction:
//!
//! - **Multiplexing**: one shared [`SharedKvClient`] carries every table
//!   subscription; entries are delivered through a single consume callback.
//! - **Per-table**: a [`TablePuller`] per span, created by a
//!   [`TablePullerFactory`], each wired directly to the sort engine.

use std::sync::Arc;

use async_trait::async_trait;
use sluice_model::{RawKvEntry, Span, Ts};
use tokio::sync::mpsc;

use crate::engine::SortEngine;
use crate::PullerError;

/// Decides whether an UPDATE entry must be split into DELETE + INSERT
/// before entering the sort engine.
pub type SplitPredicate = Arc<dyn Fn(&RawKvEntry) -> bool + Send + Sync>;

/// Consumer invoked by a shared client for every delivered entry.
///
/// The client passes the subscription's split predicate back so the
/// consumer can split updates without tracking subscriptions itself.
pub type ConsumeFn =
    Arc<dyn Fn(RawKvEntry, &Span, &SplitPredicate) -> Result<(), PullerError> + Send + Sync>;

/// A shared streaming KV client multiplexing many span subscriptions.
#[async_trait]
pub trait SharedKvClient: Send + Sync {
    /// Register the consumer invoked for every delivered entry.
    ///
    /// Must be called once, before [`SharedKvClient::run`].
    fn set_consumer(&self, consume: ConsumeFn);

    /// Subscribe the spans starting from `start_ts`. Resolved markers for
    /// the spans are delivered periodically.
    fn subscribe(&self, spans: &[Span], start_ts: Ts, name: &str, split: SplitPredicate);

    /// Drop the subscription for the spans. Entries already in flight may
    /// still be delivered and must be discarded downstream.
    fn unsubscribe(&self, spans: &[Span]);

    /// Drive the client until it fails or is closed.
    async fn run(&self) -> Result<(), PullerError>;

    /// Stop all subscriptions and release the client.
    fn close(&self);
}

/// A running single-table subscription in per-table mode.
pub trait TablePuller: Send + Sync {
    /// Stop the subscription.
    fn close(&self);
}

/// Everything a per-table puller needs at creation time.
pub struct TablePullerParams {
    /// The table span to subscribe.
    pub span: Span,
    /// Table name, for logging.
    pub table_name: String,
    /// Timestamp to start pulling from.
    pub start_ts: Ts,
    /// Update-split decision for this table.
    pub split: SplitPredicate,
    /// Engine the puller feeds.
    pub engine: Arc<dyn SortEngine>,
    /// Where the puller reports fatal errors.
    pub error_tx: mpsc::Sender<PullerError>,
    /// Whether the stream runs in bidirectional-replication mode.
    pub bdr_mode: bool,
}

/// Creates and starts a per-table puller.
pub type TablePullerFactory = Arc<dyn Fn(TablePullerParams) -> Box<dyn TablePuller> + Send + Sync>;

/// Metadata of the upstream system table holding DDL jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemTableMeta {
    /// Schema id of the system database.
    pub schema_id: i64,
    /// Physical table id of the job queue table.
    pub table_id: i64,
    /// Column id of the `job_meta` column carrying the encoded job.
    pub job_meta_column_id: i64,
}

/// Resolves [`SystemTableMeta`] by snapshotting the KV store at its current
/// version.
///
/// Called lazily when the first row-format (non-legacy) DDL entry arrives.
pub trait MetaResolver: Send + Sync {
    /// Resolve the job-queue table metadata.
    ///
    /// # Errors
    ///
    /// Returns [`PullerError::MetaNotFound`] when the system database,
    /// table, or column cannot be found.
    fn system_table_meta(&self) -> Result<SystemTableMeta, PullerError>;
}
