//! Source manager: per-table subscription lifecycle over the KV stream.
//!
//! One manager per replication stream. The puller shape is fixed at
//! construction: either a shared multiplexing client carrying every span,
//! or one [`TablePuller`] per span created through a factory. Either way,
//! raw entries land in the sort engine; UPDATE entries are split into
//! DELETE + INSERT according to the stream's [`SplitUpdateMode`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use sluice_model::{OpType, RawKvEntry, Span, Ts};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::client::{
    ConsumeFn, SharedKvClient, SplitPredicate, TablePuller, TablePullerFactory, TablePullerParams,
};
use crate::engine::{EnginePosition, SortEngine};
use crate::mounter::{MountedEventIter, Mounter};
use crate::PullerError;

/// Capacity of the shared error channel in per-table mode.
const ERROR_CHANNEL_CAPACITY: usize = 16;

/// Rows mounted per `fetch_by_table` call.
const DEFAULT_MAX_BATCH_SIZE: usize = 256;

/// When an UPDATE KV entry is split into DELETE + INSERT before sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitUpdateMode {
    /// Never split.
    #[default]
    None,
    /// Always split.
    Always,
    /// Split only updates committed before the table started replicating;
    /// those may describe rows the downstream never saw, so the
    /// conservative delete-then-insert shape is required.
    AtStart,
}

/// Returns the timestamp a table started replicating at.
pub type ReplicatingTsFn = Arc<dyn Fn() -> Ts + Send + Sync>;

enum PullerShape {
    Table {
        factory: TablePullerFactory,
        registry: DashMap<Span, Box<dyn TablePuller>>,
        error_tx: mpsc::Sender<PullerError>,
        error_rx: parking_lot::Mutex<Option<mpsc::Receiver<PullerError>>>,
    },
    Multiplexing {
        client: Arc<dyn SharedKvClient>,
    },
}

/// Owns table subscriptions and bridges the KV stream into the sort engine.
pub struct SourceManager {
    changefeed: String,
    engine: Arc<dyn SortEngine>,
    mounter: Arc<dyn Mounter>,
    split_update_mode: SplitUpdateMode,
    bdr_mode: bool,
    shape: PullerShape,
    ready: Arc<Notify>,
    ready_flag: AtomicBool,
}

impl SourceManager {
    /// A manager with one puller per table.
    #[must_use]
    pub fn new_per_table(
        changefeed: impl Into<String>,
        engine: Arc<dyn SortEngine>,
        mounter: Arc<dyn Mounter>,
        split_update_mode: SplitUpdateMode,
        bdr_mode: bool,
        factory: TablePullerFactory,
    ) -> Self {
        let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            changefeed: changefeed.into(),
            engine,
            mounter,
            split_update_mode,
            bdr_mode,
            shape: PullerShape::Table {
                factory,
                registry: DashMap::new(),
                error_tx,
                error_rx: parking_lot::Mutex::new(Some(error_rx)),
            },
            ready: Arc::new(Notify::new()),
            ready_flag: AtomicBool::new(false),
        }
    }

    /// A manager sharing one multiplexing client across all tables.
    #[must_use]
    pub fn new_multiplexing(
        changefeed: impl Into<String>,
        engine: Arc<dyn SortEngine>,
        mounter: Arc<dyn Mounter>,
        split_update_mode: SplitUpdateMode,
        bdr_mode: bool,
        client: Arc<dyn SharedKvClient>,
    ) -> Self {
        Self {
            changefeed: changefeed.into(),
            engine,
            mounter,
            split_update_mode,
            bdr_mode,
            shape: PullerShape::Multiplexing { client },
            ready: Arc::new(Notify::new()),
            ready_flag: AtomicBool::new(false),
        }
    }

    /// Whether the stream runs in bidirectional-replication mode.
    #[must_use]
    pub fn bdr_mode(&self) -> bool {
        self.bdr_mode
    }

    /// Add a table: register the span with the engine, then start its
    /// subscription. Engine first, so no delivered entry is dropped.
    pub fn add_table(
        &self,
        span: Span,
        table_name: &str,
        start_ts: Ts,
        replicating_ts: ReplicatingTsFn,
    ) {
        self.engine.add_table(&span, start_ts);
        let split = split_predicate(self.split_update_mode, replicating_ts);

        match &self.shape {
            PullerShape::Multiplexing { client } => {
                client.subscribe(std::slice::from_ref(&span), start_ts, table_name, split);
            }
            PullerShape::Table {
                factory,
                registry,
                error_tx,
                ..
            } => {
                let puller = factory(TablePullerParams {
                    span: span.clone(),
                    table_name: table_name.to_string(),
                    start_ts,
                    split,
                    engine: Arc::clone(&self.engine),
                    error_tx: error_tx.clone(),
                    bdr_mode: self.bdr_mode,
                });
                registry.insert(span, puller);
            }
        }
    }

    /// Remove a table: stop its subscription, then unregister from the
    /// engine. Entries still draining for the span are discarded
    /// downstream.
    pub fn remove_table(&self, span: &Span) {
        match &self.shape {
            PullerShape::Multiplexing { client } => {
                client.unsubscribe(std::slice::from_ref(span));
            }
            PullerShape::Table { registry, .. } => {
                if let Some((_, puller)) = registry.remove(span) {
                    puller.close();
                }
            }
        }
        self.engine.remove_table(span);
    }

    /// Register the per-table resolved-ts callback on the engine.
    pub fn on_resolve(&self, callback: crate::engine::ResolveCallback) {
        self.engine.on_resolve(callback);
    }

    /// Mounted iteration over a table's sorted events in `[lower, upper)`.
    #[must_use]
    pub fn fetch_by_table(
        &self,
        span: &Span,
        lower: EnginePosition,
        upper: EnginePosition,
    ) -> MountedEventIter {
        let iter = self.engine.fetch_by_table(span, lower, upper);
        MountedEventIter::new(iter, Arc::clone(&self.mounter), DEFAULT_MAX_BATCH_SIZE)
    }

    /// Drop the table's persisted events strictly below `upper`.
    ///
    /// # Errors
    ///
    /// Propagates engine storage failures.
    pub fn clean_by_table(&self, span: &Span, upper: EnginePosition) -> Result<(), PullerError> {
        self.engine
            .clean_by_table(span, upper)
            .map_err(|e| PullerError::Subscription(e.to_string()))
    }

    /// Wait until [`SourceManager::run`] has signalled readiness.
    pub async fn wait_for_ready(&self) {
        while !self.ready_flag.load(Ordering::Acquire) {
            let notified = self.ready.notified();
            if self.ready_flag.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    fn signal_ready(&self) {
        self.ready_flag.store(true, Ordering::Release);
        self.ready.notify_waiters();
    }

    /// Drive the manager until a subscription fails or `cancel` fires.
    ///
    /// In multiplexing mode this wires the engine consumer into the shared
    /// client and runs it; in per-table mode it parks on the shared error
    /// channel.
    ///
    /// # Errors
    ///
    /// Returns the first fatal subscription error, or
    /// [`PullerError::Cancelled`].
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PullerError> {
        match &self.shape {
            PullerShape::Multiplexing { client } => {
                client.set_consumer(engine_consumer(Arc::clone(&self.engine)));
                self.signal_ready();
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(PullerError::Cancelled),
                    result = client.run() => result,
                }
            }
            PullerShape::Table { error_rx, .. } => {
                let mut rx = error_rx
                    .lock()
                    .take()
                    .ok_or(PullerError::ChannelClosed)?;
                self.signal_ready();
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(PullerError::Cancelled),
                    err = rx.recv() => match err {
                        Some(err) => Err(err),
                        None => Err(PullerError::ChannelClosed),
                    },
                }
            }
        }
    }

    /// Stop every subscription, then close the engine. An engine close
    /// error is fatal.
    ///
    /// # Errors
    ///
    /// Returns [`PullerError::EngineClose`] when the engine cannot release
    /// its backing store.
    pub fn close(&self) -> Result<(), PullerError> {
        tracing::info!(changefeed = %self.changefeed, "Closing source manager");
        match &self.shape {
            PullerShape::Multiplexing { client } => client.close(),
            PullerShape::Table { registry, .. } => {
                registry.retain(|_, puller| {
                    puller.close();
                    false
                });
            }
        }
        self.engine
            .close()
            .map_err(|e| PullerError::EngineClose(e.to_string()))?;
        tracing::info!(changefeed = %self.changefeed, "Closed source manager");
        Ok(())
    }
}

/// Build the update-split decision for one table.
fn split_predicate(mode: SplitUpdateMode, replicating_ts: ReplicatingTsFn) -> SplitPredicate {
    Arc::new(move |raw: &RawKvEntry| {
        if !raw.is_update() {
            return false;
        }
        match mode {
            SplitUpdateMode::None => false,
            SplitUpdateMode::Always => true,
            SplitUpdateMode::AtStart => raw.commit_ts < replicating_ts(),
        }
    })
}

/// The consume callback routing shared-client deliveries into the engine.
fn engine_consumer(engine: Arc<dyn SortEngine>) -> ConsumeFn {
    Arc::new(move |raw: RawKvEntry, span: &Span, split: &SplitPredicate| {
        if raw.op_type != OpType::Resolved && split(&raw) {
            if let Some((delete, insert)) = raw.split_update() {
                engine.add(span, vec![delete, insert]);
                return Ok(());
            }
        }
        engine.add(span, vec![raw]);
        Ok(())
    })
}
