//! In-memory doubles for the engine, client, and mounter contracts.
//!
//! Used by this crate's tests and by downstream crates that need a
//! pipeline without a real KV stream or on-disk sorter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sluice_model::{Column, OpType, RawKvEntry, RowChange, Span, SqlValue, TableRef, Ts};
use tokio::sync::Notify;

use crate::client::{
    ConsumeFn, MetaResolver, SharedKvClient, SplitPredicate, SystemTableMeta, TablePuller,
    TablePullerFactory, TablePullerParams,
};
use crate::engine::{EngineError, EnginePosition, EventIterator, ResolveCallback, SortEngine};
use crate::mounter::Mounter;
use crate::PullerError;

// ── Sort engine ─────────────────────────────────────────────────────

#[derive(Default)]
struct TableState {
    events: Vec<(RawKvEntry, EnginePosition)>,
    resolved_ts: Ts,
}

/// In-memory [`SortEngine`] keeping per-span events sorted by
/// `(commit_ts, start_ts)`.
#[derive(Default)]
pub struct MemorySortEngine {
    tables: Mutex<HashMap<Span, TableState>>,
    resolve_callbacks: Mutex<Vec<ResolveCallback>>,
    closed: AtomicBool,
    fail_close: bool,
}

impl MemorySortEngine {
    /// A working in-memory engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine whose `close` fails, for fatal-close tests.
    #[must_use]
    pub fn failing_close() -> Self {
        Self {
            fail_close: true,
            ..Self::default()
        }
    }

    /// Whether a span is registered.
    #[must_use]
    pub fn has_table(&self, span: &Span) -> bool {
        self.tables.lock().contains_key(span)
    }

    /// The span's buffered events, in order.
    #[must_use]
    pub fn events(&self, span: &Span) -> Vec<RawKvEntry> {
        self.tables
            .lock()
            .get(span)
            .map(|t| t.events.iter().map(|(e, _)| e.clone()).collect())
            .unwrap_or_default()
    }

    /// The span's resolved timestamp.
    #[must_use]
    pub fn resolved_ts(&self, span: &Span) -> Ts {
        self.tables.lock().get(span).map_or(0, |t| t.resolved_ts)
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl SortEngine for MemorySortEngine {
    fn add_table(&self, span: &Span, _start_ts: Ts) {
        self.tables.lock().entry(span.clone()).or_default();
    }

    fn remove_table(&self, span: &Span) {
        self.tables.lock().remove(span);
    }

    fn add(&self, span: &Span, events: Vec<RawKvEntry>) {
        let mut resolved = None;
        {
            let mut tables = self.tables.lock();
            let Some(state) = tables.get_mut(span) else {
                // Entries for a removed span may still drain; drop them.
                return;
            };
            for event in events {
                if event.op_type == OpType::Resolved {
                    if event.commit_ts > state.resolved_ts {
                        state.resolved_ts = event.commit_ts;
                        resolved = Some(event.commit_ts);
                    }
                } else {
                    let pos = EnginePosition {
                        commit_ts: event.commit_ts,
                        start_ts: event.start_ts,
                    };
                    state.events.push((event, pos));
                }
            }
            state.events.sort_by_key(|(_, pos)| *pos);
        }
        if let Some(ts) = resolved {
            for callback in self.resolve_callbacks.lock().iter() {
                callback(span, ts);
            }
        }
    }

    fn on_resolve(&self, callback: ResolveCallback) {
        self.resolve_callbacks.lock().push(callback);
    }

    fn fetch_by_table(
        &self,
        span: &Span,
        lower: EnginePosition,
        upper: EnginePosition,
    ) -> Box<dyn EventIterator> {
        let events: Vec<_> = self
            .tables
            .lock()
            .get(span)
            .map(|t| {
                t.events
                    .iter()
                    .filter(|(_, pos)| *pos >= lower && *pos < upper)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Box::new(VecEventIter(events.into_iter()))
    }

    fn clean_by_table(&self, span: &Span, upper: EnginePosition) -> Result<(), EngineError> {
        let mut tables = self.tables.lock();
        let state = tables
            .get_mut(span)
            .ok_or_else(|| EngineError::SpanNotFound(span.to_string()))?;
        state.events.retain(|(_, pos)| *pos >= upper);
        Ok(())
    }

    fn close(&self) -> Result<(), EngineError> {
        if self.fail_close {
            return Err(EngineError::Storage("injected close failure".to_string()));
        }
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct VecEventIter(std::vec::IntoIter<(RawKvEntry, EnginePosition)>);

impl EventIterator for VecEventIter {
    fn next_event(&mut self) -> Option<(RawKvEntry, EnginePosition)> {
        self.0.next()
    }
}

// ── Shared KV client ────────────────────────────────────────────────

struct Subscription {
    span: Span,
    start_ts: Ts,
    split: SplitPredicate,
}

/// Scriptable [`SharedKvClient`] recording subscriptions and letting tests
/// push entries through the registered consumer.
#[derive(Default)]
pub struct MockKvClient {
    consumer: Mutex<Option<ConsumeFn>>,
    subscriptions: Mutex<Vec<Subscription>>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl MockKvClient {
    /// A fresh client with no subscriptions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The active subscriptions as `(span, start_ts)` pairs.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<(Span, Ts)> {
        self.subscriptions
            .lock()
            .iter()
            .map(|s| (s.span.clone(), s.start_ts))
            .collect()
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Deliver an entry for `span` through the consumer, applying the
    /// subscription's split predicate.
    ///
    /// # Errors
    ///
    /// Propagates consumer errors.
    ///
    /// # Panics
    ///
    /// Panics when no consumer is registered or the span is not
    /// subscribed.
    pub fn deliver(&self, span: &Span, entry: RawKvEntry) -> Result<(), PullerError> {
        let consumer = self
            .consumer
            .lock()
            .clone()
            .expect("consumer not registered");
        let split = self
            .subscriptions
            .lock()
            .iter()
            .find(|s| &s.span == span)
            .map(|s| Arc::clone(&s.split))
            .expect("span not subscribed");
        consumer(entry, span, &split)
    }
}

#[async_trait::async_trait]
impl SharedKvClient for MockKvClient {
    fn set_consumer(&self, consume: ConsumeFn) {
        *self.consumer.lock() = Some(consume);
    }

    fn subscribe(&self, spans: &[Span], start_ts: Ts, _name: &str, split: SplitPredicate) {
        let mut subs = self.subscriptions.lock();
        for span in spans {
            subs.push(Subscription {
                span: span.clone(),
                start_ts,
                split: Arc::clone(&split),
            });
        }
    }

    fn unsubscribe(&self, spans: &[Span]) {
        self.subscriptions
            .lock()
            .retain(|s| !spans.contains(&s.span));
    }

    async fn run(&self) -> Result<(), PullerError> {
        self.close_notify.notified().await;
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_waiters();
    }
}

// ── Per-table puller ────────────────────────────────────────────────

/// Recorded [`TablePuller`] double.
pub struct MockTablePuller {
    span: Span,
    closed: AtomicBool,
}

impl MockTablePuller {
    /// A factory producing recorded pullers, plus the shared record of
    /// every puller created.
    #[must_use]
    pub fn factory() -> (TablePullerFactory, Arc<Mutex<Vec<Arc<MockTablePuller>>>>) {
        let created: Arc<Mutex<Vec<Arc<MockTablePuller>>>> = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&created);
        let factory: TablePullerFactory = Arc::new(move |params: TablePullerParams| {
            let puller = Arc::new(MockTablePuller {
                span: params.span,
                closed: AtomicBool::new(false),
            });
            record.lock().push(Arc::clone(&puller));
            Box::new(SharedPuller(puller)) as Box<dyn TablePuller>
        });
        (factory, created)
    }

    /// The span this puller was created for.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Whether the puller has been closed.
    #[must_use]
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct SharedPuller(Arc<MockTablePuller>);

impl TablePuller for SharedPuller {
    fn close(&self) {
        self.0.closed.store(true, Ordering::Release);
    }
}

// ── Meta resolver ───────────────────────────────────────────────────

/// [`MetaResolver`] answering with fixed system-table metadata.
#[derive(Debug, Clone, Copy)]
pub struct FixedMetaResolver {
    /// The metadata to answer with.
    pub meta: SystemTableMeta,
}

impl Default for FixedMetaResolver {
    fn default() -> Self {
        Self {
            meta: SystemTableMeta {
                schema_id: 1,
                table_id: 1000,
                job_meta_column_id: 2,
            },
        }
    }
}

impl MetaResolver for FixedMetaResolver {
    fn system_table_meta(&self) -> Result<SystemTableMeta, PullerError> {
        Ok(self.meta)
    }
}

// ── Mounter ─────────────────────────────────────────────────────────

/// Mounter double decoding entries into single-column row changes.
///
/// PUT values become the `v` column; DELETEs carry the value as the
/// pre-image. Resolved markers decode to nothing.
pub struct DecodeStubMounter;

impl Mounter for DecodeStubMounter {
    fn decode_row(&self, raw: &RawKvEntry) -> Result<Option<RowChange>, PullerError> {
        if raw.op_type == OpType::Resolved {
            return Ok(None);
        }
        let column = Some(Column::handle(
            "v",
            SqlValue::Bytes(raw.value.to_vec()),
        ));
        let (pre_columns, columns) = match raw.op_type {
            OpType::Delete => (vec![column], vec![]),
            _ => (vec![], vec![column]),
        };
        Ok(Some(RowChange {
            table: TableRef::new("stub", "stub"),
            pre_columns,
            columns,
            commit_ts: raw.commit_ts,
            start_ts: raw.start_ts,
            replicating_ts: 0,
            approximate_size: raw.value.len() as i64,
            index_columns: vec![vec![0]],
        }))
    }
}
