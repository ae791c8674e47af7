//! Sort engine contract.
//!
//! The engine receives raw KV entries per table span, resolves timestamps,
//! and exposes commit-ts-ordered iteration between positions. Concrete
//! engines (on-disk sorting, memory-quota management) live outside this
//! crate; [`crate::testing::MemorySortEngine`] is the in-memory double used
//! in tests.

use sluice_model::{RawKvEntry, Span, Ts};

/// A position in a table's sorted stream.
///
/// Ordering is `(commit_ts, start_ts)`. Iteration ranges are half-open:
/// `[lower, upper)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct EnginePosition {
    /// Commit timestamp component.
    pub commit_ts: Ts,
    /// Start timestamp component, ordering events within a commit ts.
    pub start_ts: Ts,
}

impl EnginePosition {
    /// The position covering everything at or below `commit_ts`.
    #[must_use]
    pub fn at_commit(commit_ts: Ts) -> Self {
        Self {
            commit_ts,
            start_ts: Ts::MAX,
        }
    }
}

/// Errors from the sort engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The span was never registered.
    #[error("span not registered: {0}")]
    SpanNotFound(String),

    /// The engine's backing store failed.
    #[error("engine storage error: {0}")]
    Storage(String),
}

/// Per-table ordered iteration over sorted events.
pub trait EventIterator: Send {
    /// The next event and its position, in commit-ts order.
    fn next_event(&mut self) -> Option<(RawKvEntry, EnginePosition)>;
}

/// Callback invoked when a table's resolved timestamp advances.
pub type ResolveCallback = Box<dyn Fn(&Span, Ts) + Send + Sync>;

/// The sort engine consumed by the source manager.
pub trait SortEngine: Send + Sync {
    /// Register a table span starting from `start_ts`.
    fn add_table(&self, span: &Span, start_ts: Ts);

    /// Unregister a table span and drop its pending state.
    fn remove_table(&self, span: &Span);

    /// Feed raw events for a span. Resolved markers advance the span's
    /// resolved timestamp.
    fn add(&self, span: &Span, events: Vec<RawKvEntry>);

    /// Register the callback invoked per table with each new resolved ts.
    fn on_resolve(&self, callback: ResolveCallback);

    /// Iterate the span's events in `[lower, upper)`, commit-ts order.
    fn fetch_by_table(
        &self,
        span: &Span,
        lower: EnginePosition,
        upper: EnginePosition,
    ) -> Box<dyn EventIterator>;

    /// Drop persisted events strictly below `upper`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the span is unknown or the backing
    /// store fails.
    fn clean_by_table(&self, span: &Span, upper: EnginePosition) -> Result<(), EngineError>;

    /// Close the engine, releasing its backing store. A close error is
    /// fatal to the stream.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the backing store cannot be released.
    fn close(&self) -> Result<(), EngineError>;
}
