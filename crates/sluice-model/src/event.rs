//! Change events flowing through the pipeline.
//!
//! Three layers, bottom up:
//!
//! 1. [`RawKvEntry`] — an undecoded KV mutation or resolved marker from the
//!    upstream log stream.
//! 2. [`RowChange`] — a decoded row mutation with schema-aware columns.
//! 3. [`TxnEvent`] / [`TxnCallbackableEvent`] — row changes grouped by
//!    upstream transaction, carrying a completion callback that fires only
//!    after the downstream commit.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::table::TableRef;
use crate::Ts;

/// Operation type of a raw KV entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// An insert or update of a key.
    Put,
    /// A delete of a key.
    Delete,
    /// A resolved watermark: no earlier commit will arrive on this stream.
    Resolved,
}

/// An undecoded entry from the upstream KV change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawKvEntry {
    /// What happened to the key.
    pub op_type: OpType,
    /// The raw key. Empty for resolved markers.
    pub key: Bytes,
    /// The new value. Empty for deletes and resolved markers.
    pub value: Bytes,
    /// The previous value, when old-value capture is enabled upstream.
    pub old_value: Bytes,
    /// Transaction start timestamp.
    pub start_ts: Ts,
    /// Transaction commit timestamp; for resolved markers, the watermark.
    pub commit_ts: Ts,
}

impl RawKvEntry {
    /// A resolved watermark entry.
    #[must_use]
    pub fn resolved(ts: Ts) -> Self {
        Self {
            op_type: OpType::Resolved,
            key: Bytes::new(),
            value: Bytes::new(),
            old_value: Bytes::new(),
            start_ts: 0,
            commit_ts: ts,
        }
    }

    /// Whether this entry is an update: a PUT that carries both the new and
    /// the previous value.
    #[must_use]
    pub fn is_update(&self) -> bool {
        self.op_type == OpType::Put && !self.value.is_empty() && !self.old_value.is_empty()
    }

    /// Split an update entry into a delete of the old value followed by an
    /// insert of the new value.
    ///
    /// Returns `None` when the entry is not an update.
    #[must_use]
    pub fn split_update(&self) -> Option<(Self, Self)> {
        if !self.is_update() {
            return None;
        }
        let delete = Self {
            op_type: OpType::Delete,
            key: self.key.clone(),
            value: self.old_value.clone(),
            old_value: Bytes::new(),
            start_ts: self.start_ts,
            commit_ts: self.commit_ts,
        };
        let insert = Self {
            op_type: OpType::Put,
            key: self.key.clone(),
            value: self.value.clone(),
            old_value: Bytes::new(),
            start_ts: self.start_ts,
            commit_ts: self.commit_ts,
        };
        Some((delete, insert))
    }
}

/// A typed SQL value carried by a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Raw bytes (binary charsets, blobs).
    Bytes(Vec<u8>),
    /// A decoded string.
    Text(String),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// Floating point.
    Double(f64),
}

impl SqlValue {
    /// Whether the value is SQL NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Approximate encoded size in bytes, for batch-size accounting.
    #[must_use]
    pub fn approximate_size(&self) -> usize {
        match self {
            Self::Null => 1,
            Self::Bytes(b) => b.len(),
            Self::Text(s) => s.len(),
            Self::Int(_) | Self::UInt(_) | Self::Double(_) => 8,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
        }
    }
}

/// Per-column flags carried alongside values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFlags {
    /// The column participates in the row's physical identity (primary key
    /// or the chosen not-null unique index).
    pub handle_key: bool,
    /// The column is part of some unique key.
    pub unique_key: bool,
    /// The column is generated and not stored.
    pub generated: bool,
}

/// A column value within a row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// The value.
    pub value: SqlValue,
    /// Source charset name; empty when not applicable.
    pub charset: String,
    /// Column flags.
    pub flags: ColumnFlags,
}

impl Column {
    /// Convenience constructor for a plain column.
    pub fn new(name: impl Into<String>, value: SqlValue) -> Self {
        Self {
            name: name.into(),
            value,
            charset: String::new(),
            flags: ColumnFlags::default(),
        }
    }

    /// Convenience constructor for a handle-key column.
    pub fn handle(name: impl Into<String>, value: SqlValue) -> Self {
        Self {
            name: name.into(),
            value,
            charset: String::new(),
            flags: ColumnFlags {
                handle_key: true,
                unique_key: true,
                generated: false,
            },
        }
    }
}

/// A decoded row-level change.
///
/// The derived kind follows from which column sets are present: post only is
/// an INSERT, pre only a DELETE, both an UPDATE.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    /// The table the row belongs to.
    pub table: TableRef,
    /// Column values before the change; empty for inserts. `None` entries
    /// mark columns omitted by the upstream encoder.
    pub pre_columns: Vec<Option<Column>>,
    /// Column values after the change; empty for deletes.
    pub columns: Vec<Option<Column>>,
    /// Commit timestamp of the owning transaction.
    pub commit_ts: Ts,
    /// Start timestamp of the owning transaction.
    pub start_ts: Ts,
    /// Timestamp at which this table started replicating.
    pub replicating_ts: Ts,
    /// Approximate encoded size of the row data.
    pub approximate_size: i64,
    /// Offsets of index columns within `columns`, innermost handle first.
    pub index_columns: Vec<Vec<usize>>,
}

impl RowChange {
    /// Whether this is an insert (post columns only).
    #[must_use]
    pub fn is_insert(&self) -> bool {
        self.pre_columns.is_empty() && !self.columns.is_empty()
    }

    /// Whether this is a delete (pre columns only).
    #[must_use]
    pub fn is_delete(&self) -> bool {
        !self.pre_columns.is_empty() && self.columns.is_empty()
    }

    /// Whether this is an update (both column sets present).
    #[must_use]
    pub fn is_update(&self) -> bool {
        !self.pre_columns.is_empty() && !self.columns.is_empty()
    }
}

/// Completion callback invoked after a successful downstream commit.
pub type TxnCallback = Box<dyn FnOnce() + Send>;

/// Row changes grouped by upstream transaction.
#[derive(Debug, Default)]
pub struct TxnEvent {
    /// The rows of the transaction, sharing `start_ts`.
    pub rows: Vec<RowChange>,
    /// Transaction start timestamp.
    pub start_ts: Ts,
    /// Transaction commit timestamp.
    pub commit_ts: Ts,
    /// Hint that the sink should flush as soon as this event is buffered.
    pub wait_flush: bool,
}

impl TxnEvent {
    /// Whether the event asks for an immediate flush.
    #[must_use]
    pub fn to_wait_flush(&self) -> bool {
        self.wait_flush
    }
}

/// A transaction event with an optional post-commit callback.
pub struct TxnCallbackableEvent {
    /// The transaction event.
    pub event: TxnEvent,
    /// Invoked once, after the downstream transaction commits. Never
    /// invoked when the flush fails.
    pub callback: Option<TxnCallback>,
}

impl fmt::Debug for TxnCallbackableEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnCallbackableEvent")
            .field("event", &self.event)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}
