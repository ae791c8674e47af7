//! Table keyspace spans.
//!
//! A [`Span`] names the half-open key range `[start_key, end_key)` owned by
//! one physical table in the upstream KV store. Spans are the registry key
//! for per-table subscriptions and sort-engine state.

use std::fmt;

use bytes::Bytes;

/// Prefix of every table-data key in the upstream keyspace.
const TABLE_PREFIX: u8 = b't';
/// Separator between the table id and the row payload.
const RECORD_PREFIX: &[u8] = b"_r";
/// Upper-bound separator, one past `RECORD_PREFIX`.
const RECORD_PREFIX_END: &[u8] = b"_s";

/// The keyspace region of one physical table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Span {
    /// Physical table id. Negative ids are reserved for system ranges.
    pub table_id: i64,
    /// Inclusive start key.
    pub start_key: Bytes,
    /// Exclusive end key.
    pub end_key: Bytes,
}

impl Span {
    /// The row-data span of a physical table.
    #[must_use]
    pub fn table_span(table_id: i64) -> Self {
        Self {
            table_id,
            start_key: encode_table_key(table_id, RECORD_PREFIX),
            end_key: encode_table_key(table_id, RECORD_PREFIX_END),
        }
    }

    /// Spans covering the system DDL job queue.
    ///
    /// Table ids are synthetic negatives so a shared client can keep them
    /// apart from user tables.
    #[must_use]
    pub fn ddl_spans() -> Vec<Self> {
        // The job queue lives under the meta prefix, ahead of all table data.
        let ranges: [(&[u8], &[u8]); 2] = [
            (b"m\x00", b"m\xff"),
            (b"t\x00", b"t\x00\xff"),
        ];
        ranges
            .iter()
            .enumerate()
            .map(|(i, (start, end))| {
                #[allow(clippy::cast_possible_wrap)]
                let table_id = -1_i64 - i as i64;
                Self {
                    table_id,
                    start_key: Bytes::copy_from_slice(start),
                    end_key: Bytes::copy_from_slice(end),
                }
            })
            .collect()
    }

    /// Whether `key` falls inside this span.
    #[must_use]
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.start_key.as_ref() <= key && key < self.end_key.as_ref()
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "span(table={}, [{}, {}))",
            self.table_id,
            hex(&self.start_key),
            hex(&self.end_key)
        )
    }
}

fn encode_table_key(table_id: i64, suffix: &[u8]) -> Bytes {
    let mut key = Vec::with_capacity(1 + 8 + suffix.len());
    key.push(TABLE_PREFIX);
    key.extend_from_slice(&table_id.to_be_bytes());
    key.extend_from_slice(suffix);
    Bytes::from(key)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_span_bounds() {
        let span = Span::table_span(42);
        assert_eq!(span.table_id, 42);
        assert!(span.start_key < span.end_key);
        assert!(span.contains_key(&span.start_key));
        assert!(!span.contains_key(&span.end_key));
    }

    #[test]
    fn test_table_span_order_follows_table_id() {
        let a = Span::table_span(1);
        let b = Span::table_span(2);
        assert!(a.end_key <= b.start_key);
    }

    #[test]
    fn test_ddl_spans_use_negative_ids() {
        let spans = Span::ddl_spans();
        assert!(!spans.is_empty());
        for (i, span) in spans.iter().enumerate() {
            assert_eq!(span.table_id, -1 - i as i64);
        }
    }
}
