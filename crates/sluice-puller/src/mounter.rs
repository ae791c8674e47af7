//! Raw-entry decoding at the engine/sink boundary.
//!
//! The mounter turns sorted [`RawKvEntry`]s into schema-aware
//! [`RowChange`]s using the schema snapshot in force at the entry's commit
//! timestamp. [`MountedEventIter`] wraps an engine iterator and decodes
//! lazily, bounded by a per-fetch batch cap.

use std::sync::Arc;

use sluice_model::{RawKvEntry, RowChange};

use crate::engine::{EnginePosition, EventIterator};
use crate::PullerError;

/// Decodes raw entries into row changes.
pub trait Mounter: Send + Sync {
    /// Decode one raw entry.
    ///
    /// Returns `Ok(None)` for entries that produce no row event (resolved
    /// markers, rows of dropped tables still draining).
    ///
    /// # Errors
    ///
    /// Returns [`PullerError`] when the entry cannot be decoded against
    /// the current schema.
    fn decode_row(&self, raw: &RawKvEntry) -> Result<Option<RowChange>, PullerError>;
}

/// An engine iterator with decoding attached.
///
/// Yields at most `max_batch` mounted rows; the caller re-fetches for the
/// next batch, which keeps a single fetch from holding the engine iterator
/// open indefinitely.
pub struct MountedEventIter {
    iter: Box<dyn EventIterator>,
    mounter: Arc<dyn Mounter>,
    remaining: usize,
}

impl MountedEventIter {
    /// Wrap an engine iterator.
    #[must_use]
    pub fn new(iter: Box<dyn EventIterator>, mounter: Arc<dyn Mounter>, max_batch: usize) -> Self {
        Self {
            iter,
            mounter,
            remaining: max_batch,
        }
    }

    /// The next mounted row and its engine position.
    ///
    /// Returns `Ok(None)` when the range or the batch cap is exhausted.
    ///
    /// # Errors
    ///
    /// Propagates decode failures from the mounter.
    pub fn next_row(&mut self) -> Result<Option<(RowChange, EnginePosition)>, PullerError> {
        while self.remaining > 0 {
            let Some((raw, pos)) = self.iter.next_event() else {
                return Ok(None);
            };
            if let Some(row) = self.mounter.decode_row(&raw)? {
                self.remaining -= 1;
                return Ok(Some((row, pos)));
            }
        }
        Ok(None)
    }
}
