//! Replication-log positions: binlog coordinates, GTID sets, and locations.
//!
//! A [`BinlogPosition`] orders lexicographically by file name then offset,
//! which matches how MySQL rotates binlog files. A [`GtidSet`] is compared by
//! inclusion. A [`Location`] combines both and identifies a point in the
//! replication log; [`Location::MIN`] is the well-defined minimum every
//! checkpoint starts from.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ModelError;

/// A binlog file coordinate: `(file name, byte offset)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinlogPosition {
    /// Binlog file name, e.g. `"mysql-bin.000003"`.
    pub name: String,
    /// Byte offset within the file.
    pub pos: u32,
}

impl BinlogPosition {
    /// The minimum position: empty file name, offset zero.
    pub const fn min() -> Self {
        Self {
            name: String::new(),
            pos: 0,
        }
    }

    /// Create a position from a file name and offset.
    pub fn new(name: impl Into<String>, pos: u32) -> Self {
        Self {
            name: name.into(),
            pos,
        }
    }
}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BinlogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        // File names rotate with zero-padded numeric suffixes, so plain
        // lexicographic order matches rotation order.
        self.name
            .cmp(&other.name)
            .then_with(|| self.pos.cmp(&other.pos))
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.name, self.pos)
    }
}

/// A single GTID interval; a point transaction has `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GtidInterval {
    /// First transaction id in the interval (inclusive).
    pub start: u64,
    /// Last transaction id in the interval (inclusive).
    pub end: u64,
}

impl fmt::Display for GtidInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// A MySQL GTID set: server UUID → disjoint ascending transaction intervals.
///
/// Textual form is the MySQL one: `uuid:1-5:8,uuid2:1-3`. Sets are compared
/// by inclusion, not lexicographically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    intervals: BTreeMap<Uuid, Vec<GtidInterval>>,
}

impl GtidSet {
    /// An empty GTID set.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the set contains no transactions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Parse a MySQL GTID set string. Empty input yields the empty set.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidGtidSet`] on malformed UUIDs or
    /// intervals.
    pub fn parse(text: &str) -> Result<Self, ModelError> {
        let mut set = Self::default();
        let text = text.trim();
        if text.is_empty() {
            return Ok(set);
        }
        for part in text.split(',') {
            let part = part.trim();
            let (uuid_text, rest) = part.split_once(':').ok_or_else(|| {
                ModelError::InvalidGtidSet {
                    text: part.to_string(),
                    reason: "missing ':' separator".to_string(),
                }
            })?;
            let uuid = Uuid::parse_str(uuid_text).map_err(|e| ModelError::InvalidGtidSet {
                text: part.to_string(),
                reason: e.to_string(),
            })?;
            let mut intervals = Vec::new();
            for iv in rest.split(':') {
                intervals.push(parse_interval(iv)?);
            }
            intervals.sort_by_key(|iv| iv.start);
            let entry = set.intervals.entry(uuid).or_default();
            entry.extend(intervals);
            normalize(entry);
        }
        Ok(set)
    }

    /// Add a single transaction id for a server, merging adjacent intervals.
    pub fn update(&mut self, uuid: Uuid, txn_id: u64) {
        let entry = self.intervals.entry(uuid).or_default();
        entry.push(GtidInterval {
            start: txn_id,
            end: txn_id,
        });
        normalize(entry);
    }

    /// Whether `self` contains every transaction of `other`.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        other.intervals.iter().all(|(uuid, intervals)| {
            let Some(ours) = self.intervals.get(uuid) else {
                return intervals.is_empty();
            };
            intervals.iter().all(|iv| {
                ours.iter()
                    .any(|mine| mine.start <= iv.start && iv.end <= mine.end)
            })
        })
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (uuid, intervals) in &self.intervals {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{uuid}")?;
            for iv in intervals {
                write!(f, ":{iv}")?;
            }
        }
        Ok(())
    }
}

fn parse_interval(text: &str) -> Result<GtidInterval, ModelError> {
    let invalid = |reason: &str| ModelError::InvalidGtidSet {
        text: text.to_string(),
        reason: reason.to_string(),
    };
    let mut nums = text.splitn(2, '-');
    let start = nums
        .next()
        .ok_or_else(|| invalid("empty interval"))?
        .parse::<u64>()
        .map_err(|_| invalid("non-numeric interval bound"))?;
    let end = match nums.next() {
        Some(end) => end
            .parse::<u64>()
            .map_err(|_| invalid("non-numeric interval bound"))?,
        None => start,
    };
    if end < start {
        return Err(invalid("interval end before start"));
    }
    Ok(GtidInterval { start, end })
}

/// Merge overlapping or adjacent intervals in place. Input must be sorted by
/// start.
fn normalize(intervals: &mut Vec<GtidInterval>) {
    intervals.sort_by_key(|iv| iv.start);
    let mut merged: Vec<GtidInterval> = Vec::with_capacity(intervals.len());
    for iv in intervals.drain(..) {
        match merged.last_mut() {
            Some(last) if iv.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(iv.end);
            }
            _ => merged.push(iv),
        }
    }
    *intervals = merged;
}

/// A point in the replication log: binlog coordinates plus an optional GTID
/// set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Binlog file coordinate.
    pub position: BinlogPosition,
    /// GTID set reached at this point, when GTID mode is enabled.
    pub gtid_set: Option<GtidSet>,
}

impl Location {
    /// The minimum location.
    #[must_use]
    pub fn min() -> Self {
        Self {
            position: BinlogPosition::min(),
            gtid_set: None,
        }
    }

    /// Build a location from a binlog position only.
    #[must_use]
    pub fn from_position(position: BinlogPosition) -> Self {
        Self {
            position,
            gtid_set: None,
        }
    }

    /// Build a location from a binlog position and a GTID set.
    #[must_use]
    pub fn with_gtid(position: BinlogPosition, gtid_set: GtidSet) -> Self {
        Self {
            position,
            gtid_set: Some(gtid_set),
        }
    }

    /// Whether this location's GTID set contains `other`'s.
    ///
    /// Falls back to position comparison when either side carries no GTID
    /// set.
    #[must_use]
    pub fn covers(&self, other: &Self) -> bool {
        match (&self.gtid_set, &other.gtid_set) {
            (Some(mine), Some(theirs)) => mine.contains(theirs),
            _ => self.position >= other.position,
        }
    }
}

impl PartialOrd for Location {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Location {
    fn cmp(&self, other: &Self) -> Ordering {
        self.position.cmp(&other.position)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.gtid_set {
            Some(gtid) if !gtid.is_empty() => {
                write!(f, "position: {}, gtid-set: {gtid}", self.position)
            }
            _ => write!(f, "position: {}", self.position),
        }
    }
}
