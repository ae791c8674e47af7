//! Bootstrap positions from a dumper metadata file.
//!
//! Dump tools write a plain-text `metadata` file alongside the exported
//! data. It contains one or more `SHOW MASTER STATUS:` blocks with `Log:`,
//! `Pos:` and `GTID:` lines. A second master-status block annotated
//! `/* AFTER CONNECTION POOL ESTABLISHED */` carries the position at which
//! safe mode can be exited.

use std::path::Path;

use sluice_model::{BinlogPosition, GtidSet, Location};

use crate::SinkError;

/// Header of a master-status block.
const MASTER_STATUS_HEADER: &str = "SHOW MASTER STATUS:";
/// Marker of the post-connection-pool block.
const AFTER_POOL_MARKER: &str = "AFTER CONNECTION POOL ESTABLISHED";

/// Positions recovered from a dumper metadata file.
#[derive(Debug, Clone, PartialEq)]
pub struct DumpMeta {
    /// Where replication starts.
    pub location: Location,
    /// Where safe mode can be exited, when the dump recorded it.
    pub exit_safe_location: Option<Location>,
}

/// Parse a metadata file from disk.
///
/// # Errors
///
/// Returns [`SinkError::Io`] on read failures and [`SinkError::Meta`] when
/// no master-status block is present or a field fails to parse.
pub fn load_metadata_file(path: &Path) -> Result<DumpMeta, SinkError> {
    let content = std::fs::read_to_string(path)?;
    parse_metadata(&content)
}

/// Parse metadata content.
///
/// # Errors
///
/// Returns [`SinkError::Meta`] when no master-status block is present or a
/// field fails to parse.
pub fn parse_metadata(content: &str) -> Result<DumpMeta, SinkError> {
    let mut location: Option<Location> = None;
    let mut exit_safe: Option<Location> = None;

    let mut lines = content.lines().peekable();
    while let Some(line) = lines.next() {
        let line = line.trim();
        if !line.starts_with(MASTER_STATUS_HEADER) {
            continue;
        }
        let after_pool = line.contains(AFTER_POOL_MARKER);
        let block = parse_status_block(&mut lines)?;
        if after_pool {
            exit_safe = Some(block);
        } else if location.is_none() {
            location = Some(block);
        }
    }

    let location = location
        .ok_or_else(|| SinkError::Meta("no SHOW MASTER STATUS block found".to_string()))?;
    Ok(DumpMeta {
        location,
        exit_safe_location: exit_safe,
    })
}

fn parse_status_block<'a, I>(lines: &mut std::iter::Peekable<I>) -> Result<Location, SinkError>
where
    I: Iterator<Item = &'a str>,
{
    let mut log: Option<String> = None;
    let mut pos: Option<u32> = None;
    let mut gtid: Option<GtidSet> = None;

    while let Some(line) = lines.peek() {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Log:") {
            log = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Pos:") {
            let parsed = value
                .trim()
                .parse::<u32>()
                .map_err(|e| SinkError::Meta(format!("bad Pos line {line:?}: {e}")))?;
            pos = Some(parsed);
        } else if let Some(value) = line.strip_prefix("GTID:") {
            let value = value.trim();
            if !value.is_empty() {
                gtid = Some(GtidSet::parse(value)?);
            }
        }
        lines.next();
    }

    let name = log.ok_or_else(|| SinkError::Meta("master status block missing Log".to_string()))?;
    let pos = pos.ok_or_else(|| SinkError::Meta("master status block missing Pos".to_string()))?;
    Ok(Location {
        position: BinlogPosition::new(name, pos),
        gtid_set: gtid,
    })
}
