//! Bounded-memory sorter for the DDL stream.
//!
//! DDL entries arrive from the KV client in region order, not commit order.
//! The sorter buffers PUTs until a resolved marker arrives, then releases
//! everything at or below the watermark sorted by commit timestamp,
//! followed by the marker itself. Memory stays bounded by the resolved
//! cadence of the upstream.

use sluice_model::{OpType, RawKvEntry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Channel capacity of the sorted output.
const SORT_OUTPUT_CAPACITY: usize = 128;

/// Spawn the sorting task over `input`, returning the sorted receiver.
///
/// The task ends when `input` closes or `cancel` fires.
#[must_use]
pub fn sort_output(
    mut input: mpsc::Receiver<RawKvEntry>,
    cancel: CancellationToken,
) -> mpsc::Receiver<RawKvEntry> {
    let (tx, rx) = mpsc::channel(SORT_OUTPUT_CAPACITY);

    tokio::spawn(async move {
        let mut buffer: Vec<RawKvEntry> = Vec::new();
        loop {
            let entry = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                entry = input.recv() => match entry {
                    Some(entry) => entry,
                    None => break,
                },
            };

            if entry.op_type == OpType::Resolved {
                let watermark = entry.commit_ts;
                let mut ready: Vec<RawKvEntry> = Vec::new();
                buffer.retain(|e| {
                    if e.commit_ts <= watermark {
                        ready.push(e.clone());
                        false
                    } else {
                        true
                    }
                });
                ready.sort_by_key(|e| (e.commit_ts, e.start_ts));
                for e in ready {
                    if tx.send(e).await.is_err() {
                        return;
                    }
                }
                if tx.send(entry).await.is_err() {
                    return;
                }
            } else {
                buffer.push(entry);
            }
        }
        tracing::debug!(buffered = buffer.len(), "DDL sorter stopped");
    });

    rx
}
