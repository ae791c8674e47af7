//! Configuration for one replication stream.

use sluice_puller::SplitUpdateMode;
use sluice_sink::backend::SinkConfig;
use sluice_sink::checkpoint::CheckpointConfig;

/// Everything a replication stream needs at startup.
///
/// Sink-side knobs (`worker_count`, `max_txn_row`, batching and retry
/// settings) live in [`SinkConfig`]; checkpoint persistence and the flush
/// interval live in [`CheckpointConfig`].
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Stream name, used in logs and as the checkpoint task identity.
    pub changefeed: String,
    /// Timestamp replication starts from.
    pub start_ts: u64,
    /// `schema.table` allowlist patterns.
    pub filter_rules: Vec<String>,
    /// Share one multiplexing KV client across tables instead of one
    /// puller per table.
    pub enable_multiplexing: bool,
    /// When UPDATE entries split into DELETE + INSERT.
    pub split_update_mode: SplitUpdateMode,
    /// Bidirectional replication mode.
    pub bdr_mode: bool,
    /// Checkpoint store settings.
    pub checkpoint: CheckpointConfig,
    /// Sink backend settings.
    pub sink: SinkConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            changefeed: "default".to_string(),
            start_ts: 0,
            filter_rules: vec!["*.*".to_string()],
            enable_multiplexing: true,
            split_update_mode: SplitUpdateMode::AtStart,
            bdr_mode: false,
            checkpoint: CheckpointConfig::default(),
            sink: SinkConfig::default(),
        }
    }
}
