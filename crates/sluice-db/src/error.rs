//! Top-level error type for a replication stream.

use sluice_puller::PullerError;
use sluice_schema::SchemaError;
use sluice_sink::SinkError;

/// The first fatal error of any pipeline component.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// Upstream puller failure.
    #[error(transparent)]
    Puller(#[from] PullerError),

    /// Schema store failure.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Downstream sink failure.
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// A component task panicked or was aborted.
    #[error("pipeline task failed: {0}")]
    Task(String),
}

impl ReplicationError {
    /// Whether the error only reports cancellation, i.e. an orderly
    /// shutdown rather than a fault.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Puller(PullerError::Cancelled) | Self::Sink(SinkError::Cancelled)
        )
    }
}
