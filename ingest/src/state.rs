//! Ingestion pipeline state definitions.

use std::fmt;

/// Lifecycle state of the ingestion pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Constructed, never started.
    Idle,
    /// Establishing the stream subscription.
    Connecting,
    /// Consuming messages.
    Running,
    /// Cancelled by the owning process.
    Stopped,
    /// The stream failed; the owner decides whether to restart.
    Failed,
}

impl PipelineState {
    /// Check if a run is in progress.
    pub fn is_active(&self) -> bool {
        matches!(self, PipelineState::Connecting | PipelineState::Running)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "IDLE",
            PipelineState::Connecting => "CONNECTING",
            PipelineState::Running => "RUNNING",
            PipelineState::Stopped => "STOPPED",
            PipelineState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}
