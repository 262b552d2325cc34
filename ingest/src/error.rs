//! Ingestion error types.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised while consuming the rate stream.
#[derive(Debug, Clone, Error)]
pub enum IngestError {
    /// The stream subscription could not be established or was lost.
    #[error("Stream connection error: {0}")]
    StreamConnection(String),

    /// Upstream closed the stream.
    #[error("Stream closed by upstream")]
    StreamClosed,

    /// A payload could not be used as a snapshot message.
    #[error("Message parse error: {0}")]
    MessageParse(String),

    /// Entry key is not a 6-character pair key.
    #[error("Invalid pair key {key:?}")]
    InvalidPairKey { key: String },

    /// Entry value is not a decimal number.
    #[error("Invalid rate value for {key}: {value}")]
    InvalidRateValue { key: String, value: String },

    /// Zero or negative rate, which has no meaningful inverse.
    #[error("Degenerate rate {rate} for {key}")]
    DegenerateRate { key: String, rate: Decimal },

    /// `start` was called while a run is still live.
    #[error("Ingestion pipeline already running")]
    AlreadyRunning,

    /// The ingestion task panicked or was aborted.
    #[error("Ingestion task error: {0}")]
    Task(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl IngestError {
    /// Whether this error ends the current pipeline run.
    ///
    /// Everything else is scoped to a single message or entry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestError::StreamConnection(_)
                | IngestError::StreamClosed
                | IngestError::Task(_)
                | IngestError::Configuration(_)
        )
    }

    /// Stable error code for logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            IngestError::StreamConnection(_) => "STREAM_CONNECTION",
            IngestError::StreamClosed => "STREAM_CLOSED",
            IngestError::MessageParse(_) => "MESSAGE_PARSE",
            IngestError::InvalidPairKey { .. } => "INVALID_PAIR_KEY",
            IngestError::InvalidRateValue { .. } => "INVALID_RATE_VALUE",
            IngestError::DegenerateRate { .. } => "DEGENERATE_RATE",
            IngestError::AlreadyRunning => "ALREADY_RUNNING",
            IngestError::Task(_) => "TASK",
            IngestError::Configuration(_) => "CONFIGURATION",
        }
    }
}

/// Result type alias for ingestion operations.
pub type IngestResult<T> = Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(IngestError::StreamClosed.is_fatal());
        assert!(IngestError::StreamConnection("refused".into()).is_fatal());
        assert!(!IngestError::MessageParse("bad json".into()).is_fatal());
        assert!(!IngestError::DegenerateRate {
            key: "USDEUR".into(),
            rate: Decimal::ZERO,
        }
        .is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = IngestError::InvalidPairKey { key: "US".into() };
        assert_eq!(err.to_string(), "Invalid pair key \"US\"");
        assert_eq!(err.error_code(), "INVALID_PAIR_KEY");
    }
}
