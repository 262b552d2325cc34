//! Rate store error types.

use ratefeed_common::CurrencyPair;
use thiserror::Error;

/// Errors returned by rate store reads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FxError {
    /// No rate is published for the requested ordered pair.
    #[error("Rate not found for {0}")]
    RateNotFound(CurrencyPair),

    /// Converting the amount overflowed the decimal range.
    #[error("Conversion overflow for {0}")]
    ConversionOverflow(CurrencyPair),
}

/// Result type for rate store operations.
pub type FxResult<T> = Result<T, FxError>;
