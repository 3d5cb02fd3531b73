//! Error types for payload decoding in sensorbus-types.

use thiserror::Error;

/// Errors that can occur when decoding a characteristic payload.
///
/// This error type is platform-agnostic and does not include
/// Bluetooth errors (those belong in sensorbus-core).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The payload is shorter than the decoder requires.
    #[error("Insufficient bytes: expected at least {expected}, got {actual}")]
    InsufficientBytes {
        /// Minimum number of bytes required.
        expected: usize,
        /// Number of bytes received.
        actual: usize,
    },

    /// The payload has the right size but an unusable value.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

impl DecodeError {
    /// Create an [`DecodeError::InvalidValue`] from any message.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidValue(message.into())
    }
}

/// Result type alias using sensorbus-types' DecodeError type.
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;
