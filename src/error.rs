//! WAL error types.
//!
//! All errors are explicit and typed. No string errors.

use thiserror::Error;

/// Result type for WAL operations.
pub type WalResult<T> = Result<T, WalError>;

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// I/O error from the underlying filesystem.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// Error message.
        message: String,
    },

    /// A frame could not be parsed, or its checksum did not match.
    #[error("corrupted frame at offset {offset}: {reason}")]
    CorruptedFrame {
        /// Byte offset within the segment where corruption was detected.
        offset: u64,
        /// Why the frame is considered corrupt.
        reason: String,
    },

    /// A `segment-*` file in the WAL directory has a non-numeric suffix.
    #[error("malformed segment name {name:?}")]
    MalformedSegmentName {
        /// The offending file name.
        name: String,
    },

    /// Operation attempted on a closed WAL instance.
    #[error("WAL is closed")]
    Closed,
}

impl WalError {
    /// Creates an I/O error.
    pub fn io(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }

    /// Returns true if this error indicates data corruption.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::CorruptedFrame { .. })
    }
}
