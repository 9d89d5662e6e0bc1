//! Error types for record decoding

use thiserror::Error;

/// Errors raised while decoding raw records read from shared memory
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordError {
    /// Request discriminant outside the known set
    #[error("Invalid request kind: {0}")]
    InvalidKind(u32),

    /// Response discriminant outside the known set
    #[error("Invalid response status: {0}")]
    InvalidStatus(u32),
}

/// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, RecordError>;
