//! Shared memory specific error types

use thiserror::Error;

/// Shared memory error types
#[derive(Error, Debug)]
pub enum ShmError {
    /// Backing segment could not be created, mapped or validated
    #[error("Allocation failed: {0}")]
    Allocation(String),

    /// Connection queue is full
    #[error("Connection queue is full (capacity {capacity})")]
    Capacity { capacity: usize },

    /// Connection queue is empty
    #[error("Connection queue is empty")]
    Empty,

    /// Illegal stage transition or malformed shared record
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Bounded wait exceeded
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Segment name rejected before touching the filesystem
    #[error("Invalid segment name: {0}")]
    InvalidName(String),
}

/// Convenience type alias
pub type Result<T> = std::result::Result<T, ShmError>;

/// Error categories, mirroring the variants without their payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Allocation,
    Capacity,
    Empty,
    Protocol,
    Timeout,
    InvalidName,
}

impl ShmError {
    /// Wrap an OS-level failure as an allocation error
    pub fn allocation(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        ShmError::Allocation(format!("{}: {}", context, err))
    }

    /// Check if the caller may retry the operation later
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ShmError::Capacity { .. } | ShmError::Empty | ShmError::Timeout(_))
    }

    /// Get the error category
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShmError::Allocation(_) => ErrorKind::Allocation,
            ShmError::Capacity { .. } => ErrorKind::Capacity,
            ShmError::Empty => ErrorKind::Empty,
            ShmError::Protocol(_) => ErrorKind::Protocol,
            ShmError::Timeout(_) => ErrorKind::Timeout,
            ShmError::InvalidName(_) => ErrorKind::InvalidName,
        }
    }
}
