//! shm-compute - Shared Memory Module
//!
//! Cross-process connection queue and per-connection request/response
//! channels, built on file-backed segments that any process can map by id.

pub mod platform;
pub mod store;
pub mod lock;
pub mod wait;
pub mod queue;
pub mod channel;
pub mod error;

pub use store::*;
pub use lock::*;
pub use wait::*;
pub use queue::*;
pub use channel::*;
pub use error::*;

/// Re-export platform-specific implementations
pub use platform::*;
