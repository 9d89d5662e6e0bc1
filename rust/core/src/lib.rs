//! shm-compute - Core Module
//!
//! Wire records exchanged through a channel segment and the handlers the
//! worker runs on them. Nothing in this crate touches shared memory.

pub mod record;
pub mod handlers;
pub mod error;

pub use record::*;
pub use handlers::*;
pub use error::*;

/// Current version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Layout version of the request/response records. Bumped whenever a
/// `#[repr(C)]` record changes shape.
pub const RECORD_LAYOUT_VERSION: u32 = 1;
