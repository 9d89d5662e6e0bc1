//! shm-compute
//!
//! Clients post a channel to a well-known connection queue in shared memory;
//! the server accepts it and a dedicated worker answers requests on it until
//! the client unregisters or goes quiet.

pub mod cli;
pub mod client;
pub mod config;
pub mod logger;
pub mod server;
pub mod worker;

pub use client::Client;
pub use config::Config;
pub use logger::init_logger;
pub use server::{Server, ServerStats, StatsSnapshot};
pub use worker::{WorkerDispatcher, WorkerExit, WorkerReport};

pub use shm_compute_core::{Request, RequestKind, Response, Status};
pub use shm_compute_shared_memory::{ErrorKind, ShmError};
