//! Per-channel request loop
//!
//! A worker owns one accepted channel for its whole life: it answers every
//! request the client submits and, whichever way the conversation ends,
//! closes the channel and unlinks its segment.

use shm_compute_core::handle;
use shm_compute_shared_memory::{Channel, ErrorKind, Served, ShmError, Stage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

/// Longest single wait for a request before checking the stop flag and idle time
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Why a worker stopped serving its channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerExit {
    /// The client sent `Unregister`
    Unregistered,
    /// No activity on the channel for longer than the idle timeout
    Abandoned,
    /// The channel was in a stage the worker must never observe
    ProtocolViolation,
    /// Stopped by the server, or the channel was closed from outside
    Shutdown,
    /// Lock or segment failure
    Failed,
}

/// Outcome of one worker run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub channel: String,
    pub owner: String,
    pub exit: WorkerExit,
    pub served: u64,
}

/// Serves a single channel until the client leaves
pub struct WorkerDispatcher {
    channel: Channel,
    idle_timeout: Duration,
    stop: Arc<AtomicBool>,
    served: u64,
}

impl WorkerDispatcher {
    pub fn new(channel: Channel, idle_timeout: Duration) -> Self {
        Self::with_stop_flag(channel, idle_timeout, Arc::new(AtomicBool::new(false)))
    }

    /// Like [`new`](Self::new), stopping early once `stop` is set
    pub fn with_stop_flag(channel: Channel, idle_timeout: Duration, stop: Arc<AtomicBool>) -> Self {
        Self { channel, idle_timeout, stop, served: 0 }
    }

    /// Serve requests until the channel ends, then reclaim it. Blocks the
    /// calling thread.
    #[instrument(skip(self), fields(channel = %self.channel.name()))]
    pub fn run(mut self) -> WorkerReport {
        let owner = self.channel.owner_name();
        debug!("Serving channel for {}", owner);

        let exit = self.serve_loop();
        self.finish(owner, exit)
    }

    fn serve_loop(&mut self) -> WorkerExit {
        loop {
            if self.stop.load(Ordering::Acquire) {
                return WorkerExit::Shutdown;
            }

            match self.channel.wait_request(WAIT_SLICE.min(self.idle_timeout)) {
                Ok(Stage::Closed) => {
                    debug!("Channel closed from outside");
                    return WorkerExit::Shutdown;
                }
                Ok(_) => {
                    if let Some(exit) = self.serve_one() {
                        return exit;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Timeout => {
                    let idle = self.channel.idle_for();
                    if idle >= self.idle_timeout {
                        info!("Channel idle for {:?}, treating client as gone", idle);
                        return WorkerExit::Abandoned;
                    }
                }
                Err(e) => return classify(&e),
            }
        }
    }

    fn serve_one(&mut self) -> Option<WorkerExit> {
        match self.channel.serve(handle) {
            Ok(Served::Responded(response)) => {
                self.served += 1;
                trace!("Answered request with {:?}", response);
                None
            }
            Ok(Served::Closed) => {
                debug!("Client unregistered after {} requests", self.served);
                Some(WorkerExit::Unregistered)
            }
            Err(e) => Some(classify(&e)),
        }
    }

    fn finish(self, owner: String, exit: WorkerExit) -> WorkerReport {
        let channel = self.channel.name().to_string();

        if exit != WorkerExit::Unregistered {
            if let Err(e) = self.channel.force_close() {
                warn!("Failed to close channel {}: {}", channel, e);
            }
        }
        if let Err(e) = self.channel.release() {
            warn!("Failed to release channel {}: {}", channel, e);
        }

        WorkerReport { channel, owner, exit, served: self.served }
    }
}

fn classify(err: &ShmError) -> WorkerExit {
    match err.kind() {
        ErrorKind::Protocol => {
            error!("Protocol violation: {}", err);
            WorkerExit::ProtocolViolation
        }
        _ => {
            error!("Worker failed: {}", err);
            WorkerExit::Failed
        }
    }
}
