//! Platform-specific helpers

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Platform-specific utilities
pub struct PlatformUtils;

impl PlatformUtils {
    /// Get current process ID
    pub fn get_process_id() -> u32 {
        std::process::id()
    }

    /// Check whether a process with the given pid still exists
    pub fn is_process_alive(pid: u32) -> bool {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::kill;
            use nix::unistd::Pid;

            // Signal 0 only performs the existence and permission checks.
            match kill(Pid::from_raw(pid as libc::pid_t), None) {
                Ok(()) => true,
                Err(Errno::ESRCH) => false,
                Err(_) => true,
            }
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            true
        }
    }

    /// Milliseconds since the Unix epoch
    pub fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Milliseconds on a clock that never jumps and is shared by every
    /// process on the host. Use for timestamps stored in segments.
    pub fn monotonic_millis() -> u64 {
        #[cfg(unix)]
        {
            use nix::time::{clock_gettime, ClockId};

            match clock_gettime(ClockId::CLOCK_MONOTONIC) {
                Ok(ts) => (ts.tv_sec() as u64) * 1_000 + (ts.tv_nsec() as u64) / 1_000_000,
                Err(_) => 0,
            }
        }
        #[cfg(not(unix))]
        {
            Self::now_millis()
        }
    }

    /// Nanoseconds since the Unix epoch, truncated to 64 bits
    pub fn now_nanos() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
    }

    /// Default directory backing the block store
    pub fn default_store_root() -> PathBuf {
        let dev_shm = PathBuf::from("/dev/shm");
        if dev_shm.is_dir() {
            dev_shm.join("shm-compute")
        } else {
            std::env::temp_dir().join("shm-compute")
        }
    }
}
