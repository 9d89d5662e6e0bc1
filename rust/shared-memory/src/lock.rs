//! Process-shared lock
//!
//! The lock word lives inside a shared segment, so it works across processes
//! as well as threads. An owner token encodes the holder's pid; a waiter that
//! finds the holder's process gone takes the lock over instead of waiting for
//! a release that will never come.

use crate::{wait, PlatformUtils, Result};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

/// Attempts between two liveness checks of the current owner
const LIVENESS_CHECK_INTERVAL: u32 = 32;

static NEXT_LOCAL_TOKEN: AtomicU32 = AtomicU32::new(1);

/// Lock state stored in shared memory. Must be initialized once by the
/// segment's creator with [`SharedLock::init`].
#[repr(C)]
#[derive(Debug)]
pub struct SharedLock {
    owner: AtomicU64,
    acquired_at_ms: AtomicU64,
}

impl SharedLock {
    /// Reset to the unlocked state
    pub fn init(&self) {
        self.acquired_at_ms.store(0, Ordering::Relaxed);
        self.owner.store(0, Ordering::Release);
    }

    /// Take the lock without waiting
    pub fn try_acquire(&self) -> Option<SharedLockGuard<'_>> {
        self.try_acquire_with(new_token(), false)
    }

    /// Take the lock, waiting at most `timeout`
    pub fn acquire(&self, timeout: Duration, backoff_cap: Duration) -> Result<SharedLockGuard<'_>> {
        let token = new_token();
        let mut attempts: u32 = 0;

        wait::wait_until(timeout, backoff_cap, "shared lock acquisition", || {
            attempts = attempts.wrapping_add(1);
            self.try_acquire_with(token, attempts % LIVENESS_CHECK_INTERVAL == 0)
        })
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }

    /// Pid of the current holder, if any
    pub fn holder_pid(&self) -> Option<u32> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            token => Some(token_pid(token)),
        }
    }

    fn try_acquire_with(&self, token: u64, check_owner: bool) -> Option<SharedLockGuard<'_>> {
        match self.owner.compare_exchange(0, token, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => Some(self.granted(token, false)),
            Err(current) if check_owner && !PlatformUtils::is_process_alive(token_pid(current)) => {
                // The holder died with the lock held; take it over.
                self.owner
                    .compare_exchange(current, token, Ordering::Acquire, Ordering::Relaxed)
                    .ok()
                    .map(|_| {
                        let held_ms = PlatformUtils::monotonic_millis()
                            .saturating_sub(self.acquired_at_ms.load(Ordering::Relaxed));
                        warn!(
                            "Recovered shared lock from dead process {} after {} ms",
                            token_pid(current),
                            held_ms
                        );
                        self.granted(token, true)
                    })
            }
            Err(_) => None,
        }
    }

    fn granted(&self, token: u64, recovered: bool) -> SharedLockGuard<'_> {
        self.acquired_at_ms.store(PlatformUtils::monotonic_millis(), Ordering::Relaxed);
        SharedLockGuard { lock: self, token, recovered }
    }
}

/// Releases the lock on drop
#[derive(Debug)]
pub struct SharedLockGuard<'a> {
    lock: &'a SharedLock,
    token: u64,
    recovered: bool,
}

impl SharedLockGuard<'_> {
    /// True when the lock was taken over from a dead holder, meaning the
    /// protected data may have been left half-written.
    pub fn recovered(&self) -> bool {
        self.recovered
    }
}

impl Drop for SharedLockGuard<'_> {
    fn drop(&mut self) {
        // Only release if nobody recovered the lock from us in the meantime.
        let _ = self
            .lock
            .owner
            .compare_exchange(self.token, 0, Ordering::Release, Ordering::Relaxed);
    }
}

fn new_token() -> u64 {
    let local = NEXT_LOCAL_TOKEN.fetch_add(1, Ordering::Relaxed);
    (u64::from(PlatformUtils::get_process_id()) << 32) | u64::from(local)
}

fn token_pid(token: u64) -> u32 {
    (token >> 32) as u32
}
