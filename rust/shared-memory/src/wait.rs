//! Bounded waiting with backoff

use crate::{Result, ShmError};
use std::time::{Duration, Instant};

const SPIN_LIMIT: u32 = 64;
const YIELD_LIMIT: u32 = 8;
const FIRST_SLEEP: Duration = Duration::from_micros(50);

/// Default ceiling for a single backoff sleep
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_millis(2);

/// Timeouts shared by every lock acquisition and stage wait on a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    /// Longest time to wait for a shared lock
    pub lock_timeout: Duration,
    /// Ceiling for a single backoff sleep
    pub backoff_cap: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(1),
            backoff_cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

/// Spin, then yield, then sleep with doubling intervals up to `cap`
#[derive(Debug, Clone)]
pub struct Backoff {
    step: u32,
    sleep: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(cap: Duration) -> Self {
        Self { step: 0, sleep: FIRST_SLEEP.min(cap), cap }
    }

    pub fn snooze(&mut self) {
        if self.step < SPIN_LIMIT {
            std::hint::spin_loop();
        } else if self.step < SPIN_LIMIT + YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.sleep);
            self.sleep = (self.sleep * 2).min(self.cap);
        }
        self.step = self.step.saturating_add(1);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_CAP)
    }
}

/// Poll `ready` until it returns `Some`, or fail with `Timeout` once
/// `timeout` has elapsed.
pub fn wait_until<T>(
    timeout: Duration,
    backoff_cap: Duration,
    what: &str,
    mut ready: impl FnMut() -> Option<T>,
) -> Result<T> {
    let deadline = Instant::now() + timeout;
    let mut backoff = Backoff::new(backoff_cap);

    loop {
        if let Some(value) = ready() {
            return Ok(value);
        }
        if Instant::now() >= deadline {
            return Err(ShmError::Timeout(format!("{} after {:?}", what, timeout)));
        }
        backoff.snooze();
    }
}
