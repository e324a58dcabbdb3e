//! Time sources for the dispatcher.
//!
//! Every deadline in the system is an absolute millisecond timestamp read
//! from the same `Clock`, so swapping in `SimulatedClock` shifts offer
//! deadlines, booking expiry and staleness checks together and makes timeout
//! paths deterministic in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds in one second.
pub const ONE_SEC_MS: u64 = 1000;

/// Millisecond time source.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds. `SystemClock` uses the Unix epoch;
    /// simulated clocks may use any origin.
    fn now_ms(&self) -> u64;
}

/// Wall-clock time in Unix epoch milliseconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct SimulatedClock {
    now_ms: AtomicU64,
}

impl SimulatedClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    /// Move the clock forward by `delta_ms` and return the new time.
    pub fn advance(&self, delta_ms: u64) -> u64 {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst) + delta_ms
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for SimulatedClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
