//! Wall-clock abstraction.
//!
//! Every time-dependent component (learned-cache windows, conversation TTL,
//! retention sweeps) reads time through [`Clock`] so tests can drive expiry
//! with a [`ManualClock`] instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds in one hour.
pub const HOUR_SECS: u64 = 3_600;

/// Seconds in one day.
pub const DAY_SECS: u64 = 86_400;

/// Source of the current Unix time in seconds.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current Unix timestamp in seconds.
    fn now_secs(&self) -> u64;
}

/// Clock backed by [`SystemTime::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        unix_now()
    }
}

/// Manually advanced clock for tests and simulations.
///
/// # Example
///
/// ```rust
/// use learned_response_router::clock::{Clock, ManualClock, HOUR_SECS};
///
/// let clock = ManualClock::new(1_000);
/// clock.advance(HOUR_SECS);
/// assert_eq!(clock.now_secs(), 1_000 + HOUR_SECS);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at `start_secs`.
    pub fn new(start_secs: u64) -> Self {
        Self {
            now: AtomicU64::new(start_secs),
        }
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    /// Jump to an absolute timestamp.
    pub fn set(&self, secs: u64) {
        self.now.store(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Current Unix time in seconds; `0` if the system clock is before the epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
