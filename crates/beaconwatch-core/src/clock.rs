//! Time sources.
//!
//! Ranging and monitoring decisions run on a monotonic millisecond clock.
//! Persistence needs wall-clock time for file ages. Both come from a
//! [`Clock`] so tests can drive time by hand.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime};

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds since an arbitrary fixed origin. Never goes backwards.
    fn now_millis(&self) -> i64;

    /// Current wall-clock time.
    fn wall_time(&self) -> SystemTime;
}

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// Real time, measured from the first use in this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn now_millis(&self) -> i64 {
        PROCESS_START.get_or_init(Instant::now).elapsed().as_millis() as i64
    }

    fn wall_time(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
    wall_origin: SystemTime,
}

impl ManualClock {
    /// Starts at `millis`, with wall time anchored at the current system time.
    #[must_use]
    pub fn new(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
            wall_origin: SystemTime::now(),
        }
    }

    /// Moves time forward by `millis`.
    pub fn advance(&self, millis: i64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    /// Jumps to an absolute time.
    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }

    #[allow(clippy::cast_sign_loss)]
    fn wall_time(&self) -> SystemTime {
        let offset = self.now_millis().max(0) as u64;
        self.wall_origin + Duration::from_millis(offset)
    }
}
