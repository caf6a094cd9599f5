//! Monotonic tick source.
//!
//! Every timestamp in the core (decision `created_at`, lockout deadlines,
//! code expiry, audit ticks) is a [`Tick`]: milliseconds on a clock that
//! never runs backwards.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

/// Milliseconds on a monotonic clock.
pub type Tick = u64;

/// Source of monotonic ticks.
pub trait Clock: Send + Sync {
    /// Current tick. Never smaller than a previously returned value.
    fn now(&self) -> Tick;
}

/// Wall clock in Unix milliseconds, clamped so it never goes backwards.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicU64,
}

impl SystemClock {
    /// Create a system clock.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Tick {
        let wall = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        let prev = self.last.fetch_max(wall, Ordering::SeqCst);
        prev.max(wall)
    }
}

/// Hand-driven clock for tests and replays.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock starting at `start`.
    pub fn new(start: Tick) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Move the clock forward by `ms`.
    pub fn advance(&self, ms: u64) {
        let _ = self
            .now
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                Some(t.saturating_add(ms))
            });
    }

    /// Jump to `tick`; ignored if it would move the clock backwards.
    pub fn set(&self, tick: Tick) {
        self.now.fetch_max(tick, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tick {
        self.now.load(Ordering::SeqCst)
    }
}
