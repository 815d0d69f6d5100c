//! Clock abstraction.
//!
//! Every component that compares "now" against stored timestamps (NODATA
//! detection, self-state delays, package timestamps) reads time through a
//! [`Clock`], so tests can drive time by hand.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

/// Source of the current unix time in seconds.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current unix timestamp in seconds.
    fn now_unix(&self) -> i64;
}

/// Wall clock backed by `chrono::Utc::now`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// A manually driven clock.
///
/// # Examples
///
/// ```
/// use tripwire::time::{Clock, ManualClock};
///
/// let clock = ManualClock::new(1_000);
/// clock.advance(60);
/// assert_eq!(clock.now_unix(), 1_060);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Creates a clock frozen at `now`.
    #[must_use]
    pub const fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    /// Moves the clock forward by `secs` seconds.
    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute timestamp.
    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Returns the default wall clock as a shared handle.
#[must_use]
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Converts a unix timestamp into a UTC datetime, clamping invalid values to the epoch.
#[must_use]
pub fn to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_default()
}

/// Formats a unix timestamp as `HH:MM` in UTC, as used in human-facing messages.
#[must_use]
pub fn format_hhmm(ts: i64) -> String {
    to_datetime(ts).format("%H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_and_sets() {
        let clock = ManualClock::new(100);
        clock.advance(5);
        assert_eq!(clock.now_unix(), 105);
        clock.set(7);
        assert_eq!(clock.now_unix(), 7);
    }

    #[test]
    fn system_clock_is_after_2020() {
        assert!(SystemClock.now_unix() > 1_577_836_800);
    }

    #[test]
    fn format_hhmm_uses_utc() {
        // 1970-01-01T01:02:03Z
        assert_eq!(format_hhmm(3723), "01:02");
    }
}
