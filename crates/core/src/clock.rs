//! Time source abstraction.
//!
//! Everything that compares "now" against a due instant takes a clock so tests
//! can drive time explicitly.

use std::sync::Mutex;

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Source of the current instant.
pub trait Clock: Send + Sync + core::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;

    /// Current instant as whole seconds since the Unix epoch.
    fn now_ts(&self) -> i64 {
        self.now().timestamp()
    }
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at the given epoch second.
    pub fn at_ts(ts: i64) -> Self {
        let start = Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now);
        Self::new(start)
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    /// Jump to the given epoch second.
    pub fn set_ts(&self, ts: i64) {
        if let Some(at) = Utc.timestamp_opt(ts, 0).single() {
            self.set(at);
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_when_told() {
        let clock = ManualClock::at_ts(1_700_000_000);
        assert_eq!(clock.now_ts(), 1_700_000_000);

        clock.advance_secs(90);
        assert_eq!(clock.now_ts(), 1_700_000_090);

        clock.advance(Duration::days(1));
        assert_eq!(clock.now_ts(), 1_700_000_090 + 86_400);
    }
}
