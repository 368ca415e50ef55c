//! Injectable wall clock
//!
//! Every component that reads time does so through [`Clock`] so tests can
//! drive timers and timeouts deterministically with [`MockClock`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;

/// Source of wall-clock time
pub trait Clock: Send + Sync + 'static {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests
///
/// Time only moves when [`advance`](MockClock::advance) or
/// [`set`](MockClock::set) is called.
#[derive(Debug)]
pub struct MockClock {
    now: RwLock<DateTime<Utc>>,
}

impl MockClock {
    /// Create a mock clock starting at the given instant
    pub fn starting_at(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: RwLock::new(start),
        })
    }

    /// Create a mock clock starting at the current system time
    pub fn from_system() -> Arc<Self> {
        Self::starting_at(Utc::now())
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let delta = TimeDelta::from_std(by).unwrap_or(TimeDelta::zero());
        let mut now = self.now.write();
        *now += delta;
    }

    /// Jump the clock to an absolute instant
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_advances() {
        let clock = MockClock::from_system();
        let before = clock.now();

        clock.advance(Duration::from_secs(3600));

        assert_eq!(clock.now() - before, TimeDelta::try_seconds(3600).unwrap());
    }

    #[test]
    fn mock_clock_is_frozen_between_advances() {
        let clock = MockClock::from_system();
        let a = clock.now();
        let b = clock.now();
        assert_eq!(a, b);
    }
}
