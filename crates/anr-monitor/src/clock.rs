//! Monotonic clock shared by the timer and delivery contexts.
//!
//! Internally everything is a [`tokio::time::Instant`] / [`Duration`];
//! conversion to floating-point seconds happens only when a report is
//! handed to the observer.

use std::time::Duration;
use tokio::time::Instant;

/// Monotonic time source with a fixed epoch.
///
/// Reported `start` values are seconds since the epoch, which is the
/// moment the clock (and therefore the detector) was created.
///
/// # Example
///
/// ```rust
/// use anr_monitor::MonitorClock;
///
/// let clock = MonitorClock::new();
/// let t = clock.now();
/// assert!(clock.seconds_at(t) >= 0.0);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct MonitorClock {
    epoch: Instant,
}

impl MonitorClock {
    /// Creates a clock whose epoch is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Creates a clock with an explicit epoch.
    #[must_use]
    pub const fn with_epoch(epoch: Instant) -> Self {
        Self { epoch }
    }

    /// Current monotonic instant.
    #[inline]
    #[must_use]
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// The clock's epoch.
    #[inline]
    #[must_use]
    pub const fn epoch(&self) -> Instant {
        self.epoch
    }

    /// Seconds between the epoch and `instant`, clamped at zero.
    #[must_use]
    pub fn seconds_at(&self, instant: Instant) -> f64 {
        instant.saturating_duration_since(self.epoch).as_secs_f64()
    }

    /// Converts a duration to seconds.
    #[inline]
    #[must_use]
    pub fn seconds(duration: Duration) -> f64 {
        duration.as_secs_f64()
    }
}

impl Default for MonitorClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_relative_to_epoch() {
        let epoch = Instant::now();
        let clock = MonitorClock::with_epoch(epoch);
        let later = epoch + Duration::from_millis(1500);
        assert!((clock.seconds_at(later) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_instant_before_epoch_clamps() {
        let epoch = Instant::now() + Duration::from_secs(10);
        let clock = MonitorClock::with_epoch(epoch);
        assert_eq!(clock.seconds_at(Instant::now()), 0.0);
    }

    #[test]
    fn test_duration_seconds() {
        assert!((MonitorClock::seconds(Duration::from_millis(250)) - 0.25).abs() < 1e-12);
    }
}
