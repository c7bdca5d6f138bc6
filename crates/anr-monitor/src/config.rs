//! Configuration for [`AnrDetector`](crate::AnrDetector).

use crate::error::{MonitorError, Result};
use serde::{Deserialize, Serialize};

/// Default stall threshold in milliseconds.
pub const DEFAULT_THRESHOLD_MS: u64 = 250;

/// Exclusive lower bound for the threshold: 101ms is the smallest
/// accepted value.
pub const MIN_THRESHOLD_MS: u64 = 100;

/// Checks a threshold against the floor.
///
/// # Errors
///
/// Returns [`MonitorError::InvalidThreshold`] for values `<= 100`.
pub fn validate_threshold(threshold_ms: u64) -> Result<u64> {
    if threshold_ms <= MIN_THRESHOLD_MS {
        return Err(MonitorError::InvalidThreshold {
            requested: threshold_ms,
            minimum: MIN_THRESHOLD_MS,
        });
    }
    Ok(threshold_ms)
}

/// Detector configuration.
///
/// Missing fields fall back to their defaults when deserializing, so a
/// config file only needs to name what it changes.
///
/// # Example
///
/// ```rust
/// use anr_monitor::DetectorConfig;
///
/// let config = DetectorConfig::new()
///     .with_threshold_ms(400)
///     .with_timer_thread_name("ui-watchdog");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Interval between "still stuck" notifications, in milliseconds.
    pub threshold_ms: u64,
    /// Name of the dedicated timer thread.
    pub timer_thread_name: String,
    /// Name of the dedicated delivery thread.
    pub delivery_thread_name: String,
}

impl DetectorConfig {
    /// Creates a config with default values.
    ///
    /// Defaults:
    /// - Threshold: 250ms
    /// - Timer thread: `anr-timer`
    /// - Delivery thread: `anr-delivery`
    #[must_use]
    pub fn new() -> Self {
        Self {
            threshold_ms: DEFAULT_THRESHOLD_MS,
            timer_thread_name: "anr-timer".to_string(),
            delivery_thread_name: "anr-delivery".to_string(),
        }
    }

    /// Sets the threshold. Not validated until [`validate`](Self::validate).
    #[must_use]
    pub const fn with_threshold_ms(mut self, threshold_ms: u64) -> Self {
        self.threshold_ms = threshold_ms;
        self
    }

    /// Sets the timer thread name.
    #[must_use]
    pub fn with_timer_thread_name(mut self, name: impl Into<String>) -> Self {
        self.timer_thread_name = name.into();
        self
    }

    /// Sets the delivery thread name.
    #[must_use]
    pub fn with_delivery_thread_name(mut self, name: impl Into<String>) -> Self {
        self.delivery_thread_name = name.into();
        self
    }

    /// Validates every field.
    ///
    /// # Errors
    ///
    /// - [`MonitorError::InvalidThreshold`] if `threshold_ms <= 100`
    /// - [`MonitorError::InvalidConfig`] if a thread name is empty or
    ///   contains a NUL byte
    pub fn validate(&self) -> Result<()> {
        validate_threshold(self.threshold_ms)?;
        for (field, name) in [
            ("timer_thread_name", &self.timer_thread_name),
            ("delivery_thread_name", &self.delivery_thread_name),
        ] {
            if name.trim().is_empty() {
                return Err(MonitorError::InvalidConfig(format!("{field} is empty")));
            }
            if name.contains('\0') {
                return Err(MonitorError::InvalidConfig(format!(
                    "{field} contains a NUL byte"
                )));
            }
        }
        Ok(())
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self::new()
    }
}
