//! Error types for the stall detector.
//!
//! Configuration errors are returned to the caller that supplied the bad
//! value. Resource errors end the current session. Malformed phase signals
//! never produce an error at all; the engine absorbs them.

use thiserror::Error;

/// Result type alias for detector operations.
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Errors that can occur while configuring or starting a detector.
///
/// None of these are ever reported to the [`AnrObserver`](crate::AnrObserver);
/// that channel carries stall events only.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Threshold at or below the floor.
    ///
    /// The previously configured threshold is kept.
    #[error("threshold of {requested}ms rejected: must be greater than {minimum}ms")]
    InvalidThreshold {
        /// Value the caller asked for
        requested: u64,
        /// Exclusive lower bound
        minimum: u64,
    },

    /// Some other configuration field is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The repeating timer context could not be created.
    ///
    /// Fatal to the session: the detector moves to the failed state and
    /// stays there until `start` is called again.
    #[error("stall timer could not be armed: {reason}")]
    TimerUnavailable {
        /// Underlying OS or runtime error
        reason: String,
    },

    /// The delivery context could not be created.
    #[error("notification delivery context unavailable: {reason}")]
    DeliveryUnavailable {
        /// Underlying OS error
        reason: String,
    },
}

impl MonitorError {
    /// Returns true for errors that stop a running session.
    #[must_use]
    pub const fn is_resource_error(&self) -> bool {
        matches!(
            self,
            Self::TimerUnavailable { .. } | Self::DeliveryUnavailable { .. }
        )
    }
}
