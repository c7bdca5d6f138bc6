//! # ANR Monitor
//!
//! Detects when a designated primary event loop (typically a UI thread)
//! stops making progress, and reports it from a thread that is not
//! blocked.
//!
//! ## Model
//!
//! The primary loop reports phase transitions. Time spent between busy-phase
//! entry and exit is a *busy span*. Every `threshold` milliseconds a span
//! stays open, the observer receives an [`IntenseOperation`] with an
//! increasing index; when a span that fired at least once closes, one last
//! report with `is_finished = true` follows.
//!
//! ```text
//!  A ──────────────────────────────────────────────────────────────── B
//!  │   threshold   │   threshold   │   threshold   │ ...
//!                  ▼               ▼               ▼                  ▼
//!              index 1         index 2         index 3          finished
//! ```
//!
//! A span shorter than one threshold produces no reports at all.
//!
//! ## Components
//!
//! | Component | Purpose |
//! |-----------|---------|
//! | [`AnrDetector`] | Lifecycle controller and public facade |
//! | [`StallEngine`] | Busy-span state machine run on the timer thread |
//! | [`SuppressionTracker`] | Skip-current and timed skip windows |
//! | [`AnrObserver`] | Callback invoked on the delivery thread |
//! | [`PhaseSink`] / [`LoopPhaseSource`] | Phase signal intake |
//! | [`MonitorClock`] | Monotonic time and seconds conversion |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use anr_monitor::{AnrDetector, AnrObserver, DetectorConfig, IntenseOperation, LoopActivity};
//! use std::sync::Arc;
//!
//! let detector = AnrDetector::for_current_thread(DetectorConfig::new().with_threshold_ms(300))?;
//! let observer: Arc<dyn AnrObserver> = Arc::new(|op: &IntenseOperation| {
//!     if op.is_finished {
//!         eprintln!("stall over after {:.2}s", op.duration);
//!     }
//! });
//! detector.set_observer(&observer);
//! detector.start()?;
//!
//! let sink = detector.phase_sink();
//! loop {
//!     sink.observe(LoopActivity::AfterWaiting);
//!     // ... process events ...
//!     sink.observe(LoopActivity::BeforeWaiting);
//!     // ... wait for events ...
//! #   break;
//! }
//! # Ok::<(), anr_monitor::MonitorError>(())
//! ```

mod clock;
mod config;
mod detector;
mod dispatch;
mod engine;
mod error;
mod phase;
mod status;
mod suppression;

pub use clock::MonitorClock;
pub use config::{validate_threshold, DetectorConfig, DEFAULT_THRESHOLD_MS, MIN_THRESHOLD_MS};
pub use detector::AnrDetector;
pub use dispatch::{AnrObserver, IntenseOperation, StallNotice};
pub use engine::{BusySpan, EngineState, StallEngine};
pub use error::{MonitorError, Result};
pub use phase::{LoopActivity, LoopPhaseSource, PhaseEvent, PhaseSink, Transition};
pub use status::{DetectorStatus, SessionState};
pub use suppression::{ContextId, SuppressionTracker};
