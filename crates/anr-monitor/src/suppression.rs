//! Suppression windows.
//!
//! Skip requests come from the primary context while the timer and
//! delivery contexts read them, so the state is a small struct behind a
//! mutex. The lock is never held across an observer callback.
//!
//! Two kinds of window exist:
//!
//! | Scope | Lifetime |
//! |-------|----------|
//! | Current span | Until the next span opens (pre-armed if no span is open) |
//! | Timed | Every span whose start falls in `[requested_at, expires_at)` |

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Identifies an execution context.
///
/// The detector is built with the id of the context it monitors; skip
/// requests carrying any other id are ignored. Thread ids cover the usual
/// case, custom ids let tests and embedders name contexts explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(ContextRepr);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ContextRepr {
    Thread(ThreadId),
    Custom(u64),
}

impl ContextId {
    /// The calling thread.
    #[must_use]
    pub fn current() -> Self {
        Self(ContextRepr::Thread(thread::current().id()))
    }

    /// A specific thread.
    #[must_use]
    pub const fn thread(id: ThreadId) -> Self {
        Self(ContextRepr::Thread(id))
    }

    /// An embedder-chosen identifier.
    #[must_use]
    pub const fn custom(id: u64) -> Self {
        Self(ContextRepr::Custom(id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipTarget {
    NextSpan,
    Span(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    from: Instant,
    until: Instant,
}

impl Window {
    fn covers(&self, span_start: Instant) -> bool {
        self.from <= span_start && span_start < self.until
    }
}

#[derive(Debug, Default)]
struct SuppressionState {
    active_span: Option<u64>,
    skip: Option<SkipTarget>,
    window: Option<Window>,
}

/// Tracks skip requests and answers whether a notification should be
/// withheld.
///
/// Suppression only withholds delivery. Span timing and fire indices keep
/// advancing underneath it.
///
/// # Example
///
/// ```rust
/// use anr_monitor::{ContextId, SuppressionTracker};
/// use tokio::time::Instant;
///
/// let main = ContextId::custom(1);
/// let tracker = SuppressionTracker::new(main);
///
/// // Calls from other contexts are ignored.
/// assert!(!tracker.skip_current(ContextId::custom(2)));
///
/// // No span is open, so the skip applies to the next one.
/// assert!(tracker.skip_current(main));
/// tracker.span_opened(1);
/// assert!(tracker.should_suppress(1, Instant::now(), Instant::now()));
/// ```
#[derive(Debug)]
pub struct SuppressionTracker {
    monitored: ContextId,
    state: Mutex<SuppressionState>,
}

impl SuppressionTracker {
    /// Creates a tracker that honours skips from `monitored` only.
    #[must_use]
    pub fn new(monitored: ContextId) -> Self {
        Self {
            monitored,
            state: Mutex::new(SuppressionState::default()),
        }
    }

    /// The monitored context.
    #[must_use]
    pub const fn monitored(&self) -> ContextId {
        self.monitored
    }

    fn lock(&self) -> MutexGuard<'_, SuppressionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Suppresses the open span, or the next one if none is open.
    ///
    /// Returns false (and does nothing) when `caller` is not the monitored
    /// context.
    pub fn skip_current(&self, caller: ContextId) -> bool {
        if caller != self.monitored {
            debug!(?caller, "skip_current ignored: caller is not the monitored context");
            return false;
        }
        let mut state = self.lock();
        state.skip = Some(match state.active_span {
            Some(id) => SkipTarget::Span(id),
            None => SkipTarget::NextSpan,
        });
        debug!(skip = ?state.skip, "current span suppressed");
        true
    }

    /// Suppresses the current span plus every span starting in
    /// `[now, now + seconds)`.
    ///
    /// Spans that started earlier are left alone, so notices still queued
    /// for an already closed span are delivered. Non-positive, non-finite
    /// or overflowing `seconds` degrade to
    /// [`skip_current`](Self::skip_current). A live window is extended,
    /// never shortened.
    pub fn skip_current_and_for(&self, caller: ContextId, seconds: f64, now: Instant) -> bool {
        if !self.skip_current(caller) {
            return false;
        }
        if !(seconds.is_finite() && seconds > 0.0) {
            return true;
        }
        let Some(until) = Duration::try_from_secs_f64(seconds)
            .ok()
            .and_then(|window| now.checked_add(window))
        else {
            return true;
        };

        let mut state = self.lock();
        let window = match state.window {
            Some(live) if live.until > now => Window {
                from: live.from.min(now),
                until: live.until.max(until),
            },
            _ => Window { from: now, until },
        };
        state.window = Some(window);
        debug!(seconds, "timed suppression window set");
        true
    }

    /// Records that span `id` opened.
    ///
    /// A pending next-span skip binds to it; a skip for an earlier span
    /// expires.
    pub fn span_opened(&self, id: u64) {
        let mut state = self.lock();
        state.active_span = Some(id);
        state.skip = match state.skip {
            Some(SkipTarget::NextSpan) => Some(SkipTarget::Span(id)),
            Some(SkipTarget::Span(old)) if old != id => None,
            other => other,
        };
    }

    /// Records that span `id` closed.
    ///
    /// A skip bound to it stays in place so the span's queued
    /// notifications remain suppressed.
    pub fn span_closed(&self, id: u64) {
        let mut state = self.lock();
        if state.active_span == Some(id) {
            state.active_span = None;
        }
    }

    /// Returns true if notifications for the span `span_id` that started at
    /// `span_start` must be withheld at `now`.
    ///
    /// Clears the timed window once it has expired and the span being
    /// checked started after it.
    pub fn should_suppress(&self, span_id: u64, span_start: Instant, now: Instant) -> bool {
        let mut state = self.lock();
        if state.skip == Some(SkipTarget::Span(span_id)) {
            return true;
        }
        if let Some(window) = state.window {
            if window.covers(span_start) {
                return true;
            }
            if span_start >= window.until && now >= window.until {
                state.window = None;
            }
        }
        false
    }

    /// Drops every window.
    pub fn clear(&self) {
        *self.lock() = SuppressionState::default();
    }
}
