//! Runtime counters and status snapshots.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle state of a detector session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Created, not yet started.
    Idle,
    /// Timer and delivery contexts are live.
    Running,
    /// A resource error stopped the session; `start` may be retried.
    Failed,
    /// Permanently shut down.
    TornDown,
}

/// Counters updated by the timer and delivery contexts.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    spans_opened: AtomicU64,
    stalled_spans: AtomicU64,
    notices_emitted: AtomicU64,
    delivered: AtomicU64,
    suppressed: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    pub(crate) fn span_opened(&self) {
        self.spans_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn span_stalled(&self) {
        self.stalled_spans.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn notice_emitted(&self) {
        self.notices_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn suppressed(&self) {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, state: SessionState, threshold_ms: u64) -> DetectorStatus {
        DetectorStatus {
            state,
            threshold_ms,
            spans_opened: self.spans_opened.load(Ordering::Relaxed),
            stalled_spans: self.stalled_spans.load(Ordering::Relaxed),
            notices_emitted: self.notices_emitted.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of detector state.
///
/// Useful for logging and debugging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectorStatus {
    /// Session lifecycle state.
    pub state: SessionState,
    /// Threshold applied to the next span.
    pub threshold_ms: u64,
    /// Busy spans opened.
    pub spans_opened: u64,
    /// Spans that produced at least one stall notification.
    pub stalled_spans: u64,
    /// Notifications emitted by the timer context.
    pub notices_emitted: u64,
    /// Notifications handed to the observer.
    pub delivered: u64,
    /// Notifications withheld by a suppression window.
    pub suppressed: u64,
    /// Notifications dropped: no observer, or detector torn down.
    pub dropped: u64,
}
