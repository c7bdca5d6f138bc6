//! Notification delivery.
//!
//! The timer context posts [`StallNotice`]s into an unbounded queue and
//! moves on. A single delivery thread drains the queue in order, checks
//! suppression, converts to seconds and calls the observer. Posting never
//! waits on the observer, so a slow callback cannot delay future fires.
//!
//! ```text
//!  timer thread            delivery thread            observer
//!  ────────────            ───────────────            ────────
//!  Outbox::post ──queue──▶ Dispatcher::deliver ──────▶ on_intense_operation
//!                            │ closed?  → drop
//!                            │ suppressed? → withhold
//!                            │ observer gone? → drop
//!                            │ observer panicked? → drop, keep going
//! ```

use crate::clock::MonitorClock;
use crate::phase::LoopActivity;
use crate::status::Counters;
use crate::suppression::SuppressionTracker;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Report handed to the observer.
///
/// `start` is seconds since the detector was created; `duration` is the
/// time the loop has spent in the busy span so far (or in total, when
/// `is_finished`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IntenseOperation {
    /// Busy activity the span is in.
    pub activity: LoopActivity,
    /// Span start, seconds since the detector epoch.
    pub start: f64,
    /// Seconds spent in the span.
    pub duration: f64,
    /// 1-based fire index within the span. The finished report repeats
    /// the index of the last periodic report.
    pub index: u64,
    /// True only on the terminal report of a span.
    pub is_finished: bool,
}

/// Receives stall notifications.
///
/// Called on the delivery thread, never on the monitored context, one
/// call at a time.
pub trait AnrObserver: Send + Sync {
    /// A busy span crossed another threshold, or finished after doing so.
    fn on_intense_operation(&self, operation: &IntenseOperation);
}

impl<F> AnrObserver for F
where
    F: Fn(&IntenseOperation) + Send + Sync,
{
    fn on_intense_operation(&self, operation: &IntenseOperation) {
        self(operation);
    }
}

/// Engine-side notification, still in monotonic units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallNotice {
    /// Span the notice belongs to.
    pub span_id: u64,
    /// Busy activity at emission time.
    pub activity: LoopActivity,
    /// Span start.
    pub start: Instant,
    /// Elapsed time in the span.
    pub duration: Duration,
    /// 1-based fire index.
    pub index: u64,
    /// Terminal notice for the span.
    pub is_finished: bool,
    /// Suppressed at emission time.
    pub suppressed: bool,
}

/// Non-owning observer registration.
#[derive(Default)]
pub(crate) struct ObserverSlot {
    observer: RwLock<Option<Weak<dyn AnrObserver>>>,
}

impl ObserverSlot {
    pub(crate) fn set(&self, observer: &Arc<dyn AnrObserver>) {
        *self
            .observer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(observer));
    }

    pub(crate) fn clear(&self) {
        self.observer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Upgrades the registration. The lock is released before returning.
    pub(crate) fn get(&self) -> Option<Arc<dyn AnrObserver>> {
        self.observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.get().is_some()
    }
}

impl std::fmt::Debug for ObserverSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSlot")
            .field("registered", &self.is_registered())
            .finish()
    }
}

/// Sending half used by the timer context.
#[derive(Debug, Clone)]
pub struct Outbox {
    sender: UnboundedSender<StallNotice>,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl Outbox {
    pub(crate) fn new(
        sender: UnboundedSender<StallNotice>,
        closed: Arc<AtomicBool>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            sender,
            closed,
            counters,
        }
    }

    /// Enqueues a notice. Returns false if the detector is closed or the
    /// delivery context is gone.
    pub fn post(&self, notice: StallNotice) -> bool {
        if self.closed.load(Ordering::Acquire) {
            self.counters.dropped();
            return false;
        }
        self.counters.notice_emitted();
        if self.sender.send(notice).is_err() {
            self.counters.dropped();
            return false;
        }
        true
    }
}

/// What happened to one notice at the delivery boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    Suppressed,
    Dropped,
}

/// Receiving half, owned by the delivery thread.
pub(crate) struct Dispatcher {
    receiver: UnboundedReceiver<StallNotice>,
    observer: Arc<ObserverSlot>,
    tracker: Arc<SuppressionTracker>,
    clock: MonitorClock,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl Dispatcher {
    pub(crate) fn new(
        receiver: UnboundedReceiver<StallNotice>,
        observer: Arc<ObserverSlot>,
        tracker: Arc<SuppressionTracker>,
        clock: MonitorClock,
        closed: Arc<AtomicBool>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            receiver,
            observer,
            tracker,
            clock,
            closed,
            counters,
        }
    }

    /// Delivers until every sender is gone. Must run outside an async
    /// runtime.
    pub(crate) fn run(mut self) {
        debug!("delivery context started");
        while let Some(notice) = self.receiver.blocking_recv() {
            self.deliver(notice);
        }
        debug!("delivery context stopped");
    }

    pub(crate) fn deliver(&self, notice: StallNotice) -> Delivery {
        if self.closed.load(Ordering::Acquire) {
            self.counters.dropped();
            return Delivery::Dropped;
        }
        if notice.suppressed
            || self
                .tracker
                .should_suppress(notice.span_id, notice.start, self.clock.now())
        {
            trace!(span = notice.span_id, index = notice.index, "notice suppressed");
            self.counters.suppressed();
            return Delivery::Suppressed;
        }
        let Some(observer) = self.observer.get() else {
            trace!(span = notice.span_id, index = notice.index, "no observer, notice dropped");
            self.counters.dropped();
            return Delivery::Dropped;
        };

        let report = IntenseOperation {
            activity: notice.activity,
            start: self.clock.seconds_at(notice.start),
            duration: MonitorClock::seconds(notice.duration),
            index: notice.index,
            is_finished: notice.is_finished,
        };
        // A panicking observer must not take the delivery thread with it.
        if panic::catch_unwind(AssertUnwindSafe(|| observer.on_intense_operation(&report))).is_err() {
            warn!(span = notice.span_id, index = notice.index, "observer panicked, notice dropped");
            self.counters.dropped();
            return Delivery::Dropped;
        }
        self.counters.delivered();
        Delivery::Delivered
    }
}
