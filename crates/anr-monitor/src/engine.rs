//! # Stall Timer Engine
//!
//! Measures how long the primary loop stays in its busy phase and emits a
//! notice every time another threshold elapses.
//!
//! ## State Machine
//!
//! ```text
//!            enter(busy)              fire
//!   ┌──────┐ ──────────▶ ┌───────┐ ─────────▶ ┌───────┐ ◀─┐ fire
//!   │ Idle │             │ Armed │            │ Fired │ ──┘
//!   └──────┘ ◀────────── └───────┘            └───────┘
//!      ▲       exit (silent)                      │
//!      └──────────────────────────────────────────┘
//!               exit (one finished notice)
//! ```
//!
//! At most one [`BusySpan`] exists, and only `Fired` can produce a
//! finished notice, so "finished iff at least one fire" holds by
//! construction.
//!
//! Fire `k` of a span is due at `start + k * threshold`. Deadlines are
//! anchored at the span start rather than at the previous fire, so a late
//! wake-up does not shift later fires.
//!
//! [`StallEngine`] is the pure state machine; [`EngineDriver`] runs it on
//! the timer thread against real (or paused) tokio time.

use crate::dispatch::{Outbox, StallNotice};
use crate::phase::{LoopActivity, PhaseEvent, Transition};
use crate::status::Counters;
use crate::suppression::SuppressionTracker;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

/// One interval between busy-phase entry and exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusySpan {
    id: u64,
    activity: LoopActivity,
    start: Instant,
    threshold: Duration,
    fire_index: u64,
    reported: Duration,
}

impl BusySpan {
    fn new(id: u64, activity: LoopActivity, start: Instant, threshold: Duration) -> Self {
        Self {
            id,
            activity,
            start,
            threshold,
            fire_index: 0,
            reported: Duration::ZERO,
        }
    }

    /// Span identifier, assigned by the phase sink.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Latest busy activity seen in this span.
    #[inline]
    #[must_use]
    pub const fn activity(&self) -> LoopActivity {
        self.activity
    }

    /// Busy-phase entry time.
    #[inline]
    #[must_use]
    pub const fn start(&self) -> Instant {
        self.start
    }

    /// Threshold captured when the span opened.
    #[inline]
    #[must_use]
    pub const fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Fires so far; 0 until the first threshold elapses.
    #[inline]
    #[must_use]
    pub const fn fire_index(&self) -> u64 {
        self.fire_index
    }

    /// Longest duration reported so far.
    #[inline]
    #[must_use]
    pub const fn reported(&self) -> Duration {
        self.reported
    }

    /// When fire `fire_index + 1` is due. `None` only on overflow.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let k = u32::try_from(self.fire_index + 1).ok()?;
        self.start.checked_add(self.threshold.checked_mul(k)?)
    }

    fn notice(&self, duration: Duration, is_finished: bool) -> StallNotice {
        StallNotice {
            span_id: self.id,
            activity: self.activity,
            start: self.start,
            duration,
            index: self.fire_index,
            is_finished,
            suppressed: false,
        }
    }
}

/// Engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No span open; timer disarmed.
    Idle,
    /// Span open, no fire yet.
    Armed(BusySpan),
    /// Span open, at least one fire emitted. Suppression or a missing
    /// observer may still have withheld it from delivery.
    Fired(BusySpan),
}

/// Pure stall-detection state machine.
///
/// Time is passed in explicitly, which keeps it deterministic under test.
///
/// # Example
///
/// ```rust
/// use anr_monitor::{LoopActivity, StallEngine};
/// use std::time::Duration;
/// use tokio::time::Instant;
///
/// let mut engine = StallEngine::new();
/// let t0 = Instant::now();
/// let threshold = Duration::from_millis(250);
///
/// engine.enter(1, LoopActivity::AfterWaiting, t0, threshold);
/// let fires = engine.fire_due(t0 + Duration::from_millis(260));
/// assert_eq!(fires.len(), 1);
/// assert_eq!(fires[0].index, 1);
///
/// let (_, closing) = engine.exit(t0 + Duration::from_millis(300));
/// assert!(closing.last().unwrap().is_finished);
/// ```
#[derive(Debug)]
pub struct StallEngine {
    state: EngineState,
}

impl StallEngine {
    /// Creates an idle engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: EngineState::Idle,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> &EngineState {
        &self.state
    }

    /// The open span, if any.
    #[must_use]
    pub const fn open_span(&self) -> Option<&BusySpan> {
        match &self.state {
            EngineState::Idle => None,
            EngineState::Armed(span) | EngineState::Fired(span) => Some(span),
        }
    }

    /// Deadline of the next fire while a span is open.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.open_span().and_then(BusySpan::next_deadline)
    }

    /// Busy-phase entry.
    ///
    /// Opens span `span_id` when idle and returns it. If a span is already
    /// open it keeps its start and only takes the new activity tag.
    /// Non-busy activities are ignored.
    pub fn enter(
        &mut self,
        span_id: u64,
        activity: LoopActivity,
        at: Instant,
        threshold: Duration,
    ) -> Option<BusySpan> {
        if !activity.is_busy() {
            trace!(%activity, "enter with non-busy activity ignored");
            return None;
        }
        match &mut self.state {
            EngineState::Idle => {
                let span = BusySpan::new(span_id, activity, at, threshold);
                self.state = EngineState::Armed(span);
                Some(span)
            }
            EngineState::Armed(span) | EngineState::Fired(span) => {
                span.activity = activity;
                None
            }
        }
    }

    /// Emits every fire whose deadline is at or before `now`, in order.
    ///
    /// Overdue fires report their nominal due time as duration; the last
    /// one reports `now - start`.
    pub fn fire_due(&mut self, now: Instant) -> Vec<StallNotice> {
        let (mut span, was_fired) = match self.state {
            EngineState::Idle => return Vec::new(),
            EngineState::Armed(span) => (span, false),
            EngineState::Fired(span) => (span, true),
        };

        let mut notices = Vec::new();
        while let Some(due) = span.next_deadline().filter(|due| *due <= now) {
            span.fire_index += 1;
            let more_due = span.next_deadline().is_some_and(|next| next <= now);
            let duration = if more_due {
                due.saturating_duration_since(span.start)
            } else {
                now.saturating_duration_since(span.start)
            };
            span.reported = span.reported.max(duration);
            notices.push(span.notice(duration, false));
        }

        self.state = if was_fired || span.fire_index > 0 {
            EngineState::Fired(span)
        } else {
            EngineState::Armed(span)
        };
        notices
    }

    /// Busy-phase exit.
    ///
    /// Returns the closed span and its closing notices: any fires that
    /// came due at or before `at`, then one finished notice if the span
    /// fired at all. An exit while idle is absorbed and returns nothing.
    ///
    /// Exits are stamped by the primary context but fires by the timer
    /// context, so an exit can arrive after a fire that is due later than
    /// it. The fire already went out; the finished notice then reports no
    /// less than the longest duration already reported for the span.
    pub fn exit(&mut self, at: Instant) -> (Option<BusySpan>, Vec<StallNotice>) {
        if matches!(self.state, EngineState::Idle) {
            trace!("exit without open span ignored");
            return (None, Vec::new());
        }

        let mut notices = self.fire_due(at);
        let span = match std::mem::replace(&mut self.state, EngineState::Idle) {
            EngineState::Idle => return (None, notices),
            EngineState::Armed(span) => span,
            EngineState::Fired(span) => {
                let duration = at.saturating_duration_since(span.start).max(span.reported);
                notices.push(span.notice(duration, true));
                span
            }
        };
        (Some(span), notices)
    }

    /// Discards the open span without a finished notice.
    pub fn abandon(&mut self) -> Option<BusySpan> {
        match std::mem::replace(&mut self.state, EngineState::Idle) {
            EngineState::Idle => None,
            EngineState::Armed(span) | EngineState::Fired(span) => Some(span),
        }
    }
}

impl Default for StallEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a [`StallEngine`] against tokio time.
///
/// Waits on whichever comes first: the next phase event or the next fire
/// deadline. Phase events win ties. Returns when the event queue closes,
/// abandoning any open span.
pub struct EngineDriver {
    engine: StallEngine,
    threshold_ms: Arc<AtomicU64>,
    tracker: Arc<SuppressionTracker>,
    outbox: Outbox,
    counters: Arc<Counters>,
}

impl EngineDriver {
    pub(crate) fn new(
        threshold_ms: Arc<AtomicU64>,
        tracker: Arc<SuppressionTracker>,
        outbox: Outbox,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            engine: StallEngine::new(),
            threshold_ms,
            tracker,
            outbox,
            counters,
        }
    }

    /// Drives the engine until `events` closes.
    pub async fn run(mut self, mut events: UnboundedReceiver<PhaseEvent>) {
        debug!("stall timer armed");
        loop {
            let deadline = self.engine.next_deadline();
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                () = wait_until(deadline) => {
                    let notices = self.engine.fire_due(Instant::now());
                    self.publish(notices);
                }
            }
        }
        if let Some(span) = self.engine.abandon() {
            debug!(span = span.id(), fires = span.fire_index(), "open span discarded");
        }
        debug!("stall timer disarmed");
    }

    fn handle(&mut self, event: PhaseEvent) {
        match event.transition {
            Transition::Enter => {
                let threshold = Duration::from_millis(self.threshold_ms.load(Ordering::Acquire));
                if let Some(span) =
                    self.engine
                        .enter(event.span, event.activity, event.at, threshold)
                {
                    self.counters.span_opened();
                    trace!(span = span.id(), activity = %span.activity(), "busy span opened");
                }
            }
            Transition::Exit => {
                let (closed, notices) = self.engine.exit(event.at);
                self.publish(notices);
                if let Some(span) = closed {
                    trace!(span = span.id(), fires = span.fire_index(), "busy span closed");
                }
            }
        }
    }

    fn publish(&self, notices: Vec<StallNotice>) {
        for mut notice in notices {
            notice.suppressed =
                self.tracker
                    .should_suppress(notice.span_id, notice.start, Instant::now());
            if notice.is_finished {
                debug!(
                    span = notice.span_id,
                    fires = notice.index,
                    duration_ms = notice.duration.as_millis() as u64,
                    suppressed = notice.suppressed,
                    "stall finished"
                );
            } else {
                if notice.index == 1 {
                    self.counters.span_stalled();
                }
                warn!(
                    span = notice.span_id,
                    index = notice.index,
                    activity = %notice.activity,
                    duration_ms = notice.duration.as_millis() as u64,
                    suppressed = notice.suppressed,
                    "primary loop stalled"
                );
            }
            self.outbox.post(notice);
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
