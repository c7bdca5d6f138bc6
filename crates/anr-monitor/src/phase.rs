//! Loop phase signals.
//!
//! The primary loop reports its transitions through a [`PhaseSink`]. The
//! sink never waits on the monitor: events are pushed onto an unbounded
//! queue that the timer context drains, and are dropped while no session
//! is running.

use crate::clock::MonitorClock;
use crate::suppression::SuppressionTracker;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

/// Phase of the primary event loop.
///
/// Mirrors the activity stages of a typical run loop. The first four
/// belong to the busy phase; `BeforeWaiting` and `Exit` end it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopActivity {
    /// Loop entered.
    Entry,
    /// About to process timers.
    BeforeTimers,
    /// About to process input sources.
    BeforeSources,
    /// Woke from waiting.
    AfterWaiting,
    /// About to sleep waiting for events.
    BeforeWaiting,
    /// Loop exiting.
    Exit,
}

impl LoopActivity {
    /// Returns true if the loop is doing work in this phase.
    #[inline]
    #[must_use]
    pub const fn is_busy(self) -> bool {
        matches!(
            self,
            Self::Entry | Self::BeforeTimers | Self::BeforeSources | Self::AfterWaiting
        )
    }

    /// Short lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::BeforeTimers => "before_timers",
            Self::BeforeSources => "before_sources",
            Self::AfterWaiting => "after_waiting",
            Self::BeforeWaiting => "before_waiting",
            Self::Exit => "exit",
        }
    }
}

impl std::fmt::Display for LoopActivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Entering the busy phase.
    Enter,
    /// Leaving the busy phase.
    Exit,
}

/// One transition reported by the loop phase source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseEvent {
    /// Enter or exit.
    pub transition: Transition,
    /// Activity the loop reported.
    pub activity: LoopActivity,
    /// When the transition happened.
    pub at: Instant,
    /// Busy span this transition belongs to, as numbered by the sink.
    pub span: u64,
}

impl PhaseEvent {
    /// Busy-phase entry.
    #[must_use]
    pub const fn enter(activity: LoopActivity, at: Instant) -> Self {
        Self {
            transition: Transition::Enter,
            activity,
            at,
            span: 0,
        }
    }

    /// Busy-phase exit.
    #[must_use]
    pub const fn exit(activity: LoopActivity, at: Instant) -> Self {
        Self {
            transition: Transition::Exit,
            activity,
            at,
            span: 0,
        }
    }

    /// Maps a raw loop activity onto enter or exit of the busy phase.
    #[must_use]
    pub const fn from_activity(activity: LoopActivity, at: Instant) -> Self {
        if activity.is_busy() {
            Self::enter(activity, at)
        } else {
            Self::exit(activity, at)
        }
    }

    /// Tags the event with a span number.
    #[must_use]
    pub const fn with_span(mut self, span: u64) -> Self {
        self.span = span;
        self
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    sender: Option<UnboundedSender<PhaseEvent>>,
    open: bool,
    last_span: u64,
}

/// Queue endpoint shared by every sink of one detector.
///
/// Numbers busy spans in the order the primary context reports them and
/// keeps the suppression tracker's view of the open span in that same
/// order, so a skip issued right after an entry always targets the span
/// that entry opened.
#[derive(Debug)]
pub(crate) struct PhaseChannel {
    state: Mutex<ChannelState>,
    tracker: Arc<SuppressionTracker>,
    clock: MonitorClock,
}

impl PhaseChannel {
    pub(crate) fn new(clock: MonitorClock, tracker: Arc<SuppressionTracker>) -> Self {
        Self {
            state: Mutex::new(ChannelState::default()),
            tracker,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connects a fresh engine. Span numbering continues across sessions.
    pub(crate) fn connect(&self, sender: UnboundedSender<PhaseEvent>) {
        let mut state = self.lock();
        state.sender = Some(sender);
        state.open = false;
    }

    pub(crate) fn disconnect(&self) {
        let mut state = self.lock();
        state.sender = None;
        if state.open {
            state.open = false;
            self.tracker.span_closed(state.last_span);
        }
    }

    fn push(&self, event: PhaseEvent) -> bool {
        let mut state = self.lock();
        let Some(sender) = state.sender.as_ref() else {
            return false;
        };

        let opens = event.transition == Transition::Enter && event.activity.is_busy() && !state.open;
        let closes = event.transition == Transition::Exit && state.open;
        let span = if opens { state.last_span + 1 } else { state.last_span };

        if sender.send(event.with_span(span)).is_err() {
            return false;
        }
        if opens {
            state.open = true;
            state.last_span = span;
            self.tracker.span_opened(span);
        } else if closes {
            state.open = false;
            self.tracker.span_closed(span);
        }
        true
    }
}

/// Handle the loop phase source pushes transitions into.
///
/// Cheap to clone and safe to call from the primary context: every method
/// enqueues and returns immediately. Events are discarded while the
/// detector is not running.
///
/// # Example
///
/// ```rust
/// use anr_monitor::{AnrDetector, DetectorConfig, LoopActivity};
///
/// let detector = AnrDetector::for_current_thread(DetectorConfig::default())?;
/// let sink = detector.phase_sink();
///
/// sink.observe(LoopActivity::AfterWaiting);
/// // ... handle one unit of loop work ...
/// sink.observe(LoopActivity::BeforeWaiting);
/// # Ok::<(), anr_monitor::MonitorError>(())
/// ```
#[derive(Debug, Clone)]
pub struct PhaseSink {
    channel: Arc<PhaseChannel>,
}

impl PhaseSink {
    pub(crate) fn new(channel: Arc<PhaseChannel>) -> Self {
        Self { channel }
    }

    /// Reports busy-phase entry at `at`.
    pub fn enter(&self, activity: LoopActivity, at: Instant) -> bool {
        self.send(PhaseEvent::enter(activity, at))
    }

    /// Reports busy-phase exit at `at`.
    pub fn exit(&self, activity: LoopActivity, at: Instant) -> bool {
        self.send(PhaseEvent::exit(activity, at))
    }

    /// Reports a raw loop activity, timestamped now.
    pub fn observe(&self, activity: LoopActivity) -> bool {
        self.send(PhaseEvent::from_activity(activity, self.channel.clock.now()))
    }

    /// Pushes an event. Returns false if it was dropped because no session
    /// is running.
    pub fn send(&self, event: PhaseEvent) -> bool {
        self.channel.push(event)
    }
}

/// A producer of primary-loop phase transitions.
///
/// Implementors keep the sink and push into it whenever the primary loop
/// changes phase. Timestamps must be monotonically non-decreasing.
pub trait LoopPhaseSource {
    /// Registers the sink that receives this source's transitions.
    fn subscribe(&mut self, sink: PhaseSink);
}
