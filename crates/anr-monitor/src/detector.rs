//! # ANR Detector
//!
//! Lifecycle controller tying the pieces together.
//!
//! ## Architecture
//!
//! ```text
//!  primary context          timer thread                 delivery thread
//! ┌───────────────┐       ┌──────────────────┐         ┌─────────────────┐
//! │ PhaseSink     │──────▶│ EngineDriver     │────────▶│ Dispatcher      │
//! │ skip_current* │       │  └ StallEngine   │ notices │  └ AnrObserver  │
//! └───────┬───────┘       └────────┬─────────┘         └────────┬────────┘
//!         │                        │ latch                      │ re-check
//!         └──────────────▶ SuppressionTracker ◀─────────────────┘
//! ```
//!
//! The primary context only enqueues events and flips suppression state;
//! it never waits on the timer or the observer. The timer thread owns a
//! current-thread tokio runtime and the only
//! [`StallEngine`](crate::StallEngine). The delivery thread is the single
//! place observer code runs.
//!
//! ## Example
//!
//! ```rust,no_run
//! use anr_monitor::{AnrDetector, AnrObserver, DetectorConfig, IntenseOperation, LoopActivity};
//! use std::sync::Arc;
//!
//! let detector = AnrDetector::for_current_thread(DetectorConfig::default())?;
//! let observer: Arc<dyn AnrObserver> = Arc::new(|op: &IntenseOperation| {
//!     eprintln!("main loop stuck for {:.3}s (#{})", op.duration, op.index);
//! });
//! detector.set_observer(&observer);
//! detector.start()?;
//!
//! let sink = detector.phase_sink();
//! sink.observe(LoopActivity::AfterWaiting);
//! std::thread::sleep(std::time::Duration::from_millis(600));
//! sink.observe(LoopActivity::BeforeWaiting);
//!
//! detector.tear_down();
//! # Ok::<(), anr_monitor::MonitorError>(())
//! ```

use crate::clock::MonitorClock;
use crate::config::{validate_threshold, DetectorConfig};
use crate::dispatch::{AnrObserver, Dispatcher, ObserverSlot, Outbox};
use crate::engine::EngineDriver;
use crate::error::{MonitorError, Result};
use crate::phase::{LoopPhaseSource, PhaseChannel, PhaseSink};
use crate::status::{Counters, DetectorStatus, SessionState};
use crate::suppression::{ContextId, SuppressionTracker};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct Session {
    state: SessionState,
    timer: Option<JoinHandle<()>>,
    delivery: Option<JoinHandle<()>>,
}

/// Watches a primary event loop for stalls.
///
/// # Lifecycle
///
/// | Call | Idle | Running | Failed | TornDown |
/// |------|------|---------|--------|----------|
/// | `start` | → Running | no-op | → Running | no-op |
/// | `tear_down` | → TornDown | → TornDown | → TornDown | no-op |
///
/// A failed `start` leaves the detector in `Failed`. After `tear_down`
/// every method is a silent no-op.
///
/// # Thread Safety
///
/// `AnrDetector` is `Send + Sync`. Phase signals and skip calls are meant
/// for the monitored context; everything else may be called from anywhere.
#[derive(Debug)]
pub struct AnrDetector {
    config: DetectorConfig,
    clock: MonitorClock,
    threshold_ms: Arc<AtomicU64>,
    tracker: Arc<SuppressionTracker>,
    observer: Arc<ObserverSlot>,
    phases: Arc<PhaseChannel>,
    counters: Arc<Counters>,
    closed: Arc<AtomicBool>,
    session: Mutex<Session>,
}

impl AnrDetector {
    /// Creates a detector that monitors `monitored`.
    ///
    /// Nothing runs until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns the validation error if `config` is invalid.
    pub fn new(config: DetectorConfig, monitored: ContextId) -> Result<Self> {
        config.validate()?;
        let clock = MonitorClock::new();
        let tracker = Arc::new(SuppressionTracker::new(monitored));
        Ok(Self {
            threshold_ms: Arc::new(AtomicU64::new(config.threshold_ms)),
            phases: Arc::new(PhaseChannel::new(clock, Arc::clone(&tracker))),
            observer: Arc::new(ObserverSlot::default()),
            counters: Arc::new(Counters::default()),
            closed: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(Session {
                state: SessionState::Idle,
                timer: None,
                delivery: None,
            }),
            config,
            clock,
            tracker,
        })
    }

    /// Creates a detector that monitors the calling thread.
    ///
    /// # Errors
    ///
    /// Returns the validation error if `config` is invalid.
    pub fn for_current_thread(config: DetectorConfig) -> Result<Self> {
        Self::new(config, ContextId::current())
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_torn_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Starts the timer and delivery contexts.
    ///
    /// A no-op when already running or torn down. After a failure it may
    /// be called again.
    ///
    /// # Errors
    ///
    /// [`MonitorError::TimerUnavailable`] or
    /// [`MonitorError::DeliveryUnavailable`] when a context cannot be
    /// created. The detector is then in [`SessionState::Failed`].
    pub fn start(&self) -> Result<()> {
        let mut session = self.lock_session();
        match session.state {
            SessionState::Running | SessionState::TornDown => return Ok(()),
            SessionState::Idle | SessionState::Failed => {}
        }

        match self.launch() {
            Ok((timer, delivery)) => {
                session.timer = Some(timer);
                session.delivery = Some(delivery);
                session.state = SessionState::Running;
                info!(
                    threshold_ms = self.threshold_ms(),
                    "ANR detector started"
                );
                Ok(())
            }
            Err(err) => {
                session.state = SessionState::Failed;
                error!(error = %err, "ANR detector failed to start; not monitoring");
                Err(err)
            }
        }
    }

    fn launch(&self) -> Result<(JoinHandle<()>, JoinHandle<()>)> {
        let (notice_tx, notice_rx) = unbounded_channel();
        let dispatcher = Dispatcher::new(
            notice_rx,
            Arc::clone(&self.observer),
            Arc::clone(&self.tracker),
            self.clock,
            Arc::clone(&self.closed),
            Arc::clone(&self.counters),
        );
        let delivery = thread::Builder::new()
            .name(self.config.delivery_thread_name.clone())
            .spawn(move || dispatcher.run())
            .map_err(|err| MonitorError::DeliveryUnavailable {
                reason: err.to_string(),
            })?;

        // If the timer never comes up, dropping the driver drops the last
        // outbox and the delivery thread exits on its own.
        let outbox = Outbox::new(
            notice_tx,
            Arc::clone(&self.closed),
            Arc::clone(&self.counters),
        );
        let driver = EngineDriver::new(
            Arc::clone(&self.threshold_ms),
            Arc::clone(&self.tracker),
            outbox,
            Arc::clone(&self.counters),
        );
        let (event_tx, event_rx) = unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<std::result::Result<(), String>>(1);

        let timer = thread::Builder::new()
            .name(self.config.timer_thread_name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                runtime.block_on(driver.run(event_rx));
            })
            .map_err(|err| MonitorError::TimerUnavailable {
                reason: err.to_string(),
            })?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err("timer thread exited during startup".to_string()));
        if let Err(reason) = ready {
            if timer.join().is_err() {
                warn!("timer thread panicked during startup");
            }
            return Err(MonitorError::TimerUnavailable { reason });
        }

        self.phases.connect(event_tx);
        Ok((timer, delivery))
    }

    /// Permanently stops the detector.
    ///
    /// Disarms the timer and waits for the timer thread to exit, discards
    /// any open span without a finished notification, and releases the
    /// observer. A delivery already in progress may finish; nothing new is
    /// delivered once this returns. Idempotent.
    pub fn tear_down(&self) {
        let mut session = self.lock_session();
        if session.state == SessionState::TornDown {
            return;
        }
        self.closed.store(true, Ordering::Release);
        session.state = SessionState::TornDown;
        self.phases.disconnect();
        self.observer.clear();
        self.tracker.clear();
        let timer = session.timer.take();
        // Not joined: the observer may call tear_down from the delivery
        // thread itself. It exits once the timer thread drops the outbox.
        let _delivery = session.delivery.take();
        drop(session);

        if let Some(timer) = timer {
            if timer.join().is_err() {
                warn!("timer thread panicked");
            }
        }
        info!("ANR detector torn down");
    }

    /// Current threshold in milliseconds.
    #[must_use]
    pub fn threshold_ms(&self) -> u64 {
        self.threshold_ms.load(Ordering::Acquire)
    }

    /// Changes the threshold. An open span keeps the threshold it started
    /// with; the new value applies from the next span.
    ///
    /// # Errors
    ///
    /// [`MonitorError::InvalidThreshold`] for values `<= 100`; the current
    /// value is kept.
    pub fn set_threshold(&self, threshold_ms: u64) -> Result<()> {
        if self.is_torn_down() {
            return Ok(());
        }
        if let Err(err) = validate_threshold(threshold_ms) {
            debug!(threshold_ms, "threshold rejected");
            return Err(err);
        }
        let previous = self.threshold_ms.swap(threshold_ms, Ordering::AcqRel);
        debug!(previous, threshold_ms, "threshold updated");
        Ok(())
    }

    /// Registers the observer without taking ownership of it.
    ///
    /// Once the last `Arc` to the observer is dropped, deliveries are
    /// silently discarded.
    pub fn set_observer(&self, observer: &Arc<dyn AnrObserver>) {
        if self.is_torn_down() {
            return;
        }
        self.observer.set(observer);
    }

    /// Removes the observer.
    pub fn clear_observer(&self) {
        self.observer.clear();
    }

    /// Returns a sink for the loop phase source.
    #[must_use]
    pub fn phase_sink(&self) -> PhaseSink {
        PhaseSink::new(Arc::clone(&self.phases))
    }

    /// Hands a sink to `source`.
    pub fn attach<S: LoopPhaseSource + ?Sized>(&self, source: &mut S) {
        source.subscribe(self.phase_sink());
    }

    /// Suppresses the current busy span (or the next one if the loop is
    /// idle). Only effective on the monitored thread.
    pub fn skip_current(&self) -> bool {
        self.skip_current_from(ContextId::current())
    }

    /// [`skip_current`](Self::skip_current) with an explicit caller.
    pub fn skip_current_from(&self, caller: ContextId) -> bool {
        !self.is_torn_down() && self.tracker.skip_current(caller)
    }

    /// Suppresses the current span and every span starting within the
    /// next `seconds`. Only effective on the monitored thread.
    pub fn skip_current_and_for(&self, seconds: f64) -> bool {
        self.skip_current_and_for_from(ContextId::current(), seconds)
    }

    /// [`skip_current_and_for`](Self::skip_current_and_for) with an
    /// explicit caller.
    pub fn skip_current_and_for_from(&self, caller: ContextId, seconds: f64) -> bool {
        !self.is_torn_down()
            && self
                .tracker
                .skip_current_and_for(caller, seconds, self.clock.now())
    }

    /// The monitored context.
    #[must_use]
    pub fn monitored(&self) -> ContextId {
        self.tracker.monitored()
    }

    /// Clock used for timestamps and reported seconds.
    #[must_use]
    pub const fn clock(&self) -> &MonitorClock {
        &self.clock
    }

    /// Returns true while the timer context is live.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock_session().state == SessionState::Running
    }

    /// Snapshot of state and counters.
    #[must_use]
    pub fn status(&self) -> DetectorStatus {
        let state = self.lock_session().state;
        self.counters.snapshot(state, self.threshold_ms())
    }
}

impl Drop for AnrDetector {
    fn drop(&mut self) {
        self.tear_down();
    }
}
