//! Simulated primary loop.
//!
//! Runs a scripted sequence of busy iterations on the calling thread so the
//! detector can be watched end to end without a real UI loop. Each
//! iteration blocks for its busy duration, then idles.

use anr_monitor::{
    AnrDetector, AnrObserver, DetectorConfig, DetectorStatus, IntenseOperation, LoopActivity,
    LoopPhaseSource, PhaseSink,
};
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Skip request issued during one iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkipPlan {
    /// 1-based iteration the skip is issued in.
    pub iteration: usize,
    /// Extra timed window, if any.
    pub seconds: Option<f64>,
}

/// Script for one simulation run.
#[derive(Debug, Clone)]
pub struct Scenario {
    /// Busy time of each iteration, in order.
    pub busy: Vec<Duration>,
    /// Idle time before each iteration.
    pub idle: Duration,
    /// Skip to issue, if any.
    pub skip: Option<SkipPlan>,
    /// Wait after the last iteration for deliveries to arrive.
    pub settle: Duration,
}

impl Scenario {
    /// Iterations busy for `busy_ms` each, separated by `idle_ms`.
    pub fn new(busy_ms: &[u64], idle_ms: u64) -> Self {
        Self {
            busy: busy_ms.iter().copied().map(Duration::from_millis).collect(),
            idle: Duration::from_millis(idle_ms),
            skip: None,
            settle: Duration::from_millis(200),
        }
    }

    /// Sets the skip plan.
    #[must_use]
    pub const fn with_skip(mut self, skip: Option<SkipPlan>) -> Self {
        self.skip = skip;
        self
    }
}

/// Outcome of a run.
#[derive(Debug, Clone)]
pub struct Report {
    /// Reports delivered to the observer, in delivery order.
    pub operations: Vec<IntenseOperation>,
    /// Detector status after tear down.
    pub status: DetectorStatus,
}

/// Loop phase source driven by a [`Scenario`].
#[derive(Debug, Default)]
pub struct SimulatedLoop {
    sink: Option<PhaseSink>,
}

impl LoopPhaseSource for SimulatedLoop {
    fn subscribe(&mut self, sink: PhaseSink) {
        self.sink = Some(sink);
    }
}

impl SimulatedLoop {
    fn emit(&self, activity: LoopActivity) {
        if let Some(sink) = &self.sink {
            sink.observe(activity);
        }
    }

    /// Plays the scenario on the calling thread, which the detector must
    /// be monitoring for skips to take effect.
    pub fn play(&self, detector: &AnrDetector, scenario: &Scenario) {
        self.emit(LoopActivity::Entry);
        self.emit(LoopActivity::BeforeWaiting);

        for (i, busy) in scenario.busy.iter().enumerate() {
            let iteration = i + 1;
            thread::sleep(scenario.idle);

            self.emit(LoopActivity::AfterWaiting);
            self.emit(LoopActivity::BeforeTimers);
            self.emit(LoopActivity::BeforeSources);
            if let Some(skip) = scenario.skip.filter(|skip| skip.iteration == iteration) {
                let accepted = match skip.seconds {
                    Some(seconds) => detector.skip_current_and_for(seconds),
                    None => detector.skip_current(),
                };
                debug!(iteration, accepted, "skip issued");
            }
            thread::sleep(*busy);
            self.emit(LoopActivity::BeforeWaiting);
            debug!(iteration, busy_ms = busy.as_millis() as u64, "iteration done");
        }

        self.emit(LoopActivity::Exit);
    }
}

/// Runs `scenario` against a fresh detector built from `config`.
pub fn run(config: DetectorConfig, scenario: &Scenario) -> Result<Report> {
    let detector = AnrDetector::for_current_thread(config).context("failed to create detector")?;

    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);
    let observer: Arc<dyn AnrObserver> = Arc::new(move |op: &IntenseOperation| {
        sink.lock().unwrap_or_else(PoisonError::into_inner).push(*op);
    });
    detector.set_observer(&observer);

    let mut source = SimulatedLoop::default();
    detector.attach(&mut source);
    detector.start().context("failed to start detector")?;
    info!(
        iterations = scenario.busy.len(),
        threshold_ms = detector.threshold_ms(),
        "simulation started"
    );

    source.play(&detector, scenario);
    thread::sleep(scenario.settle);
    detector.tear_down();

    let operations = collected
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    Ok(Report {
        operations,
        status: detector.status(),
    })
}
