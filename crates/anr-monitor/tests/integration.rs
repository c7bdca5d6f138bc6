//! # Integration Tests
//!
//! End-to-end tests for `AnrDetector` with real timer and delivery
//! threads. The test thread plays the primary loop: it reports busy-phase
//! entry, blocks in `thread::sleep`, then reports exit.
//!
//! Timings use generous margins; assertions are on counts and ordering,
//! not on exact durations.

use anr_monitor::{
    AnrDetector, AnrObserver, DetectorConfig, IntenseOperation, LoopActivity, PhaseSink,
    SessionState,
};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
struct Delivered {
    op: IntenseOperation,
    thread: Option<String>,
}

/// Observer that forwards every report, then spends `latency` in the
/// callback.
fn recorder_with_latency(latency: Duration) -> (Arc<dyn AnrObserver>, Receiver<Delivered>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let observer: Arc<dyn AnrObserver> = Arc::new(move |op: &IntenseOperation| {
        let delivered = Delivered {
            op: *op,
            thread: thread::current().name().map(str::to_string),
        };
        let _ = tx.lock().unwrap().send(delivered);
        thread::sleep(latency);
    });
    (observer, rx)
}

fn recorder() -> (Arc<dyn AnrObserver>, Receiver<Delivered>) {
    recorder_with_latency(Duration::ZERO)
}

fn started_with(
    threshold_ms: u64,
    observer: Arc<dyn AnrObserver>,
) -> (AnrDetector, Arc<dyn AnrObserver>) {
    init_tracing();
    let config = DetectorConfig::new().with_threshold_ms(threshold_ms);
    let detector = AnrDetector::for_current_thread(config).unwrap();
    detector.set_observer(&observer);
    detector.start().unwrap();
    (detector, observer)
}

fn started(threshold_ms: u64) -> (AnrDetector, Arc<dyn AnrObserver>, Receiver<Delivered>) {
    let (observer, rx) = recorder();
    let (detector, observer) = started_with(threshold_ms, observer);
    (detector, observer, rx)
}

fn block_for(sink: &PhaseSink, busy: Duration) {
    sink.observe(LoopActivity::AfterWaiting);
    thread::sleep(busy);
    sink.observe(LoopActivity::BeforeWaiting);
}

/// Collects deliveries until none arrive for `quiet`.
fn drain(rx: &Receiver<Delivered>, quiet: Duration) -> Vec<Delivered> {
    let mut out = Vec::new();
    while let Ok(delivered) = rx.recv_timeout(quiet) {
        out.push(delivered);
    }
    out
}

fn shape(delivered: &[Delivered]) -> Vec<(u64, bool)> {
    delivered
        .iter()
        .map(|d| (d.op.index, d.op.is_finished))
        .collect()
}

// ============================================================================
// Detection
// ============================================================================

#[test]
fn test_blocked_900ms_reports_three_fires_then_finished() {
    let (detector, _observer, rx) = started(250);
    block_for(&detector.phase_sink(), Duration::from_millis(900));

    let delivered = drain(&rx, Duration::from_millis(400));
    assert_eq!(
        shape(&delivered),
        vec![(1, false), (2, false), (3, false), (3, true)]
    );

    let durations: Vec<f64> = delivered.iter().map(|d| d.op.duration).collect();
    assert!(durations[0] >= 0.25 && durations[0] < 0.5);
    assert!(durations[1] >= 0.5 && durations[1] < 0.75);
    assert!(durations[2] >= 0.75 && durations[2] < 1.0);
    assert!(durations[3] >= 0.9 && durations[3] < 1.0);
    assert!(durations.windows(2).all(|w| w[0] <= w[1]));

    let starts: Vec<f64> = delivered.iter().map(|d| d.op.start).collect();
    assert!(starts.iter().all(|s| *s == starts[0]));
    assert!(delivered
        .iter()
        .all(|d| d.op.activity == LoopActivity::AfterWaiting));
}

#[test]
fn test_callbacks_never_run_on_monitored_thread() {
    let (detector, _observer, rx) = started(150);
    block_for(&detector.phase_sink(), Duration::from_millis(400));

    let delivered = drain(&rx, Duration::from_millis(300));
    assert!(!delivered.is_empty());
    for d in &delivered {
        assert_eq!(d.thread.as_deref(), Some("anr-delivery"));
    }
}

#[test]
fn test_blocked_150ms_is_silent() {
    let (detector, _observer, rx) = started(250);
    block_for(&detector.phase_sink(), Duration::from_millis(150));

    assert!(drain(&rx, Duration::from_millis(500)).is_empty());
    let status = detector.status();
    assert_eq!(status.spans_opened, 1);
    assert_eq!(status.stalled_spans, 0);
}

#[test]
fn test_consecutive_spans_are_sequential() {
    let (detector, _observer, rx) = started(150);
    let sink = detector.phase_sink();
    block_for(&sink, Duration::from_millis(350));
    thread::sleep(Duration::from_millis(20));
    block_for(&sink, Duration::from_millis(200));

    let delivered = drain(&rx, Duration::from_millis(400));
    assert_eq!(
        shape(&delivered),
        vec![(1, false), (2, false), (2, true), (1, false), (1, true)]
    );
    assert!(delivered[3].op.start > delivered[0].op.start);
}

#[test]
fn test_slow_observer_does_not_hold_back_fires() {
    let (observer, rx) = recorder_with_latency(Duration::from_millis(400));
    let (detector, _observer) = started_with(150, observer);
    block_for(&detector.phase_sink(), Duration::from_millis(900));
    thread::sleep(Duration::from_millis(30));

    // Six fires and the finished notice are out while the observer is
    // still working through the first couple.
    let status = detector.status();
    assert_eq!(status.notices_emitted, 7);
    assert!(status.delivered <= 3);

    let delivered = drain(&rx, Duration::from_millis(1000));
    assert_eq!(
        shape(&delivered),
        vec![
            (1, false),
            (2, false),
            (3, false),
            (4, false),
            (5, false),
            (6, false),
            (6, true)
        ]
    );
    let durations: Vec<f64> = delivered.iter().map(|d| d.op.duration).collect();
    assert!(durations.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(detector.status().delivered, 7);
}

#[test]
fn test_repeated_busy_activities_extend_one_span() {
    let (detector, _observer, rx) = started(150);
    let sink = detector.phase_sink();

    sink.observe(LoopActivity::AfterWaiting);
    thread::sleep(Duration::from_millis(100));
    sink.observe(LoopActivity::BeforeTimers);
    thread::sleep(Duration::from_millis(100));
    sink.observe(LoopActivity::BeforeSources);
    thread::sleep(Duration::from_millis(150));
    sink.observe(LoopActivity::BeforeWaiting);

    let delivered = drain(&rx, Duration::from_millis(400));
    assert_eq!(shape(&delivered), vec![(1, false), (2, false), (2, true)]);
    assert_eq!(delivered[2].op.activity, LoopActivity::BeforeSources);
}

#[test]
fn test_stray_exit_is_absorbed() {
    let (detector, _observer, rx) = started(150);
    let sink = detector.phase_sink();
    sink.observe(LoopActivity::BeforeWaiting);
    sink.observe(LoopActivity::Exit);
    block_for(&sink, Duration::from_millis(200));

    assert_eq!(
        shape(&drain(&rx, Duration::from_millis(400))),
        vec![(1, false), (1, true)]
    );
}

// ============================================================================
// Suppression
// ============================================================================

#[test]
fn test_skip_current_silences_whole_span() {
    let (detector, _observer, rx) = started(150);
    let sink = detector.phase_sink();

    sink.observe(LoopActivity::AfterWaiting);
    assert!(detector.skip_current());
    thread::sleep(Duration::from_millis(500));
    sink.observe(LoopActivity::BeforeWaiting);

    assert!(drain(&rx, Duration::from_millis(400)).is_empty());
    assert!(detector.status().suppressed >= 4);

    // The next span is reported normally.
    block_for(&sink, Duration::from_millis(200));
    assert_eq!(
        shape(&drain(&rx, Duration::from_millis(400))),
        vec![(1, false), (1, true)]
    );
}

#[test]
fn test_skip_while_idle_applies_to_next_span() {
    let (detector, _observer, rx) = started(150);
    assert!(detector.skip_current());
    block_for(&detector.phase_sink(), Duration::from_millis(400));
    assert!(drain(&rx, Duration::from_millis(400)).is_empty());
}

#[test]
fn test_skip_mid_span_withholds_remaining_deliveries() {
    let (detector, _observer, rx) = started(200);
    let sink = detector.phase_sink();

    sink.observe(LoopActivity::AfterWaiting);
    thread::sleep(Duration::from_millis(300));
    detector.skip_current();
    thread::sleep(Duration::from_millis(400));
    sink.observe(LoopActivity::BeforeWaiting);

    assert_eq!(
        shape(&drain(&rx, Duration::from_millis(400))),
        vec![(1, false)]
    );
}

#[test]
fn test_timed_window_covers_spans_starting_inside_it() {
    let (detector, _observer, rx) = started(150);
    let sink = detector.phase_sink();

    let skipped_at = Instant::now();
    assert!(detector.skip_current_and_for(1.0));

    block_for(&sink, Duration::from_millis(300));
    thread::sleep(Duration::from_millis(50));
    block_for(&sink, Duration::from_millis(300));
    assert!(drain(&rx, Duration::from_millis(200)).is_empty());

    while skipped_at.elapsed() < Duration::from_millis(1100) {
        thread::sleep(Duration::from_millis(20));
    }
    block_for(&sink, Duration::from_millis(200));
    assert_eq!(
        shape(&drain(&rx, Duration::from_millis(400))),
        vec![(1, false), (1, true)]
    );
}

#[test]
fn test_timed_window_spares_span_closed_before_it() {
    let (observer, rx) = recorder_with_latency(Duration::from_millis(300));
    let (detector, _observer) = started_with(150, observer);
    let sink = detector.phase_sink();

    block_for(&sink, Duration::from_millis(350));
    thread::sleep(Duration::from_millis(20));
    // Span 1's later reports are still queued behind the slow observer.
    assert!(detector.skip_current_and_for(1.0));
    block_for(&sink, Duration::from_millis(200));

    assert_eq!(
        shape(&drain(&rx, Duration::from_millis(800))),
        vec![(1, false), (2, false), (2, true)]
    );
}

#[test]
fn test_skip_from_other_thread_has_no_effect() {
    let (detector, _observer, rx) = started(150);
    let detector = Arc::new(detector);
    let sink = detector.phase_sink();

    sink.observe(LoopActivity::AfterWaiting);
    let remote = Arc::clone(&detector);
    let accepted = thread::spawn(move || remote.skip_current() || remote.skip_current_and_for(5.0))
        .join()
        .unwrap();
    assert!(!accepted);
    thread::sleep(Duration::from_millis(200));
    sink.observe(LoopActivity::BeforeWaiting);

    assert_eq!(
        shape(&drain(&rx, Duration::from_millis(400))),
        vec![(1, false), (1, true)]
    );
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_tear_down_discards_open_span() {
    let (detector, _observer, rx) = started(150);
    let sink = detector.phase_sink();

    sink.observe(LoopActivity::AfterWaiting);
    thread::sleep(Duration::from_millis(200));
    detector.tear_down();
    thread::sleep(Duration::from_millis(300));
    sink.observe(LoopActivity::BeforeWaiting);

    let delivered = drain(&rx, Duration::from_millis(400));
    assert!(delivered.iter().all(|d| !d.op.is_finished));
    assert!(delivered.len() <= 1);
}

#[test]
fn test_tear_down_twice_matches_once() {
    let (detector, _observer, rx) = started(150);
    let sink = detector.phase_sink();
    block_for(&sink, Duration::from_millis(200));
    let before = drain(&rx, Duration::from_millis(300));
    assert_eq!(shape(&before), vec![(1, false), (1, true)]);

    detector.tear_down();
    detector.tear_down();
    assert_eq!(detector.status().state, SessionState::TornDown);

    // Signals after tear_down go nowhere.
    block_for(&sink, Duration::from_millis(400));
    assert!(drain(&rx, Duration::from_millis(300)).is_empty());
}

#[test]
fn test_tear_down_from_inside_callback() {
    init_tracing();
    let detector = Arc::new(
        AnrDetector::for_current_thread(DetectorConfig::new().with_threshold_ms(150)).unwrap(),
    );
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let weak = Arc::downgrade(&detector);
    let observer: Arc<dyn AnrObserver> = Arc::new(move |op: &IntenseOperation| {
        if let Some(detector) = weak.upgrade() {
            detector.tear_down();
        }
        let _ = tx.lock().unwrap().send(*op);
    });
    detector.set_observer(&observer);
    detector.start().unwrap();

    let sink = detector.phase_sink();
    sink.observe(LoopActivity::AfterWaiting);
    thread::sleep(Duration::from_millis(500));
    sink.observe(LoopActivity::BeforeWaiting);

    let mut seen = Vec::new();
    while let Ok(op) = rx.recv_timeout(Duration::from_millis(400)) {
        seen.push(op);
    }
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].index, 1);
    assert_eq!(detector.status().state, SessionState::TornDown);
}

#[test]
fn test_dropped_observer_silences_delivery() {
    let (detector, observer, rx) = started(150);
    drop(observer);
    block_for(&detector.phase_sink(), Duration::from_millis(200));

    assert!(drain(&rx, Duration::from_millis(300)).is_empty());
    assert!(detector.status().dropped >= 2);
}

#[test]
fn test_threshold_change_takes_effect_next_span() {
    let (detector, _observer, rx) = started(150);
    let sink = detector.phase_sink();

    sink.observe(LoopActivity::AfterWaiting);
    thread::sleep(Duration::from_millis(50));
    detector.set_threshold(400).unwrap();
    thread::sleep(Duration::from_millis(270));
    sink.observe(LoopActivity::BeforeWaiting);
    assert_eq!(
        shape(&drain(&rx, Duration::from_millis(300))),
        vec![(1, false), (2, false), (2, true)]
    );

    block_for(&sink, Duration::from_millis(300));
    assert!(drain(&rx, Duration::from_millis(300)).is_empty());
}

#[test]
fn test_rejected_threshold_keeps_previous_value() {
    let (detector, _observer, _rx) = started(250);
    assert!(detector.set_threshold(100).is_err());
    assert_eq!(detector.threshold_ms(), 250);
    assert!(detector.set_threshold(101).is_ok());
    assert_eq!(detector.status().threshold_ms, 101);
}

#[test]
fn test_status_counts_a_full_run() {
    let (detector, _observer, rx) = started(150);
    block_for(&detector.phase_sink(), Duration::from_millis(350));
    let delivered = drain(&rx, Duration::from_millis(300));

    let status = detector.status();
    assert_eq!(status.state, SessionState::Running);
    assert_eq!(status.spans_opened, 1);
    assert_eq!(status.stalled_spans, 1);
    assert_eq!(status.notices_emitted, delivered.len() as u64);
    assert_eq!(status.delivered, delivered.len() as u64);
    assert_eq!(status.suppressed, 0);
}
