//! Prometheus metrics.
//!
//! Registered lazily into the default registry; the telemetry module serves
//! them over HTTP.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts};
use std::sync::OnceLock;

fn events_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("trellis_events_total", "Events processed, by type"),
            &["event"],
        )
        .expect("valid metric");
        prometheus::register(Box::new(counter.clone())).ok();
        counter
    })
}

fn frames_received_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new("trellis_frames_received_total", "Frames received, by opcode"),
            &["opcode"],
        )
        .expect("valid metric");
        prometheus::register(Box::new(counter.clone())).ok();
        counter
    })
}

fn frames_sent_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter =
            IntCounter::new("trellis_frames_sent_total", "Frames written to peer links")
                .expect("valid metric");
        prometheus::register(Box::new(counter.clone())).ok();
        counter
    })
}

fn frames_dropped_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounter::new(
            "trellis_frames_dropped_total",
            "Frames dropped on full queues or lost links",
        )
        .expect("valid metric");
        prometheus::register(Box::new(counter.clone())).ok();
        counter
    })
}

fn commands_committed_total() -> &'static IntCounter {
    static METRIC: OnceLock<IntCounter> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter =
            IntCounter::new("trellis_commands_committed_total", "Commands committed")
                .expect("valid metric");
        prometheus::register(Box::new(counter.clone())).ok();
        counter
    })
}

fn commit_height() -> &'static IntGauge {
    static METRIC: OnceLock<IntGauge> = OnceLock::new();
    METRIC.get_or_init(|| {
        let gauge = IntGauge::new("trellis_commit_height", "Height of the committed tip")
            .expect("valid metric");
        prometheus::register(Box::new(gauge.clone())).ok();
        gauge
    })
}

fn verifications_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new(
                "trellis_verifications_total",
                "Signature verifications, by outcome",
            ),
            &["outcome"],
        )
        .expect("valid metric");
        prometheus::register(Box::new(counter.clone())).ok();
        counter
    })
}

/// Record one processed event.
pub fn record_event(event: &'static str) {
    events_total().with_label_values(&[event]).inc();
}

/// Record an inbound frame.
pub fn record_frame_received(opcode: &'static str) {
    frames_received_total().with_label_values(&[opcode]).inc();
}

/// Record a frame written to a peer link.
pub fn record_frame_sent() {
    frames_sent_total().inc();
}

/// Record a dropped frame.
pub fn record_frame_dropped() {
    frames_dropped_total().inc();
}

/// Record a committed command and the new tip height.
pub fn record_commit(height: u64) {
    commands_committed_total().inc();
    commit_height().set(height as i64);
}

/// Record a verification outcome.
pub fn record_verification(valid: bool) {
    let outcome = if valid { "valid" } else { "invalid" };
    verifications_total().with_label_values(&[outcome]).inc();
}
