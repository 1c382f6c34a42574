//! Prometheus metrics for the relayer
//!
//! Exposed on the `/metrics` endpoint of the health server.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Gauge, GaugeVec, HistogramVec,
};

use crate::store::StatusCounts;
use crate::types::CommitStatus;

lazy_static! {
    // Scanning
    pub static ref BLOCKS_SCANNED: CounterVec = register_counter_vec!(
        "relayer_blocks_scanned_total",
        "Total number of blocks scanned",
        &["chain"]
    ).expect("metric can be registered");

    pub static ref CHECKPOINT_HEIGHT: GaugeVec = register_gauge_vec!(
        "relayer_checkpoint_height",
        "Last fully processed height",
        &["chain"]
    ).expect("metric can be registered");

    pub static ref EVENTS_EXTRACTED: CounterVec = register_counter_vec!(
        "relayer_events_extracted_total",
        "Total number of cross-chain events extracted",
        &["chain"]
    ).expect("metric can be registered");

    // Submission
    pub static ref COMMITS_SUBMITTED: CounterVec = register_counter_vec!(
        "relayer_commits_total",
        "Commit outcomes per destination chain",
        &["destination", "outcome"]
    ).expect("metric can be registered");

    pub static ref SUBMISSION_LATENCY: HistogramVec = register_histogram_vec!(
        "relayer_submission_latency_seconds",
        "Time from broadcast to confirmed destination transaction",
        &["destination"],
        vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("metric can be registered");

    pub static ref COMMIT_QUEUE: GaugeVec = register_gauge_vec!(
        "relayer_commit_queue",
        "Number of commits per status",
        &["status"]
    ).expect("metric can be registered");

    // Reconciliation
    pub static ref DEPOSITS_REINJECTED: CounterVec = register_counter_vec!(
        "relayer_deposits_reinjected_total",
        "Deposits whose events were re-derived and queued again",
        &["chain"]
    ).expect("metric can be registered");

    pub static ref DEPOSITS_PARKED: CounterVec = register_counter_vec!(
        "relayer_deposits_parked_total",
        "Deposits taken out of reconciliation",
        &["chain", "reason"]
    ).expect("metric can be registered");

    // Errors
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "relayer_errors_total",
        "Total number of errors",
        &["component", "type"]
    ).expect("metric can be registered");

    // Health
    pub static ref UP: Gauge = register_gauge!(
        "relayer_up",
        "Whether the relayer is up and running"
    ).expect("metric can be registered");
}

/// Record a scanned block and the checkpoint it produced
pub fn record_block_scanned(chain: &str, height: u64, events: usize) {
    BLOCKS_SCANNED.with_label_values(&[chain]).inc();
    CHECKPOINT_HEIGHT.with_label_values(&[chain]).set(height as f64);
    if events > 0 {
        EVENTS_EXTRACTED
            .with_label_values(&[chain])
            .inc_by(events as f64);
    }
}

/// Record the outcome of one commit attempt
pub fn record_commit(destination: &str, outcome: &str) {
    COMMITS_SUBMITTED
        .with_label_values(&[destination, outcome])
        .inc();
}

pub fn record_submission_latency(destination: &str, seconds: f64) {
    SUBMISSION_LATENCY
        .with_label_values(&[destination])
        .observe(seconds);
}

/// Update the queue gauges
pub fn set_queue(counts: &StatusCounts) {
    for status in CommitStatus::ALL {
        COMMIT_QUEUE
            .with_label_values(&[status.as_str()])
            .set(counts.get(status) as f64);
    }
}

pub fn record_reinjected(chain: &str, count: usize) {
    DEPOSITS_REINJECTED
        .with_label_values(&[chain])
        .inc_by(count as f64);
}

pub fn record_parked(chain: &str, reason: &str) {
    DEPOSITS_PARKED.with_label_values(&[chain, reason]).inc();
}

/// Record an error
pub fn record_error(component: &str, error_type: &str) {
    ERRORS.with_label_values(&[component, error_type]).inc();
}
