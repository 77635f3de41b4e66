//! Prometheus metrics for the sync scheduler and job queue
//!
//! This module provides metrics tracking for:
//! - Scheduler: ticks by outcome, tick duration, policy skips, tracked events
//! - Job queue: jobs enqueued by kind, dedup skips, claims, completions, requeues
//! - Operator API: request counts and latency
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec,
    TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for scheduler metrics
struct SchedulerMetrics {
    ticks: CounterVec,
    tick_duration: Histogram,
    policy_skips: CounterVec,
    tracked_events: Gauge,
}

/// Container for job queue metrics
struct QueueMetrics {
    enqueued: CounterVec,
    dedup_skips: CounterVec,
    claimed: Counter,
    completed: CounterVec,
    requeued: CounterVec,
}

/// Container for operator API metrics
struct ApiMetrics {
    requests: CounterVec,
    duration: HistogramVec,
}

static SCHEDULER_METRICS: OnceLock<SchedulerMetrics> = OnceLock::new();
static QUEUE_METRICS: OnceLock<QueueMetrics> = OnceLock::new();
static API_METRICS: OnceLock<ApiMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once; only the first call registers anything.
/// When registration fails the error is returned and every recording
/// function below stays a no-op.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let scheduler = SchedulerMetrics {
        ticks: register_counter_vec!(
            "racesync_scheduler_ticks_total",
            "Scheduler ticks by outcome",
            &["outcome"]
        )?,
        tick_duration: register_histogram!(
            "racesync_scheduler_tick_duration_seconds",
            "Time spent in one scheduling pass",
            vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
        )?,
        policy_skips: register_counter_vec!(
            "racesync_scheduler_policy_skips_total",
            "Events skipped because their scheduling input was invalid",
            &["reason"]
        )?,
        tracked_events: register_gauge!(
            "racesync_scheduler_tracked_events",
            "Events currently in the in-memory schedule table"
        )?,
    };

    let queue = QueueMetrics {
        enqueued: register_counter_vec!(
            "racesync_jobs_enqueued_total",
            "Jobs inserted into the queue",
            &["kind", "trigger"]
        )?,
        dedup_skips: register_counter_vec!(
            "racesync_jobs_dedup_skips_total",
            "Enqueue attempts dropped because an active job already existed",
            &["kind"]
        )?,
        claimed: register_counter!("racesync_jobs_claimed_total", "Jobs claimed by workers")?,
        completed: register_counter_vec!(
            "racesync_jobs_completed_total",
            "Jobs finished by workers",
            &["kind", "status"]
        )?,
        requeued: register_counter_vec!(
            "racesync_jobs_requeued_total",
            "Stuck jobs handled by the watchdog",
            &["action"]
        )?,
    };

    let api = ApiMetrics {
        requests: register_counter_vec!(
            "racesync_api_requests_total",
            "Operator API requests by endpoint and status",
            &["endpoint", "status"]
        )?,
        duration: register_histogram_vec!(
            "racesync_api_request_duration_seconds",
            "Operator API request duration in seconds",
            &["endpoint"],
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
        )?,
    };

    SCHEDULER_METRICS
        .set(scheduler)
        .map_err(|_| "Scheduler metrics already initialized")?;
    QUEUE_METRICS
        .set(queue)
        .map_err(|_| "Queue metrics already initialized")?;
    API_METRICS
        .set(api)
        .map_err(|_| "API metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    SCHEDULER_METRICS.get().is_some() && QUEUE_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a finished tick. `outcome` is one of `ok`, `failed`, `skipped`.
pub fn record_tick(outcome: &str, duration_secs: f64) {
    let Some(m) = SCHEDULER_METRICS.get() else {
        return;
    };

    m.ticks.with_label_values(&[outcome]).inc();
    if outcome != "skipped" {
        m.tick_duration.observe(duration_secs);
    }
}

pub fn record_policy_skip(reason: &str) {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.policy_skips.with_label_values(&[reason]).inc();
    }
}

pub fn set_tracked_events(count: usize) {
    if let Some(m) = SCHEDULER_METRICS.get() {
        m.tracked_events.set(count as f64);
    }
}

/// Record an enqueue attempt; `inserted == false` means it was deduplicated
pub fn record_enqueue(kind: &str, trigger: &str, inserted: bool) {
    let Some(m) = QUEUE_METRICS.get() else {
        return;
    };

    if inserted {
        m.enqueued.with_label_values(&[kind, trigger]).inc();
    } else {
        m.dedup_skips.with_label_values(&[kind]).inc();
    }
}

pub fn record_claim() {
    if let Some(m) = QUEUE_METRICS.get() {
        m.claimed.inc();
    }
}

pub fn record_completion(kind: &str, status: &str) {
    if let Some(m) = QUEUE_METRICS.get() {
        m.completed.with_label_values(&[kind, status]).inc();
    }
}

/// Record a watchdog sweep
pub fn record_requeue(requeued: usize, failed: usize) {
    let Some(m) = QUEUE_METRICS.get() else {
        return;
    };

    if requeued > 0 {
        m.requeued
            .with_label_values(&["requeued"])
            .inc_by(requeued as f64);
    }
    if failed > 0 {
        m.requeued
            .with_label_values(&["failed"])
            .inc_by(failed as f64);
    }
}

/// Record API request
pub fn record_api_request(endpoint: &str, status: u16, duration_secs: f64) {
    let Some(m) = API_METRICS.get() else {
        return;
    };

    let status_str = status.to_string();
    m.requests
        .with_label_values(&[endpoint, &status_str])
        .inc();
    m.duration
        .with_label_values(&[endpoint])
        .observe(duration_secs);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_metrics_initialized() {
        let _ = init_metrics();
    }

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_encode_metrics() {
        ensure_metrics_initialized();
        record_tick("ok", 0.01);
        let text = encode_metrics().unwrap();
        assert!(text.contains("racesync_scheduler_ticks_total"));
    }

    #[test]
    fn test_queue_recording() {
        ensure_metrics_initialized();
        record_enqueue("participants", "scheduled", true);
        record_enqueue("participants", "scheduled", false);
        record_claim();
        record_completion("participants", "success");
        record_requeue(2, 1);
        assert!(metrics_initialized());
    }

    #[test]
    fn test_scheduler_recording() {
        ensure_metrics_initialized();
        record_tick("skipped", 0.0);
        record_policy_skip("missing_start_time");
        set_tracked_events(12);
        record_api_request("/api/health", 200, 0.002);
    }
}
