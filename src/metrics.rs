//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Retry combinator attempts, outcomes and timeouts
//! - Synthetic document generation (documents, attachments, bulk failures)
//! - Replication job writes and purges
//! - Convergence checks (job completion, pairwise comparison)
//! - Scenario cycles and injected node failures
//!
//! The crate only talks to the `metrics` facade. Installing an exporter is
//! up to the embedding application.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `repdyno_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use repdyno::metrics;
//! use std::time::Duration;
//!
//! metrics::record_documents_written("cdyno-0000001", 500);
//! metrics::record_convergence_wait("equality", true, Duration::from_secs(12));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Retry combinator
// =============================================================================

/// Record one attempt of a retried operation.
///
/// `outcome` is one of `matched`, `mismatch`, `error`.
pub fn record_retry_attempt(operation: &str, outcome: &str) {
    counter!(
        "repdyno_retry_attempts_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a retried operation giving up at its deadline.
pub fn record_retry_timeout(operation: &str) {
    counter!("repdyno_retry_timeouts_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Document generation
// =============================================================================

/// Record documents (revision branches) accepted by a bulk write.
pub fn record_documents_written(db: &str, count: usize) {
    counter!("repdyno_documents_written_total", "db" => db.to_string()).increment(count as u64);
}

/// Record documents rejected by a bulk write.
pub fn record_bulk_failures(db: &str, count: usize) {
    if count > 0 {
        counter!("repdyno_bulk_failures_total", "db" => db.to_string()).increment(count as u64);
    }
}

/// Record attachments uploaded.
pub fn record_attachments_written(db: &str, count: usize) {
    counter!("repdyno_attachments_written_total", "db" => db.to_string()).increment(count as u64);
}

/// Record documents deleted while cleaning a prefix range.
pub fn record_documents_cleaned(db: &str, count: usize) {
    counter!("repdyno_documents_cleaned_total", "db" => db.to_string()).increment(count as u64);
}

/// Record duration of one fill call.
pub fn record_fill_duration(db: &str, duration: Duration) {
    histogram!("repdyno_fill_duration_seconds", "db" => db.to_string())
        .record(duration.as_secs_f64());
}

// =============================================================================
// Replication jobs
// =============================================================================

/// Record job documents written (`store` is `shared` or `per_job`).
pub fn record_jobs_created(store: &str, ok: usize, failed: usize) {
    counter!("repdyno_jobs_created_total", "store" => store.to_string()).increment(ok as u64);
    if failed > 0 {
        counter!("repdyno_jobs_failed_total", "store" => store.to_string()).increment(failed as u64);
    }
}

/// Record job documents or per-job databases purged.
pub fn record_jobs_purged(kind: &str, count: usize) {
    counter!("repdyno_jobs_purged_total", "kind" => kind.to_string()).increment(count as u64);
}

/// Record the number of jobs not yet in the `completed` state.
pub fn set_incomplete_jobs(count: usize) {
    gauge!("repdyno_incomplete_jobs").set(count as f64);
}

// =============================================================================
// Convergence
// =============================================================================

/// Record the outcome of one pairwise comparison.
///
/// `phase` is where the verdict was reached: `count`, `ids`, `content`.
pub fn record_comparison(phase: &str, equal: bool) {
    let result = if equal { "equal" } else { "different" };
    counter!(
        "repdyno_comparisons_total",
        "phase" => phase.to_string(),
        "result" => result
    )
    .increment(1);
}

/// Record how long a convergence wait took (`check` is `equality` or `jobs`).
pub fn record_convergence_wait(check: &str, converged: bool, duration: Duration) {
    let status = if converged { "converged" } else { "timeout" };
    histogram!(
        "repdyno_convergence_wait_seconds",
        "check" => check.to_string(),
        "status" => status
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Scenarios
// =============================================================================

/// Record a completed scenario cycle.
pub fn record_cycle(pattern: &str, duration: Duration) {
    counter!("repdyno_cycles_total", "pattern" => pattern.to_string()).increment(1);
    histogram!("repdyno_cycle_duration_seconds", "pattern" => pattern.to_string())
        .record(duration.as_secs_f64());
}

/// Record a node killed by the failure hook.
pub fn record_node_kill(node: u32) {
    counter!("repdyno_node_kills_total", "node" => node.to_string()).increment(1);
}
