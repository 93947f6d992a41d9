// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Emitted through the `metrics` facade; the embedding process installs
//! whatever exporter it wants. Covers:
//! - Source reads and reconnects
//! - Routing drops and batching
//! - Per-target apply, skip, retry and commit outcomes
//! - Checkpoint flushes and positions
//! - Initial sync progress
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `connector_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use oplog_connector::metrics;
//! use std::time::Duration;
//!
//! // In the tailer after a read
//! metrics::record_source_read(42, Duration::from_millis(3));
//!
//! // In a worker after a batch
//! metrics::record_batch_applied("search", 100, Duration::from_millis(50));
//! ```

use crate::oplog::Position;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Source
// =============================================================================

/// Record one source read.
pub fn record_source_read(events_count: usize, duration: Duration) {
    counter!("connector_source_reads_total").increment(1);
    if events_count > 0 {
        counter!("connector_events_read_total").increment(events_count as u64);
    }
    histogram!("connector_source_read_duration_seconds").record(duration.as_secs_f64());
}

/// Record a failed source call (the tailer goes to reconnecting).
pub fn record_source_error(operation: &str) {
    counter!("connector_source_errors_total", "operation" => operation.to_string()).increment(1);
}

/// Record a reconnect attempt outcome.
pub fn record_source_reconnect(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("connector_source_reconnects_total", "status" => status).increment(1);
}

/// Record a detected history gap.
pub fn record_history_gap() {
    counter!("connector_history_gaps_total").increment(1);
}

/// Replication lag in milliseconds between the newest event read and the
/// newest event the slowest target has applied.
pub fn set_replication_lag_ms(lag_ms: u64) {
    gauge!("connector_replication_lag_ms").set(lag_ms as f64);
}

/// Gauge for the tailer state.
pub fn set_tailer_state(state: &str) {
    let value = match state {
        "Starting" => 0.0,
        "CatchingUp" => 1.0,
        "Tailing" => 2.0,
        "Reconnecting" => 3.0,
        "Error" => 4.0,
        "Stopped" => 5.0,
        _ => -1.0,
    };
    gauge!("connector_tailer_state").set(value);
}

/// Gauge for the connector lifecycle state.
pub fn set_connector_state(state: &str) {
    // Encoded numerically for alerting.
    let value = match state {
        "Created" => 0.0,
        "InitialSync" => 1.0,
        "Running" => 2.0,
        "Stopping" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("connector_state").set(value);
}

// =============================================================================
// Routing and batching
// =============================================================================

/// Record an event that was not delivered (filtered, system namespace, or
/// an update projected to nothing).
pub fn record_event_dropped(reason: &str) {
    counter!("connector_events_dropped_total", "reason" => reason.to_string()).increment(1);
}

/// Record a batch handed to the targets.
pub fn record_batch_emitted(size: usize) {
    counter!("connector_batches_total").increment(1);
    histogram!("connector_batch_size").record(size as f64);
}

/// Record a large-object metadata document held back for its chunks.
pub fn record_large_object_deferred() {
    counter!("connector_large_objects_deferred_total").increment(1);
}

/// Record held events released into the stream.
pub fn record_large_object_released(count: usize) {
    counter!("connector_large_objects_released_total").increment(count as u64);
}

// =============================================================================
// Targets
// =============================================================================

/// Record a batch fully applied by a target.
pub fn record_batch_applied(target_id: &str, events: usize, duration: Duration) {
    let target = target_id.to_string();
    counter!("connector_events_applied_total", "target" => target.clone())
        .increment(events as u64);
    histogram!("connector_batch_apply_duration_seconds", "target" => target)
        .record(duration.as_secs_f64());
}

/// Record an event skipped under `continueOnError`.
pub fn record_event_skipped(target_id: &str, error_kind: &str) {
    counter!(
        "connector_events_skipped_total",
        "target" => target_id.to_string(),
        "error_kind" => error_kind.to_string()
    )
    .increment(1);
}

/// Record a retried write.
pub fn record_apply_retry(target_id: &str, error_kind: &str) {
    counter!(
        "connector_apply_retries_total",
        "target" => target_id.to_string(),
        "error_kind" => error_kind.to_string()
    )
    .increment(1);
}

/// Record a fatal apply error.
pub fn record_apply_halt(target_id: &str, error_kind: &str) {
    counter!(
        "connector_apply_halts_total",
        "target" => target_id.to_string(),
        "error_kind" => error_kind.to_string()
    )
    .increment(1);
}

/// Record an adapter commit.
pub fn record_commit(target_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("connector_commits_total", "target" => target_id.to_string(), "status" => status)
        .increment(1);
}

/// Gauge for batches waiting in a target queue.
pub fn set_queue_depth(target_id: &str, depth: usize) {
    gauge!("connector_queue_depth", "target" => target_id.to_string()).set(depth as f64);
}

// =============================================================================
// Checkpoint
// =============================================================================

/// Gauge for a target's acknowledged position (timestamp component).
pub fn set_target_position(target_id: &str, position: Position) {
    gauge!("connector_target_position_ts", "target" => target_id.to_string())
        .set(position.ts as f64);
}

/// Gauge for the persisted resume point (timestamp component).
pub fn set_resume_position(position: Position) {
    gauge!("connector_resume_position_ts").set(position.ts as f64);
}

/// Record a checkpoint file write.
pub fn record_checkpoint_flush(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("connector_checkpoint_flushes_total", "status" => status).increment(1);
}

// =============================================================================
// Initial sync
// =============================================================================

/// Record one namespace copied by the initial sync for a target.
pub fn record_initial_sync_namespace(target_id: &str, documents: usize, duration: Duration) {
    let target = target_id.to_string();
    counter!("connector_initial_sync_documents_total", "target" => target.clone())
        .increment(documents as u64);
    histogram!("connector_initial_sync_namespace_duration_seconds", "target" => target)
        .record(duration.as_secs_f64());
}

/// Record a completed initial sync.
pub fn record_initial_sync_complete(namespaces: usize, duration: Duration) {
    counter!("connector_initial_syncs_total").increment(1);
    gauge!("connector_initial_sync_namespaces").set(namespaces as f64);
    histogram!("connector_initial_sync_duration_seconds").record(duration.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    // These run without an installed recorder; they only check that the
    // calls never panic on edge-case inputs.

    #[test]
    fn test_source_metrics() {
        record_source_read(0, Duration::ZERO);
        record_source_read(500, Duration::from_millis(12));
        record_source_error("read_after");
        record_source_reconnect(true);
        record_source_reconnect(false);
        record_history_gap();
        set_replication_lag_ms(0);
    }

    #[test]
    fn test_state_gauges() {
        for state in ["Starting", "CatchingUp", "Tailing", "Reconnecting", "Error", "Stopped", "?"] {
            set_tailer_state(state);
        }
        for state in ["Created", "InitialSync", "Running", "Stopping", "Stopped", "Failed", "?"] {
            set_connector_state(state);
        }
    }

    #[test]
    fn test_target_metrics() {
        record_batch_emitted(0);
        record_batch_applied("t", 10, Duration::from_millis(5));
        record_event_skipped("t", "invalid_document");
        record_apply_retry("t", "connection");
        record_apply_halt("t", "authentication");
        record_commit("t", true);
        set_queue_depth("t", 3);
        record_event_dropped("excluded");
    }

    #[test]
    fn test_checkpoint_and_sync_metrics() {
        set_target_position("t", Position::new(12, 3));
        set_resume_position(Position::ZERO);
        record_checkpoint_flush(true);
        record_checkpoint_flush(false);
        record_large_object_deferred();
        record_large_object_released(2);
        record_initial_sync_namespace("t", 100, Duration::from_secs(1));
        record_initial_sync_complete(3, Duration::from_secs(2));
    }
}
