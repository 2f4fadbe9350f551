// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the operation log engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `oplog_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `source`: local, remote
//! - `kind`: regular, emergency (compaction); state, operation (migration)
//! - `outcome`: success, failure, rejected, dropped, recovered

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record an operation appended to the log
pub fn record_operation_written(source: &str) {
    counter!(
        "oplog_operations_written_total",
        "source" => source.to_string()
    )
    .increment(1);
}

/// Record a failed append (invalid, quota, backend)
pub fn record_append_error(kind: &str) {
    counter!(
        "oplog_append_errors_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record the outcome of emergency compaction + retry after a quota error
pub fn record_quota_recovery(success: bool) {
    counter!(
        "oplog_quota_recoveries_total",
        "outcome" => if success { "success" } else { "failure" }
    )
    .increment(1);
}

/// Record a finished compaction run
pub fn record_compaction(kind: &str, deleted: usize, duration: Duration) {
    counter!(
        "oplog_compactions_total",
        "kind" => kind.to_string()
    )
    .increment(1);
    counter!(
        "oplog_compacted_entries_total",
        "kind" => kind.to_string()
    )
    .increment(deleted as u64);
    histogram!(
        "oplog_compaction_seconds",
        "kind" => kind.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a bulk tail replay
pub fn record_replay(replayed: usize, dropped: usize, duration: Duration) {
    counter!("oplog_replayed_operations_total").increment(replayed as u64);
    counter!("oplog_dropped_operations_total").increment(dropped as u64);
    histogram!("oplog_replay_seconds").record(duration.as_secs_f64());
}

/// Record a hydration run
pub fn record_hydration(outcome: &str, duration: Duration) {
    histogram!(
        "oplog_hydration_seconds",
        "outcome" => outcome.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a schema migration step
pub fn record_migration(kind: &str, outcome: &str) {
    counter!(
        "oplog_migrations_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a recovery action (legacy_import, empty, pending_ops, corrupt_ops)
pub fn record_recovery(action: &str) {
    counter!(
        "oplog_recovery_actions_total",
        "action" => action.to_string()
    )
    .increment(1);
}

/// Set the number of commands deferred during remote application
pub fn set_deferred_commands(count: usize) {
    gauge!("oplog_deferred_commands").set(count as f64);
}

/// Record a remote endpoint call
pub fn record_remote_call(call: &str, outcome: &str) {
    counter!(
        "oplog_remote_calls_total",
        "call" => call.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record remote operations applied or failed in one download
pub fn record_remote_ops_applied(applied: usize, failed: usize) {
    counter!("oplog_remote_ops_applied_total").increment(applied as u64);
    counter!("oplog_remote_ops_failed_total").increment(failed as u64);
}

/// Record conflicts detected between remote and unsynced local operations
pub fn record_conflicts(count: usize) {
    counter!("oplog_conflicts_total").increment(count as u64);
}

/// Record a circuit breaker call outcome
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "oplog_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an engine state transition
pub fn set_engine_state(state: &str) {
    counter!(
        "oplog_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}
