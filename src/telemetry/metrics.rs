//! Metric instrument factories for genq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"genq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for genq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("genq")
}

/// Counter: tasks inserted by enqueue.
/// Labels: `kind`, `mode` ("single" | "batch").
pub fn tasks_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("genq.tasks.enqueued")
        .with_description("Number of tasks inserted by enqueue")
        .build()
}

/// Counter: queued tasks deleted because a newer enqueue replaced them.
/// Labels: `kind`.
pub fn tasks_superseded() -> Counter<u64> {
    meter()
        .u64_counter("genq.tasks.superseded")
        .with_description("Queued tasks replaced by a conflicting enqueue")
        .build()
}

/// Counter: batch payloads skipped by the uniqueness rule.
/// Labels: `kind`.
pub fn tasks_skipped() -> Counter<u64> {
    meter()
        .u64_counter("genq.tasks.skipped")
        .with_description("Batch payloads skipped as duplicates")
        .build()
}

/// Counter: claim attempts.
/// Labels: `result` ("claimed" | "empty" | "error").
pub fn task_claims() -> Counter<u64> {
    meter()
        .u64_counter("genq.tasks.claims")
        .with_description("Number of claim attempts")
        .build()
}

/// Counter: task state transitions.
/// Labels: `from`, `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("genq.tasks.state_transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Counter: leases reclaimed by the watchdog.
/// Labels: `kind`.
pub fn tasks_timed_out() -> Counter<u64> {
    meter()
        .u64_counter("genq.tasks.timed_out")
        .with_description("Tasks failed by the watchdog after lease expiry")
        .build()
}

/// Counter: tasks removed by cancellation or administrative cleanup.
/// Labels: `operation`.
pub fn tasks_deleted() -> Counter<u64> {
    meter()
        .u64_counter("genq.tasks.deleted")
        .with_description("Tasks removed by cancellation or cleanup")
        .build()
}

/// Histogram: handler execution duration in milliseconds.
/// Labels: `kind`, `outcome`.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("genq.tasks.duration_ms")
        .with_description("Handler execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
