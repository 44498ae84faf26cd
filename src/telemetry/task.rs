//! Task execution span helpers.
//!
//! Provides span creation and state-transition recording for tasks
//! flowing through the worker pool.

use tracing::Span;

use crate::model::Task;

/// Start a span for task execution.
///
/// The `task.status` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_task_span(task: &Task, worker: usize) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.id" = %task.id.0,
        "task.kind" = %task.kind_name,
        "task.owner" = %task.owner_id,
        "task.attempt" = task.attempts,
        "worker" = worker,
        "task.status" = tracing::field::Empty,
    )
}

/// Record a state transition on the span and emit an `info` event in it.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("task.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
