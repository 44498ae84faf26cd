//! Worker loop: claim a task, run its handler, record the outcome.
//!
//! Workers share nothing in memory. Each one polls the store on its own and
//! the claim statement alone decides who gets which task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::watch;
use tracing::{Instrument, Span, error, info, warn};

use crate::config::QueueConfig;
use crate::db::Db;
use crate::error::Error;
use crate::handler::HandlerRegistry;
use crate::model::{Task, TaskStatus};
use crate::retry::FailureAction;
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};

/// Result of running one task's handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    Succeeded { duration_ms: u64 },
    Failed { error: String, duration_ms: u64 },
}

impl Execution {
    pub fn is_success(&self) -> bool {
        matches!(self, Execution::Succeeded { .. })
    }
}

/// Dispatch a claimed task to the handler for its kind.
///
/// Never fails: an unknown kind, a handler error, and a handler panic all
/// come back as [`Execution::Failed`] with a printable cause.
pub async fn execute(registry: &HandlerRegistry, task: &Task) -> Execution {
    let start = Instant::now();

    let kind = match task.kind() {
        Ok(kind) => kind,
        Err(e) => {
            metrics::task_duration_ms().record(
                0.0,
                &[
                    KeyValue::new("kind", task.kind_name.clone()),
                    KeyValue::new("outcome", "unroutable"),
                ],
            );
            return Execution::Failed {
                error: e.to_string(),
                duration_ms: 0,
            };
        }
    };

    let Some(handler) = registry.get(kind) else {
        return Execution::Failed {
            error: Error::MissingHandler(kind).to_string(),
            duration_ms: 0,
        };
    };

    // Run on its own task so a panicking handler cannot take the worker down.
    let payload = task.payload.clone();
    let joined = tokio::spawn(
        async move { handler.handle(payload).await }.instrument(Span::current()),
    )
    .await;

    let duration_ms = start.elapsed().as_millis() as u64;
    let execution = match joined {
        Ok(Ok(())) => Execution::Succeeded { duration_ms },
        Ok(Err(e)) => Execution::Failed {
            error: format!("{e:#}"),
            duration_ms,
        },
        Err(join) if join.is_panic() => Execution::Failed {
            error: "handler panicked".to_string(),
            duration_ms,
        },
        Err(join) => Execution::Failed {
            error: format!("handler aborted: {join}"),
            duration_ms,
        },
    };

    metrics::task_duration_ms().record(
        duration_ms as f64,
        &[
            KeyValue::new("kind", kind.as_str()),
            KeyValue::new(
                "outcome",
                if execution.is_success() { "ready" } else { "error" },
            ),
        ],
    );
    execution
}

/// One worker's loop. Returns once shutdown is signalled; a task already
/// claimed is always finished first.
pub(crate) async fn run_worker(
    index: usize,
    db: Arc<Db>,
    registry: Arc<HandlerRegistry>,
    config: QueueConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(worker = index, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let task = match db.try_claim_next(config.lease).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                if wait_or_shutdown(&mut shutdown, config.poll_interval).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                // The task, if any, stays queued for the next attempt.
                warn!(worker = index, error = %e, "claim failed, backing off");
                metrics::task_claims().add(1, &[KeyValue::new("result", "error")]);
                if wait_or_shutdown(&mut shutdown, config.error_backoff).await {
                    break;
                }
                continue;
            }
        };

        let span = start_task_span(&task, index);
        record_state_transition(&span, "queued", "processing");
        process(&db, &registry, &config, &task, &span)
            .instrument(span.clone())
            .await;
    }

    info!(worker = index, "worker stopped");
}

async fn process(
    db: &Db,
    registry: &HandlerRegistry,
    config: &QueueConfig,
    task: &Task,
    span: &Span,
) {
    info!(
        id = %task.id,
        kind = %task.kind_name,
        attempt = task.attempts,
        "processing task"
    );

    match execute(registry, task).await {
        Execution::Succeeded { duration_ms } => {
            match db.complete_task(task.id, task.attempts).await {
                Ok(()) => {
                    record_state_transition(span, "processing", "ready");
                    info!(id = %task.id, duration_ms, "task ready")
                }
                Err(e) => retire_failed(task, TaskStatus::Ready, e),
            }
        }
        Execution::Failed { error, duration_ms } => {
            error!(id = %task.id, %error, duration_ms, attempt = task.attempts, "task failed");

            if config.retry.on_failure(task.attempts) == FailureAction::Requeue {
                match db.requeue_task(task.id, task.attempts).await {
                    Ok(true) => {
                        record_state_transition(span, "processing", "queued");
                        info!(id = %task.id, policy = %config.retry, "task requeued for retry");
                        return;
                    }
                    Ok(false) => {
                        info!(id = %task.id, "newer task queued for the same key, not retrying")
                    }
                    Err(e) => return retire_failed(task, TaskStatus::Queued, e),
                }
            }

            match db.fail_task(task.id, task.attempts, &error).await {
                Ok(()) => record_state_transition(span, "processing", "error"),
                Err(e) => retire_failed(task, TaskStatus::Error, e),
            }
        }
    }
}

/// The terminal write did not land. Either the lease was lost (the watchdog
/// failed the task first, or it was deleted) or the store is unreachable,
/// in which case the watchdog will fail the task once the lease expires.
fn retire_failed(task: &Task, to: TaskStatus, e: Error) {
    match e {
        Error::InvalidTransition { from, .. } => {
            warn!(id = %task.id, now = %from, to = %to, "lease lost before result was recorded")
        }
        Error::NotFound(_) => {
            warn!(id = %task.id, to = %to, "task deleted before result was recorded")
        }
        e => error!(id = %task.id, to = %to, error = %e, "failed to record task result"),
    }
}

/// Sleep for `period`. Returns true if shutdown was signalled meanwhile.
pub(crate) async fn wait_or_shutdown(
    shutdown: &mut watch::Receiver<bool>,
    period: Duration,
) -> bool {
    let changed = tokio::select! {
        _ = tokio::time::sleep(period) => return false,
        changed = shutdown.changed() => changed,
    };
    changed.is_err() || *shutdown.borrow()
}
