//! Integration tests for telemetry initialization and span helpers.

use chrono::Utc;
use genq::model::{Task, TaskId, TaskStatus};
use serde_json::json;

fn sample_task() -> Task {
    let now = Utc::now();
    Task {
        id: TaskId::new(),
        kind_name: "tags".to_string(),
        priority: 2,
        status: TaskStatus::Processing,
        owner_id: "B1".to_string(),
        sub_owner_id: None,
        payload: json!({}),
        discriminator: None,
        attempts: 1,
        created_at: now,
        locked_at: Some(now),
        started_at: Some(now),
        timeout_at: now,
        completed_at: None,
        error_message: None,
    }
}

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // Using try_init() in the implementation avoids panics if another
    // test already initialized a subscriber.
    let config = genq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "genq-test".to_string(),
        default_level: "debug".to_string(),
    };
    let _guard = genq::telemetry::init_telemetry(config);
}

#[test]
fn task_span_creates_and_records_transition() {
    let task = sample_task();
    let span = genq::telemetry::task::start_task_span(&task, 0);
    genq::telemetry::task::record_state_transition(&span, "queued", "processing");
    genq::telemetry::task::record_state_transition(&span, "processing", "ready");
}

#[test]
fn metric_instruments_accept_records_without_exporter() {
    use opentelemetry::KeyValue;

    genq::telemetry::metrics::tasks_enqueued()
        .add(1, &[KeyValue::new("kind", "tags"), KeyValue::new("mode", "single")]);
    genq::telemetry::metrics::task_duration_ms().record(
        12.0,
        &[KeyValue::new("kind", "tags"), KeyValue::new("outcome", "ready")],
    );
}
