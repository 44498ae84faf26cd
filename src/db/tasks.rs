//! Task operations: conflict-resolving enqueue, lease-based claiming,
//! terminal transitions, the watchdog sweep, and administrative cleanup.
//!
//! Every status change is a single conditional statement (or a single
//! transaction) so a claim, a completion, and a watchdog sweep can never
//! overwrite one another.

use std::time::Duration;

use opentelemetry::KeyValue;
use sqlx::PgConnection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::task::*;
use crate::telemetry::metrics;

/// Error message written by the watchdog.
pub const TIMED_OUT_MESSAGE: &str = "timed out";

const TASK_COLUMNS: &str = "id, kind, priority, status, owner_id, sub_owner_id, payload, \
     discriminator, attempts, created_at, locked_at, started_at, timeout_at, completed_at, \
     error_message";

// Placeholder deadline for queued rows; the claim overwrites it.
const INSERT_TASK: &str = "INSERT INTO queue_tasks (id, kind, priority, status, owner_id, sub_owner_id, payload, discriminator, timeout_at)
     VALUES ($1, $2, $3, 'queued', $4, $5, $6, $7, clock_timestamp() + interval '1 day')";

impl super::Db {
    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Enqueue one task, replacing any still-queued task with the same
    /// (kind, owner, sub-owner) key.
    pub async fn enqueue(&self, new: NewTask) -> Result<TaskId> {
        let mut tx = self.pool().begin().await?;

        lock_conflict_key(&mut tx, new.kind, &new.owner_id, new.sub_owner_id.as_deref()).await?;
        let superseded =
            delete_queued_for_key(&mut tx, new.kind, &new.owner_id, new.sub_owner_id.as_deref())
                .await?;

        let id = TaskId::new();
        sqlx::query(INSERT_TASK)
            .bind(id.0)
            .bind(new.kind.as_str())
            .bind(new.priority)
            .bind(&new.owner_id)
            .bind(&new.sub_owner_id)
            .bind(&new.payload)
            .bind(new.kind.discriminator(&new.payload))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        record_enqueue(new.kind, 1, superseded, "single");
        info!(
            id = %id,
            kind = %new.kind,
            owner = %new.owner_id,
            sub_owner = new.sub_owner_id.as_deref().unwrap_or("-"),
            priority = new.priority,
            superseded,
            "task enqueued"
        );
        Ok(id)
    }

    /// Enqueue several sibling tasks for one key in one transaction.
    ///
    /// Queued tasks for the key are replaced. Payloads whose discriminator
    /// duplicates one already inserted in this batch are skipped, so the
    /// returned ids may be fewer than `payloads`.
    pub async fn enqueue_batch(
        &self,
        kind: TaskKind,
        priority: i32,
        owner_id: &str,
        sub_owner_id: Option<&str>,
        payloads: Vec<serde_json::Value>,
    ) -> Result<Vec<TaskId>> {
        let mut tx = self.pool().begin().await?;

        lock_conflict_key(&mut tx, kind, owner_id, sub_owner_id).await?;
        let superseded = delete_queued_for_key(&mut tx, kind, owner_id, sub_owner_id).await?;

        let mut ids = Vec::with_capacity(payloads.len());
        for payload in &payloads {
            let id = TaskId::new();
            let inserted: Option<(Uuid,)> =
                sqlx::query_as(&format!("{INSERT_TASK} ON CONFLICT DO NOTHING RETURNING id"))
                    .bind(id.0)
                    .bind(kind.as_str())
                    .bind(priority)
                    .bind(owner_id)
                    .bind(sub_owner_id)
                    .bind(payload)
                    .bind(kind.discriminator(payload))
                    .fetch_optional(&mut *tx)
                    .await?;

            match inserted {
                Some((uuid,)) => ids.push(TaskId(uuid)),
                None => debug!(kind = %kind, owner = owner_id, "duplicate payload skipped"),
            }
        }

        tx.commit().await?;

        let skipped = (payloads.len() - ids.len()) as u64;
        record_enqueue(kind, ids.len() as u64, superseded, "batch");
        if skipped > 0 {
            metrics::tasks_skipped().add(skipped, &[KeyValue::new("kind", kind.as_str())]);
        }
        info!(
            kind = %kind,
            owner = owner_id,
            sub_owner = sub_owner_id.unwrap_or("-"),
            priority,
            inserted = ids.len(),
            skipped,
            superseded,
            "task batch enqueued"
        );
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Claim
    // -----------------------------------------------------------------------

    /// Lease the next queued task: lowest priority first, then oldest.
    ///
    /// Rows locked by a concurrent claimer are skipped rather than waited
    /// on, so two claimers never receive the same task.
    pub async fn try_claim_next(&self, lease: Duration) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(
            "WITH next AS (
                 SELECT id FROM queue_tasks
                 WHERE status = 'queued'
                 ORDER BY priority ASC, created_at ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE queue_tasks t
             SET status = 'processing',
                 locked_at = now(),
                 started_at = now(),
                 timeout_at = now() + make_interval(secs => $1),
                 attempts = t.attempts + 1
             FROM next
             WHERE t.id = next.id
             RETURNING t.*",
        )
        .bind(lease.as_secs_f64())
        .fetch_optional(self.pool())
        .await?;

        let task = row.map(TaskRow::try_into_task).transpose()?;

        metrics::task_claims().add(
            1,
            &[KeyValue::new(
                "result",
                if task.is_some() { "claimed" } else { "empty" },
            )],
        );
        if task.is_some() {
            record_transition(TaskStatus::Queued, TaskStatus::Processing);
        }
        Ok(task)
    }

    /// Like [`try_claim_next`](Self::try_claim_next), but a store failure is
    /// logged and reported as "nothing to claim". The task stays queued.
    pub async fn claim_next(&self, lease: Duration) -> Option<Task> {
        match self.try_claim_next(lease).await {
            Ok(task) => task,
            Err(e) => {
                warn!(error = %e, "claim failed");
                metrics::task_claims().add(1, &[KeyValue::new("result", "error")]);
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    /// Mark a leased task ready. `attempt` must match the claim being
    /// finished; a task already failed by the watchdog is left alone.
    pub async fn complete_task(&self, id: TaskId, attempt: u32) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE queue_tasks
             SET status = 'ready', completed_at = now(), error_message = NULL
             WHERE id = $1 AND status = 'processing' AND attempts = $2",
        )
        .bind(id.0)
        .bind(attempt as i32)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(self.rejected(id, TaskStatus::Ready).await);
        }
        record_transition(TaskStatus::Processing, TaskStatus::Ready);
        Ok(())
    }

    /// Mark a leased task failed with the given message.
    pub async fn fail_task(&self, id: TaskId, attempt: u32, message: &str) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE queue_tasks
             SET status = 'error', completed_at = now(), error_message = $3
             WHERE id = $1 AND status = 'processing' AND attempts = $2",
        )
        .bind(id.0)
        .bind(attempt as i32)
        .bind(message)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(self.rejected(id, TaskStatus::Error).await);
        }
        record_transition(TaskStatus::Processing, TaskStatus::Error);
        Ok(())
    }

    /// Return a leased task to the queue for another attempt.
    ///
    /// Returns `false` without changing anything when the key was enqueued
    /// again while this task ran; the caller should fail the task instead.
    /// Siblings queued before the claim do not block the retry.
    pub async fn requeue_task(&self, id: TaskId, attempt: u32) -> Result<bool> {
        let mut tx = self.pool().begin().await?;

        let row: Option<LeaseRow> = sqlx::query_as(
            "SELECT status, attempts, kind, owner_id, sub_owner_id, locked_at
             FROM queue_tasks WHERE id = $1
             FOR UPDATE",
        )
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let lease = row.ok_or_else(|| Error::NotFound(format!("task {id}")))?;
        let status: TaskStatus = lease.status.parse()?;
        validate_transition(status, TaskStatus::Queued)?;
        if lease.attempts != attempt as i32 {
            // Reclaimed and claimed again since this attempt started.
            return Err(Error::InvalidTransition {
                from: status,
                to: TaskStatus::Queued,
            });
        }

        lock_key(
            &mut tx,
            &conflict_key(&lease.kind, &lease.owner_id, lease.sub_owner_id.as_deref()),
        )
        .await?;

        let (superseded,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (
                 SELECT 1 FROM queue_tasks
                 WHERE status = 'queued' AND kind = $1 AND owner_id = $2
                   AND sub_owner_id IS NOT DISTINCT FROM $3
                   AND created_at > $4
             )",
        )
        .bind(&lease.kind)
        .bind(&lease.owner_id)
        .bind(&lease.sub_owner_id)
        .bind(lease.locked_at)
        .fetch_one(&mut *tx)
        .await?;

        if superseded {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "UPDATE queue_tasks
             SET status = 'queued', locked_at = NULL, started_at = NULL,
                 timeout_at = clock_timestamp() + interval '1 day'
             WHERE id = $1",
        )
        .bind(id.0)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        record_transition(TaskStatus::Processing, TaskStatus::Queued);
        Ok(true)
    }

    /// A conditional write on a leased task matched nothing: the task is
    /// gone or no longer held by this attempt. Report what it is now.
    async fn rejected(&self, id: TaskId, to: TaskStatus) -> Error {
        match self.get_task(id).await {
            Ok(task) => match validate_transition(task.status, to) {
                Err(e) => e,
                // Processing again under a newer claim.
                Ok(()) => Error::InvalidTransition {
                    from: task.status,
                    to,
                },
            },
            Err(e) => e,
        }
    }

    /// Fail every task whose lease has expired, in one statement.
    /// Returns the id and kind of each task reclaimed.
    pub async fn sweep_expired(&self) -> Result<Vec<(TaskId, String)>> {
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            "UPDATE queue_tasks
             SET status = 'error', error_message = $1, completed_at = now()
             WHERE status = 'processing' AND timeout_at < now()
             RETURNING id, kind",
        )
        .bind(TIMED_OUT_MESSAGE)
        .fetch_all(self.pool())
        .await?;

        for (_, kind) in &rows {
            metrics::tasks_timed_out().add(1, &[KeyValue::new("kind", kind.clone())]);
            record_transition(TaskStatus::Processing, TaskStatus::Error);
        }
        Ok(rows.into_iter().map(|(id, kind)| (TaskId(id), kind)).collect())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Get a task by ID.
    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM queue_tasks WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(self.pool())
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("task {id}")))?
            .try_into_task()
    }

    /// Find tasks whose id starts with `prefix` (at most `limit`).
    pub async fn find_tasks_by_prefix(&self, prefix: &str, limit: i64) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM queue_tasks
             WHERE id::text LIKE $1 || '%'
             ORDER BY created_at DESC
             LIMIT $2"
        ))
        .bind(prefix.to_ascii_lowercase())
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    /// List tasks, newest first.
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        kind: Option<TaskKind>,
        limit: i64,
    ) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM queue_tasks
             WHERE ($1::text IS NULL OR status = $1)
             AND ($2::text IS NULL OR kind = $2)
             ORDER BY created_at DESC
             LIMIT $3"
        ))
        .bind(status.map(TaskStatus::as_str))
        .bind(kind.map(TaskKind::as_str))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(TaskRow::try_into_task).collect()
    }

    /// Statuses of the queued, processing, and failed tasks for a key.
    /// With `sub_owner_id = None` every sub-owner of the owner matches.
    ///
    /// Queued and processing rows always count. A failed row stops counting
    /// once the same sibling (sub-owner + discriminator) was enqueued again
    /// after the failure, so a recovered failure no longer reports `error`.
    pub async fn live_statuses(
        &self,
        owner_id: &str,
        sub_owner_id: Option<&str>,
        kind: TaskKind,
    ) -> Result<Vec<TaskStatus>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT t.status FROM queue_tasks t
             WHERE t.owner_id = $1
             AND ($2::text IS NULL OR t.sub_owner_id = $2)
             AND t.kind = $3
             AND (
                 t.status IN ('queued', 'processing')
                 OR (t.status = 'error' AND NOT EXISTS (
                     SELECT 1 FROM queue_tasks n
                     WHERE n.kind = t.kind AND n.owner_id = t.owner_id
                       AND n.sub_owner_id IS NOT DISTINCT FROM t.sub_owner_id
                       AND n.discriminator IS NOT DISTINCT FROM t.discriminator
                       AND n.created_at > COALESCE(t.completed_at, t.created_at)
                 ))
             )",
        )
        .bind(owner_id)
        .bind(sub_owner_id)
        .bind(kind.as_str())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(|(status,)| status.parse()).collect()
    }

    /// Task counts grouped by status.
    pub async fn counts_by_status(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM queue_tasks GROUP BY status")
                .fetch_all(self.pool())
                .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            counts.add(status.parse()?, count as u64);
        }
        Ok(counts)
    }

    // -----------------------------------------------------------------------
    // Cancellation and cleanup
    // -----------------------------------------------------------------------

    /// Cancel queued tasks matching the filter. Claimed tasks are never
    /// touched. An empty filter is rejected; use [`clear_all`](Self::clear_all).
    pub async fn delete_tasks(&self, filter: &TaskFilter) -> Result<u64> {
        if filter.is_empty() {
            return Err(Error::Other(
                "delete_tasks needs at least one of kind, owner, sub-owner".to_string(),
            ));
        }

        let deleted = sqlx::query(
            "DELETE FROM queue_tasks
             WHERE status = 'queued'
             AND ($1::text IS NULL OR kind = $1)
             AND ($2::text IS NULL OR owner_id = $2)
             AND ($3::text IS NULL OR sub_owner_id = $3)",
        )
        .bind(filter.kind.map(TaskKind::as_str))
        .bind(filter.owner_id.as_deref())
        .bind(filter.sub_owner_id.as_deref())
        .execute(self.pool())
        .await?
        .rows_affected();

        record_deleted("cancel", deleted);
        info!(
            kind = filter.kind.map(TaskKind::as_str).unwrap_or("*"),
            owner = filter.owner_id.as_deref().unwrap_or("*"),
            sub_owner = filter.sub_owner_id.as_deref().unwrap_or("*"),
            deleted,
            "queued tasks cancelled"
        );
        Ok(deleted)
    }

    /// Delete one task regardless of status. Returns whether it existed.
    pub async fn delete_task(&self, id: TaskId) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM queue_tasks WHERE id = $1")
            .bind(id.0)
            .execute(self.pool())
            .await?
            .rows_affected();
        record_deleted("delete", deleted);
        Ok(deleted > 0)
    }

    /// Remove every `ready` and `error` task.
    pub async fn clear_completed(&self) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM queue_tasks WHERE status IN ('ready', 'error')")
            .execute(self.pool())
            .await?
            .rows_affected();
        record_deleted("clear_completed", deleted);
        info!(deleted, "completed tasks cleared");
        Ok(deleted)
    }

    /// Remove every task in every status.
    pub async fn clear_all(&self) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM queue_tasks")
            .execute(self.pool())
            .await?
            .rows_affected();
        record_deleted("clear_all", deleted);
        info!(deleted, "all tasks cleared");
        Ok(deleted)
    }
}

// ---------------------------------------------------------------------------
// Transaction helpers
// ---------------------------------------------------------------------------

/// Validate a state transition, returning an error if disallowed.
fn validate_transition(from: TaskStatus, to: TaskStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}

fn conflict_key(kind: &str, owner_id: &str, sub_owner_id: Option<&str>) -> String {
    format!("{kind}\u{1f}{owner_id}\u{1f}{}", sub_owner_id.unwrap_or(""))
}

/// Serialize writers of one conflict key until the transaction ends.
async fn lock_conflict_key(
    conn: &mut PgConnection,
    kind: TaskKind,
    owner_id: &str,
    sub_owner_id: Option<&str>,
) -> Result<()> {
    lock_key(conn, &conflict_key(kind.as_str(), owner_id, sub_owner_id)).await
}

async fn lock_key(conn: &mut PgConnection, key: &str) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(key)
        .execute(conn)
        .await?;
    Ok(())
}

async fn delete_queued_for_key(
    conn: &mut PgConnection,
    kind: TaskKind,
    owner_id: &str,
    sub_owner_id: Option<&str>,
) -> Result<u64> {
    let deleted = sqlx::query(
        "DELETE FROM queue_tasks
         WHERE status = 'queued' AND kind = $1 AND owner_id = $2
           AND sub_owner_id IS NOT DISTINCT FROM $3",
    )
    .bind(kind.as_str())
    .bind(owner_id)
    .bind(sub_owner_id)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(deleted)
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

fn record_enqueue(kind: TaskKind, inserted: u64, superseded: u64, mode: &'static str) {
    metrics::tasks_enqueued().add(
        inserted,
        &[
            KeyValue::new("kind", kind.as_str()),
            KeyValue::new("mode", mode),
        ],
    );
    if superseded > 0 {
        metrics::tasks_superseded().add(superseded, &[KeyValue::new("kind", kind.as_str())]);
    }
}

fn record_transition(from: TaskStatus, to: TaskStatus) {
    metrics::task_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

fn record_deleted(operation: &'static str, deleted: u64) {
    if deleted > 0 {
        metrics::tasks_deleted().add(deleted, &[KeyValue::new("operation", operation)]);
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    kind: String,
    priority: i32,
    status: String,
    owner_id: String,
    sub_owner_id: Option<String>,
    payload: serde_json::Value,
    discriminator: Option<String>,
    attempts: i32,
    created_at: chrono::DateTime<chrono::Utc>,
    locked_at: Option<chrono::DateTime<chrono::Utc>>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    timeout_at: chrono::DateTime<chrono::Utc>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
    error_message: Option<String>,
}

/// Lock-time view of a leased task, read by [`Db::requeue_task`](super::Db::requeue_task).
#[derive(sqlx::FromRow)]
struct LeaseRow {
    status: String,
    attempts: i32,
    kind: String,
    owner_id: String,
    sub_owner_id: Option<String>,
    locked_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId(self.id),
            kind_name: self.kind,
            priority: self.priority,
            status: self.status.parse()?,
            owner_id: self.owner_id,
            sub_owner_id: self.sub_owner_id,
            payload: self.payload,
            discriminator: self.discriminator,
            attempts: self.attempts.max(0) as u32,
            created_at: self.created_at,
            locked_at: self.locked_at,
            started_at: self.started_at,
            timeout_at: self.timeout_at,
            completed_at: self.completed_at,
            error_message: self.error_message,
        })
    }
}
