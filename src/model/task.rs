//! Task records, kinds, and lifecycle states.
//!
//! A task is one unit of asynchronous generation work. It is identified by
//! its conflict key (kind + owner + optional sub-owner), carries an opaque
//! payload for its handler, and moves through a small lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Default priority for new tasks. Lower is served first (1 high, 3 low).
pub const DEFAULT_PRIORITY: i32 = 2;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A task row as stored in `queue_tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// Raw kind as stored. Parsed with [`Task::kind`] at dispatch time so a
    /// row written with a kind this build does not know still loads.
    pub kind_name: String,

    /// Lower value is claimed first.
    pub priority: i32,

    pub status: TaskStatus,

    /// The logical object this task works on (e.g. a draft book).
    pub owner_id: String,

    /// Optional sub-section of the owner (e.g. a chapter).
    pub sub_owner_id: Option<String>,

    /// Handler input. The queue never interprets it.
    pub payload: serde_json::Value,

    /// Payload discriminator used by the batch uniqueness rule.
    pub discriminator: Option<String>,

    /// Number of claim cycles so far.
    pub attempts: u32,

    pub created_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub timeout_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Set only when `status` is `error`.
    pub error_message: Option<String>,
}

impl Task {
    /// Parse the stored kind.
    pub fn kind(&self) -> Result<TaskKind, Error> {
        self.kind_name.parse()
    }

    /// True while the lease is held and has not yet expired.
    pub fn lease_active(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Processing && self.timeout_at > now
    }
}

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// The closed set of work the queue knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Generate classification tags for a book.
    Tags,
    /// Generate a book description.
    Descriptions,
    /// Generate comprehension questions for one chapter and grade level.
    Questions,
    /// Screen book text for age-inappropriate content.
    SafetyCheck,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::Tags,
        TaskKind::Descriptions,
        TaskKind::Questions,
        TaskKind::SafetyCheck,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Tags => "tags",
            TaskKind::Descriptions => "descriptions",
            TaskKind::Questions => "questions",
            TaskKind::SafetyCheck => "safety_check",
        }
    }

    /// Payload field that distinguishes sibling tasks sharing a conflict key.
    pub fn discriminator_field(self) -> Option<&'static str> {
        match self {
            TaskKind::Questions | TaskKind::SafetyCheck => Some("grade_level"),
            TaskKind::Tags | TaskKind::Descriptions => None,
        }
    }

    /// Extract the discriminator value from a payload, if this kind has one.
    pub fn discriminator(self, payload: &serde_json::Value) -> Option<String> {
        let field = self.discriminator_field()?;
        match payload.get(field)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnknownKind(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker.
    Queued,
    /// Leased to a worker.
    Processing,
    /// Handler finished successfully. Terminal.
    Ready,
    /// Handler failed or the lease expired. Terminal.
    Error,
}

impl TaskStatus {
    /// Can transition from self to `to`?
    ///
    /// `Processing -> Queued` is only taken by an explicit retry policy.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Queued, Processing) | (Processing, Ready) | (Processing, Error) | (Processing, Queued)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Ready | TaskStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Ready => "ready",
            TaskStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "processing" => Ok(TaskStatus::Processing),
            "ready" => Ok(TaskStatus::Ready),
            "error" => Ok(TaskStatus::Error),
            other => Err(Error::UnknownStatus(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Counts
// ---------------------------------------------------------------------------

/// Aggregate task counts, one per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: u64,
    pub queued: u64,
    pub processing: u64,
    pub ready: u64,
    pub error: u64,
}

impl StatusCounts {
    pub(crate) fn add(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Queued => self.queued += count,
            TaskStatus::Processing => self.processing += count,
            TaskStatus::Ready => self.ready += count,
            TaskStatus::Error => self.error += count,
        }
        self.total += count;
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new tasks. The producer-side API for enqueueing work.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub(crate) kind: TaskKind,
    pub(crate) priority: i32,
    pub(crate) owner_id: String,
    pub(crate) sub_owner_id: Option<String>,
    pub(crate) payload: serde_json::Value,
}

impl NewTask {
    pub fn new(kind: TaskKind, owner_id: impl Into<String>) -> Self {
        Self {
            kind,
            priority: DEFAULT_PRIORITY,
            owner_id: owner_id.into(),
            sub_owner_id: None,
            payload: serde_json::json!({}),
        }
    }

    pub fn sub_owner(mut self, sub_owner_id: impl Into<String>) -> Self {
        self.sub_owner_id = Some(sub_owner_id.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }
}

/// Selects queued tasks for cancellation. Unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub kind: Option<TaskKind>,
    pub owner_id: Option<String>,
    pub sub_owner_id: Option<String>,
}

impl TaskFilter {
    pub fn is_empty(&self) -> bool {
        self.kind.is_none() && self.owner_id.is_none() && self.sub_owner_id.is_none()
    }
}
