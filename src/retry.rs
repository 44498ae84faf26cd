//! What happens to a task whose handler failed.
//!
//! The default is terminal failure: the task stays `error` until a producer
//! re-enqueues it. Automatic retry must be opted into.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Every handler failure is terminal.
    #[default]
    Never,
    /// Put the task back in the queue until it has been claimed
    /// `max_attempts` times.
    UpTo { max_attempts: u32 },
}

/// Disposition of a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Requeue,
    Fail,
}

impl RetryPolicy {
    /// Build from a configured attempt ceiling. `0` or `1` means no retry.
    pub fn from_max_attempts(max_attempts: u32) -> Self {
        if max_attempts <= 1 {
            RetryPolicy::Never
        } else {
            RetryPolicy::UpTo { max_attempts }
        }
    }

    /// Decide what to do after the claim numbered `attempts` failed.
    pub fn on_failure(self, attempts: u32) -> FailureAction {
        match self {
            RetryPolicy::Never => FailureAction::Fail,
            RetryPolicy::UpTo { max_attempts } if attempts < max_attempts => FailureAction::Requeue,
            RetryPolicy::UpTo { .. } => FailureAction::Fail,
        }
    }
}

impl std::fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryPolicy::Never => write!(f, "never"),
            RetryPolicy::UpTo { max_attempts } => write!(f, "up to {max_attempts} attempts"),
        }
    }
}
