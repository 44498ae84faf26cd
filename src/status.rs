//! Effective status of a unit of work.
//!
//! There is no push notification between workers and producers, so a poller
//! reconstructs "done / in progress / failed / never started" from two
//! sources: live task rows, then the artifacts the handlers persisted.

use serde::{Deserialize, Serialize};

use crate::db::Db;
use crate::error::Result;
use crate::model::{TaskKind, TaskStatus};

/// Externally reported status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedStatus {
    Ready,
    Queued,
    Processing,
    Error,
    /// Nothing in flight and the expected artifacts are not there.
    Pending,
}

impl std::fmt::Display for ResolvedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResolvedStatus::Ready => "ready",
            ResolvedStatus::Queued => "queued",
            ResolvedStatus::Processing => "processing",
            ResolvedStatus::Error => "error",
            ResolvedStatus::Pending => "pending",
        };
        f.write_str(s)
    }
}

/// How many downstream artifacts exist versus how many complete the work,
/// e.g. three questions per grade level: `expected = grades * 3`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifacts {
    pub produced: u64,
    pub expected: u64,
}

impl Artifacts {
    pub fn new(produced: u64, expected: u64) -> Self {
        Self { produced, expected }
    }

    /// Zero expected artifacts is never complete: the work is not defined yet.
    pub fn is_complete(&self) -> bool {
        self.expected > 0 && self.produced >= self.expected
    }
}

/// Combine live task statuses with artifact progress.
///
/// Live tasks win over artifacts, with precedence
/// `processing > queued > error`. Terminal `ready` rows are ignored: once a
/// task succeeds, the artifacts are the truth.
pub fn resolve(live: &[TaskStatus], artifacts: Artifacts) -> ResolvedStatus {
    if live.contains(&TaskStatus::Processing) {
        ResolvedStatus::Processing
    } else if live.contains(&TaskStatus::Queued) {
        ResolvedStatus::Queued
    } else if live.contains(&TaskStatus::Error) {
        ResolvedStatus::Error
    } else if artifacts.is_complete() {
        ResolvedStatus::Ready
    } else {
        ResolvedStatus::Pending
    }
}

impl Db {
    /// Status of `kind` work across every task of an owner.
    pub async fn resolve_owner_status(
        &self,
        owner_id: &str,
        kind: TaskKind,
        artifacts: Artifacts,
    ) -> Result<ResolvedStatus> {
        let live = self.live_statuses(owner_id, None, kind).await?;
        Ok(resolve(&live, artifacts))
    }

    /// Status of `kind` work for one sub-owner.
    pub async fn resolve_subowner_status(
        &self,
        owner_id: &str,
        sub_owner_id: &str,
        kind: TaskKind,
        artifacts: Artifacts,
    ) -> Result<ResolvedStatus> {
        let live = self.live_statuses(owner_id, Some(sub_owner_id), kind).await?;
        Ok(resolve(&live, artifacts))
    }
}
