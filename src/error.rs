//! Error types for genq.

use thiserror::Error;

use crate::model::task::{TaskKind, TaskStatus};

#[derive(Debug, Error)]
pub enum Error {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("unknown task kind: {0}")]
    UnknownKind(String),

    #[error("unknown task status: {0}")]
    UnknownStatus(String),

    #[error("no handler registered for task kind {0}")]
    MissingHandler(TaskKind),

    #[error("duplicate handler for task kind {0}")]
    DuplicateHandler(TaskKind),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("telemetry setup failed: {0}")]
    Telemetry(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
