//! Core data model.

pub mod task;

pub use task::{NewTask, StatusCounts, Task, TaskFilter, TaskId, TaskKind, TaskStatus};
