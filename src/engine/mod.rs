//! Runtime: worker pool and watchdog driving the task store.

pub mod runtime;
pub mod watchdog;
pub mod worker;

pub use runtime::QueueRuntime;
pub use watchdog::Watchdog;
pub use worker::{Execution, execute};
