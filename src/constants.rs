//! # System Constants
//!
//! Operational boundaries and well-known names shared across the engine.

/// Alias of the synthetic root node (re-exported from the DAG module)
pub use crate::dag::ROOT;

/// Stop reason recorded when a run panics inside the flow
pub const REASON_PANIC: &str = "panic error";

/// Stop reason recorded when the run-level watchdog fires
pub const REASON_RUN_TIMEOUT: &str = "timeout";

/// Lifecycle event names published by the engine
pub mod events {
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_FINISHED: &str = "run.finished";
    pub const TASK_TRANSITION: &str = "task.transition";
}
