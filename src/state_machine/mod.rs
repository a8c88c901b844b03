//! Run, task and trigger state definitions.
//!
//! The engine drives every task through `initializing -> created -> running`
//! into one of the done statuses; runs and triggers carry their own smaller
//! state machines. Transition side effects live with the components that
//! perform them (`orchestration::flow`, `orchestration::node`).

pub mod states;

pub use states::{RunStatus, TaskStatus, TriggerStatus};
