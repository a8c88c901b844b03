//! # Data Layer
//!
//! Persisted records for the run engine. Every struct here is a plain serde
//! model; persistence goes through the [`crate::store::Store`] contract so
//! the engine stays polymorphic over the backing database.

pub mod core;

pub use core::actuator::ActuatorDefinition;
pub use core::pipeline::{
    DefinitionLookup, ExecutorKind, PipelineContent, PipelineDefinition, TaskDef, ValueDef,
    ValueKind,
};
pub use core::pipeline_run::{PipelineRun, RunExtra};
pub use core::task::{generate_callback_secret, Task, TaskExtra, TaskKey, TaskValue};
pub use core::trigger::{Event, Trigger};
