//! # Persistence Contract
//!
//! Generic CRUD store consumed by the flow and the flow manager. The store is
//! the single source of truth across process restarts: in-memory state is a
//! cache rebuilt from it, never the reverse.
//!
//! The trigger state machine is the one place that needs optimistic
//! concurrency; [`Store::update_trigger_status`] only applies when the row's
//! current status matches the expected previous status. Ordinary task writes
//! are serialized through the owning flow's lock instead.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    ActuatorDefinition, Event, ExecutorKind, PipelineDefinition, PipelineRun, RunExtra, Task,
    Trigger,
};
use crate::state_machine::{RunStatus, TriggerStatus};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Generic CRUD store with transactional semantics, consumed by the engine
#[async_trait]
pub trait Store: Send + Sync {
    // Pipeline runs
    async fn create_run(&self, run: &PipelineRun) -> Result<()>;
    async fn get_run(&self, id: Uuid) -> Result<Option<PipelineRun>>;
    async fn list_runs_by_status(&self, statuses: &[RunStatus]) -> Result<Vec<PipelineRun>>;
    async fn update_run(&self, run: &PipelineRun) -> Result<()>;

    // Run extras
    async fn create_run_extra(&self, extra: &RunExtra) -> Result<()>;
    async fn get_run_extra(&self, run_id: Uuid) -> Result<Option<RunExtra>>;
    async fn update_run_extra(&self, extra: &RunExtra) -> Result<()>;

    // Tasks
    async fn create_task(&self, task: &Task) -> Result<()>;
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>>;
    async fn list_tasks(&self, run_id: Uuid) -> Result<Vec<Task>>;
    async fn update_task(&self, task: &Task) -> Result<()>;

    // Pipeline definitions
    /// Fetch by name and version; `None` version selects the `latest` flag
    async fn get_pipeline(
        &self,
        namespace: &str,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<PipelineDefinition>>;

    // Triggers and events
    async fn get_trigger(&self, id: Uuid) -> Result<Option<Trigger>>;
    /// Status-guarded update; returns false (no write) on a status mismatch
    async fn update_trigger_status(
        &self,
        id: Uuid,
        expected: TriggerStatus,
        next: TriggerStatus,
    ) -> Result<bool>;
    async fn get_event(&self, id: Uuid) -> Result<Option<Event>>;

    // Actuator definitions
    async fn list_actuators(
        &self,
        namespace: &str,
        kind: ExecutorKind,
    ) -> Result<Vec<ActuatorDefinition>>;
}
