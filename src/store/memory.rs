//! In-memory store used by tests and local development.
//!
//! Mirrors the Postgres implementation's semantics, including the
//! status-guarded trigger update.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use super::Store;
use crate::error::{EngineError, Result};
use crate::models::{
    ActuatorDefinition, Event, ExecutorKind, PipelineDefinition, PipelineRun, RunExtra, Task,
    Trigger,
};
use crate::state_machine::{RunStatus, TriggerStatus};

#[derive(Default)]
pub struct MemoryStore {
    runs: DashMap<Uuid, PipelineRun>,
    extras: DashMap<Uuid, RunExtra>,
    tasks: DashMap<Uuid, Task>,
    pipelines: DashMap<String, Vec<PipelineDefinition>>,
    triggers: Mutex<Vec<Trigger>>,
    events: DashMap<Uuid, Event>,
    actuators: Mutex<Vec<ActuatorDefinition>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Seeding helpers for embedders and tests; the apply/registration
    // surfaces that normally write these rows are external to the engine.

    pub fn put_pipeline(&self, definition: PipelineDefinition) {
        let key = format!("{}/{}", definition.namespace, definition.name);
        let mut versions = self.pipelines.entry(key).or_default();
        if definition.latest {
            for existing in versions.iter_mut() {
                existing.latest = false;
            }
        }
        versions.push(definition);
    }

    pub fn put_trigger(&self, trigger: Trigger) {
        self.triggers.lock().push(trigger);
    }

    pub fn put_event(&self, event: Event) {
        self.events.insert(event.id, event);
    }

    pub fn put_actuator(&self, definition: ActuatorDefinition) {
        self.actuators.lock().push(definition);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_run(&self, run: &PipelineRun) -> Result<()> {
        if self.runs.contains_key(&run.id) {
            return Err(EngineError::store("create_run", "duplicate run id"));
        }
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<PipelineRun>> {
        Ok(self.runs.get(&id).map(|entry| entry.clone()))
    }

    async fn list_runs_by_status(&self, statuses: &[RunStatus]) -> Result<Vec<PipelineRun>> {
        Ok(self
            .runs
            .iter()
            .filter(|entry| statuses.contains(&entry.status))
            .map(|entry| entry.clone())
            .collect())
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<()> {
        if !self.runs.contains_key(&run.id) {
            return Err(EngineError::not_found("pipeline run", run.id));
        }
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn create_run_extra(&self, extra: &RunExtra) -> Result<()> {
        self.extras.insert(extra.run_id, extra.clone());
        Ok(())
    }

    async fn get_run_extra(&self, run_id: Uuid) -> Result<Option<RunExtra>> {
        Ok(self.extras.get(&run_id).map(|entry| entry.clone()))
    }

    async fn update_run_extra(&self, extra: &RunExtra) -> Result<()> {
        if !self.extras.contains_key(&extra.run_id) {
            return Err(EngineError::not_found("run extra", extra.run_id));
        }
        self.extras.insert(extra.run_id, extra.clone());
        Ok(())
    }

    async fn create_task(&self, task: &Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(EngineError::store("create_task", "duplicate task id"));
        }
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        Ok(self.tasks.get(&id).map(|entry| entry.clone()))
    }

    async fn list_tasks(&self, run_id: Uuid) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|entry| entry.run_id == run_id)
            .map(|entry| entry.clone())
            .collect();
        tasks.sort_by_key(|task| task.created_at);
        Ok(tasks)
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        if !self.tasks.contains_key(&task.id) {
            return Err(EngineError::not_found("task", task.id));
        }
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_pipeline(
        &self,
        namespace: &str,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<PipelineDefinition>> {
        let key = format!("{namespace}/{name}");
        let Some(versions) = self.pipelines.get(&key) else {
            return Ok(None);
        };
        let found = match version {
            Some(version) => versions.iter().find(|d| d.version == version),
            None => versions.iter().find(|d| d.latest),
        };
        Ok(found.cloned())
    }

    async fn get_trigger(&self, id: Uuid) -> Result<Option<Trigger>> {
        Ok(self.triggers.lock().iter().find(|t| t.id == id).cloned())
    }

    async fn update_trigger_status(
        &self,
        id: Uuid,
        expected: TriggerStatus,
        next: TriggerStatus,
    ) -> Result<bool> {
        let mut triggers = self.triggers.lock();
        let Some(trigger) = triggers.iter_mut().find(|t| t.id == id) else {
            return Err(EngineError::not_found("trigger", id));
        };
        if trigger.status != expected {
            return Ok(false);
        }
        trigger.status = next;
        trigger.updated_at = chrono::Utc::now();
        Ok(true)
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<Event>> {
        Ok(self.events.get(&id).map(|entry| entry.clone()))
    }

    async fn list_actuators(
        &self,
        namespace: &str,
        kind: ExecutorKind,
    ) -> Result<Vec<ActuatorDefinition>> {
        Ok(self
            .actuators
            .lock()
            .iter()
            .filter(|a| a.namespace == namespace && a.kind == kind)
            .cloned()
            .collect())
    }
}
