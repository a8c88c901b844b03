//! Shared fixtures for the engine integration tests: a scriptable mock
//! actuator, definition builders and polling helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use conductor_core::actuator::{Actuator, ActuatorError, ActuatorFactory, ActuatorSelector, Job};
use conductor_core::config::EngineConfig;
use conductor_core::models::{
    ActuatorDefinition, ExecutorKind, PipelineContent, PipelineDefinition, PipelineRun, RunExtra,
    Task, TaskDef, ValueDef, ValueKind,
};
use conductor_core::orchestration::{Flow, FlowManager};
use conductor_core::state_machine::TaskStatus;
use conductor_core::store::{MemoryStore, Store};

pub const NS: &str = "default";

/// Scriptable in-memory actuator recording every call it receives.
///
/// Statuses are scripted per task alias (`job.name`); the last scripted
/// status repeats forever, and unscripted aliases report success.
pub struct MockActuator {
    scripts: Mutex<HashMap<String, VecDeque<TaskStatus>>>,
    errors: Mutex<HashMap<String, ActuatorError>>,
    calls: Mutex<Vec<String>>,
}

impl MockActuator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            errors: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Script the status sequence reported for one alias
    pub fn script(&self, alias: &str, statuses: &[TaskStatus]) {
        self.scripts
            .lock()
            .insert(alias.to_string(), statuses.iter().copied().collect());
    }

    /// Keep the alias in `running` until `finish` is called
    pub fn hold(&self, alias: &str) {
        self.script(alias, &[TaskStatus::Running]);
    }

    /// Replace the alias's script with a single repeating status
    pub fn finish(&self, alias: &str, status: TaskStatus) {
        self.script(alias, &[status]);
    }

    /// Make status polling fail with a backend error for one alias
    pub fn fail_status(&self, alias: &str, error: ActuatorError) {
        self.errors.lock().insert(alias.to_string(), error);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == call).count()
    }

    fn record(&self, op: &str, name: &str) {
        self.calls.lock().push(format!("{op}:{name}"));
    }
}

#[async_trait]
impl Actuator for MockActuator {
    async fn create(&self, job: &Job) -> Result<Job, ActuatorError> {
        self.record("create", &job.name);
        let mut created = job.clone();
        created.sign = Some(format!("mock-{}", job.task_id));
        Ok(created)
    }

    async fn start(&self, job: &Job) -> Result<(), ActuatorError> {
        self.record("start", &job.name);
        Ok(())
    }

    async fn status(&self, job: &Job) -> Result<TaskStatus, ActuatorError> {
        self.record("status", &job.name);
        if let Some(error) = self.errors.lock().get(&job.name) {
            return Err(error.clone());
        }
        let mut scripts = self.scripts.lock();
        let Some(script) = scripts.get_mut(&job.name) else {
            return Ok(TaskStatus::Success);
        };
        if script.len() > 1 {
            Ok(script.pop_front().unwrap_or(TaskStatus::Success))
        } else {
            Ok(script.front().copied().unwrap_or(TaskStatus::Success))
        }
    }

    async fn cancel(&self, job: &Job) -> Result<(), ActuatorError> {
        self.record("cancel", &job.name);
        Ok(())
    }

    async fn exist(&self, job: &Job) -> Result<bool, ActuatorError> {
        self.record("exist", &job.name);
        Ok(true)
    }

    async fn remove(&self, job: &Job) -> Result<(), ActuatorError> {
        self.record("remove", &job.name);
        Ok(())
    }
}

pub struct MockFactory {
    actuator: Arc<MockActuator>,
}

#[async_trait]
impl ActuatorFactory for MockFactory {
    async fn connect(
        &self,
        _definition: &ActuatorDefinition,
    ) -> Result<Arc<dyn Actuator>, ActuatorError> {
        Ok(Arc::clone(&self.actuator) as Arc<dyn Actuator>)
    }

    async fn connect_tunneled(
        &self,
        _definition: &ActuatorDefinition,
        _tunnel_id: &str,
    ) -> Result<Arc<dyn Actuator>, ActuatorError> {
        Ok(Arc::clone(&self.actuator) as Arc<dyn Actuator>)
    }
}

// ---- definition builders ---------------------------------------------

pub fn task_def(alias: &str, needs: &[&str]) -> TaskDef {
    TaskDef {
        alias: alias.to_string(),
        needs: needs.iter().map(|s| s.to_string()).collect(),
        executor: ExecutorKind::Container,
        image: "busybox:latest".to_string(),
        commands: vec!["echo hello".to_string()],
        inputs: Vec::new(),
        outputs: Vec::new(),
        contexts: Vec::new(),
        tags: Vec::new(),
        timeout_seconds: None,
    }
}

pub fn pipeline_task_def(alias: &str, needs: &[&str], image: &str) -> TaskDef {
    let mut def = task_def(alias, needs);
    def.executor = ExecutorKind::Pipeline;
    def.image = image.to_string();
    def.commands = Vec::new();
    def
}

pub fn definition(name: &str, content: PipelineContent) -> PipelineDefinition {
    PipelineDefinition {
        name: name.to_string(),
        version: "v1".to_string(),
        namespace: NS.to_string(),
        latest: true,
        content,
        created_at: chrono::Utc::now(),
    }
}

pub fn output_def(name: &str, value: Option<&str>) -> ValueDef {
    ValueDef::new(name, ValueKind::String, value.map(str::to_string))
}

// ---- harness ---------------------------------------------------------

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub actuator: Arc<MockActuator>,
    pub manager: FlowManager,
    pub config: EngineConfig,
}

pub fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let actuator = MockActuator::new();
    let config = EngineConfig::for_testing();
    store.put_actuator(ActuatorDefinition::new(
        "mock",
        ExecutorKind::Container,
        NS,
        "mock://local",
    ));
    let factory = Arc::new(MockFactory {
        actuator: Arc::clone(&actuator),
    });
    let manager = FlowManager::new(
        Arc::clone(&store) as Arc<dyn Store>,
        factory,
        config.clone(),
    );
    Harness {
        store,
        actuator,
        manager,
        config,
    }
}

impl Harness {
    /// Build a flow directly over the harness store, bypassing the manager
    pub async fn flow_for(&self, content: PipelineContent) -> (Arc<Flow>, Uuid) {
        let run = PipelineRun::new("demo", "v1", NS);
        let run_id = run.id;
        let extra = RunExtra::new(run_id, content);
        self.store.create_run(&run).await.unwrap();
        self.store.create_run_extra(&extra).await.unwrap();

        let factory = Arc::new(MockFactory {
            actuator: Arc::clone(&self.actuator),
        });
        let selector = Arc::new(ActuatorSelector::new(
            Arc::clone(&self.store) as Arc<dyn Store>,
            factory,
            &self.config,
        ));
        let flow = Arc::new(Flow::new(
            run,
            extra,
            Arc::clone(&self.store) as Arc<dyn Store>,
            selector,
            conductor_core::events::EventPublisher::default(),
            self.config.clone(),
        ));
        (flow, run_id)
    }

    pub async fn task_by_alias(&self, run_id: Uuid, alias: &str) -> Option<Task> {
        self.store
            .list_tasks(run_id)
            .await
            .unwrap()
            .into_iter()
            .find(|task| task.alias == alias)
    }

    /// Poll until the run commits a terminal status
    pub async fn wait_for_terminal(&self, run_id: Uuid, timeout_ms: u64) -> PipelineRun {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if let Some(run) = self.manager.get_run(run_id).await.unwrap() {
                if run.status.is_terminal() {
                    return run;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "run {run_id} did not reach a terminal status in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the aliased task reaches the wanted status
    pub async fn wait_for_task(
        &self,
        run_id: Uuid,
        alias: &str,
        status: TaskStatus,
        timeout_ms: u64,
    ) -> Task {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if let Some(task) = self.task_by_alias(run_id, alias).await {
                if task.status == status {
                    return task;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {alias} did not reach {status} in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
