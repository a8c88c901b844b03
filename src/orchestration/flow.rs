//! # Flow
//!
//! Execution context for one pipeline run. The flow owns the run's in-memory
//! task map (a read-your-writes cache over the store), the run-scoped
//! cancellation token, the lazy-stop/commit protocol and the run-level
//! timeout watchdog.
//!
//! ## Lazy stop
//!
//! Reaching a terminal status does not commit immediately. The first terminal
//! transition is captured exactly once; concurrently racing branches observe
//! "already ending" and stop cheaply. The captured stop is committed when the
//! root execution unwinds, together with any completion notifiers registered
//! by synchronous cancel callers.

use chrono::Utc;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::node::Node;
use crate::actuator::ActuatorSelector;
use crate::config::EngineConfig;
use crate::constants::{REASON_PANIC, REASON_RUN_TIMEOUT};
use crate::error::Result;
use crate::events::EventPublisher;
use crate::logging::log_run_operation;
use crate::models::{PipelineContent, PipelineRun, RunExtra, Task, TaskKey, TaskValue};
use crate::state_machine::RunStatus;
use crate::store::Store;

/// Terminal transition captured by the lazy-stop protocol
pub(crate) struct StopState {
    pub status: RunStatus,
    pub reason: String,
    /// Completion callbacks fired at commit, used by cancel-and-wait callers
    pub notifiers: Vec<oneshot::Sender<()>>,
}

/// Mutable per-run state guarded by the flow's lock
#[derive(Default)]
pub(crate) struct FlowState {
    /// Task rows keyed by `(parent_task_id, alias)` signature
    tasks: HashMap<String, Task>,
    by_id: HashMap<Uuid, String>,
    /// Traversed edge signatures, the dynamic cycle guard
    edges: HashSet<String>,
    /// Task ids currently executed by a node in this process
    active: HashSet<Uuid>,
    /// Values minted for the `randoms` placeholder namespace, stable per run
    randoms: HashMap<String, String>,
    stop: Option<StopState>,
    finished: bool,
}

/// State and collaborators shared between a flow and its nodes
pub(crate) struct FlowShared {
    pub config: EngineConfig,
    pub store: Arc<dyn Store>,
    pub selector: Arc<ActuatorSelector>,
    pub events: EventPublisher,
    pub cancel: CancellationToken,
    state: Mutex<FlowState>,
    /// Serializes lazy task creation so `(parent, alias)` stays unique
    create_lock: tokio::sync::Mutex<()>,
    run: RwLock<PipelineRun>,
    extra: RwLock<RunExtra>,
}

impl FlowShared {
    pub fn run_id(&self) -> Uuid {
        self.run.read().id
    }

    pub fn namespace(&self) -> String {
        self.run.read().namespace.clone()
    }

    pub fn run_snapshot(&self) -> PipelineRun {
        self.run.read().clone()
    }

    pub fn definition(&self) -> PipelineContent {
        self.extra.read().definition.clone()
    }

    pub fn is_stopping(&self) -> bool {
        let state = self.state.lock();
        state.stop.is_some() || state.finished
    }

    /// Capture the run's terminal transition; only the first caller wins
    pub fn lazy_stop(&self, status: RunStatus, reason: impl Into<String>) -> bool {
        let mut state = self.state.lock();
        if state.finished || state.stop.is_some() {
            return false;
        }
        let reason = reason.into();
        debug!(run_id = %self.run.read().id, status = %status, reason = %reason, "lazy stop captured");
        state.stop = Some(StopState {
            status,
            reason,
            notifiers: Vec::new(),
        });
        true
    }

    fn take_stop(&self) -> Option<StopState> {
        let mut state = self.state.lock();
        state.finished = true;
        state.stop.take()
    }

    /// Terminal outcome when no stop was captured: success unless a task
    /// landed in a failed-class status.
    fn outcome_from_tasks(&self) -> (RunStatus, Option<String>) {
        let state = self.state.lock();
        for task in state.tasks.values() {
            if task.status.is_failed() {
                return (
                    RunStatus::Failed,
                    Some(format!("task {} is {}", task.alias, task.status)),
                );
            }
        }
        (RunStatus::Success, None)
    }

    // ---- task map ----------------------------------------------------

    pub fn task_by_id(&self, id: Uuid) -> Option<Task> {
        let state = self.state.lock();
        state
            .by_id
            .get(&id)
            .and_then(|signature| state.tasks.get(signature))
            .cloned()
    }

    pub fn task_by_key(&self, key: &TaskKey) -> Option<Task> {
        self.state.lock().tasks.get(&key.signature()).cloned()
    }

    pub fn children_of(&self, parent_task_id: Uuid) -> Vec<Task> {
        self.state
            .lock()
            .tasks
            .values()
            .filter(|task| task.parent_task_id == parent_task_id)
            .cloned()
            .collect()
    }

    fn cache_task(&self, task: Task) {
        let mut state = self.state.lock();
        state.by_id.insert(task.id, task.key().signature());
        state.tasks.insert(task.key().signature(), task);
    }

    /// Load previously persisted tasks into the cache (restart recovery)
    pub fn adopt_tasks(&self, tasks: Vec<Task>) {
        for task in tasks {
            self.cache_task(task);
        }
    }

    /// Persist a task mutation, then reflect it in the cache
    pub async fn persist_task(&self, task: &mut Task) -> Result<()> {
        task.updated_at = Utc::now();
        self.store.update_task(task).await?;
        self.cache_task(task.clone());
        Ok(())
    }

    /// Fetch or lazily create the task row for `(parent, alias)`.
    ///
    /// Returns the task and whether this call created it.
    pub async fn ensure_task(&self, parent_task_id: Uuid, alias: &str) -> Result<(Task, bool)> {
        let key = TaskKey::new(parent_task_id, alias);
        if let Some(existing) = self.task_by_key(&key) {
            return Ok((existing, false));
        }
        let _guard = self.create_lock.lock().await;
        if let Some(existing) = self.task_by_key(&key) {
            return Ok((existing, false));
        }
        let task = Task::new(self.run_id(), parent_task_id, alias);
        self.store.create_task(&task).await?;
        self.cache_task(task.clone());
        Ok((task, true))
    }

    /// Claim a task for execution by this process; at most one node runs a
    /// given task per flow execution.
    pub fn claim(&self, task_id: Uuid) -> bool {
        self.state.lock().active.insert(task_id)
    }

    /// Record a traversed edge signature; false means the edge repeats
    pub fn record_edge(&self, signature: String) -> bool {
        self.state.lock().edges.insert(signature)
    }

    /// Stable random value for the `randoms` namespace, minted once per key
    pub fn random_value(&self, key: &str) -> String {
        let mut state = self.state.lock();
        state
            .randoms
            .entry(key.to_string())
            .or_insert_with(|| {
                rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(16)
                    .map(char::from)
                    .collect()
            })
            .clone()
    }

    // ---- context flow ------------------------------------------------

    /// Context visible to children of `parent_task_id`: the run-level
    /// contexts for root-level tasks, the parent task's contexts otherwise.
    pub fn context_value(&self, parent_task_id: Uuid, name: &str) -> Option<String> {
        if parent_task_id.is_nil() {
            self.extra.read().contexts.get(name).cloned()
        } else {
            self.task_by_id(parent_task_id)
                .and_then(|task| task.extra.contexts.get(name).map(|v| v.value.clone()))
        }
    }

    /// Write a context set by a child upward to its nearest enclosing parent
    pub async fn set_parent_context(
        &self,
        parent_task_id: Uuid,
        name: &str,
        value: TaskValue,
    ) -> Result<()> {
        if parent_task_id.is_nil() {
            self.persist_extra(|extra| {
                extra.contexts.insert(name.to_string(), value.value.clone());
            })
            .await
        } else {
            let Some(mut parent) = self.task_by_id(parent_task_id) else {
                return Ok(());
            };
            parent.extra.contexts.insert(name.to_string(), value);
            self.persist_task(&mut parent).await
        }
    }

    // ---- run / extra snapshots (read-your-writes) --------------------

    pub async fn persist_run<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut PipelineRun),
    {
        let mut copy = self.run.read().clone();
        mutate(&mut copy);
        copy.updated_at = Utc::now();
        self.store.update_run(&copy).await?;
        *self.run.write() = copy;
        Ok(())
    }

    pub async fn persist_extra<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut RunExtra),
    {
        let mut copy = self.extra.read().clone();
        mutate(&mut copy);
        copy.updated_at = Utc::now();
        self.store.update_run_extra(&copy).await?;
        *self.extra.write() = copy;
        Ok(())
    }
}

/// One pipeline run's execution handle
pub struct Flow {
    shared: Arc<FlowShared>,
}

impl Flow {
    pub fn new(
        run: PipelineRun,
        extra: RunExtra,
        store: Arc<dyn Store>,
        selector: Arc<ActuatorSelector>,
        events: EventPublisher,
        config: EngineConfig,
    ) -> Self {
        Self {
            shared: Arc::new(FlowShared {
                config,
                store,
                selector,
                events,
                cancel: CancellationToken::new(),
                state: Mutex::new(FlowState::default()),
                create_lock: tokio::sync::Mutex::new(()),
                run: RwLock::new(run),
                extra: RwLock::new(extra),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.run_id()
    }

    pub fn run_snapshot(&self) -> PipelineRun {
        self.shared.run_snapshot()
    }

    pub(crate) fn shared(&self) -> &Arc<FlowShared> {
        &self.shared
    }

    /// Execute the run to a terminal status.
    ///
    /// Reloads previously persisted tasks first, so a run interrupted by a
    /// process restart resumes from its last committed task statuses instead
    /// of restarting from scratch.
    pub async fn run(&self) -> Result<RunStatus> {
        let shared = &self.shared;
        let run_id = shared.run_id();
        let pipeline = shared.run.read().pipeline_name.clone();
        log_run_operation("flow_run", Some(run_id), Some(&pipeline), "starting", None);

        shared
            .persist_run(|run| {
                run.status = RunStatus::Running;
                if run.time_begin.is_none() {
                    run.time_begin = Some(Utc::now());
                }
            })
            .await?;
        shared.events.run_started(run_id);

        let persisted = shared.store.list_tasks(run_id).await?;
        if !persisted.is_empty() {
            debug!(run_id = %run_id, tasks = persisted.len(), "recovered persisted tasks");
        }
        shared.adopt_tasks(persisted);

        // Run-level watchdog: force a failure when the run outlives its ceiling.
        let watchdog_guard = CancellationToken::new();
        let guard = watchdog_guard.clone();
        let watchdog_shared = Arc::clone(shared);
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(Duration::from_secs(watchdog_shared.config.run_timeout_seconds)) => {
                    warn!(run_id = %watchdog_shared.run_id(), "run watchdog fired");
                    watchdog_shared.lazy_stop(RunStatus::Failed, REASON_RUN_TIMEOUT);
                    watchdog_shared.cancel.cancel();
                }
            }
        });

        // Execute the root node, recovering panics at the run boundary.
        match Node::root(Arc::clone(shared)).await {
            Ok(root) => {
                if AssertUnwindSafe(root.run()).catch_unwind().await.is_err() {
                    error!(run_id = %run_id, "run panicked");
                    shared.lazy_stop(RunStatus::Failed, REASON_PANIC);
                }
            }
            Err(err) => {
                shared.lazy_stop(RunStatus::Failed, err.to_string());
            }
        }
        watchdog_guard.cancel();

        self.commit_stop().await
    }

    /// Request cancellation; the returned receiver resolves once the run's
    /// terminal status has been committed.
    pub fn cancel(&self, reason: impl Into<String>) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut pending = Some(tx);
        {
            let mut state = self.shared.state.lock();
            if !state.finished {
                let tx = pending.take().expect("sender consumed once");
                match &mut state.stop {
                    Some(stop) => stop.notifiers.push(tx),
                    None => {
                        state.stop = Some(StopState {
                            status: RunStatus::Cancelled,
                            reason: reason.into(),
                            notifiers: vec![tx],
                        });
                    }
                }
            }
        }
        // Already committed: resolve the waiter immediately.
        if let Some(tx) = pending {
            let _ = tx.send(());
        }
        self.shared.cancel.cancel();
        rx
    }

    /// Invoke the captured lazy stop exactly once, when the root unwinds
    async fn commit_stop(&self) -> Result<RunStatus> {
        let (status, reason, notifiers) = match self.shared.take_stop() {
            Some(stop) => (stop.status, Some(stop.reason), stop.notifiers),
            None => {
                let (status, reason) = self.shared.outcome_from_tasks();
                (status, reason, Vec::new())
            }
        };

        self.shared
            .persist_run(|run| {
                run.status = status;
                run.reason = reason.clone();
                let end = Utc::now();
                run.time_end = Some(end);
                run.cost_ms = run.time_begin.map(|begin| (end - begin).num_milliseconds());
            })
            .await?;

        let run_id = self.shared.run_id();
        self.shared
            .events
            .run_finished(run_id, status, reason.as_deref());
        log_run_operation(
            "flow_finished",
            Some(run_id),
            None,
            &status.to_string(),
            reason.as_deref(),
        );
        for notifier in notifiers {
            let _ = notifier.send(());
        }
        Ok(status)
    }
}
