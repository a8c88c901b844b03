//! # Node: task state machine
//!
//! The in-memory execution wrapper for one task instance. A node drives its
//! task through `initializing -> created -> running` against the selected
//! actuator, persisting every step before falling through to the next, then
//! fans out to the DAG successors whose needs are all done. Tasks typed as
//! sub-pipelines take a recursive path instead of talking to an actuator.
//!
//! A task already in a done status short-circuits dispatch as a no-op; this
//! is what makes restart recovery idempotent.

use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use super::flow::FlowShared;
use super::{fanout, job_builder};
use crate::actuator::{Actuator, ActuatorError, Job};
use crate::dag::{Dag, DagNode, ROOT};
use crate::error::{EngineError, Result};
use crate::logging::{log_error, log_task_operation};
use crate::models::{ExecutorKind, PipelineContent, Task, TaskDef, TaskKey, TaskValue};
use crate::placeholder::{Namespace, PlaceholderError, Resolver};
use crate::state_machine::{RunStatus, TaskStatus};

pub(crate) struct Node {
    shared: Arc<FlowShared>,
    /// Graph of the pipeline scope this node belongs to
    dag: Arc<Dag>,
    /// Content of that scope: task definitions, declared values, tags
    scope: Arc<PipelineContent>,
    /// Scope parent: nil for top-level tasks, the owning pipeline-task's id
    /// inside a sub-pipeline
    parent_task_id: Uuid,
    def: TaskDef,
    task_id: Uuid,
}

impl Node {
    /// Build the synthetic root node for a flow, creating its task row
    pub(crate) async fn root(shared: Arc<FlowShared>) -> Result<Arc<Self>> {
        let content = shared.definition();
        let dag = content.build_dag()?;
        dag.check()?;
        let (task, _) = shared.ensure_task(Uuid::nil(), ROOT).await?;
        Ok(Arc::new(Self {
            shared,
            dag: Arc::new(dag),
            scope: Arc::new(content),
            parent_task_id: Uuid::nil(),
            def: synthetic_root_def(),
            task_id: task.id,
        }))
    }

    /// Execute this node and, on success, its eligible successors.
    ///
    /// Errors never escape: a dispatch failure is persisted on the task and
    /// converted into a lazy stop of the owning run.
    pub(crate) fn run(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if let Err(err) = Arc::clone(&self).run_inner().await {
                self.fail_with(err).await;
            }
        })
    }

    async fn run_inner(self: Arc<Self>) -> Result<()> {
        // A run that already reached a terminal decision stops new work here.
        if self.shared.is_stopping() {
            return Ok(());
        }

        let task = self.current_task()?;
        if task.status.is_failed() {
            self.shared.lazy_stop(
                RunStatus::Failed,
                format!("task {} is {}", task.alias, task.status),
            );
            return Ok(());
        }

        // At most one node executes a given task per flow execution.
        if !self.shared.claim(self.task_id) {
            return Ok(());
        }

        if self.def.alias == ROOT {
            self.exec_root().await?;
        } else if self.def.executor == ExecutorKind::Pipeline {
            self.exec_pipeline().await?;
        } else {
            self.exec().await?;
        }

        let task = self.current_task()?;
        if task.status == TaskStatus::Success {
            if self.def.alias != ROOT {
                self.set_context(&task).await?;
            }
            self.fan_out_from(
                &self.def.alias,
                self.parent_task_id,
                Arc::clone(&self.dag),
                Arc::clone(&self.scope),
            )
            .await?;
        } else if task.status.is_failed() {
            self.shared.lazy_stop(
                RunStatus::Failed,
                format!("task {} is {}", task.alias, task.status),
            );
        }
        Ok(())
    }

    /// The synthetic root has no actuator work; it just anchors fan-out.
    async fn exec_root(&self) -> Result<()> {
        let mut task = self.current_task()?;
        if task.status.is_done() {
            return Ok(());
        }
        task.time_begin = Some(Utc::now());
        self.transition(&mut task, TaskStatus::Success).await
    }

    /// Dispatch one ordinary task through the actuator life-cycle.
    ///
    /// Each arm persists its transition before falling through to the next,
    /// so a restart resumes exactly where the previous process stopped.
    async fn exec(&self) -> Result<()> {
        let mut task = self.current_task()?;
        if task.status.is_done() {
            return Ok(());
        }

        let namespace = self.shared.namespace();
        let selection = self
            .shared
            .selector
            .select(&task, &self.def, &self.scope.tags, &namespace)
            .await?;
        if task.extra.actuator_tag.is_none() {
            task.extra.actuator_tag = selection.tag.clone();
        }
        let client = self.shared.selector.client_for(&selection.definition).await?;

        if task.status == TaskStatus::Initializing {
            self.resolve_inputs(&mut task)?;
        }
        let resolver = self.base_resolver(plain_values(&task.extra.inputs));
        let mut job = job_builder::build_job(&self.shared.config, &task, &self.def, &resolver)?;

        loop {
            match task.status {
                TaskStatus::Initializing => {
                    let created = client.create(&job).await?;
                    job.sign = created.sign;
                    task.sign = job.sign.clone();
                    self.transition(&mut task, TaskStatus::Created).await?;
                }
                TaskStatus::Created => {
                    client.start(&job).await?;
                    task.time_begin = Some(Utc::now());
                    self.transition(&mut task, TaskStatus::Running).await?;
                }
                TaskStatus::Running => {
                    self.poll(client.as_ref(), &job, &mut task).await?;
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// Poll the actuator until the task is done, times out, or the run's
    /// cancellation scope fires. Backoff starts at the configured initial
    /// interval and grows by a fixed step up to a ceiling.
    async fn poll(&self, client: &dyn Actuator, job: &Job, task: &mut Task) -> Result<()> {
        let config = &self.shared.config;
        let timeout = Duration::from_secs(job.timeout_seconds);
        let begin = task.time_begin.unwrap_or_else(Utc::now);
        let step = Duration::from_millis(config.poll_interval_step_ms);
        let ceiling = Duration::from_millis(config.poll_max_interval_ms);
        let mut interval = Duration::from_millis(config.poll_initial_interval_ms);

        loop {
            if self.shared.cancel.is_cancelled() {
                self.transition(task, TaskStatus::Cancel).await?;
                // The cancel call itself must not be aborted by the
                // cancelled scope; it is awaited on its own.
                if let Err(err) = client.cancel(job).await {
                    warn!(task = %task.alias, error = %err, "actuator cancel failed");
                }
                return Ok(());
            }

            let elapsed = Utc::now()
                .signed_duration_since(begin)
                .to_std()
                .unwrap_or_default();
            if elapsed >= timeout {
                self.transition(task, TaskStatus::Timeout).await?;
                if let Err(err) = client.cancel(job).await {
                    warn!(task = %task.alias, error = %err, "actuator cancel failed");
                }
                return Ok(());
            }

            match client.status(job).await {
                Ok(status) if status.is_done() => {
                    self.transition(task, status).await?;
                    return Ok(());
                }
                Ok(_) => {}
                Err(ActuatorError::JobNotFound { sign }) => {
                    return Err(EngineError::Actuator(ActuatorError::JobNotFound { sign }));
                }
                Err(err) => return Err(err.into()),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.shared.cancel.cancelled() => {}
            }
            interval = std::cmp::min(interval + step, ceiling);
        }
    }

    /// Recursive dispatch for a task typed as a sub-pipeline: instantiate the
    /// referenced definition as a nested DAG scoped under this task's id.
    async fn exec_pipeline(&self) -> Result<()> {
        let mut task = self.current_task()?;
        if task.status.is_done() {
            return Ok(());
        }

        let (name, version) = split_image(&self.def.image);
        let namespace = self.shared.namespace();
        let definition = self
            .shared
            .store
            .get_pipeline(&namespace, name, version)
            .await?
            .ok_or_else(|| EngineError::not_found("pipeline definition", &self.def.image))?;

        if task.status == TaskStatus::Initializing {
            self.resolve_inputs(&mut task)?;
        }
        if task.status != TaskStatus::Running {
            task.time_begin = Some(Utc::now());
            self.transition(&mut task, TaskStatus::Running).await?;
        }

        // The sub-pipeline's inputs are fed from this task's resolved inputs.
        let mut content = definition.content;
        for input in &mut content.inputs {
            if let Some(resolved) = task.extra.inputs.get(&input.name) {
                input.value = Some(resolved.value.clone());
            }
        }
        let dag = content.build_dag()?;
        dag.check()?;
        let dag = Arc::new(dag);
        let scope = Arc::new(content);

        self.fan_out_from(ROOT, task.id, Arc::clone(&dag), Arc::clone(&scope))
            .await?;

        // Roll up child statuses: success only if every descendant task ran
        // and succeeded; cancel when the owning run was cancelled.
        let children = self.shared.children_of(task.id);
        let status = if self.shared.cancel.is_cancelled() {
            TaskStatus::Cancel
        } else if children.len() == scope.tasks.len()
            && children.iter().all(|c| c.status == TaskStatus::Success)
        {
            TaskStatus::Success
        } else {
            TaskStatus::Failed
        };

        let mut task = self.current_task()?;
        if status == TaskStatus::Success {
            self.resolve_pipeline_outputs(&mut task, &scope)?;
        }
        self.transition(&mut task, status).await
    }

    /// Fan out to successors of `from_alias` whose needs are all done.
    ///
    /// Dependency failure does not block a sibling from running; only an
    /// explicit lazy stop halts the run. Successor tasks are created lazily,
    /// guarded by the traversed-edge cycle check, and executed concurrently
    /// up to the configured ceiling.
    async fn fan_out_from(
        &self,
        from_alias: &str,
        parent_task_id: Uuid,
        dag: Arc<Dag>,
        scope: Arc<PipelineContent>,
    ) -> Result<()> {
        let mut ready = Vec::new();
        for successor in dag.next_nodes(from_alias) {
            if !self.needs_done(successor, parent_task_id) {
                continue;
            }
            let key = TaskKey::new(parent_task_id, &successor.alias);
            if self.shared.task_by_key(&key).is_none() {
                let signature = format!(
                    "{}:{}->{}:{}",
                    self.parent_task_id, from_alias, parent_task_id, successor.alias
                );
                if !self.shared.record_edge(signature.clone()) {
                    return Err(EngineError::validation(format!(
                        "dynamic cycle detected on edge {signature}"
                    )));
                }
            }
            let (task, _created) = self.shared.ensure_task(parent_task_id, &successor.alias).await?;
            let def = scope
                .task(&successor.alias)
                .ok_or_else(|| {
                    EngineError::validation(format!(
                        "task {} missing from definition",
                        successor.alias
                    ))
                })?
                .clone();
            ready.push(Arc::new(Self {
                shared: Arc::clone(&self.shared),
                dag: Arc::clone(&dag),
                scope: Arc::clone(&scope),
                parent_task_id,
                def,
                task_id: task.id,
            }));
        }

        if ready.is_empty() {
            return Ok(());
        }
        let limit = self.shared.config.max_concurrent_branches;
        fanout::bounded(limit, ready.into_iter().map(Node::run).collect()).await;
        Ok(())
    }

    /// A successor is eligible once every declared need is in a done status.
    /// The synthetic root counts as done for the scope being executed.
    fn needs_done(&self, successor: &DagNode, parent_task_id: Uuid) -> bool {
        successor.needs.iter().all(|need| {
            if need == ROOT {
                return true;
            }
            self.shared
                .task_by_key(&TaskKey::new(parent_task_id, need))
                .map(|task| task.status.is_done())
                .unwrap_or(false)
        })
    }

    /// Resolve this task's declared inputs against its scope and seed the
    /// declared output slots callbacks merge into.
    fn resolve_inputs(&self, task: &mut Task) -> Result<()> {
        let scope_inputs: HashMap<String, String> = self
            .scope
            .inputs
            .iter()
            .filter_map(|def| def.value.clone().map(|value| (def.name.clone(), value)))
            .collect();
        let resolver = self.base_resolver(scope_inputs);
        for def in &self.def.inputs {
            let raw = def.value.clone().unwrap_or_default();
            let value = resolver.resolve(&raw)?;
            task.extra
                .inputs
                .insert(def.name.clone(), TaskValue::new(value, def.kind));
        }
        for def in &self.def.outputs {
            task.extra
                .outputs
                .entry(def.name.clone())
                .or_insert_with(|| TaskValue::new("", def.kind));
        }
        Ok(())
    }

    /// On success, resolve this task's outward context contribution and write
    /// it to the nearest enclosing parent.
    async fn set_context(&self, task: &Task) -> Result<()> {
        if self.def.contexts.is_empty() {
            return Ok(());
        }
        let resolver = self.base_resolver(plain_values(&task.extra.inputs));
        for def in &self.def.contexts {
            let Some(raw) = &def.value else { continue };
            let value = resolver.resolve(raw)?;
            self.shared
                .set_parent_context(self.parent_task_id, &def.name, TaskValue::new(value, def.kind))
                .await?;
        }
        Ok(())
    }

    /// Resolve a sub-pipeline task's outputs from its children's outputs
    fn resolve_pipeline_outputs(&self, task: &mut Task, scope: &PipelineContent) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let scope_parent = task.id;
        let resolver = Resolver::new().register(Namespace::Outputs, move |occ| {
            shared
                .task_by_key(&TaskKey::new(scope_parent, &occ.segments[0]))
                .and_then(|child| {
                    child
                        .extra
                        .outputs
                        .get(&occ.segments[1])
                        .map(|v| v.value.clone())
                })
                .ok_or_else(|| PlaceholderError::unresolvable(&occ.token, "output not set"))
        });
        for def in &scope.outputs {
            let Some(raw) = &def.value else { continue };
            let value = resolver.resolve(raw)?;
            task.extra
                .outputs
                .insert(def.name.clone(), TaskValue::new(value, def.kind));
        }
        Ok(())
    }

    /// Resolver wired to this node's scope: declared/resolved inputs, the
    /// enclosing contexts, sibling outputs and run-stable randoms.
    fn base_resolver(&self, inputs: HashMap<String, String>) -> Resolver<'static> {
        let contexts_shared = Arc::clone(&self.shared);
        let outputs_shared = Arc::clone(&self.shared);
        let randoms_shared = Arc::clone(&self.shared);
        let parent = self.parent_task_id;
        Resolver::new()
            .register(Namespace::Inputs, move |occ| {
                inputs.get(&occ.segments[0]).cloned().ok_or_else(|| {
                    PlaceholderError::unresolvable(
                        &occ.token,
                        format!("input '{}' is not defined", occ.segments[0]),
                    )
                })
            })
            .register(Namespace::Contexts, move |occ| {
                contexts_shared
                    .context_value(parent, &occ.segments[0])
                    .ok_or_else(|| {
                        PlaceholderError::unresolvable(
                            &occ.token,
                            format!("context '{}' is not set", occ.segments[0]),
                        )
                    })
            })
            .register(Namespace::Outputs, move |occ| {
                outputs_shared
                    .task_by_key(&TaskKey::new(parent, &occ.segments[0]))
                    .and_then(|sibling| {
                        sibling
                            .extra
                            .outputs
                            .get(&occ.segments[1])
                            .map(|v| v.value.clone())
                    })
                    .ok_or_else(|| {
                        PlaceholderError::unresolvable(
                            &occ.token,
                            format!(
                                "output '{}' of task '{}' is not set",
                                occ.segments[1], occ.segments[0]
                            ),
                        )
                    })
            })
            .register(Namespace::Randoms, move |occ| {
                Ok(randoms_shared
                    .random_value(&format!("{}.{}", occ.segments[0], occ.segments[1])))
            })
    }

    async fn transition(&self, task: &mut Task, status: TaskStatus) -> Result<()> {
        // Callbacks may have reported outputs while this node held its own
        // snapshot; a status transition must not clobber them.
        if let Some(current) = self.shared.task_by_id(task.id) {
            for (name, value) in current.extra.outputs {
                if !value.value.is_empty() {
                    task.extra.outputs.insert(name, value);
                }
            }
        }
        task.status = status;
        if status.is_done() && task.time_end.is_none() {
            task.time_end = Some(Utc::now());
        }
        self.shared.persist_task(task).await?;
        self.shared
            .events
            .task_transition(task.run_id, task.id, &task.alias, status);
        log_task_operation(
            "transition",
            Some(task.run_id),
            Some(task.id),
            Some(&task.alias),
            &status.to_string(),
            None,
        );
        Ok(())
    }

    /// Persist a dispatch error on the task and lazily stop the run
    async fn fail_with(&self, err: EngineError) {
        log_error("node", "run", &err.to_string(), Some(&self.def.alias));
        if let Ok(mut task) = self.current_task() {
            if !task.status.is_done() {
                task.extra.error = Some(err.to_string());
                if self.transition(&mut task, TaskStatus::Error).await.is_err() {
                    warn!(task = %self.def.alias, "failed to persist error status");
                }
            }
        }
        self.shared.lazy_stop(RunStatus::Failed, err.to_string());
    }

    fn current_task(&self) -> Result<Task> {
        self.shared.task_by_id(self.task_id).ok_or_else(|| {
            EngineError::internal(format!("task {} missing from flow cache", self.task_id))
        })
    }
}

fn synthetic_root_def() -> TaskDef {
    TaskDef {
        alias: ROOT.to_string(),
        needs: Vec::new(),
        executor: ExecutorKind::Container,
        image: String::new(),
        commands: Vec::new(),
        inputs: Vec::new(),
        outputs: Vec::new(),
        contexts: Vec::new(),
        tags: Vec::new(),
        timeout_seconds: None,
    }
}

/// Split a `name:version` pipeline reference; a bare name selects `latest`
fn split_image(image: &str) -> (&str, Option<&str>) {
    match image.split_once(':') {
        Some((name, version)) if !version.is_empty() => (name, Some(version)),
        Some((name, _)) => (name, None),
        None => (image, None),
    }
}

fn plain_values(values: &HashMap<String, TaskValue>) -> HashMap<String, String> {
    values
        .iter()
        .map(|(name, value)| (name.clone(), value.value.clone()))
        .collect()
}
