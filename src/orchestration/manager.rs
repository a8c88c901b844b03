//! # Flow Manager
//!
//! Process-wide registry of active flows. Recovers previously running
//! pipelines after a restart, starts new runs on trigger signals or manual
//! application, and routes cancel requests and inbound callbacks to the
//! correct flow.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::callback::{self, TaskCallback};
use super::fanout;
use super::flow::Flow;
use crate::actuator::{ActuatorFactory, ActuatorSelector};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::EventPublisher;
use crate::logging::{log_error, log_run_operation};
use crate::models::{PipelineRun, RunExtra, Trigger};
use crate::state_machine::{RunStatus, TriggerStatus};
use crate::store::Store;

struct ManagerInner {
    config: EngineConfig,
    store: Arc<dyn Store>,
    selector: Arc<ActuatorSelector>,
    events: EventPublisher,
    flows: DashMap<Uuid, Arc<Flow>>,
}

/// Registry and dispatcher for active pipeline runs
#[derive(Clone)]
pub struct FlowManager {
    inner: Arc<ManagerInner>,
}

impl FlowManager {
    pub fn new(
        store: Arc<dyn Store>,
        factory: Arc<dyn ActuatorFactory>,
        config: EngineConfig,
    ) -> Self {
        let selector = Arc::new(ActuatorSelector::new(Arc::clone(&store), factory, &config));
        let events = EventPublisher::new(config.event_channel_capacity);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                store,
                selector,
                events,
                flows: DashMap::new(),
            }),
        }
    }

    /// Lifecycle event publisher for embedders that want to observe runs
    pub fn events(&self) -> &EventPublisher {
        &self.inner.events
    }

    /// Resume every non-terminal run from its persisted task statuses.
    ///
    /// Flows are registered synchronously and then driven in the background
    /// through the bounded fan-out helper. Returns how many runs were picked
    /// up.
    pub async fn recover(&self) -> Result<usize> {
        let runs = self
            .inner
            .store
            .list_runs_by_status(&[RunStatus::Pending, RunStatus::Running])
            .await?;

        let mut flows = Vec::new();
        for run in runs {
            let run_id = run.id;
            match self.build_flow(run).await {
                Ok(flow) => flows.push(flow),
                Err(err) => log_error(
                    "flow_manager",
                    "recover",
                    &err.to_string(),
                    Some(&run_id.to_string()),
                ),
            }
        }

        let count = flows.len();
        for flow in &flows {
            self.inner.flows.insert(flow.id(), Arc::clone(flow));
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let limit = inner.config.max_concurrent_branches;
            let drivers = flows
                .into_iter()
                .map(|flow| {
                    let inner = Arc::clone(&inner);
                    async move {
                        let id = flow.id();
                        if let Err(err) = flow.run().await {
                            log_error(
                                "flow_manager",
                                "recovered_run",
                                &err.to_string(),
                                Some(&id.to_string()),
                            );
                        }
                        inner.flows.remove(&id);
                    }
                })
                .collect();
            fanout::bounded(limit, drivers).await;
        });

        info!(count, "recovery pass scheduled");
        Ok(count)
    }

    /// Launch the pipeline bound to a matched trigger.
    ///
    /// The trigger row is advanced through status-guarded writes so that two
    /// processes racing on the same trigger launch exactly one run.
    pub async fn run_by_trigger(&self, trigger_id: Uuid) -> Result<Uuid> {
        let store = &self.inner.store;
        let trigger = store
            .get_trigger(trigger_id)
            .await?
            .ok_or_else(|| EngineError::not_found("trigger", trigger_id))?;

        if !store
            .update_trigger_status(trigger_id, TriggerStatus::Matched, TriggerStatus::Launching)
            .await?
        {
            return Err(EngineError::validation(format!(
                "trigger {trigger_id} is not in matched status"
            )));
        }

        match self.launch_from_trigger(&trigger).await {
            Ok(run_id) => {
                store
                    .update_trigger_status(
                        trigger_id,
                        TriggerStatus::Launching,
                        TriggerStatus::Launched,
                    )
                    .await?;
                Ok(run_id)
            }
            Err(err) => {
                let _ = store
                    .update_trigger_status(
                        trigger_id,
                        TriggerStatus::Launching,
                        TriggerStatus::Failed,
                    )
                    .await;
                Err(err)
            }
        }
    }

    /// Manually apply a run of the named pipeline (operator path)
    pub async fn start_run(
        &self,
        namespace: &str,
        pipeline_name: &str,
        version: Option<&str>,
    ) -> Result<Uuid> {
        let definition = self
            .inner
            .store
            .get_pipeline(namespace, pipeline_name, version)
            .await?
            .ok_or_else(|| EngineError::not_found("pipeline definition", pipeline_name))?;
        let run = PipelineRun::new(&definition.name, &definition.version, namespace);
        self.create_and_launch(run, RunExtra::new(Uuid::nil(), definition.content))
            .await
    }

    async fn launch_from_trigger(&self, trigger: &Trigger) -> Result<Uuid> {
        let store = &self.inner.store;
        let event = match trigger.event_id {
            Some(event_id) => store.get_event(event_id).await?,
            None => None,
        };
        let definition = store
            .get_pipeline(
                &trigger.namespace,
                &trigger.pipeline_name,
                trigger.pipeline_version.as_deref(),
            )
            .await?
            .ok_or_else(|| EngineError::not_found("pipeline definition", &trigger.pipeline_name))?;

        let run = PipelineRun::new(&definition.name, &definition.version, &trigger.namespace)
            .with_trigger(trigger.id, trigger.event_id);
        let mut extra = RunExtra::new(Uuid::nil(), definition.content);
        extra.event_content = event.map(|e| e.content);
        extra.trigger_content = Some(trigger.content.clone());
        self.create_and_launch(run, extra).await
    }

    async fn create_and_launch(&self, run: PipelineRun, mut extra: RunExtra) -> Result<Uuid> {
        let store = &self.inner.store;
        extra.run_id = run.id;
        store.create_run(&run).await?;
        store.create_run_extra(&extra).await?;

        let run_id = run.id;
        let pipeline = run.pipeline_name.clone();
        let flow = Arc::new(Flow::new(
            run,
            extra,
            Arc::clone(store),
            Arc::clone(&self.inner.selector),
            self.inner.events.clone(),
            self.inner.config.clone(),
        ));
        self.launch(flow);
        log_run_operation("start_run", Some(run_id), Some(&pipeline), "launched", None);
        Ok(run_id)
    }

    fn launch(&self, flow: Arc<Flow>) {
        let id = flow.id();
        self.inner.flows.insert(id, Arc::clone(&flow));
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(err) = flow.run().await {
                log_error("flow_manager", "run", &err.to_string(), Some(&id.to_string()));
            }
            inner.flows.remove(&id);
        });
    }

    /// Cancel a run and wait for its terminal status to be committed
    pub async fn cancel_run(&self, run_id: Uuid, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        let flow = self.inner.flows.get(&run_id).map(|entry| Arc::clone(&entry));
        if let Some(flow) = flow {
            let committed = flow.cancel(reason);
            let _ = committed.await;
            return Ok(());
        }

        // No live flow owns the run; cancel an orphaned row directly.
        let mut run = self
            .inner
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found("pipeline run", run_id))?;
        if !run.status.is_terminal() {
            run.status = RunStatus::Cancelled;
            run.reason = Some(reason);
            run.time_end = Some(Utc::now());
            run.updated_at = Utc::now();
            self.inner.store.update_run(&run).await?;
        }
        Ok(())
    }

    /// Route an inbound callback to the owning flow, or to the store when the
    /// engine no longer holds the run in memory
    pub async fn handle_callback(&self, callback: TaskCallback) -> Result<()> {
        let flow = self
            .inner
            .flows
            .get(&callback.run_id)
            .map(|entry| Arc::clone(&entry));
        callback::apply(&self.inner.store, flow.as_ref(), callback).await
    }

    /// Fetch a run, preferring the live flow's read-your-writes snapshot
    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>> {
        if let Some(flow) = self.inner.flows.get(&run_id) {
            return Ok(Some(flow.run_snapshot()));
        }
        self.inner.store.get_run(run_id).await
    }

    pub async fn list_runs(&self, statuses: &[RunStatus]) -> Result<Vec<PipelineRun>> {
        self.inner.store.list_runs_by_status(statuses).await
    }

    /// Ids of runs currently owned by this process
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.inner.flows.iter().map(|entry| *entry.key()).collect()
    }

    async fn build_flow(&self, run: PipelineRun) -> Result<Arc<Flow>> {
        let extra = self
            .inner
            .store
            .get_run_extra(run.id)
            .await?
            .ok_or_else(|| EngineError::not_found("run extra", run.id))?;
        Ok(Arc::new(Flow::new(
            run,
            extra,
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.selector),
            self.inner.events.clone(),
            self.inner.config.clone(),
        )))
    }
}
