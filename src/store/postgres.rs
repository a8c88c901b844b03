//! Postgres-backed store.
//!
//! Queries are runtime-bound (no compile-time macro checking) so the crate
//! builds without a live database. Status enums are stored as text; the
//! definition content and task extras land in JSONB columns.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::Store;
use crate::error::{EngineError, Result};
use crate::models::{
    ActuatorDefinition, Event, ExecutorKind, PipelineContent, PipelineDefinition, PipelineRun,
    RunExtra, Task, TaskExtra, Trigger,
};
use crate::state_machine::{RunStatus, TaskStatus, TriggerStatus};

/// Schema applied by [`PgStore::ensure_schema`]
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conductor_pipeline_runs (
  id UUID PRIMARY KEY,
  pipeline_name TEXT NOT NULL,
  pipeline_version TEXT NOT NULL,
  namespace TEXT NOT NULL,
  status TEXT NOT NULL,
  reason TEXT,
  trigger_id UUID,
  event_id UUID,
  time_begin TIMESTAMPTZ,
  time_end TIMESTAMPTZ,
  cost_ms BIGINT,
  created_at TIMESTAMPTZ NOT NULL,
  updated_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conductor_runs_status ON conductor_pipeline_runs (status);

CREATE TABLE IF NOT EXISTS conductor_run_extras (
  run_id UUID PRIMARY KEY REFERENCES conductor_pipeline_runs (id),
  definition JSONB NOT NULL,
  event_content JSONB,
  trigger_content JSONB,
  contexts JSONB NOT NULL,
  updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS conductor_tasks (
  id UUID PRIMARY KEY,
  run_id UUID NOT NULL REFERENCES conductor_pipeline_runs (id),
  parent_task_id UUID NOT NULL,
  alias TEXT NOT NULL,
  status TEXT NOT NULL,
  sign TEXT,
  extra JSONB NOT NULL,
  time_begin TIMESTAMPTZ,
  time_end TIMESTAMPTZ,
  created_at TIMESTAMPTZ NOT NULL,
  updated_at TIMESTAMPTZ NOT NULL,
  UNIQUE (run_id, parent_task_id, alias)
);
CREATE INDEX IF NOT EXISTS idx_conductor_tasks_run ON conductor_tasks (run_id);

CREATE TABLE IF NOT EXISTS conductor_pipelines (
  name TEXT NOT NULL,
  version TEXT NOT NULL,
  namespace TEXT NOT NULL,
  latest BOOLEAN NOT NULL DEFAULT FALSE,
  content JSONB NOT NULL,
  created_at TIMESTAMPTZ NOT NULL,
  PRIMARY KEY (namespace, name, version)
);

CREATE TABLE IF NOT EXISTS conductor_triggers (
  id UUID PRIMARY KEY,
  pipeline_name TEXT NOT NULL,
  pipeline_version TEXT,
  namespace TEXT NOT NULL,
  event_id UUID,
  status TEXT NOT NULL,
  content JSONB NOT NULL,
  created_at TIMESTAMPTZ NOT NULL,
  updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS conductor_events (
  id UUID PRIMARY KEY,
  source TEXT NOT NULL,
  content JSONB NOT NULL,
  created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS conductor_actuators (
  id UUID PRIMARY KEY,
  name TEXT NOT NULL,
  kind TEXT NOT NULL,
  tags TEXT[] NOT NULL DEFAULT '{}',
  namespace TEXT NOT NULL,
  endpoint TEXT NOT NULL,
  tunnel_id TEXT,
  created_at TIMESTAMPTZ NOT NULL
);
"#;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the engine tables when they do not exist yet
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    fn run_from_row(row: &PgRow) -> Result<PipelineRun> {
        let status: String = row.try_get("status")?;
        Ok(PipelineRun {
            id: row.try_get("id")?,
            pipeline_name: row.try_get("pipeline_name")?,
            pipeline_version: row.try_get("pipeline_version")?,
            namespace: row.try_get("namespace")?,
            status: parse_status::<RunStatus>(&status)?,
            reason: row.try_get("reason")?,
            trigger_id: row.try_get("trigger_id")?,
            event_id: row.try_get("event_id")?,
            time_begin: row.try_get("time_begin")?,
            time_end: row.try_get("time_end")?,
            cost_ms: row.try_get("cost_ms")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn task_from_row(row: &PgRow) -> Result<Task> {
        let status: String = row.try_get("status")?;
        let extra: serde_json::Value = row.try_get("extra")?;
        Ok(Task {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            parent_task_id: row.try_get("parent_task_id")?,
            alias: row.try_get("alias")?,
            status: parse_status::<TaskStatus>(&status)?,
            sign: row.try_get("sign")?,
            extra: serde_json::from_value::<TaskExtra>(extra)?,
            time_begin: row.try_get("time_begin")?,
            time_end: row.try_get("time_end")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn extra_from_row(row: &PgRow) -> Result<RunExtra> {
        let definition: serde_json::Value = row.try_get("definition")?;
        let contexts: serde_json::Value = row.try_get("contexts")?;
        Ok(RunExtra {
            run_id: row.try_get("run_id")?,
            definition: serde_json::from_value::<PipelineContent>(definition)?,
            event_content: row.try_get("event_content")?,
            trigger_content: row.try_get("trigger_content")?,
            contexts: serde_json::from_value(contexts)?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn pipeline_from_row(row: &PgRow) -> Result<PipelineDefinition> {
        let content: serde_json::Value = row.try_get("content")?;
        Ok(PipelineDefinition {
            name: row.try_get("name")?,
            version: row.try_get("version")?,
            namespace: row.try_get("namespace")?,
            latest: row.try_get("latest")?,
            content: serde_json::from_value::<PipelineContent>(content)?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn trigger_from_row(row: &PgRow) -> Result<Trigger> {
        let status: String = row.try_get("status")?;
        Ok(Trigger {
            id: row.try_get("id")?,
            pipeline_name: row.try_get("pipeline_name")?,
            pipeline_version: row.try_get("pipeline_version")?,
            namespace: row.try_get("namespace")?,
            event_id: row.try_get("event_id")?,
            status: parse_status::<TriggerStatus>(&status)?,
            content: row.try_get("content")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn actuator_from_row(row: &PgRow) -> Result<ActuatorDefinition> {
        let kind: String = row.try_get("kind")?;
        Ok(ActuatorDefinition {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            kind: serde_json::from_value(serde_json::Value::String(kind))?,
            tags: row.try_get("tags")?,
            namespace: row.try_get("namespace")?,
            endpoint: row.try_get("endpoint")?,
            tunnel_id: row.try_get("tunnel_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

fn parse_status<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T> {
    s.parse::<T>()
        .map_err(|e| EngineError::store("parse_status", e))
}

#[async_trait]
impl Store for PgStore {
    async fn create_run(&self, run: &PipelineRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conductor_pipeline_runs (
                id, pipeline_name, pipeline_version, namespace, status, reason,
                trigger_id, event_id, time_begin, time_end, cost_ms, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(run.id)
        .bind(&run.pipeline_name)
        .bind(&run.pipeline_version)
        .bind(&run.namespace)
        .bind(run.status.to_string())
        .bind(&run.reason)
        .bind(run.trigger_id)
        .bind(run.event_id)
        .bind(run.time_begin)
        .bind(run.time_end)
        .bind(run.cost_ms)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<PipelineRun>> {
        let row = sqlx::query("SELECT * FROM conductor_pipeline_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::run_from_row).transpose()
    }

    async fn list_runs_by_status(&self, statuses: &[RunStatus]) -> Result<Vec<PipelineRun>> {
        let statuses: Vec<String> = statuses.iter().map(ToString::to_string).collect();
        let rows = sqlx::query(
            "SELECT * FROM conductor_pipeline_runs WHERE status = ANY($1) ORDER BY created_at",
        )
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::run_from_row).collect()
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE conductor_pipeline_runs
            SET status = $2, reason = $3, time_begin = $4, time_end = $5,
                cost_ms = $6, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(run.status.to_string())
        .bind(&run.reason)
        .bind(run.time_begin)
        .bind(run.time_end)
        .bind(run.cost_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_run_extra(&self, extra: &RunExtra) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conductor_run_extras (
                run_id, definition, event_content, trigger_content, contexts, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(extra.run_id)
        .bind(serde_json::to_value(&extra.definition)?)
        .bind(&extra.event_content)
        .bind(&extra.trigger_content)
        .bind(serde_json::to_value(&extra.contexts)?)
        .bind(extra.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run_extra(&self, run_id: Uuid) -> Result<Option<RunExtra>> {
        let row = sqlx::query("SELECT * FROM conductor_run_extras WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::extra_from_row).transpose()
    }

    async fn update_run_extra(&self, extra: &RunExtra) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE conductor_run_extras
            SET contexts = $2, updated_at = NOW()
            WHERE run_id = $1
            "#,
        )
        .bind(extra.run_id)
        .bind(serde_json::to_value(&extra.contexts)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conductor_tasks (
                id, run_id, parent_task_id, alias, status, sign, extra,
                time_begin, time_end, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(task.id)
        .bind(task.run_id)
        .bind(task.parent_task_id)
        .bind(&task.alias)
        .bind(task.status.to_string())
        .bind(&task.sign)
        .bind(serde_json::to_value(&task.extra)?)
        .bind(task.time_begin)
        .bind(task.time_end)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM conductor_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::task_from_row).transpose()
    }

    async fn list_tasks(&self, run_id: Uuid) -> Result<Vec<Task>> {
        let rows =
            sqlx::query("SELECT * FROM conductor_tasks WHERE run_id = $1 ORDER BY created_at")
                .bind(run_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(Self::task_from_row).collect()
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE conductor_tasks
            SET status = $2, sign = $3, extra = $4, time_begin = $5,
                time_end = $6, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(task.status.to_string())
        .bind(&task.sign)
        .bind(serde_json::to_value(&task.extra)?)
        .bind(task.time_begin)
        .bind(task.time_end)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_pipeline(
        &self,
        namespace: &str,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<PipelineDefinition>> {
        let row = match version {
            Some(version) => {
                sqlx::query(
                    "SELECT * FROM conductor_pipelines WHERE namespace = $1 AND name = $2 AND version = $3",
                )
                .bind(namespace)
                .bind(name)
                .bind(version)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM conductor_pipelines WHERE namespace = $1 AND name = $2 AND latest",
                )
                .bind(namespace)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?
            }
        };
        row.as_ref().map(Self::pipeline_from_row).transpose()
    }

    async fn get_trigger(&self, id: Uuid) -> Result<Option<Trigger>> {
        let row = sqlx::query("SELECT * FROM conductor_triggers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::trigger_from_row).transpose()
    }

    async fn update_trigger_status(
        &self,
        id: Uuid,
        expected: TriggerStatus,
        next: TriggerStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE conductor_triggers
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(expected.to_string())
        .bind(next.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<Event>> {
        let row = sqlx::query("SELECT * FROM conductor_events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(Event {
            id: row.try_get("id")?,
            source: row.try_get("source")?,
            content: row.try_get("content")?,
            created_at: row.try_get("created_at")?,
        }))
    }

    async fn list_actuators(
        &self,
        namespace: &str,
        kind: ExecutorKind,
    ) -> Result<Vec<ActuatorDefinition>> {
        let rows = sqlx::query(
            "SELECT * FROM conductor_actuators WHERE namespace = $1 AND kind = $2 ORDER BY created_at",
        )
        .bind(namespace)
        .bind(kind.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::actuator_from_row).collect()
    }
}
