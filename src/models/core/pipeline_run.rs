//! # Pipeline Run Model
//!
//! One instantiation of a pipeline definition, plus the immutable-at-creation
//! `RunExtra` snapshot that travels with it. The run row is the externally
//! visible record (status, timing, cost); the extra carries the resolved
//! definition content, the originating event/trigger content, and the
//! run-scoped context values mutated as root-level tasks complete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::pipeline::PipelineContent;
use crate::state_machine::RunStatus;

/// One pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline_name: String,
    pub pipeline_version: String,
    pub namespace: String,
    pub status: RunStatus,
    /// Free-text stop reason recorded at terminal commit
    pub reason: Option<String>,
    pub trigger_id: Option<Uuid>,
    pub event_id: Option<Uuid>,
    pub time_begin: Option<DateTime<Utc>>,
    pub time_end: Option<DateTime<Utc>>,
    /// Wall-clock cost in milliseconds, computed at terminal commit
    pub cost_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(
        pipeline_name: impl Into<String>,
        pipeline_version: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            pipeline_name: pipeline_name.into(),
            pipeline_version: pipeline_version.into(),
            namespace: namespace.into(),
            status: RunStatus::Pending,
            reason: None,
            trigger_id: None,
            event_id: None,
            time_begin: None,
            time_end: None,
            cost_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_trigger(mut self, trigger_id: Uuid, event_id: Option<Uuid>) -> Self {
        self.trigger_id = Some(trigger_id);
        self.event_id = event_id;
        self
    }
}

/// Immutable-at-creation snapshot attached to a run.
///
/// Context values are the only part mutated after creation: root-level tasks
/// write their context outputs here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunExtra {
    pub run_id: Uuid,
    /// Resolved definition content captured when the run was created
    pub definition: PipelineContent,
    pub event_content: Option<serde_json::Value>,
    pub trigger_content: Option<serde_json::Value>,
    /// Run-scoped context values, keyed by context name
    pub contexts: HashMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl RunExtra {
    pub fn new(run_id: Uuid, definition: PipelineContent) -> Self {
        // Seed run-scoped contexts from the definition's declared defaults.
        let contexts = definition
            .contexts
            .iter()
            .filter_map(|def| def.value.clone().map(|value| (def.name.clone(), value)))
            .collect();
        Self {
            run_id,
            definition,
            event_content: None,
            trigger_content: None,
            contexts,
            updated_at: Utc::now(),
        }
    }
}
