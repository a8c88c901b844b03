//! # Trigger and Event Models
//!
//! The engine consumes triggers and events at their interface boundary: a
//! matched trigger names the pipeline to run and carries the event that
//! matched it. Trigger status advances through status-guarded store writes so
//! two processes cannot both launch a run for the same trigger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::TriggerStatus;

/// A trigger matched against an inbound event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Uuid,
    pub pipeline_name: String,
    /// Pin a definition version; the `latest` version is used when absent
    pub pipeline_version: Option<String>,
    pub namespace: String,
    pub event_id: Option<Uuid>,
    pub status: TriggerStatus,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trigger {
    pub fn new(pipeline_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            pipeline_name: pipeline_name.into(),
            pipeline_version: None,
            namespace: namespace.into(),
            event_id: None,
            status: TriggerStatus::Matched,
            content: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An inbound external event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub source: String,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(source: impl Into<String>, content: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            content,
            created_at: Utc::now(),
        }
    }
}
