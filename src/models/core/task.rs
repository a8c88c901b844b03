//! # Task Model
//!
//! One instance of a DAG node within a run. Identity is the pair
//! `(parent_task_id, alias)`, the only identity a task needs; root-level
//! tasks use the nil UUID as their parent. Task rows are created lazily the
//! first time their DAG predecessor completes and are never deleted.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::pipeline::ValueKind;
use crate::state_machine::TaskStatus;

/// Length of the per-task callback auth secret
const CALLBACK_SECRET_LEN: usize = 32;

/// Task identity within a run: `(parent_task_id, alias)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub parent_task_id: Uuid,
    pub alias: String,
}

impl TaskKey {
    pub fn new(parent_task_id: Uuid, alias: impl Into<String>) -> Self {
        Self {
            parent_task_id,
            alias: alias.into(),
        }
    }

    /// Stable string form used for map keys and edge signatures
    pub fn signature(&self) -> String {
        format!("{}/{}", self.parent_task_id, self.alias)
    }
}

/// A resolved value attached to a task (input, context or output)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskValue {
    pub value: String,
    #[serde(default)]
    pub kind: ValueKind,
}

impl TaskValue {
    pub fn new(value: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            value: value.into(),
            kind,
        }
    }
}

/// Mutable extra payload persisted with every task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TaskExtra {
    pub inputs: HashMap<String, TaskValue>,
    pub contexts: HashMap<String, TaskValue>,
    pub outputs: HashMap<String, TaskValue>,
    /// Actuator selector tag recorded at first dispatch, reused on retry
    pub actuator_tag: Option<String>,
    /// Per-task secret checked against inbound callbacks
    pub callback_secret: String,
    /// Error text retained for diagnosis
    pub error: Option<String>,
}

/// One task instance within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub run_id: Uuid,
    pub parent_task_id: Uuid,
    pub alias: String,
    pub status: TaskStatus,
    /// Job handle returned by the actuator's create operation
    pub sign: Option<String>,
    pub extra: TaskExtra,
    pub time_begin: Option<DateTime<Utc>>,
    pub time_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(run_id: Uuid, parent_task_id: Uuid, alias: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            run_id,
            parent_task_id,
            alias: alias.into(),
            status: TaskStatus::Initializing,
            sign: None,
            extra: TaskExtra {
                callback_secret: generate_callback_secret(),
                ..TaskExtra::default()
            },
            time_begin: None,
            time_end: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.parent_task_id, self.alias.clone())
    }

    /// Check whether this task belongs to the run's top-level scope
    pub fn is_root_level(&self) -> bool {
        self.parent_task_id.is_nil()
    }
}

/// Mint a random per-task callback secret
pub fn generate_callback_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CALLBACK_SECRET_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_key_signature_is_stable() {
        let parent = Uuid::nil();
        let key = TaskKey::new(parent, "build");
        assert_eq!(key.signature(), format!("{parent}/build"));
    }

    #[test]
    fn new_task_starts_initializing_with_a_secret() {
        let task = Task::new(Uuid::new_v4(), Uuid::nil(), "build");
        assert_eq!(task.status, TaskStatus::Initializing);
        assert_eq!(task.extra.callback_secret.len(), CALLBACK_SECRET_LEN);
        assert!(task.is_root_level());
    }

    #[test]
    fn callback_secrets_are_distinct() {
        assert_ne!(generate_callback_secret(), generate_callback_secret());
    }
}
