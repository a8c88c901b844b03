//! # Task Callback
//!
//! Inbound output reporting from running jobs. A callback is accepted only
//! when its auth token matches the per-task secret minted at task creation;
//! matched outputs merge into the task's declared output slots, keeping their
//! declared types. A rejected callback mutates no state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::flow::Flow;
use crate::error::{EngineError, Result};
use crate::logging::log_task_operation;
use crate::store::Store;

/// Payload of an inbound task callback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCallback {
    pub run_id: Uuid,
    pub task_id: Uuid,
    pub auth: String,
    pub outputs: HashMap<String, String>,
}

/// Verify and apply a callback against the owning flow's cache when the run
/// is live, or straight against the store otherwise.
pub(crate) async fn apply(
    store: &Arc<dyn Store>,
    flow: Option<&Arc<Flow>>,
    callback: TaskCallback,
) -> Result<()> {
    let mut task = match flow {
        Some(flow) => flow.shared().task_by_id(callback.task_id),
        None => store.get_task(callback.task_id).await?,
    }
    .ok_or_else(|| EngineError::not_found("task", callback.task_id))?;

    if task.run_id != callback.run_id {
        return Err(EngineError::callback("task does not belong to this run"));
    }
    if task.extra.callback_secret != callback.auth {
        return Err(EngineError::callback("auth token mismatch"));
    }

    let mut merged = 0usize;
    for (name, value) in callback.outputs {
        // Only declared outputs are merged; unknown names are dropped.
        if let Some(slot) = task.extra.outputs.get_mut(&name) {
            slot.value = value;
            merged += 1;
        }
    }

    match flow {
        Some(flow) => flow.shared().persist_task(&mut task).await?,
        None => store.update_task(&task).await?,
    }
    log_task_operation(
        "callback",
        Some(callback.run_id),
        Some(callback.task_id),
        Some(&task.alias),
        &task.status.to_string(),
        Some(&format!("{merged} outputs merged")),
    );
    Ok(())
}
