//! # Actuator Contract
//!
//! The capability interface every execution backend implements. The engine is
//! polymorphic over this trait and never depends on a concrete backend;
//! container engines, cluster schedulers and remote shells all live behind
//! it, out of process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::ExecutorKind;
use crate::state_machine::TaskStatus;

/// Errors surfaced by actuator backends.
///
/// `JobNotFound` is a distinguished condition (the job reference is unknown
/// to the backend), distinct from transport errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActuatorError {
    #[error("Job not found on actuator: {sign}")]
    JobNotFound { sign: String },

    #[error("Actuator transport error: {message}")]
    Transport { message: String },

    #[error("Actuator backend error: {message}")]
    Backend { message: String },

    #[error("No actuator matches kind {kind} in namespace {namespace}")]
    NoMatch { kind: String, namespace: String },

    #[error("Tunnel dialer unavailable for {tunnel_id} after {attempts} attempts")]
    DialerUnavailable { tunnel_id: String, attempts: u32 },
}

impl ActuatorError {
    pub fn job_not_found(sign: impl Into<String>) -> Self {
        Self::JobNotFound { sign: sign.into() }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// The actuator-facing request for one task execution.
///
/// Built once per node before first dispatch and reused across polling
/// iterations; `sign` is the backend's job handle, filled in by `create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub run_id: Uuid,
    pub task_id: Uuid,
    /// Task alias, used by backends for display and log labels
    pub name: String,
    pub executor: ExecutorKind,
    pub image: String,
    /// Staging commands executed before the main command list
    pub pre_commands: Vec<String>,
    pub commands: Vec<String>,
    /// Staging and callback commands executed after the main command list
    pub post_commands: Vec<String>,
    pub timeout_seconds: u64,
    /// Per-task object-storage alias used by the staging commands
    pub storage_alias: String,
    /// Backend job handle returned by `create`
    pub sign: Option<String>,
}

/// Capability interface for execution backends
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Provision the execution unit; returns the job with an updated sign
    async fn create(&self, job: &Job) -> Result<Job, ActuatorError>;

    /// Begin execution of a previously created job
    async fn start(&self, job: &Job) -> Result<(), ActuatorError>;

    /// Report the job's current status
    async fn status(&self, job: &Job) -> Result<TaskStatus, ActuatorError>;

    /// Cancel a running job.
    ///
    /// Called in response to cancellation and timeouts; implementations must
    /// not tie this to the cancelled run scope.
    async fn cancel(&self, job: &Job) -> Result<(), ActuatorError>;

    /// Check whether the backend still knows the job
    async fn exist(&self, job: &Job) -> Result<bool, ActuatorError>;

    /// Remove the job and its backend resources
    async fn remove(&self, job: &Job) -> Result<(), ActuatorError>;
}
