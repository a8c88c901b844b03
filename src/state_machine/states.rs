use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline run state definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run row exists but the flow has not started executing yet
    Pending,
    /// Flow is actively executing the DAG
    Running,
    /// Every task finished successfully
    Success,
    /// At least one task failed, or the run was stopped for a failure reason
    Failed,
    /// The run was cancelled by an operator or API call
    Cancelled,
}

impl RunStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }

    /// Check if this is an active state (run owned by a live flow)
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {s}")),
        }
    }
}

/// Task state definitions driving the node dispatch state machine.
///
/// Dispatch walks `Initializing -> Created -> Running` and then lands on one
/// of the done statuses reported by the actuator or by the engine itself
/// (timeout, cancel, error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task row created, job not yet built or submitted
    Initializing,
    /// Job provisioned on the actuator, not yet started
    Created,
    /// Job started, engine is polling for a done status
    Running,
    /// Job finished successfully
    Success,
    /// Job finished with a failure reported by the actuator
    Failed,
    /// Task was cancelled together with its run
    Cancel,
    /// Per-task timeout elapsed before the job finished
    Timeout,
    /// The engine hit an unrecoverable error dispatching the task
    Error,
    /// The actuator reported a status the engine cannot interpret
    Unknown,
}

impl TaskStatus {
    /// Check if this status is final for a task ("done")
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Cancel | Self::Unknown | Self::Error | Self::Timeout
        )
    }

    /// Check if this is a done status other than success ("failed-class")
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Cancel | Self::Unknown | Self::Error | Self::Timeout
        )
    }

    /// Check if this task is waiting on actuator progress
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Created | Self::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Cancel => write!(f, "cancel"),
            Self::Timeout => write!(f, "timeout"),
            Self::Error => write!(f, "error"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancel" => Ok(Self::Cancel),
            "timeout" => Ok(Self::Timeout),
            "error" => Ok(Self::Error),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

/// Trigger intake state machine, advanced with status-guarded store writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    /// Event matched the trigger, no run launched yet
    Matched,
    /// A run is being created for this trigger
    Launching,
    /// The run was created and handed to a flow
    Launched,
    /// Launching the run failed
    Failed,
}

impl fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Matched => write!(f, "matched"),
            Self::Launching => write!(f, "launching"),
            Self::Launched => write!(f, "launched"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TriggerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "matched" => Ok(Self::Matched),
            "launching" => Ok(Self::Launching),
            "launched" => Ok(Self::Launched),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid trigger status: {s}")),
        }
    }
}
