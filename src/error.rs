//! # Engine Error Types
//!
//! Structured error handling for the run engine using thiserror. Component
//! errors (`DagError`, `PlaceholderError`, `ActuatorError`) convert into the
//! top-level [`EngineError`] at the orchestration boundary.

use thiserror::Error;

use crate::actuator::ActuatorError;
use crate::dag::DagError;
use crate::placeholder::PlaceholderError;

/// Top-level error type for the run engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Store error: {operation}: {message}")]
    Store { operation: String, message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error(transparent)]
    Dag(#[from] DagError),

    #[error(transparent)]
    Placeholder(#[from] PlaceholderError),

    #[error(transparent)]
    Actuator(#[from] ActuatorError),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Callback rejected: {message}")]
    Callback { message: String },

    #[error("{scope} timed out after {seconds}s")]
    Timeout { scope: String, seconds: u64 },

    #[error("Run cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    /// Create a store error for a failed persistence operation
    pub fn store(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not-found error for a missing entity
    pub fn not_found(entity: impl Into<String>, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a callback rejection error
    pub fn callback(message: impl Into<String>) -> Self {
        Self::Callback {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store {
            operation: "query".to_string(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
