#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Conductor Core
//!
//! Event-driven pipeline orchestration core. External events matched against
//! trigger definitions launch pipeline runs: live, recoverable, concurrently
//! executing DAGs of tasks, each dispatched through a pluggable remote
//! actuator (container engine, cluster scheduler, or remote shell).
//!
//! ## Architecture
//!
//! The engine is built leaves-first:
//!
//! - [`dag`] - static dependency graph per pipeline definition
//! - [`placeholder`] - the `${{ namespace.path }}` template language
//! - [`actuator`] - the capability contract and backend selection
//! - [`orchestration`] - nodes, flows and the flow manager
//!
//! A **Flow** owns one run's mutable state, cancellation scope and lazy-stop
//! commit protocol. A **Node** drives one task through
//! `initializing -> created -> running` into a done status, recursing into
//! nested DAGs for sub-pipeline tasks. The **Flow Manager** registers active
//! flows, recovers interrupted runs from persisted state, and routes trigger
//! signals, cancel requests and task callbacks.
//!
//! ## Persistence
//!
//! The persistence layer is the single source of truth across restarts:
//! every run/task mutation is written through the [`store::Store`] contract
//! before it is reflected in memory. Replaying a run after a restart
//! re-derives the node graph and skips everything already finished.
//!
//! ## Module Organization
//!
//! - [`models`] - persisted records (definitions, runs, tasks, triggers)
//! - [`store`] - persistence contract with Postgres and in-memory backends
//! - [`state_machine`] - run/task/trigger status definitions
//! - [`events`] - in-process lifecycle event publishing
//! - [`config`] - layered engine configuration
//! - [`error`] - structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use conductor_core::config::EngineConfig;
//! use conductor_core::orchestration::FlowManager;
//! use conductor_core::store::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example(factory: Arc<dyn conductor_core::actuator::ActuatorFactory>) -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//! let manager = FlowManager::new(store, factory, EngineConfig::default());
//!
//! // Resume runs interrupted by the previous process
//! let recovered = manager.recover().await?;
//! println!("recovered {recovered} runs");
//! # Ok(())
//! # }
//! ```

pub mod actuator;
pub mod config;
pub mod constants;
pub mod dag;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod placeholder;
pub mod state_machine;
pub mod store;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use orchestration::{Flow, FlowManager, TaskCallback};
pub use state_machine::{RunStatus, TaskStatus, TriggerStatus};
