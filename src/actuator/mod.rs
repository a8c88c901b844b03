//! # Actuator Layer
//!
//! The capability contract every execution backend implements, plus the
//! selection machinery that maps a task to a registered backend and a
//! connected client.

pub mod contract;
pub mod selection;

pub use contract::{Actuator, ActuatorError, Job};
pub use selection::{ActuatorFactory, ActuatorSelector, Selection};
