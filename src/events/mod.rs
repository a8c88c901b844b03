//! # Lifecycle Events
//!
//! In-process event publishing for run and task lifecycle transitions.
//! Subscribers are optional; publishing with no listeners is not an error and
//! lagging receivers simply miss events.

pub mod publisher;

pub use publisher::{EventPublisher, PublishedEvent};
