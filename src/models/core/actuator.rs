//! # Actuator Definition Model
//!
//! Registered actuator backends, looked up during task dispatch by selector
//! tag and executor kind within the run owner's namespace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::pipeline::ExecutorKind;

/// A registered actuator backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorDefinition {
    pub id: Uuid,
    pub name: String,
    pub kind: ExecutorKind,
    /// Selector tags matched against task/pipeline tags
    pub tags: Vec<String>,
    pub namespace: String,
    pub endpoint: String,
    /// Set when the backend is reachable only through a reverse tunnel
    pub tunnel_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ActuatorDefinition {
    pub fn new(
        name: impl Into<String>,
        kind: ExecutorKind,
        namespace: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            tags: Vec::new(),
            namespace: namespace.into(),
            endpoint: endpoint.into(),
            tunnel_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_tunnel(mut self, tunnel_id: impl Into<String>) -> Self {
        self.tunnel_id = Some(tunnel_id.into());
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}
