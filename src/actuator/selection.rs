//! # Actuator Selection
//!
//! Maps a task to a registered actuator definition and a connected client.
//! Selector precedence: the task's own tags, then the owning pipeline's tags,
//! then the tag previously recorded on the task (retries reuse the original
//! choice). Definitions are filtered to the run owner's namespace and the
//! task's declared executor kind; the first match wins.
//!
//! Clients live in an explicit bounded cache keyed by definition id, and
//! backends reachable only through a tunnel are dialed with bounded retry.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::contract::{Actuator, ActuatorError};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::models::{ActuatorDefinition, Task, TaskDef};
use crate::store::Store;

/// Builds connected clients for actuator definitions.
///
/// Concrete backends are external; embedders inject a factory that knows how
/// to dial them, directly or through a tunnel's reverse connection.
#[async_trait]
pub trait ActuatorFactory: Send + Sync {
    /// Dial a directly reachable actuator
    async fn connect(&self, definition: &ActuatorDefinition)
        -> std::result::Result<Arc<dyn Actuator>, ActuatorError>;

    /// Fetch a client through the tunnel's remote dialer
    async fn connect_tunneled(
        &self,
        definition: &ActuatorDefinition,
        tunnel_id: &str,
    ) -> std::result::Result<Arc<dyn Actuator>, ActuatorError>;
}

/// Bounded client cache with insertion-order eviction
struct ClientCache {
    clients: DashMap<Uuid, Arc<dyn Actuator>>,
    order: Mutex<VecDeque<Uuid>>,
    capacity: usize,
}

impl ClientCache {
    fn new(capacity: usize) -> Self {
        Self {
            clients: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, id: &Uuid) -> Option<Arc<dyn Actuator>> {
        self.clients.get(id).map(|entry| Arc::clone(&entry))
    }

    fn insert(&self, id: Uuid, client: Arc<dyn Actuator>) {
        let mut order = self.order.lock();
        if self.clients.insert(id, client).is_none() {
            order.push_back(id);
        }
        while order.len() > self.capacity {
            if let Some(evicted) = order.pop_front() {
                self.clients.remove(&evicted);
            }
        }
    }
}

/// Outcome of actuator selection: the chosen definition plus the tag that
/// matched it, recorded on the task so retries reuse the same choice
#[derive(Debug, Clone)]
pub struct Selection {
    pub definition: ActuatorDefinition,
    pub tag: Option<String>,
}

/// Selects actuator definitions and maintains connected clients
pub struct ActuatorSelector {
    store: Arc<dyn Store>,
    factory: Arc<dyn ActuatorFactory>,
    cache: ClientCache,
    dialer_retry_attempts: u32,
    dialer_retry_delay: Duration,
}

impl ActuatorSelector {
    pub fn new(
        store: Arc<dyn Store>,
        factory: Arc<dyn ActuatorFactory>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            factory,
            cache: ClientCache::new(config.actuator_cache_capacity),
            dialer_retry_attempts: config.dialer_retry_attempts,
            dialer_retry_delay: Duration::from_secs(config.dialer_retry_delay_seconds),
        }
    }

    /// Pick the actuator definition for a task.
    ///
    /// Tag sources are consulted in precedence order until one yields a
    /// match; an empty source falls through to the next. With no tags at all,
    /// any definition of the right kind and namespace matches.
    pub async fn select(
        &self,
        task: &Task,
        definition: &TaskDef,
        pipeline_tags: &[String],
        namespace: &str,
    ) -> Result<Selection> {
        let candidates = self
            .store
            .list_actuators(namespace, definition.executor)
            .await?;
        if candidates.is_empty() {
            return Err(ActuatorError::NoMatch {
                kind: definition.executor.to_string(),
                namespace: namespace.to_string(),
            }
            .into());
        }

        let recorded: Vec<String> = task.extra.actuator_tag.clone().into_iter().collect();
        let sources: [&[String]; 3] = [&definition.tags, pipeline_tags, &recorded];
        for tags in sources {
            if tags.is_empty() {
                continue;
            }
            for tag in tags {
                if let Some(found) = candidates.iter().find(|c| c.has_tag(tag)) {
                    debug!(task = %task.alias, tag = %tag, actuator = %found.name, "actuator selected by tag");
                    return Ok(Selection {
                        definition: found.clone(),
                        tag: Some(tag.clone()),
                    });
                }
            }
        }

        if sources.iter().all(|tags| tags.is_empty()) {
            return Ok(Selection {
                definition: candidates[0].clone(),
                tag: None,
            });
        }
        Err(ActuatorError::NoMatch {
            kind: definition.executor.to_string(),
            namespace: namespace.to_string(),
        }
        .into())
    }

    /// Resolve a connected client for a definition, caching per definition id
    pub async fn client_for(&self, definition: &ActuatorDefinition) -> Result<Arc<dyn Actuator>> {
        if let Some(client) = self.cache.get(&definition.id) {
            return Ok(client);
        }
        let client = match &definition.tunnel_id {
            Some(tunnel_id) => self.dial_tunneled(definition, tunnel_id).await?,
            None => self.factory.connect(definition).await?,
        };
        self.cache.insert(definition.id, Arc::clone(&client));
        Ok(client)
    }

    /// Tunnel dialing with bounded retry; failing all attempts is a hard
    /// dispatch error.
    async fn dial_tunneled(
        &self,
        definition: &ActuatorDefinition,
        tunnel_id: &str,
    ) -> Result<Arc<dyn Actuator>> {
        for attempt in 1..=self.dialer_retry_attempts {
            match self.factory.connect_tunneled(definition, tunnel_id).await {
                Ok(client) => return Ok(client),
                Err(err) => {
                    warn!(
                        tunnel = %tunnel_id,
                        attempt,
                        error = %err,
                        "tunnel dial attempt failed"
                    );
                    if attempt < self.dialer_retry_attempts {
                        tokio::time::sleep(self.dialer_retry_delay).await;
                    }
                }
            }
        }
        Err(EngineError::Actuator(ActuatorError::DialerUnavailable {
            tunnel_id: tunnel_id.to_string(),
            attempts: self.dialer_retry_attempts,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::contract::Job;
    use crate::models::ExecutorKind;
    use crate::state_machine::TaskStatus;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopActuator;

    #[async_trait]
    impl Actuator for NoopActuator {
        async fn create(&self, job: &Job) -> std::result::Result<Job, ActuatorError> {
            Ok(job.clone())
        }
        async fn start(&self, _job: &Job) -> std::result::Result<(), ActuatorError> {
            Ok(())
        }
        async fn status(&self, _job: &Job) -> std::result::Result<TaskStatus, ActuatorError> {
            Ok(TaskStatus::Success)
        }
        async fn cancel(&self, _job: &Job) -> std::result::Result<(), ActuatorError> {
            Ok(())
        }
        async fn exist(&self, _job: &Job) -> std::result::Result<bool, ActuatorError> {
            Ok(true)
        }
        async fn remove(&self, _job: &Job) -> std::result::Result<(), ActuatorError> {
            Ok(())
        }
    }

    struct CountingFactory {
        connects: AtomicUsize,
        tunnel_failures_before_success: usize,
        tunnel_attempts: AtomicUsize,
    }

    impl CountingFactory {
        fn new(tunnel_failures_before_success: usize) -> Self {
            Self {
                connects: AtomicUsize::new(0),
                tunnel_failures_before_success,
                tunnel_attempts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ActuatorFactory for CountingFactory {
        async fn connect(
            &self,
            _definition: &ActuatorDefinition,
        ) -> std::result::Result<Arc<dyn Actuator>, ActuatorError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NoopActuator))
        }

        async fn connect_tunneled(
            &self,
            _definition: &ActuatorDefinition,
            tunnel_id: &str,
        ) -> std::result::Result<Arc<dyn Actuator>, ActuatorError> {
            let attempt = self.tunnel_attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.tunnel_failures_before_success {
                Err(ActuatorError::transport(format!("{tunnel_id} unreachable")))
            } else {
                Ok(Arc::new(NoopActuator))
            }
        }
    }

    fn selector_with(
        store: Arc<MemoryStore>,
        factory: Arc<CountingFactory>,
    ) -> ActuatorSelector {
        let mut config = EngineConfig::default();
        config.dialer_retry_attempts = 3;
        config.dialer_retry_delay_seconds = 0;
        config.actuator_cache_capacity = 2;
        ActuatorSelector::new(store, factory, &config)
    }

    fn container_task(alias: &str) -> (Task, TaskDef) {
        let task = Task::new(Uuid::new_v4(), Uuid::nil(), alias);
        let def = TaskDef {
            alias: alias.to_string(),
            needs: vec!["root".to_string()],
            executor: ExecutorKind::Container,
            image: "busybox".to_string(),
            commands: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            contexts: Vec::new(),
            tags: Vec::new(),
            timeout_seconds: None,
        };
        (task, def)
    }

    #[tokio::test]
    async fn task_tags_take_precedence_over_pipeline_tags() {
        let store = Arc::new(MemoryStore::new());
        store.put_actuator(
            ActuatorDefinition::new("a", ExecutorKind::Container, "ns", "grpc://a")
                .with_tags(vec!["gpu".to_string()]),
        );
        store.put_actuator(
            ActuatorDefinition::new("b", ExecutorKind::Container, "ns", "grpc://b")
                .with_tags(vec!["cheap".to_string()]),
        );

        let selector = selector_with(store, Arc::new(CountingFactory::new(0)));
        let (task, mut def) = container_task("build");
        def.tags = vec!["cheap".to_string()];
        let chosen = selector
            .select(&task, &def, &["gpu".to_string()], "ns")
            .await
            .unwrap();
        assert_eq!(chosen.definition.name, "b");
        assert_eq!(chosen.tag.as_deref(), Some("cheap"));
    }

    #[tokio::test]
    async fn recorded_tag_is_used_when_definition_tags_do_not_match() {
        let store = Arc::new(MemoryStore::new());
        store.put_actuator(
            ActuatorDefinition::new("a", ExecutorKind::Container, "ns", "grpc://a")
                .with_tags(vec!["edge".to_string()]),
        );
        let selector = selector_with(store, Arc::new(CountingFactory::new(0)));
        let (mut task, def) = container_task("build");
        task.extra.actuator_tag = Some("edge".to_string());
        let chosen = selector.select(&task, &def, &[], "ns").await.unwrap();
        assert_eq!(chosen.definition.name, "a");
    }

    #[tokio::test]
    async fn no_candidates_is_a_dispatch_error() {
        let store = Arc::new(MemoryStore::new());
        let selector = selector_with(store, Arc::new(CountingFactory::new(0)));
        let (task, def) = container_task("build");
        assert!(selector.select(&task, &def, &[], "ns").await.is_err());
    }

    #[tokio::test]
    async fn clients_are_cached_per_definition() {
        let store = Arc::new(MemoryStore::new());
        let factory = Arc::new(CountingFactory::new(0));
        let selector = selector_with(store, Arc::clone(&factory));
        let definition =
            ActuatorDefinition::new("a", ExecutorKind::Container, "ns", "grpc://a");
        selector.client_for(&definition).await.unwrap();
        selector.client_for(&definition).await.unwrap();
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tunnel_dial_retries_until_the_dialer_appears() {
        let store = Arc::new(MemoryStore::new());
        let factory = Arc::new(CountingFactory::new(2));
        let selector = selector_with(store, Arc::clone(&factory));
        let definition = ActuatorDefinition::new("a", ExecutorKind::Container, "ns", "grpc://a")
            .with_tunnel("edge-1");
        selector.client_for(&definition).await.unwrap();
        assert_eq!(factory.tunnel_attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn tunnel_dial_gives_up_after_bounded_attempts() {
        let store = Arc::new(MemoryStore::new());
        let factory = Arc::new(CountingFactory::new(usize::MAX));
        let selector = selector_with(store, Arc::clone(&factory));
        let definition = ActuatorDefinition::new("a", ExecutorKind::Container, "ns", "grpc://a")
            .with_tunnel("edge-1");
        let err = selector.client_for(&definition).await.err().unwrap();
        assert!(err.to_string().contains("after 3 attempts"));
    }
}
