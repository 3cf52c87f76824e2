//! Process-wide owner of the registry, bus, store and coordinator.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tumbler_core::definition::Definition;
use tumbler_core::error::CoreError;
use tumbler_events::EventBus;

use crate::catalog::{self, CatalogError};
use crate::config::TrackerConfig;
use crate::coordinator::SubmissionCoordinator;
use crate::registry::PathRegistry;
use crate::runner::JobRunner;
use crate::store::{ExecutionStore, RetentionPolicy};

pub struct Tracker {
    config: TrackerConfig,
    registry: Arc<PathRegistry>,
    bus: Arc<EventBus>,
    store: Arc<ExecutionStore>,
    coordinator: SubmissionCoordinator,
}

impl Tracker {
    /// Tracker with an empty registry.
    pub fn new(config: TrackerConfig, runner: Arc<dyn JobRunner>) -> Self {
        Self::with_registry(config, PathRegistry::new(), runner)
    }

    pub fn with_registry(
        config: TrackerConfig,
        registry: PathRegistry,
        runner: Arc<dyn JobRunner>,
    ) -> Self {
        let registry = Arc::new(registry);
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(
            ExecutionStore::new(Arc::clone(&bus)).with_output_limit(config.max_output_events),
        );
        let coordinator = SubmissionCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            runner,
            config.runner_timeout(),
        );
        Self {
            config,
            registry,
            bus,
            store,
            coordinator,
        }
    }

    /// Replace the registry contents with the catalog under `home`.
    ///
    /// Returns the number of definitions loaded.
    pub async fn load_catalog(&self, home: &Path) -> Result<usize, CatalogError> {
        let home = home.to_path_buf();
        let definitions = tokio::task::spawn_blocking(move || catalog::load_dir(&home))
            .await
            .map_err(|e| CatalogError::Task(e.to_string()))??;

        Ok(self.registry.replace_all(definitions).await?)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PathRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<ExecutionStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &SubmissionCoordinator {
        &self.coordinator
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        self.config.retention_policy()
    }

    /// Run one retention sweep now.
    pub async fn evict_expired(&self) -> usize {
        self.store
            .evict(&self.retention_policy(), chrono::Utc::now())
            .await
    }

    pub async fn shutdown(&self, grace: Duration) {
        self.coordinator.shutdown(grace).await;
    }

    /// Register a definition at runtime.
    pub async fn register(&self, definition: Definition) -> Result<(), CoreError> {
        self.registry.register(definition).await
    }
}
