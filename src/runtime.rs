//! Composition root.
//!
//! Registers the core components in dependency order (event bus, memory,
//! model manager, orchestrator), resolves them once through the container,
//! and owns their start and shutdown sequence.

use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::bus::{topics, EventBus};
use crate::config::{Config, ConfigError};
use crate::container::{Container, ContainerError, Resolver, Scope};
use crate::memory::{MemoryError, MemoryStore, SqliteMemory};
use crate::models::{BackendRegistry, ModelError, ModelManager};
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::shutdown::ShutdownResult;

/// Component keys accepted in the `[components]` config table.
pub const CORE_COMPONENTS: &[&str] = &["event_bus", "memory", "models", "orchestrator"];

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("Component '{component}' must be a singleton, configured as {scope:?}")]
    InvalidScope { component: String, scope: Scope },
}

/// Replacements for the default component implementations.
#[derive(Default)]
pub struct RuntimeOverrides {
    pub memory: Option<Arc<dyn MemoryStore>>,
    pub backends: Option<BackendRegistry>,
}

/// The assembled agent runtime.
pub struct Runtime {
    config: Config,
    container: Container,
    bus: EventBus,
    memory: Arc<dyn MemoryStore>,
    models: ModelManager,
    orchestrator: Orchestrator,
}

fn announce(resolver: &Resolver, bus: &EventBus, component: &str) {
    bus.publish(
        topics::COMPONENT_READY,
        json!({ "component": component, "resolved_via": resolver.chain() }),
    );
}

impl Runtime {
    pub async fn build(config: Config) -> Result<Self, RuntimeError> {
        Self::build_with(config, RuntimeOverrides::default()).await
    }

    pub async fn build_with(config: Config, overrides: RuntimeOverrides) -> Result<Self, RuntimeError> {
        validate_components(&config)?;
        let container = Container::new();

        container.register_instance(EventBus::new())?;

        let memory_path = config.memory_path.clone();
        let memory_override = overrides.memory;
        container.register::<Arc<dyn MemoryStore>, _, _>(Scope::Singleton, move |resolver| {
            let path = memory_path.clone();
            let preset = memory_override.clone();
            async move {
                let bus: EventBus = resolver.resolve().await?;
                let memory: Arc<dyn MemoryStore> = match preset {
                    Some(memory) => memory,
                    None => Arc::new(SqliteMemory::open(&path).await.map_err(ContainerError::factory)?),
                };
                announce(&resolver, &bus, "memory");
                Ok(memory)
            }
        })?;

        let models_config = config.models.clone();
        let backends = overrides.backends.unwrap_or_default();
        container.register::<ModelManager, _, _>(Scope::Singleton, move |resolver| {
            let models_config = models_config.clone();
            let backends = backends.clone();
            async move {
                let bus: EventBus = resolver.resolve().await?;
                let manager = ModelManager::new(models_config, bus.clone(), backends);
                announce(&resolver, &bus, "models");
                Ok(manager)
            }
        })?;

        let orchestrator_config = config.orchestrator.clone();
        container.register::<Orchestrator, _, _>(Scope::Singleton, move |resolver| {
            let orchestrator_config = orchestrator_config.clone();
            async move {
                let bus: EventBus = resolver.resolve().await?;
                let memory: Arc<dyn MemoryStore> = resolver.resolve().await?;
                let models: ModelManager = resolver.resolve().await?;
                let orchestrator = Orchestrator::new(orchestrator_config, bus.clone(), memory, models);
                announce(&resolver, &bus, "orchestrator");
                Ok(orchestrator)
            }
        })?;

        let bus: EventBus = container.resolve().await?;
        let memory: Arc<dyn MemoryStore> = container.resolve().await?;
        let models: ModelManager = container.resolve().await?;
        let orchestrator: Orchestrator = container.resolve().await?;
        info!(
            memory = %config.memory_path.display(),
            models = %config.models.models_dir.display(),
            "Runtime assembled"
        );

        Ok(Self { config, container, bus, memory, models, orchestrator })
    }

    /// Discover models and start the orchestrator.
    ///
    /// A missing models directory is logged and leaves the model set empty.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        match self.models.discover().await {
            Ok(found) => info!(count = found.len(), "Models discovered"),
            Err(e) => warn!(error = %e, "Model discovery failed, continuing with no models"),
        }
        self.orchestrator.start()?;
        Ok(())
    }

    /// Stop the orchestrator, unload models, close the bus and release
    /// every singleton.
    pub async fn shutdown(&self) -> ShutdownResult {
        let result = self.orchestrator.shutdown().await;
        self.models.shutdown().await;
        self.bus.shutdown();
        self.container.clear();
        info!(?result, "Runtime shut down");
        result
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn memory(&self) -> &Arc<dyn MemoryStore> {
        &self.memory
    }

    pub fn models(&self) -> &ModelManager {
        &self.models
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }
}

/// Core components share one instance each; only unknown keys may differ.
pub fn validate_components(config: &Config) -> Result<(), RuntimeError> {
    for (component, entry) in &config.components {
        if !CORE_COMPONENTS.contains(&component.as_str()) {
            warn!(component = %component, "Ignoring unknown component in config");
            continue;
        }
        if entry.scope != Scope::Singleton {
            return Err(RuntimeError::InvalidScope {
                component: component.clone(),
                scope: entry.scope,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ComponentConfig;

    #[test]
    fn test_transient_core_component_rejected() {
        let mut config = Config::default();
        config
            .components
            .insert("memory".into(), ComponentConfig { scope: Scope::Transient });
        assert!(matches!(
            validate_components(&config),
            Err(RuntimeError::InvalidScope { .. })
        ));
    }

    #[test]
    fn test_unknown_component_ignored() {
        let mut config = Config::default();
        config
            .components
            .insert("plugin_market".into(), ComponentConfig { scope: Scope::Transient });
        assert!(validate_components(&config).is_ok());
    }
}
