//! Locator configuration.
//!
//! [`LocatorConfig`] picks the directory backend and the placement strategy
//! per actor type. It can be built in code with [`LocatorConfig::builder`]
//! or parsed from JSON with [`LocatorConfig::from_json_str`]; missing
//! fields take their defaults.
//!
//! # Example
//!
//! ```rust
//! use grainroute::{ActorType, DirectoryBackendKind, LocatorConfig, PlacementStrategy};
//!
//! let config = LocatorConfig::builder()
//!     .directory(DirectoryBackendKind::InMemory)
//!     .placement(ActorType(0x504C_4159), PlacementStrategy::HashBased)
//!     .build()
//!     .expect("valid config");
//! assert_eq!(config.max_unregister_batch, 100);
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::NodeAddress;
use crate::catalog::ActivationCatalog;
use crate::directory::{ConditionalStore, DirectoryService, InMemoryDirectory, KeyValueDirectory};
use crate::locator::CachedLocator;
use crate::membership::MembershipSnapshot;
use crate::placement::{PlacementRegistry, PlacementStrategy};
use crate::types::ActorType;

const DEFAULT_MAX_UNREGISTER_BATCH: usize = 100;
const DEFAULT_RECONCILE_RETRY_MS: u64 = 1_000;

/// Errors from configuration validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `max_unregister_batch` was zero.
    #[error("max_unregister_batch must be greater than zero")]
    InvalidBatchSize,

    /// A stateless worker strategy allowed zero local activations.
    #[error("stateless worker strategy for {actor_type} must allow at least one activation")]
    InvalidWorkerLimit {
        /// The offending actor type.
        actor_type: ActorType,
    },

    /// The default strategy was a stateless worker with no local activation.
    #[error("default stateless worker strategy must allow at least one activation")]
    InvalidDefaultWorkerLimit,

    /// The same actor type was configured twice.
    #[error("placement for {actor_type} configured more than once")]
    DuplicatePlacement {
        /// The repeated actor type.
        actor_type: ActorType,
    },

    /// The key-value backend was selected without a store.
    #[error("key-value directory selected but no store was provided")]
    MissingStore,

    /// The configuration text could not be parsed.
    #[error("invalid locator config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Which directory backend to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryBackendKind {
    /// [`InMemoryDirectory`]: single process, supports bulk node removal.
    #[default]
    InMemory,
    /// [`KeyValueDirectory`] over an external [`ConditionalStore`].
    KeyValue,
}

/// Configuration for one node's locator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    /// Directory backend selected at startup.
    pub directory: DirectoryBackendKind,
    /// Largest batch for bulk unregisters; backends may lower it further.
    pub max_unregister_batch: usize,
    /// Delay before retrying a failed reconciliation pass, in milliseconds.
    pub reconcile_retry_ms: u64,
    /// Strategy for actor types without an override.
    pub default_placement: PlacementStrategy,
    /// Per-type strategy overrides.
    pub placements: Vec<(ActorType, PlacementStrategy)>,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            directory: DirectoryBackendKind::default(),
            max_unregister_batch: DEFAULT_MAX_UNREGISTER_BATCH,
            reconcile_retry_ms: DEFAULT_RECONCILE_RETRY_MS,
            default_placement: PlacementStrategy::default(),
            placements: Vec::new(),
        }
    }
}

impl LocatorConfig {
    /// Start building a configuration.
    pub fn builder() -> LocatorConfigBuilder {
        LocatorConfigBuilder::default()
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for inconsistent values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_unregister_batch == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        if matches!(
            self.default_placement,
            PlacementStrategy::StatelessWorker { max_local: 0 }
        ) {
            return Err(ConfigError::InvalidDefaultWorkerLimit);
        }
        let mut seen = HashSet::new();
        for (actor_type, strategy) in &self.placements {
            if !seen.insert(*actor_type) {
                return Err(ConfigError::DuplicatePlacement {
                    actor_type: *actor_type,
                });
            }
            if matches!(strategy, PlacementStrategy::StatelessWorker { max_local: 0 }) {
                return Err(ConfigError::InvalidWorkerLimit {
                    actor_type: *actor_type,
                });
            }
        }
        Ok(())
    }

    /// Delay before retrying a failed reconciliation pass.
    pub fn reconcile_retry(&self) -> Duration {
        Duration::from_millis(self.reconcile_retry_ms)
    }

    /// Placement registry described by this configuration.
    pub fn placement_registry(&self) -> PlacementRegistry {
        self.placements.iter().fold(
            PlacementRegistry::new(self.default_placement.clone()),
            |registry, (actor_type, strategy)| registry.with_strategy(*actor_type, strategy.clone()),
        )
    }

    /// Start the configured directory backend.
    ///
    /// `store` is required for [`DirectoryBackendKind::KeyValue`] and
    /// ignored otherwise.
    pub fn build_directory(
        &self,
        store: Option<Arc<dyn ConditionalStore>>,
    ) -> Result<DirectoryService, ConfigError> {
        let service = match self.directory {
            DirectoryBackendKind::InMemory => {
                if store.is_some() {
                    tracing::warn!("Config: in-memory directory selected, ignoring provided store");
                }
                DirectoryService::new(Arc::new(InMemoryDirectory::new()))
            }
            DirectoryBackendKind::KeyValue => {
                let store = store.ok_or(ConfigError::MissingStore)?;
                DirectoryService::new(Arc::new(KeyValueDirectory::new(store)))
            }
        };
        let service = service.with_max_batch(self.max_unregister_batch);
        tracing::info!(
            backend = ?self.directory,
            max_batch = service.max_batch(),
            bulk_node_removal = service.capabilities().supports_bulk_node_removal,
            "Config: directory started"
        );
        Ok(service)
    }

    /// Build a locator for `local` over `directory`.
    pub fn build_locator(
        &self,
        local: NodeAddress,
        catalog: Arc<ActivationCatalog>,
        directory: DirectoryService,
        snapshot: Arc<MembershipSnapshot>,
    ) -> CachedLocator {
        CachedLocator::new(local, catalog, directory, self.placement_registry(), snapshot)
    }
}

/// Builder for [`LocatorConfig`].
#[derive(Debug, Clone, Default)]
pub struct LocatorConfigBuilder {
    config: LocatorConfig,
}

impl LocatorConfigBuilder {
    /// Select the directory backend.
    pub fn directory(mut self, kind: DirectoryBackendKind) -> Self {
        self.config.directory = kind;
        self
    }

    /// Set the bulk unregister batch size.
    pub fn max_unregister_batch(mut self, max: usize) -> Self {
        self.config.max_unregister_batch = max;
        self
    }

    /// Set the reconciliation retry delay.
    pub fn reconcile_retry(mut self, delay: Duration) -> Self {
        self.config.reconcile_retry_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the strategy used by types without an override.
    pub fn default_placement(mut self, strategy: PlacementStrategy) -> Self {
        self.config.default_placement = strategy;
        self
    }

    /// Override the strategy for one actor type.
    pub fn placement(mut self, actor_type: ActorType, strategy: PlacementStrategy) -> Self {
        self.config.placements.push((actor_type, strategy));
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<LocatorConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
