//! Cached locator: the entry point for finding and registering actors.
//!
//! The locator is a read-through cache over the [`DirectoryService`],
//! consulted after the node's own [`ActivationCatalog`]. Every cache hit is
//! checked against the current membership snapshot, so a record pointing
//! at a dead node is never handed out even before reconciliation evicts it.
//!
//! # Resolve
//!
//! ```text
//! resolve(id)
//!   ├─ catalog.find_local(id)      → local node
//!   ├─ cache[id], node not dead    → cached node
//!   └─ directory.lookup(id)
//!        ├─ node alive             → cache it, return node
//!        ├─ node dead              → best-effort unregister, NotFound
//!        └─ absent                 → NotFound (caller places + registers)
//! ```
//!
//! # Register
//!
//! The directory's first accepted writer wins. The locator only reports
//! whether the caller won; tearing down a losing activation is up to the
//! caller.
//!
//! # Membership reconciliation
//!
//! [`CachedLocator::apply_membership`] evicts cache entries of newly dead
//! nodes and purges them from the directory, falling back to per-record
//! unregisters when the backend has no bulk removal. The applied version
//! only advances once that work succeeded, so a failed pass is redone on the
//! next snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;

use crate::address::NodeAddress;
use crate::catalog::{ActivationCatalog, ActivationMode};
use crate::directory::{BatchOutcome, BulkRemoval, DirectoryError, DirectoryService};
use crate::membership::{MembershipSnapshot, MembershipVersion};
use crate::placement::{choose_node, PlacementError, PlacementRegistry, PlacementStrategy};
use crate::types::{ActivationRecord, ActorId};

/// How many times `register` replaces a winner hosted on a dead node.
const MAX_DEAD_WINNER_RETRIES: usize = 2;

/// Errors surfaced by the locator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocatorError {
    /// No live activation is known; the caller should place one.
    #[error("actor {id} not found")]
    NotFound {
        /// The actor that was looked up.
        id: ActorId,
    },

    /// The directory failed.
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// Placement failed.
    #[error(transparent)]
    Placement(#[from] PlacementError),
}

impl LocatorError {
    /// True if the actor simply has no activation yet.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Directory(e) if e.is_transient())
    }
}

/// Result of [`CachedLocator::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationOutcome {
    /// The record now held by the directory.
    pub record: ActivationRecord,
    /// Whether the caller's activation is the one the directory kept.
    ///
    /// When `false` the caller's activation is a duplicate and must be
    /// deactivated; calls go to `record` instead.
    pub won_race: bool,
}

/// Why an activation is being unregistered. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisterCause {
    /// The activation deactivated normally.
    Deactivation,
    /// The hosting node was declared dead.
    NodeDead,
    /// The activation lost a registration race.
    Duplicate,
    /// The local node is shutting down.
    Shutdown,
}

impl std::fmt::Display for UnregisterCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deactivation => write!(f, "deactivation"),
            Self::NodeDead => write!(f, "node-dead"),
            Self::Duplicate => write!(f, "duplicate"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Result of [`CachedLocator::apply_membership`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// The snapshot was applied.
    Applied {
        /// Version now recorded as applied.
        version: MembershipVersion,
        /// Nodes that became dead since the previous applied snapshot.
        dead_nodes: Vec<NodeAddress>,
        /// Cache entries evicted.
        evicted: usize,
    },
    /// The snapshot was not newer than the applied one; nothing was done.
    Stale {
        /// Version of the rejected snapshot.
        offered: MembershipVersion,
        /// Version already applied.
        applied: MembershipVersion,
    },
}

/// Reconciliation state, guarded by one async mutex so passes never overlap.
#[derive(Debug)]
struct Applied {
    snapshot: Arc<MembershipSnapshot>,
    /// Per-record unregisters that failed on an earlier pass.
    pending: Vec<ActivationRecord>,
}

/// Read-through actor location cache for one node.
///
/// # Example
///
/// ```rust,ignore
/// let locator = CachedLocator::new(local, catalog, directory, placements, snapshot);
///
/// match locator.resolve(&id).await {
///     Ok(node) => send_to(node),
///     Err(e) if e.is_not_found() => {
///         let node = locator.place(&id, &snapshot.active_members(), &mut rng)?;
///         let record = activate_on(node, &id).await?;
///         let outcome = locator.register(record).await?;
///         if !outcome.won_race {
///             deactivate_duplicate().await;
///         }
///     }
///     Err(e) => return Err(e),
/// }
/// ```
#[derive(Debug)]
pub struct CachedLocator {
    local: NodeAddress,
    catalog: Arc<ActivationCatalog>,
    directory: DirectoryService,
    placements: PlacementRegistry,
    cache: DashMap<ActorId, ActivationRecord>,
    current: RwLock<Arc<MembershipSnapshot>>,
    applied: tokio::sync::Mutex<Applied>,
    last_applied_version: AtomicU64,
}

impl CachedLocator {
    /// Create a locator for `local`, starting from `snapshot`.
    ///
    /// `snapshot` counts as already applied.
    pub fn new(
        local: NodeAddress,
        catalog: Arc<ActivationCatalog>,
        directory: DirectoryService,
        placements: PlacementRegistry,
        snapshot: Arc<MembershipSnapshot>,
    ) -> Self {
        let version = snapshot.version;
        Self {
            local,
            catalog,
            directory,
            placements,
            cache: DashMap::new(),
            current: RwLock::new(snapshot.clone()),
            applied: tokio::sync::Mutex::new(Applied {
                snapshot,
                pending: Vec::new(),
            }),
            last_applied_version: AtomicU64::new(version.0),
        }
    }

    /// This node's address.
    pub fn local_node(&self) -> &NodeAddress {
        &self.local
    }

    /// The local activation catalog.
    pub fn catalog(&self) -> &Arc<ActivationCatalog> {
        &self.catalog
    }

    /// The directory service.
    pub fn directory(&self) -> &DirectoryService {
        &self.directory
    }

    /// Placement strategy configured for the actor's type.
    pub fn strategy_for(&self, id: &ActorId) -> &PlacementStrategy {
        self.placements.strategy_for(id.actor_type)
    }

    /// Latest membership snapshot seen.
    pub fn current_snapshot(&self) -> Arc<MembershipSnapshot> {
        self.current.read().clone()
    }

    /// Version of the last fully reconciled snapshot.
    pub fn last_applied_version(&self) -> MembershipVersion {
        MembershipVersion(self.last_applied_version.load(Ordering::Acquire))
    }

    /// Number of cached records.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    /// The cached record for `id`, if any.
    pub fn cached(&self, id: &ActorId) -> Option<ActivationRecord> {
        self.cache.get(id).map(|e| e.value().clone())
    }

    /// Adopt `snapshot` for liveness checks if it is newer than the current one.
    ///
    /// Does not reconcile. Returns `true` if the snapshot was adopted.
    pub fn observe_snapshot(&self, snapshot: Arc<MembershipSnapshot>) -> bool {
        let mut current = self.current.write();
        if snapshot.version > current.version {
            *current = snapshot;
            true
        } else {
            false
        }
    }

    /// Find the node hosting `id`.
    ///
    /// # Errors
    ///
    /// - [`LocatorError::NotFound`] when no live activation is known.
    /// - [`LocatorError::Directory`] when the directory is unavailable.
    pub async fn resolve(&self, id: &ActorId) -> Result<NodeAddress, LocatorError> {
        if self.catalog.find_local(id).is_some() {
            return Ok(self.local.clone());
        }

        if let Some(cached) = self.cached(id) {
            if !self.current_snapshot().is_dead(&cached.node) {
                tracing::debug!(actor_id = %id, node = %cached.node, "Locator: cache hit");
                return Ok(cached.node);
            }
            self.cache.remove_if(id, |_, r| *r == cached);
        }

        tracing::debug!(actor_id = %id, "Locator: cache miss");
        let Some(record) = self.directory.lookup(id).await? else {
            return Err(LocatorError::NotFound { id: id.clone() });
        };

        if self.current_snapshot().is_dead(&record.node) {
            tracing::warn!(
                actor_id = %id,
                node = %record.node,
                "Locator: directory entry points at dead node, removing"
            );
            if let Err(e) = self.directory.unregister(&record).await {
                tracing::warn!(actor_id = %id, error = %e, "Locator: lazy cleanup failed");
            }
            return Err(LocatorError::NotFound { id: id.clone() });
        }

        self.cache.insert(id.clone(), record.clone());
        Ok(record.node)
    }

    /// Choose a node for a new activation of `id`.
    ///
    /// Uses the strategy configured for the actor's type, the current
    /// snapshot and this node as the local candidate.
    pub fn place<R: Rng + ?Sized>(
        &self,
        id: &ActorId,
        compatible: &[NodeAddress],
        rng: &mut R,
    ) -> Result<NodeAddress, LocatorError> {
        let snapshot = self.current_snapshot();
        let node = choose_node(
            self.strategy_for(id),
            id,
            &snapshot,
            compatible,
            &self.local,
            rng,
        )?;
        Ok(node)
    }

    /// Register a freshly created activation.
    ///
    /// If the directory already holds an activation on a node the current
    /// snapshot considers dead, that entry is removed and registration is
    /// retried.
    ///
    /// # Errors
    ///
    /// Directory failures propagate; the cache is left untouched.
    pub async fn register(
        &self,
        record: ActivationRecord,
    ) -> Result<RegistrationOutcome, LocatorError> {
        let mut stored = self.directory.register(record.clone()).await?;

        for _ in 0..MAX_DEAD_WINNER_RETRIES {
            if stored.same_activation(&record) || !self.current_snapshot().is_dead(&stored.node) {
                break;
            }
            tracing::warn!(
                actor_id = %record.actor_id,
                node = %stored.node,
                "Locator: replacing registration on dead node"
            );
            self.directory.unregister(&stored).await?;
            stored = self.directory.register(record.clone()).await?;
        }

        let won_race = stored.same_activation(&record);
        tracing::info!(
            actor_id = %record.actor_id,
            node = %stored.node,
            activation = %stored.activation_id,
            won_race,
            "Locator: registered"
        );
        self.cache.insert(stored.actor_id.clone(), stored.clone());
        Ok(RegistrationOutcome {
            record: stored,
            won_race,
        })
    }

    /// Remove an activation from the directory and the cache.
    pub async fn unregister(
        &self,
        record: &ActivationRecord,
        cause: UnregisterCause,
    ) -> Result<(), LocatorError> {
        self.directory.unregister(record).await?;
        self.cache
            .remove_if(&record.actor_id, |_, cached| cached.same_activation(record));
        tracing::info!(
            actor_id = %record.actor_id,
            activation = %record.activation_id,
            cause = %cause,
            "Locator: unregistered"
        );
        Ok(())
    }

    /// Drop the cache entry for `record.actor_id` if it still equals `record`.
    ///
    /// Returns `true` if an entry was dropped.
    pub fn invalidate(&self, record: &ActivationRecord) -> bool {
        let removed = self
            .cache
            .remove_if(&record.actor_id, |_, cached| cached == record)
            .is_some();
        if removed {
            tracing::debug!(actor_id = %record.actor_id, "Locator: invalidated cache entry");
        }
        removed
    }

    /// Drain the local catalog and unregister every drained activation.
    ///
    /// Stateless workers are dropped from the catalog without touching the
    /// directory, since they were never registered.
    pub async fn unregister_local_activations(&self, cause: UnregisterCause) -> BatchOutcome {
        let records: Vec<ActivationRecord> = self
            .catalog
            .drain()
            .into_iter()
            .filter(|h| h.mode == ActivationMode::Single)
            .map(|h| h.record())
            .collect();

        let outcome = self.directory.unregister_many(&records).await;
        for record in &records {
            self.cache
                .remove_if(&record.actor_id, |_, cached| cached.same_activation(record));
        }
        tracing::info!(
            attempted = outcome.attempted,
            failed = outcome.failures.len(),
            cause = %cause,
            "Locator: unregistered local activations"
        );
        outcome
    }

    /// Reconcile the cache and directory with a new membership snapshot.
    ///
    /// # Errors
    ///
    /// Returns the directory error that interrupted the pass. The applied
    /// version is not advanced and the next snapshot redoes the work.
    pub async fn apply_membership(
        &self,
        snapshot: Arc<MembershipSnapshot>,
    ) -> Result<Reconciliation, LocatorError> {
        let mut applied = self.applied.lock().await;
        if snapshot.version <= applied.snapshot.version {
            tracing::warn!(
                offered = %snapshot.version,
                applied = %applied.snapshot.version,
                "Locator: ignoring stale membership snapshot"
            );
            return Ok(Reconciliation::Stale {
                offered: snapshot.version,
                applied: applied.snapshot.version,
            });
        }

        self.observe_snapshot(snapshot.clone());
        let dead_nodes = snapshot.newly_dead_since(&applied.snapshot);

        let mut evicted = Vec::new();
        if !dead_nodes.is_empty() {
            self.cache.retain(|_, record| {
                if dead_nodes.contains(&record.node) {
                    evicted.push(record.clone());
                    false
                } else {
                    true
                }
            });
        }
        let evicted_count = evicted.len();

        let mut leftovers = std::mem::take(&mut applied.pending);
        if !dead_nodes.is_empty() {
            match self.directory.unregister_nodes(&dead_nodes).await {
                Ok(BulkRemoval::Removed(_)) => {}
                Ok(BulkRemoval::Unsupported) => leftovers.extend(evicted),
                Err(e) => {
                    tracing::error!(
                        version = %snapshot.version,
                        error = %e,
                        "Locator: bulk removal of dead nodes failed"
                    );
                    applied.pending = leftovers;
                    return Err(e.into());
                }
            }
        }

        if !leftovers.is_empty() {
            let outcome = self.directory.unregister_many(&leftovers).await;
            if let Some((_, first)) = outcome.failures.first() {
                let error = first.clone();
                tracing::error!(
                    version = %snapshot.version,
                    failed = outcome.failures.len(),
                    "Locator: per-record cleanup of dead nodes incomplete"
                );
                applied.pending = outcome.failures.into_iter().map(|(r, _)| r).collect();
                return Err(error.into());
            }
        }

        applied.snapshot = snapshot.clone();
        self.last_applied_version
            .store(snapshot.version.0, Ordering::Release);
        tracing::info!(
            version = %snapshot.version,
            dead_nodes = dead_nodes.len(),
            evicted = evicted_count,
            "Locator: applied membership snapshot"
        );
        Ok(Reconciliation::Applied {
            version: snapshot.version,
            dead_nodes,
            evicted: evicted_count,
        })
    }
}
