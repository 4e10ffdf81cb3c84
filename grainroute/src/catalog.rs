//! Local activation catalog: which activations this node hosts right now.
//!
//! The catalog is the node's own source of truth for "am I hosting this
//! actor". The locator consults it before touching its cache or the
//! directory, so calls for locally hosted actors never leave the process.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ ActivationCatalog                            │
//! │                                              │
//! │  by_actor:      ActorId → [ActivationHandle] │  (one entry, or up to
//! │                                              │   max_local workers)
//! │  by_activation: ActivationId → ActorId       │  (secondary index)
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Both maps are sharded. Writers lock `by_actor` before `by_activation`,
//! never the reverse, and no lock is held across an `.await`.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::address::NodeAddress;
use crate::types::{ActivationId, ActivationRecord, ActorId};

/// How many activations of one actor id a node may host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationMode {
    /// At most one activation per actor id (directory-registered actors).
    #[default]
    Single,
    /// Up to `max_local` independent activations per actor id on this node.
    StatelessWorker {
        /// Per-node cap.
        max_local: usize,
    },
}

/// A live activation hosted by this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationHandle {
    /// Identity of the hosted actor.
    pub actor_id: ActorId,
    /// Identity of this activation.
    pub activation_id: ActivationId,
    /// Node hosting the activation (always the local node).
    pub node: NodeAddress,
    /// Catalog admission rule for this activation.
    pub mode: ActivationMode,
}

impl ActivationHandle {
    /// Create a handle for a freshly created activation.
    pub fn new(
        actor_id: ActorId,
        activation_id: ActivationId,
        node: NodeAddress,
        mode: ActivationMode,
    ) -> Self {
        Self {
            actor_id,
            activation_id,
            node,
            mode,
        }
    }

    /// Directory record describing this activation (no etag yet).
    pub fn record(&self) -> ActivationRecord {
        ActivationRecord::new(self.actor_id.clone(), self.node.clone(), self.activation_id)
    }
}

/// Errors from catalog operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// A single-activation actor already has a local activation.
    #[error("actor {id} already has local activation {existing}, refused {attempted}")]
    DuplicateActivation {
        /// The actor.
        id: ActorId,
        /// Activation already recorded.
        existing: ActivationId,
        /// Activation that was refused.
        attempted: ActivationId,
    },

    /// A stateless worker already has `max_local` local activations.
    #[error("actor {id} already has {max_local} local workers")]
    WorkerLimitReached {
        /// The actor.
        id: ActorId,
        /// The configured cap.
        max_local: usize,
    },
}

/// Per-node registry of live activations.
#[derive(Debug, Default)]
pub struct ActivationCatalog {
    by_actor: DashMap<ActorId, Vec<ActivationHandle>>,
    by_activation: DashMap<ActivationId, ActorId>,
}

impl ActivationCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly created activation.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::DuplicateActivation`] if the handle is `Single` and
    ///   the actor already has a local activation, or if this activation id
    ///   is already recorded under any actor. The existing entry is kept.
    /// - [`CatalogError::WorkerLimitReached`] if a stateless worker is at
    ///   its cap.
    pub fn record_new(&self, handle: ActivationHandle) -> Result<(), CatalogError> {
        match self.by_actor.entry(handle.actor_id.clone()) {
            Entry::Vacant(vacant) => {
                self.index_activation(&handle)?;
                vacant.insert(vec![handle]);
                Ok(())
            }
            Entry::Occupied(mut occupied) => {
                let hosted = occupied.get_mut();
                let conflict = hosted.iter().find(|h| {
                    handle.mode == ActivationMode::Single
                        || h.activation_id == handle.activation_id
                        || h.mode != handle.mode
                });

                if let Some(existing) = conflict.map(|h| h.activation_id) {
                    tracing::error!(
                        actor_id = %handle.actor_id,
                        existing = %existing,
                        attempted = %handle.activation_id,
                        "Catalog: refusing duplicate local activation"
                    );
                    return Err(CatalogError::DuplicateActivation {
                        id: handle.actor_id,
                        existing,
                        attempted: handle.activation_id,
                    });
                }

                if let ActivationMode::StatelessWorker { max_local } = handle.mode {
                    if hosted.len() >= max_local {
                        return Err(CatalogError::WorkerLimitReached {
                            id: handle.actor_id,
                            max_local,
                        });
                    }
                }

                self.index_activation(&handle)?;
                hosted.push(handle);
                Ok(())
            }
        }
    }

    /// Claim `handle.activation_id` in the secondary index.
    ///
    /// Called with the `by_actor` shard already locked. An id indexed under
    /// another actor is refused, so the index never points at the wrong
    /// actor.
    fn index_activation(&self, handle: &ActivationHandle) -> Result<(), CatalogError> {
        match self.by_activation.entry(handle.activation_id) {
            Entry::Vacant(vacant) => {
                vacant.insert(handle.actor_id.clone());
                Ok(())
            }
            Entry::Occupied(occupied) => {
                tracing::error!(
                    actor_id = %handle.actor_id,
                    owner = %occupied.get(),
                    activation_id = %handle.activation_id,
                    "Catalog: activation id already hosted by another actor"
                );
                Err(CatalogError::DuplicateActivation {
                    id: handle.actor_id.clone(),
                    existing: handle.activation_id,
                    attempted: handle.activation_id,
                })
            }
        }
    }

    fn unindex_activation(&self, handle: &ActivationHandle) {
        self.by_activation
            .remove_if(&handle.activation_id, |_, owner| *owner == handle.actor_id);
    }

    /// Remove an activation. Returns `true` if it was present.
    ///
    /// Removing an activation that is already gone is a no-op.
    pub fn remove(&self, handle: &ActivationHandle) -> bool {
        let Entry::Occupied(mut occupied) = self.by_actor.entry(handle.actor_id.clone()) else {
            return false;
        };
        let hosted = occupied.get_mut();
        let before = hosted.len();
        hosted.retain(|h| h.activation_id != handle.activation_id);
        let removed = hosted.len() != before;
        if removed {
            self.unindex_activation(handle);
        }
        if hosted.is_empty() {
            occupied.remove();
        }
        removed
    }

    /// Find a local activation of `actor_id`.
    ///
    /// For stateless workers this returns the oldest local worker.
    pub fn find_local(&self, actor_id: &ActorId) -> Option<ActivationHandle> {
        self.by_actor
            .get(actor_id)
            .and_then(|hosted| hosted.first().cloned())
    }

    /// Find a local activation by its activation id.
    pub fn find_activation(&self, activation_id: &ActivationId) -> Option<ActivationHandle> {
        let actor_id = self.by_activation.get(activation_id)?.clone();
        self.by_actor.get(&actor_id).and_then(|hosted| {
            hosted
                .iter()
                .find(|h| h.activation_id == *activation_id)
                .cloned()
        })
    }

    /// Number of local activations of `actor_id`.
    pub fn count_for(&self, actor_id: &ActorId) -> usize {
        self.by_actor.get(actor_id).map_or(0, |hosted| hosted.len())
    }

    /// Total number of local activations.
    pub fn len(&self) -> usize {
        self.by_actor.iter().map(|entry| entry.value().len()).sum()
    }

    /// True if nothing is hosted locally.
    pub fn is_empty(&self) -> bool {
        self.by_actor.is_empty()
    }

    /// Point-in-time copy of every local activation, for diagnostics.
    ///
    /// Walks one shard at a time, so concurrent `record_new`/`remove` on
    /// other shards proceed. Activations added during the walk may or may
    /// not appear.
    pub fn all_activations(&self) -> impl Iterator<Item = ActivationHandle> {
        let snapshot: Vec<ActivationHandle> = self
            .by_actor
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();
        snapshot.into_iter()
    }

    /// Remove and return every local activation (node shutdown).
    pub fn drain(&self) -> Vec<ActivationHandle> {
        let actor_ids: Vec<ActorId> = self.by_actor.iter().map(|e| e.key().clone()).collect();
        let mut drained = Vec::new();
        for actor_id in actor_ids {
            if let Some((_, hosted)) = self.by_actor.remove(&actor_id) {
                for handle in &hosted {
                    self.unindex_activation(handle);
                }
                drained.extend(hosted);
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    use super::*;
    use crate::address::NetworkAddress;
    use crate::types::ActorType;

    fn local() -> NodeAddress {
        NodeAddress::new(
            NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4500),
            1,
        )
    }

    fn actor(key: &str) -> ActorId {
        ActorId::new(ActorType(0xBA4E_4B00), key)
    }

    fn single(key: &str, activation: u64) -> ActivationHandle {
        ActivationHandle::new(
            actor(key),
            ActivationId::new(activation),
            local(),
            ActivationMode::Single,
        )
    }

    fn worker(key: &str, activation: u64, max_local: usize) -> ActivationHandle {
        ActivationHandle::new(
            actor(key),
            ActivationId::new(activation),
            local(),
            ActivationMode::StatelessWorker { max_local },
        )
    }

    #[test]
    fn test_record_and_find() {
        let catalog = ActivationCatalog::new();
        assert!(catalog.find_local(&actor("alice")).is_none());

        catalog.record_new(single("alice", 1)).expect("record");

        assert_eq!(catalog.find_local(&actor("alice")), Some(single("alice", 1)));
        assert_eq!(
            catalog.find_activation(&ActivationId::new(1)),
            Some(single("alice", 1))
        );
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_duplicate_single_is_refused_and_existing_kept() {
        let catalog = ActivationCatalog::new();
        catalog.record_new(single("alice", 1)).expect("record");

        let result = catalog.record_new(single("alice", 2));
        assert_eq!(
            result,
            Err(CatalogError::DuplicateActivation {
                id: actor("alice"),
                existing: ActivationId::new(1),
                attempted: ActivationId::new(2),
            })
        );
        assert_eq!(catalog.find_local(&actor("alice")), Some(single("alice", 1)));
        assert!(catalog.find_activation(&ActivationId::new(2)).is_none());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let catalog = ActivationCatalog::new();
        let handle = single("alice", 1);
        catalog.record_new(handle.clone()).expect("record");

        assert!(catalog.remove(&handle));
        assert!(!catalog.remove(&handle));
        assert!(catalog.find_local(&actor("alice")).is_none());
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_remove_stale_handle_keeps_current_activation() {
        let catalog = ActivationCatalog::new();
        catalog.record_new(single("alice", 2)).expect("record");

        assert!(!catalog.remove(&single("alice", 1)));
        assert_eq!(catalog.count_for(&actor("alice")), 1);
    }

    #[test]
    fn test_stateless_workers_capped_per_node() {
        let catalog = ActivationCatalog::new();
        catalog.record_new(worker("pool", 1, 2)).expect("first worker");
        catalog.record_new(worker("pool", 2, 2)).expect("second worker");

        let result = catalog.record_new(worker("pool", 3, 2));
        assert_eq!(
            result,
            Err(CatalogError::WorkerLimitReached {
                id: actor("pool"),
                max_local: 2,
            })
        );
        assert_eq!(catalog.count_for(&actor("pool")), 2);

        assert!(catalog.remove(&worker("pool", 1, 2)));
        catalog.record_new(worker("pool", 3, 2)).expect("slot freed");
        assert_eq!(catalog.find_local(&actor("pool")), Some(worker("pool", 2, 2)));
    }

    #[test]
    fn test_worker_duplicate_activation_id_refused() {
        let catalog = ActivationCatalog::new();
        catalog.record_new(worker("pool", 1, 4)).expect("record");
        assert!(matches!(
            catalog.record_new(worker("pool", 1, 4)),
            Err(CatalogError::DuplicateActivation { .. })
        ));
    }

    #[test]
    fn test_single_after_worker_refused() {
        let catalog = ActivationCatalog::new();
        catalog.record_new(worker("pool", 1, 4)).expect("record");
        assert!(matches!(
            catalog.record_new(single("pool", 2)),
            Err(CatalogError::DuplicateActivation { .. })
        ));
    }

    #[test]
    fn test_all_activations_and_drain() {
        let catalog = ActivationCatalog::new();
        catalog.record_new(single("alice", 1)).expect("record");
        catalog.record_new(single("bob", 2)).expect("record");
        catalog.record_new(worker("pool", 3, 2)).expect("record");

        let mut all: Vec<_> = catalog.all_activations().map(|h| h.activation_id).collect();
        all.sort();
        assert_eq!(all, vec![ActivationId::new(1), ActivationId::new(2), ActivationId::new(3)]);

        let drained = catalog.drain();
        assert_eq!(drained.len(), 3);
        assert!(catalog.is_empty());
        assert!(catalog.find_local(&actor("bob")).is_none());
    }

    #[test]
    fn test_handle_record_has_no_etag() {
        let record = single("alice", 5).record();
        assert_eq!(record.activation_id, ActivationId::new(5));
        assert_eq!(record.node, local());
        assert!(record.etag.is_none());
    }

    #[test]
    fn test_activation_id_shared_across_actors_refused() {
        let catalog = ActivationCatalog::new();
        catalog.record_new(single("alice", 7)).expect("record alice");

        assert_eq!(
            catalog.record_new(single("bob", 7)),
            Err(CatalogError::DuplicateActivation {
                id: actor("bob"),
                existing: ActivationId::new(7),
                attempted: ActivationId::new(7),
            })
        );
        assert!(catalog.find_local(&actor("bob")).is_none());
        assert_eq!(catalog.len(), 1);

        assert!(catalog.remove(&single("alice", 7)));
        assert_eq!(catalog.len(), 0);
        assert!(catalog.is_empty());
        assert!(catalog.find_activation(&ActivationId::new(7)).is_none());

        catalog.record_new(single("bob", 7)).expect("id free again");
        assert_eq!(catalog.len(), 1);
        assert_eq!(
            catalog.find_activation(&ActivationId::new(7)),
            Some(single("bob", 7))
        );
    }

    #[test]
    fn test_stale_remove_keeps_other_actor_index() {
        let catalog = ActivationCatalog::new();
        catalog.record_new(single("bob", 7)).expect("record bob");

        assert!(!catalog.remove(&single("alice", 7)));
        assert_eq!(
            catalog.find_activation(&ActivationId::new(7)),
            Some(single("bob", 7))
        );
        assert!(!catalog.is_empty());
    }

    #[test]
    fn test_concurrent_distinct_actors() {
        let catalog = Arc::new(ActivationCatalog::new());
        let threads: Vec<_> = (0..8u64)
            .map(|t| {
                let catalog = Arc::clone(&catalog);
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        let id = t * 1000 + i;
                        catalog
                            .record_new(single(&format!("actor-{id}"), id))
                            .expect("distinct actors never collide");
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().expect("thread");
        }
        assert_eq!(catalog.len(), 800);
    }
}
