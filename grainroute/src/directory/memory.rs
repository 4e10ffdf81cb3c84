//! In-memory directory backend.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{BackendCapabilities, DirectoryBackend, DirectoryError};
use crate::address::NodeAddress;
use crate::types::{ActivationRecord, ActorId, Etag};

/// Largest batch accepted by [`InMemoryDirectory::unregister_batch`].
const MAX_BATCH_SIZE: usize = 1024;

/// In-memory directory for single-process clusters and tests.
///
/// All lookups are O(1) sharded map operations. Conditional writes are
/// atomic per actor id because they run under the shard lock of that id.
/// Supports bulk node removal.
#[derive(Debug)]
pub struct InMemoryDirectory {
    entries: DashMap<ActorId, ActivationRecord>,
    next_etag: AtomicU64,
}

impl InMemoryDirectory {
    /// Create a new empty directory.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_etag: AtomicU64::new(1),
        }
    }

    /// List all entries currently stored. Order is unspecified.
    pub fn list_all(&self) -> Vec<ActivationRecord> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    fn mint_etag(&self) -> Etag {
        Etag(self.next_etag.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DirectoryBackend for InMemoryDirectory {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_bulk_node_removal: true,
            max_batch_size: MAX_BATCH_SIZE,
        }
    }

    async fn lookup(&self, id: &ActorId) -> Result<Option<ActivationRecord>, DirectoryError> {
        Ok(self.entries.get(id).map(|e| e.value().clone()))
    }

    async fn register(&self, record: ActivationRecord) -> Result<ActivationRecord, DirectoryError> {
        match self.entries.entry(record.actor_id.clone()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(vacant) => {
                let stored = record.with_etag(self.mint_etag());
                vacant.insert(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn unregister(&self, record: &ActivationRecord) -> Result<(), DirectoryError> {
        self.entries
            .remove_if(&record.actor_id, |_, stored| record.matches_stored(stored));
        Ok(())
    }

    async fn unregister_nodes(
        &self,
        nodes: &[NodeAddress],
    ) -> Result<Vec<ActivationRecord>, DirectoryError> {
        let mut removed = Vec::new();
        self.entries.retain(|_, stored| {
            if nodes.contains(&stored.node) {
                removed.push(stored.clone());
                false
            } else {
                true
            }
        });
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    use super::*;
    use crate::address::NetworkAddress;
    use crate::types::{ActivationId, ActorType};

    fn node(port: u16) -> NodeAddress {
        NodeAddress::new(
            NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            1,
        )
    }

    fn alice_id() -> ActorId {
        ActorId::new(ActorType(0xBA4E_4B00), "alice")
    }

    fn bob_id() -> ActorId {
        ActorId::new(ActorType(0xBA4E_4B00), "bob")
    }

    fn alice_record(port: u16, activation: u64) -> ActivationRecord {
        ActivationRecord::new(alice_id(), node(port), ActivationId::new(activation))
    }

    #[tokio::test]
    async fn test_lookup_empty() {
        let dir = InMemoryDirectory::new();
        let result = dir.lookup(&alice_id()).await.expect("lookup should succeed");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_register_assigns_etag_and_lookup_returns_it() {
        let dir = InMemoryDirectory::new();
        let sent = alice_record(4500, 1);

        let stored = dir.register(sent.clone()).await.expect("register");
        assert!(stored.same_activation(&sent));
        assert!(stored.etag.is_some());

        let found = dir.lookup(&alice_id()).await.expect("lookup");
        assert_eq!(found, Some(stored));
    }

    #[tokio::test]
    async fn test_register_conflict_returns_existing() {
        let dir = InMemoryDirectory::new();
        let first = dir.register(alice_record(4500, 1)).await.expect("first register");

        let second = dir.register(alice_record(4501, 2)).await.expect("second register");
        assert_eq!(second, first);
        assert_eq!(second.activation_id, ActivationId::new(1));
    }

    #[tokio::test]
    async fn test_unregister_matching_activation() {
        let dir = InMemoryDirectory::new();
        let stored = dir.register(alice_record(4500, 1)).await.expect("register");

        dir.unregister(&stored).await.expect("unregister");
        assert!(dir.lookup(&alice_id()).await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn test_unregister_mismatched_activation_keeps_entry() {
        let dir = InMemoryDirectory::new();
        let stored = dir.register(alice_record(4500, 1)).await.expect("register");

        dir.unregister(&alice_record(4500, 2)).await.expect("unregister");
        assert_eq!(dir.lookup(&alice_id()).await.expect("lookup"), Some(stored));
    }

    #[tokio::test]
    async fn test_unregister_with_stale_etag_keeps_newer_entry() {
        let dir = InMemoryDirectory::new();
        let old = dir.register(alice_record(4500, 1)).await.expect("register");
        dir.unregister(&old).await.expect("unregister");
        let newer = dir.register(alice_record(4500, 1)).await.expect("re-register");
        assert_ne!(old.etag, newer.etag);

        // Same activation, old etag: must not remove the newer registration.
        dir.unregister(&old).await.expect("unregister");
        assert_eq!(dir.lookup(&alice_id()).await.expect("lookup"), Some(newer));
    }

    #[tokio::test]
    async fn test_unregister_nodes() {
        let dir = InMemoryDirectory::new();
        let alice = dir.register(alice_record(4500, 1)).await.expect("register alice");
        let bob = dir
            .register(ActivationRecord::new(bob_id(), node(4501), ActivationId::new(2)))
            .await
            .expect("register bob");

        let removed = dir.unregister_nodes(&[node(4500)]).await.expect("unregister_nodes");

        assert_eq!(removed, vec![alice]);
        assert!(dir.lookup(&alice_id()).await.expect("lookup").is_none());
        assert_eq!(dir.lookup(&bob_id()).await.expect("lookup"), Some(bob));
    }

    #[tokio::test]
    async fn test_unregister_nodes_respects_generation() {
        let dir = InMemoryDirectory::new();
        let restarted = NodeAddress::new(node(4500).endpoint().clone(), 2);
        let alive = dir
            .register(ActivationRecord::new(alice_id(), restarted, ActivationId::new(1)))
            .await
            .expect("register");

        let removed = dir.unregister_nodes(&[node(4500)]).await.expect("unregister_nodes");
        assert!(removed.is_empty());
        assert_eq!(dir.lookup(&alice_id()).await.expect("lookup"), Some(alive));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_single_winner() {
        let dir = Arc::new(InMemoryDirectory::new());
        let tasks: Vec<_> = (0..32u64)
            .map(|i| {
                let dir = Arc::clone(&dir);
                tokio::spawn(async move { dir.register(alice_record(4500 + i as u16, i)).await })
            })
            .collect();

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.expect("join").expect("register"));
        }
        let winner = dir.lookup(&alice_id()).await.expect("lookup").expect("registered");
        assert!(results.iter().all(|r| *r == winner));
        assert_eq!(dir.list_all().len(), 1);
    }
}
