//! Directory backend over an external key-value store.
//!
//! Each actor maps to one key holding its JSON-encoded record. The store's
//! per-key version doubles as the record's [`Etag`]. Only three conditional
//! primitives are needed from the store: put-if-absent, compare-and-swap
//! and compare-and-delete.
//!
//! Scanning the whole keyspace to find the entries of dead nodes is too
//! costly for this kind of store, so [`KeyValueDirectory`] does not support
//! bulk node removal. Stale entries are removed one by one by the locator.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{BackendCapabilities, DirectoryBackend, DirectoryError};
use crate::address::NodeAddress;
use crate::types::{ActivationId, ActivationRecord, ActorId, Etag};

/// Batch limit typical of hosted key-value stores.
const MAX_BATCH_SIZE: usize = 25;

/// How many times `register` retries after losing a replace race on a
/// corrupted entry before giving up.
const MAX_CONFLICT_RETRIES: usize = 3;

/// Errors raised by a [`ConditionalStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached or refused the request.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for DirectoryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => DirectoryError::Unavailable { reason },
        }
    }
}

/// A stored value and its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    /// Raw bytes.
    pub value: Vec<u8>,
    /// Version assigned by the store on the last write.
    pub version: u64,
}

/// Result of [`ConditionalStore::put_if_absent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// The value was written with this version.
    Inserted(u64),
    /// The key already existed; nothing was written.
    Exists(Versioned),
}

/// Minimal strongly-consistent key-value store interface.
#[async_trait]
pub trait ConditionalStore: fmt::Debug + Send + Sync {
    /// Read a key.
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Write `value` only if `key` is absent.
    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<PutOutcome, StoreError>;

    /// Replace the value if its version is still `expected`.
    ///
    /// Returns the new version, or `None` if the version did not match.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: u64,
        value: Vec<u8>,
    ) -> Result<Option<u64>, StoreError>;

    /// Delete the key if its version is still `expected`.
    async fn compare_and_delete(&self, key: &str, expected: u64) -> Result<bool, StoreError>;
}

/// In-process [`ConditionalStore`].
///
/// Used by tests and single-process deployments. Can be switched to fail
/// every call with [`StoreError::Unavailable`], and can hold arbitrary raw
/// bytes to exercise corrupted-entry handling.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
    unavailable: AtomicBool,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    entries: HashMap<String, Versioned>,
    last_version: u64,
}

impl MemoryStoreInner {
    fn write(&mut self, key: &str, value: Vec<u8>) -> u64 {
        self.last_version += 1;
        let version = self.last_version;
        self.entries.insert(key.to_string(), Versioned { value, version });
        version
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Write raw bytes under `key`, bypassing any encoding.
    pub fn put_raw(&self, key: &str, value: Vec<u8>) -> u64 {
        self.inner.lock().write(key, value)
    }

    /// Number of keys stored.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True if no key is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store switched off".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ConditionalStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        self.check_available()?;
        Ok(self.inner.lock().entries.get(key).cloned())
    }

    async fn put_if_absent(&self, key: &str, value: Vec<u8>) -> Result<PutOutcome, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.entries.get(key) {
            return Ok(PutOutcome::Exists(existing.clone()));
        }
        Ok(PutOutcome::Inserted(inner.write(key, value)))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: u64,
        value: Vec<u8>,
    ) -> Result<Option<u64>, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            Some(current) if current.version == expected => Ok(Some(inner.write(key, value))),
            _ => Ok(None),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: u64) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            Some(current) if current.version == expected => {
                inner.entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Stored form of an [`ActivationRecord`]; the etag lives in the store version.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    actor_id: ActorId,
    node: NodeAddress,
    activation_id: ActivationId,
}

/// Directory backend storing one JSON record per actor in a [`ConditionalStore`].
#[derive(Debug)]
pub struct KeyValueDirectory<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ConditionalStore + ?Sized> KeyValueDirectory<S> {
    /// Create a backend over `store`.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Key under which `id` is stored: `"{type:016x}/{key}"`.
    pub fn storage_key(id: &ActorId) -> String {
        format!("{}/{}", id.actor_type, id.key)
    }

    fn encode(record: &ActivationRecord) -> Result<Vec<u8>, DirectoryError> {
        let stored = StoredRecord {
            actor_id: record.actor_id.clone(),
            node: record.node.clone(),
            activation_id: record.activation_id,
        };
        serde_json::to_vec(&stored).map_err(|e| DirectoryError::Encoding {
            id: record.actor_id.clone(),
            reason: e.to_string(),
        })
    }

    fn decode(id: &ActorId, versioned: &Versioned) -> Result<ActivationRecord, DirectoryError> {
        let stored: StoredRecord =
            serde_json::from_slice(&versioned.value).map_err(|e| DirectoryError::Corrupted {
                id: id.clone(),
                reason: e.to_string(),
            })?;
        if stored.actor_id != *id {
            return Err(DirectoryError::Corrupted {
                id: id.clone(),
                reason: format!("entry belongs to {}", stored.actor_id),
            });
        }
        Ok(
            ActivationRecord::new(stored.actor_id, stored.node, stored.activation_id)
                .with_etag(Etag(versioned.version)),
        )
    }
}

#[async_trait]
impl<S: ConditionalStore + ?Sized> DirectoryBackend for KeyValueDirectory<S> {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            supports_bulk_node_removal: false,
            max_batch_size: MAX_BATCH_SIZE,
        }
    }

    async fn lookup(&self, id: &ActorId) -> Result<Option<ActivationRecord>, DirectoryError> {
        match self.store.get(&Self::storage_key(id)).await? {
            Some(versioned) => Self::decode(id, &versioned).map(Some),
            None => Ok(None),
        }
    }

    async fn register(&self, record: ActivationRecord) -> Result<ActivationRecord, DirectoryError> {
        let key = Self::storage_key(&record.actor_id);
        let value = Self::encode(&record)?;

        for _ in 0..MAX_CONFLICT_RETRIES {
            let existing = match self.store.put_if_absent(&key, value.clone()).await? {
                PutOutcome::Inserted(version) => return Ok(record.with_etag(Etag(version))),
                PutOutcome::Exists(existing) => existing,
            };
            match Self::decode(&record.actor_id, &existing) {
                Ok(current) => return Ok(current),
                Err(DirectoryError::Corrupted { reason, .. }) => {
                    tracing::warn!(
                        actor_id = %record.actor_id,
                        reason = %reason,
                        "Directory: replacing corrupted entry"
                    );
                    let swapped = self
                        .store
                        .compare_and_swap(&key, existing.version, value.clone())
                        .await?;
                    if let Some(version) = swapped {
                        return Ok(record.with_etag(Etag(version)));
                    }
                }
                Err(other) => return Err(other),
            }
        }

        Err(DirectoryError::Unavailable {
            reason: format!("contended entry for {}", record.actor_id),
        })
    }

    async fn unregister(&self, record: &ActivationRecord) -> Result<(), DirectoryError> {
        let key = Self::storage_key(&record.actor_id);
        let Some(versioned) = self.store.get(&key).await? else {
            return Ok(());
        };
        let stored = Self::decode(&record.actor_id, &versioned)?;
        if record.matches_stored(&stored) {
            // A failed compare means the entry was superseded meanwhile.
            self.store.compare_and_delete(&key, versioned.version).await?;
        }
        Ok(())
    }

    async fn unregister_nodes(
        &self,
        nodes: &[NodeAddress],
    ) -> Result<Vec<ActivationRecord>, DirectoryError> {
        tracing::debug!(
            nodes = nodes.len(),
            "Directory: bulk node removal unsupported by key-value backend"
        );
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::address::NetworkAddress;
    use crate::types::ActorType;

    type Directory = KeyValueDirectory<MemoryStore>;

    fn node(port: u16) -> NodeAddress {
        NodeAddress::new(
            NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            1,
        )
    }

    fn alice_id() -> ActorId {
        ActorId::new(ActorType(0xBA4E_4B00), "alice")
    }

    fn alice_record(port: u16, activation: u64) -> ActivationRecord {
        ActivationRecord::new(alice_id(), node(port), ActivationId::new(activation))
    }

    fn setup() -> (Arc<MemoryStore>, Directory) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), KeyValueDirectory::new(store))
    }

    #[test]
    fn test_storage_key_format() {
        assert_eq!(Directory::storage_key(&alice_id()), "00000000ba4e4b00/alice");
    }

    #[tokio::test]
    async fn test_register_lookup_roundtrip_uses_store_version() {
        let (store, dir) = setup();
        let stored = dir.register(alice_record(4500, 1)).await.expect("register");

        let versioned = store
            .get(&Directory::storage_key(&alice_id()))
            .await
            .expect("get")
            .expect("present");
        assert_eq!(stored.etag, Some(Etag(versioned.version)));
        assert_eq!(dir.lookup(&alice_id()).await.expect("lookup"), Some(stored));
    }

    #[tokio::test]
    async fn test_register_conflict_returns_existing() {
        let (_, dir) = setup();
        let first = dir.register(alice_record(4500, 1)).await.expect("first");
        let second = dir.register(alice_record(4501, 2)).await.expect("second");
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_lookup_corrupted_entry() {
        let (store, dir) = setup();
        store.put_raw(&Directory::storage_key(&alice_id()), b"not json".to_vec());

        let result = dir.lookup(&alice_id()).await;
        assert!(matches!(result, Err(DirectoryError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_lookup_entry_for_wrong_actor_is_corrupted() {
        let (store, dir) = setup();
        let bob = ActivationRecord::new(
            ActorId::new(ActorType(0xBA4E_4B00), "bob"),
            node(4500),
            ActivationId::new(1),
        );
        store.put_raw(
            &Directory::storage_key(&alice_id()),
            Directory::encode(&bob).expect("encode"),
        );

        assert!(matches!(
            dir.lookup(&alice_id()).await,
            Err(DirectoryError::Corrupted { .. })
        ));
    }

    #[tokio::test]
    async fn test_register_replaces_corrupted_entry() {
        let (store, dir) = setup();
        store.put_raw(&Directory::storage_key(&alice_id()), b"{".to_vec());

        let stored = dir.register(alice_record(4500, 1)).await.expect("register");
        assert!(stored.same_activation(&alice_record(4500, 1)));
        assert_eq!(dir.lookup(&alice_id()).await.expect("lookup"), Some(stored));
    }

    #[tokio::test]
    async fn test_unregister_only_matching() {
        let (store, dir) = setup();
        let stored = dir.register(alice_record(4500, 1)).await.expect("register");

        dir.unregister(&alice_record(4500, 2)).await.expect("mismatch is ok");
        assert_eq!(store.len(), 1);

        dir.unregister(&stored).await.expect("unregister");
        assert!(store.is_empty());

        dir.unregister(&stored).await.expect("twice is ok");
    }

    #[tokio::test]
    async fn test_unavailable_store_propagates() {
        let (store, dir) = setup();
        store.set_unavailable(true);

        let result = dir.register(alice_record(4500, 1)).await;
        assert!(matches!(result, Err(DirectoryError::Unavailable { .. })));
        assert!(dir.lookup(&alice_id()).await.is_err());
    }

    #[tokio::test]
    async fn test_unregister_nodes_is_noop() {
        let (store, dir) = setup();
        dir.register(alice_record(4500, 1)).await.expect("register");

        let removed = dir.unregister_nodes(&[node(4500)]).await.expect("no-op");
        assert!(removed.is_empty());
        assert_eq!(store.len(), 1);
        assert!(!dir.capabilities().supports_bulk_node_removal);
    }
}
