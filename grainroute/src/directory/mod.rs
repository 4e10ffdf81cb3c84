//! Actor directory: maps actor identities to their current activation.
//!
//! The directory is the cluster's "phone book": given an `ActorId`, it
//! returns the [`ActivationRecord`] naming the node and activation that
//! currently serve it.
//!
//! # Design
//!
//! - [`DirectoryBackend`] is a trait so storage can range from an in-memory
//!   table ([`InMemoryDirectory`]) to an external strongly-consistent
//!   key-value store ([`KeyValueDirectory`]). The backend is chosen at
//!   startup from configuration.
//! - [`DirectoryService`] wraps a backend with the policies every caller
//!   wants: batching of bulk unregisters, and treating corrupted entries as
//!   absent.
//!
//! # Register Semantics
//!
//! `register()` never overwrites:
//! - If no entry exists: stores the record (assigning an etag), returns it
//! - If an entry already exists: returns the existing entry untouched
//!
//! The caller compares the returned record with what it sent
//! ([`ActivationRecord::same_activation`]) to learn whether it won.
//!
//! `unregister()` only removes the entry if it still describes the same
//! activation (and the same etag, when the caller has one). A stale
//! unregister can never delete a newer activation.

mod kv;
mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::address::NodeAddress;
use crate::types::{ActivationRecord, ActorId};

pub use kv::{ConditionalStore, KeyValueDirectory, MemoryStore, PutOutcome, StoreError, Versioned};
pub use memory::InMemoryDirectory;

/// Errors from directory operations.
///
/// "Not found" is not an error: lookups return `Ok(None)`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    /// Transient backend failure. The caller may retry with backoff.
    #[error("directory unavailable: {reason}")]
    Unavailable {
        /// What went wrong.
        reason: String,
    },

    /// The stored entry for an actor could not be decoded.
    #[error("corrupted directory entry for {id}: {reason}")]
    Corrupted {
        /// The actor whose entry is malformed.
        id: ActorId,
        /// Decoder message.
        reason: String,
    },

    /// A record could not be encoded for storage. Retrying cannot help.
    #[error("cannot encode directory record for {id}: {reason}")]
    Encoding {
        /// The actor whose record was refused.
        id: ActorId,
        /// Encoder message.
        reason: String,
    },
}

impl DirectoryError {
    /// True for errors worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// What a backend can do beyond the basic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Whether [`DirectoryBackend::unregister_nodes`] really removes entries.
    ///
    /// When `false`, the backend treats it as a no-op and stale entries are
    /// cleaned up by per-record unregisters and by lookups that find a
    /// record pointing at a dead node.
    pub supports_bulk_node_removal: bool,
    /// Largest batch the backend accepts in one `unregister_batch` call.
    pub max_batch_size: usize,
}

/// Storage backend for the directory.
///
/// All operations may suspend on I/O. Implementations must make `register`
/// and `unregister` atomic per actor id (a conditional write keyed by the
/// stored version), which is what makes first-writer-wins race resolution
/// correct.
#[async_trait]
pub trait DirectoryBackend: fmt::Debug + Send + Sync {
    /// What this backend supports.
    fn capabilities(&self) -> BackendCapabilities;

    /// Look up the current record for an actor.
    async fn lookup(&self, id: &ActorId) -> Result<Option<ActivationRecord>, DirectoryError>;

    /// Insert `record` unless an entry exists; return whichever is stored.
    async fn register(&self, record: ActivationRecord) -> Result<ActivationRecord, DirectoryError>;

    /// Delete the stored entry if it still matches `record`.
    ///
    /// Absent or superseded entries are left alone and reported as success.
    async fn unregister(&self, record: &ActivationRecord) -> Result<(), DirectoryError>;

    /// Unregister a batch, reporting one result per record in order.
    ///
    /// A failure for one record must not prevent the others from being
    /// attempted. The default issues one `unregister` per record.
    async fn unregister_batch(
        &self,
        records: &[ActivationRecord],
    ) -> Vec<Result<(), DirectoryError>> {
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            results.push(self.unregister(record).await);
        }
        results
    }

    /// Remove every entry hosted on one of `nodes`, returning what was removed.
    ///
    /// Backends without [`BackendCapabilities::supports_bulk_node_removal`]
    /// return an empty list without touching storage.
    async fn unregister_nodes(
        &self,
        nodes: &[NodeAddress],
    ) -> Result<Vec<ActivationRecord>, DirectoryError>;
}

/// Result of a bulk node removal through the [`DirectoryService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkRemoval {
    /// The backend removed these records.
    Removed(Vec<ActivationRecord>),
    /// The backend does not support bulk removal; nothing was done.
    Unsupported,
}

/// Outcome of [`DirectoryService::unregister_many`].
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Number of records submitted.
    pub attempted: usize,
    /// Records whose unregister failed, with the error.
    pub failures: Vec<(ActivationRecord, DirectoryError)>,
}

impl BatchOutcome {
    /// True if every record was handled.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Policy layer over a [`DirectoryBackend`].
///
/// Cheap to clone; clones share the backend.
#[derive(Debug, Clone)]
pub struct DirectoryService {
    backend: Arc<dyn DirectoryBackend>,
    max_batch: usize,
}

impl DirectoryService {
    /// Wrap a backend, batching at the backend's maximum batch size.
    pub fn new(backend: Arc<dyn DirectoryBackend>) -> Self {
        let max_batch = backend.capabilities().max_batch_size.max(1);
        Self { backend, max_batch }
    }

    /// Lower the batch size used by [`unregister_many`](Self::unregister_many).
    ///
    /// The backend's own maximum still applies.
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        let backend_max = self.backend.capabilities().max_batch_size.max(1);
        self.max_batch = max_batch.clamp(1, backend_max);
        self
    }

    /// Batch size in use.
    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    /// The backend's capabilities.
    pub fn capabilities(&self) -> BackendCapabilities {
        self.backend.capabilities()
    }

    /// Look up an actor. Corrupted entries are logged and reported as absent.
    pub async fn lookup(&self, id: &ActorId) -> Result<Option<ActivationRecord>, DirectoryError> {
        match self.backend.lookup(id).await {
            Err(DirectoryError::Corrupted { id, reason }) => {
                tracing::warn!(actor_id = %id, reason = %reason, "Directory: ignoring corrupted entry");
                Ok(None)
            }
            result => {
                tracing::debug!(actor_id = %id, found = matches!(result, Ok(Some(_))), "Directory: lookup");
                result
            }
        }
    }

    /// Register a record; returns the record the backend holds afterwards.
    pub async fn register(
        &self,
        record: ActivationRecord,
    ) -> Result<ActivationRecord, DirectoryError> {
        self.backend.register(record).await
    }

    /// Unregister a record. Corrupted entries are logged and left alone.
    pub async fn unregister(&self, record: &ActivationRecord) -> Result<(), DirectoryError> {
        match self.backend.unregister(record).await {
            Err(DirectoryError::Corrupted { id, reason }) => {
                tracing::warn!(actor_id = %id, reason = %reason, "Directory: cannot unregister corrupted entry");
                Ok(())
            }
            result => result,
        }
    }

    /// Best-effort unregister of many records, in batches.
    ///
    /// Every record is attempted; failures are collected, not propagated.
    pub async fn unregister_many(&self, records: &[ActivationRecord]) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            attempted: records.len(),
            failures: Vec::new(),
        };
        for chunk in records.chunks(self.max_batch) {
            let results = self.backend.unregister_batch(chunk).await;
            for (record, result) in chunk.iter().zip(results) {
                match result {
                    Ok(()) => {}
                    Err(DirectoryError::Corrupted { id, reason }) => {
                        tracing::warn!(actor_id = %id, reason = %reason, "Directory: cannot unregister corrupted entry");
                    }
                    Err(error) => outcome.failures.push((record.clone(), error)),
                }
            }
        }
        if !outcome.is_complete() {
            tracing::warn!(
                attempted = outcome.attempted,
                failed = outcome.failures.len(),
                "Directory: bulk unregister incomplete"
            );
        }
        outcome
    }

    /// Remove every entry hosted on `nodes`, if the backend supports it.
    pub async fn unregister_nodes(
        &self,
        nodes: &[NodeAddress],
    ) -> Result<BulkRemoval, DirectoryError> {
        if !self.capabilities().supports_bulk_node_removal {
            return Ok(BulkRemoval::Unsupported);
        }
        let removed = self.backend.unregister_nodes(nodes).await?;
        tracing::info!(
            nodes = nodes.len(),
            removed = removed.len(),
            "Directory: removed entries of dead nodes"
        );
        Ok(BulkRemoval::Removed(removed))
    }
}
