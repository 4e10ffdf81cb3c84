//! # grainroute
//!
//! Actor location and placement for an Orleans-style virtual actor runtime.
//!
//! Client code addresses actors by a stable [`ActorId`]. This crate answers
//! "which node hosts that actor right now", picks a node when none does,
//! and keeps at most one registered activation per id cluster-wide.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ CachedLocator                                                │
//! │   resolve / register / unregister / place / apply_membership │
//! ├───────────────────┬──────────────────┬───────────────────────┤
//! │ ActivationCatalog │ cache (DashMap)  │ PlacementRegistry     │
//! │ local activations │ ActorId → record │ ActorType → strategy  │
//! ├───────────────────┴──────────────────┴───────────────────────┤
//! │ DirectoryService (batching, corrupted-entry policy)          │
//! │   └─ dyn DirectoryBackend                                    │
//! │        ├─ InMemoryDirectory                                  │
//! │        └─ KeyValueDirectory<dyn ConditionalStore>            │
//! └──────────────────────────────────────────────────────────────┘
//!           ▲
//!           │ MembershipReconciler ◄── MembershipFeed (watch)
//! ```
//!
//! ## Modules
//!
//! - [`address`]: network and node addresses
//! - [`types`]: actor identity and directory records
//! - [`membership`]: versioned cluster membership snapshots and feed
//! - [`placement`]: placement strategies and their registry
//! - [`catalog`]: activations hosted by the local node
//! - [`directory`]: directory backends and the service wrapping them
//! - [`locator`]: the cached locator
//! - [`reconciler`]: background membership reconciliation
//! - [`config`]: startup configuration
//! - [`telemetry`]: tracing setup

#![deny(missing_docs)]

pub mod address;
pub mod catalog;
pub mod config;
pub mod directory;
pub mod locator;
pub mod membership;
pub mod placement;
pub mod reconciler;
pub mod telemetry;
pub mod types;

pub use address::{NetworkAddress, NetworkAddressParseError, NodeAddress};
pub use catalog::{ActivationCatalog, ActivationHandle, ActivationMode, CatalogError};
pub use config::{ConfigError, DirectoryBackendKind, LocatorConfig, LocatorConfigBuilder};
pub use directory::{
    BackendCapabilities, BatchOutcome, BulkRemoval, ConditionalStore, DirectoryBackend,
    DirectoryError, DirectoryService, InMemoryDirectory, KeyValueDirectory, MemoryStore,
    PutOutcome, StoreError, Versioned,
};
pub use locator::{CachedLocator, LocatorError, Reconciliation, RegistrationOutcome, UnregisterCause};
pub use membership::{
    ClusterMember, MembershipError, MembershipFeed, MembershipSnapshot, MembershipSubscription,
    MembershipVersion, NodeStatus,
};
pub use placement::{choose_node, uniform_hash, PlacementError, PlacementRegistry, PlacementStrategy};
pub use reconciler::MembershipReconciler;
pub use telemetry::init_tracing;
pub use types::{ActivationId, ActivationRecord, ActorId, ActorType, Etag};
