//! Identity types shared by the directory, the catalog and the locator.
//!
//! - `ActorType` identifies an implementation family (a u64 tag).
//! - `ActorId` is `ActorType` + an opaque string key. It is the directory's
//!   primary key and is never mutated once built.
//! - `ActivationId` is minted per activation so that two activations of the
//!   same actor created in quick succession can be told apart.
//! - `ActivationRecord` is the unit stored in the directory.

use serde::{Deserialize, Serialize};

use crate::address::NodeAddress;

/// Identifies an actor TYPE.
///
/// This is a stable identifier for a class of actors, not a specific
/// instance. Placement strategies are configured per `ActorType`.
///
/// # Convention
///
/// Use a hex constant:
/// ```rust
/// use grainroute::ActorType;
/// const BANK_ACCOUNT: ActorType = ActorType(0xBA4E_4B00);
/// ```
#[derive(Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Debug)]
pub struct ActorType(pub u64);

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Full virtual actor identity = type + key.
///
/// Two ids are equal iff both the type and the key are equal.
///
/// # Examples
///
/// ```rust
/// use grainroute::{ActorId, ActorType};
///
/// let player = ActorId::new(ActorType(0x504C_4159), "player-42");
/// assert_eq!(player.key, "player-42");
/// ```
#[derive(Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Debug)]
pub struct ActorId {
    /// The implementation family of the actor.
    pub actor_type: ActorType,
    /// The specific instance key (e.g., "player-42", "account-abc").
    pub key: String,
}

impl ActorId {
    /// Create a new actor ID.
    pub fn new(actor_type: ActorType, key: impl Into<String>) -> Self {
        Self {
            actor_type,
            key: key.into(),
        }
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.actor_type, self.key)
    }
}

/// Unique identifier for a specific actor activation.
///
/// If an actor is deactivated and later re-activated (possibly on a
/// different node), it gets a new `ActivationId`. This distinguishes
/// stale directory entries from current ones even when they share a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivationId(pub u64);

impl ActivationId {
    /// Create an activation ID from a raw value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Mint a fresh random activation ID.
    pub fn mint() -> Self {
        Self(rand::random())
    }
}

impl std::fmt::Display for ActivationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "act-{:016x}", self.0)
    }
}

/// Opaque concurrency token assigned by a directory backend.
///
/// Backends hand one out with every stored record and use it for
/// compare-and-swap style conditional deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Etag(pub u64);

impl std::fmt::Display for Etag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "etag-{}", self.0)
    }
}

/// Directory entry: which activation of an actor is current, and where.
///
/// A freshly built record has no etag. The directory backend assigns one
/// when it accepts the record, so records returned from the directory
/// always carry `Some(etag)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRecord {
    /// The actor's identity.
    pub actor_id: ActorId,
    /// The node hosting this activation.
    pub node: NodeAddress,
    /// Unique identifier for this specific activation.
    pub activation_id: ActivationId,
    /// Version token returned by the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<Etag>,
}

impl ActivationRecord {
    /// Create a record that has not been stored yet.
    pub fn new(actor_id: ActorId, node: NodeAddress, activation_id: ActivationId) -> Self {
        Self {
            actor_id,
            node,
            activation_id,
            etag: None,
        }
    }

    /// Return a copy carrying the given etag.
    pub fn with_etag(mut self, etag: Etag) -> Self {
        self.etag = Some(etag);
        self
    }

    /// True if both records describe the same activation.
    ///
    /// Etags are ignored: a record sent to the directory and the one the
    /// directory hands back differ only by the etag it assigned.
    pub fn same_activation(&self, other: &ActivationRecord) -> bool {
        self.actor_id == other.actor_id
            && self.activation_id == other.activation_id
            && self.node == other.node
    }

    /// True if `self` may be used to delete `stored`.
    ///
    /// The activation must match, and when `self` carries an etag it must
    /// equal the stored one.
    pub fn matches_stored(&self, stored: &ActivationRecord) -> bool {
        self.same_activation(stored) && self.etag.is_none_or(|etag| stored.etag == Some(etag))
    }
}

impl std::fmt::Display for ActivationRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {} ({})", self.actor_id, self.node, self.activation_id)
    }
}
