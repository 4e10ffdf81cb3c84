//! Placement: choosing the node for a new activation.
//!
//! Placement separates two concerns:
//!
//! - **[`PlacementStrategy`]**: a tag declared per actor type, saying *what*
//!   the actor wants (local, random, hashed, pinned, stateless worker).
//! - **[`choose_node`]**: a pure function interpreting the tag against the
//!   caller's inputs: actor id, membership snapshot, compatible nodes, local
//!   node and a random source.
//!
//! Strategies carry no state. Randomness comes from the caller's RNG so
//! that a seeded RNG makes every decision reproducible in tests.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::address::NodeAddress;
use crate::catalog::ActivationMode;
use crate::membership::MembershipSnapshot;
use crate::types::{ActorId, ActorType};

/// Errors from placement operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    /// No compatible node is available.
    #[error("no compatible node for actor {id}")]
    NoCompatibleNode {
        /// The actor that could not be placed.
        id: ActorId,
    },

    /// A pinned target is not among the compatible nodes.
    #[error("node {target} unavailable for actor {id}")]
    NodeUnavailable {
        /// The actor that could not be placed.
        id: ActorId,
        /// The requested node.
        target: NodeAddress,
    },
}

/// Per-actor-type placement tag.
///
/// Configured once per [`ActorType`] (see [`PlacementRegistry`]).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlacementStrategy {
    /// Uniformly random among compatible nodes.
    #[default]
    Random,
    /// The local node when it is compatible and not terminating, else random.
    PreferLocal,
    /// Deterministic function of the actor id over the sorted compatible nodes.
    HashBased,
    /// Many independent activations, at most `max_local` per node, never
    /// registered in the directory.
    StatelessWorker {
        /// Per-node cap on concurrent activations of one actor id.
        max_local: usize,
    },
    /// Always the given node.
    Fixed {
        /// The node that must host the actor.
        target: NodeAddress,
    },
}

impl PlacementStrategy {
    /// Whether activations placed with this strategy go through the directory.
    pub fn uses_directory(&self) -> bool {
        !matches!(self, Self::StatelessWorker { .. })
    }

    /// How the local catalog must record activations of this strategy.
    pub fn activation_mode(&self) -> ActivationMode {
        match self {
            Self::StatelessWorker { max_local } => ActivationMode::StatelessWorker {
                max_local: *max_local,
            },
            _ => ActivationMode::Single,
        }
    }
}

/// Choose the node that should host a new activation of `actor_id`.
///
/// # Errors
///
/// - [`PlacementError::NoCompatibleNode`] when a strategy needs a candidate
///   and `compatible` offers none.
/// - [`PlacementError::NodeUnavailable`] when a `Fixed` target is not
///   compatible.
pub fn choose_node<R: Rng + ?Sized>(
    strategy: &PlacementStrategy,
    actor_id: &ActorId,
    snapshot: &MembershipSnapshot,
    compatible: &[NodeAddress],
    local: &NodeAddress,
    rng: &mut R,
) -> Result<NodeAddress, PlacementError> {
    match strategy {
        PlacementStrategy::Random => random(actor_id, compatible, rng),
        PlacementStrategy::PreferLocal | PlacementStrategy::StatelessWorker { .. } => {
            if compatible.contains(local) && !snapshot.is_terminating(local) {
                Ok(local.clone())
            } else {
                random(actor_id, compatible, rng)
            }
        }
        PlacementStrategy::HashBased => hash_based(actor_id, compatible),
        PlacementStrategy::Fixed { target } => {
            if compatible.contains(target) {
                Ok(target.clone())
            } else {
                Err(PlacementError::NodeUnavailable {
                    id: actor_id.clone(),
                    target: target.clone(),
                })
            }
        }
    }
}

fn random<R: Rng + ?Sized>(
    actor_id: &ActorId,
    compatible: &[NodeAddress],
    rng: &mut R,
) -> Result<NodeAddress, PlacementError> {
    compatible
        .choose(rng)
        .cloned()
        .ok_or_else(|| PlacementError::NoCompatibleNode {
            id: actor_id.clone(),
        })
}

fn hash_based(
    actor_id: &ActorId,
    compatible: &[NodeAddress],
) -> Result<NodeAddress, PlacementError> {
    let mut candidates = compatible.to_vec();
    candidates.sort();
    candidates.dedup();
    if candidates.is_empty() {
        return Err(PlacementError::NoCompatibleNode {
            id: actor_id.clone(),
        });
    }
    let index = (uniform_hash(actor_id) % candidates.len() as u64) as usize;
    Ok(candidates.swap_remove(index))
}

/// Hash of an actor id that is identical on every node and platform.
pub fn uniform_hash(actor_id: &ActorId) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(actor_id.actor_type.0.to_be_bytes());
    hasher.update(actor_id.key.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Placement strategy per actor type, with a fallback for unknown types.
#[derive(Debug, Clone, Default)]
pub struct PlacementRegistry {
    default: PlacementStrategy,
    by_type: HashMap<ActorType, PlacementStrategy>,
}

impl PlacementRegistry {
    /// Create a registry where every type uses `default`.
    pub fn new(default: PlacementStrategy) -> Self {
        Self {
            default,
            by_type: HashMap::new(),
        }
    }

    /// Set the strategy for one actor type.
    pub fn with_strategy(mut self, actor_type: ActorType, strategy: PlacementStrategy) -> Self {
        self.by_type.insert(actor_type, strategy);
        self
    }

    /// The strategy configured for `actor_type`.
    pub fn strategy_for(&self, actor_type: ActorType) -> &PlacementStrategy {
        self.by_type.get(&actor_type).unwrap_or(&self.default)
    }
}
