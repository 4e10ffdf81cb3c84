//! Membership snapshots: the locator's view of which nodes are alive.
//!
//! This crate does not detect failures. It consumes versioned
//! [`MembershipSnapshot`]s produced elsewhere, published through a
//! [`MembershipFeed`], and uses them to decide which directory entries
//! point at dead nodes.
//!
//! # Design
//!
//! - Snapshots are immutable per version. Consumers hold them behind `Arc`
//!   and swap the reference when a newer version arrives.
//! - The feed keeps only the latest snapshot. A slow subscriber skips
//!   intermediate versions instead of queueing them.
//! - The feed refuses versions that do not move forward, so subscribers
//!   never observe an older snapshot after a newer one.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::address::NodeAddress;

/// Monotonically increasing membership version.
///
/// Every membership change (join, status transition, leave) bumps the version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct MembershipVersion(pub u64);

impl MembershipVersion {
    /// Create version 0 (initial).
    pub fn new() -> Self {
        Self(0)
    }

    /// Return the next version.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for MembershipVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Status of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Node is joining the cluster (announced but not yet ready to serve).
    Joining,
    /// Node is fully operational and serving requests.
    Active,
    /// Node is gracefully shutting down (draining work).
    Stopping,
    /// Node has been declared dead.
    Dead,
}

impl NodeStatus {
    /// True for `Stopping` and `Dead`: the node must not receive new activations.
    pub fn is_terminating(self) -> bool {
        matches!(self, Self::Stopping | Self::Dead)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Joining => write!(f, "Joining"),
            Self::Active => write!(f, "Active"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Dead => write!(f, "Dead"),
        }
    }
}

/// A single member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Address of this member.
    pub node: NodeAddress,
    /// Current lifecycle status.
    pub status: NodeStatus,
    /// Human-readable name (for logging/debugging).
    pub name: String,
}

impl ClusterMember {
    /// Create a new cluster member.
    pub fn new(node: NodeAddress, status: NodeStatus, name: impl Into<String>) -> Self {
        Self {
            node,
            status,
            name: name.into(),
        }
    }

    /// Check if this member is in a status where it can serve requests.
    pub fn is_active(&self) -> bool {
        self.status == NodeStatus::Active
    }
}

/// Immutable snapshot of cluster membership at a specific version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipSnapshot {
    /// All known members, keyed by node address.
    pub members: HashMap<NodeAddress, ClusterMember>,
    /// Version of this snapshot (monotonically increasing).
    pub version: MembershipVersion,
}

impl MembershipSnapshot {
    /// Create an empty snapshot at version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot where every given node is `Active`.
    pub fn with_active(
        version: MembershipVersion,
        nodes: impl IntoIterator<Item = NodeAddress>,
    ) -> Self {
        let members = nodes
            .into_iter()
            .enumerate()
            .map(|(i, node)| {
                let name = format!("node-{i}");
                (node.clone(), ClusterMember::new(node, NodeStatus::Active, name))
            })
            .collect();
        Self { members, version }
    }

    /// Derive the next snapshot with `node` set to `status`.
    ///
    /// Unknown nodes are added. The version is bumped by one.
    pub fn updated(&self, node: &NodeAddress, status: NodeStatus) -> Self {
        let mut members = self.members.clone();
        let name = format!("node-{}", members.len());
        members
            .entry(node.clone())
            .and_modify(|m| m.status = status)
            .or_insert_with(|| ClusterMember::new(node.clone(), status, name));
        Self {
            members,
            version: self.version.next(),
        }
    }

    /// Get the status of a specific member, or `None` if unknown.
    pub fn status(&self, node: &NodeAddress) -> Option<NodeStatus> {
        self.members.get(node).map(|m| m.status)
    }

    /// True if `node` must be treated as gone.
    ///
    /// A node is dead when its status is `Dead`, or when a later generation
    /// is registered at the same endpoint. Unknown nodes are not dead.
    pub fn is_dead(&self, node: &NodeAddress) -> bool {
        if self.status(node) == Some(NodeStatus::Dead) {
            return true;
        }
        self.members.keys().any(|other| node.is_superseded_by(other))
    }

    /// True if `node` is `Stopping`, `Dead` or superseded.
    pub fn is_terminating(&self, node: &NodeAddress) -> bool {
        self.status(node).is_some_and(NodeStatus::is_terminating) || self.is_dead(node)
    }

    /// Addresses of all `Active` members, sorted.
    pub fn active_members(&self) -> Vec<NodeAddress> {
        let mut active: Vec<_> = self
            .members
            .values()
            .filter(|m| m.is_active())
            .map(|m| m.node.clone())
            .collect();
        active.sort();
        active
    }

    /// Nodes that are dead in `self` but were not dead in `previous`, sorted.
    ///
    /// A node that drops out of the member list without ever being seen as
    /// `Dead` is not reported: unknown nodes are not dead. This happens when
    /// a reconciler skips the version that marked it `Dead`. Records on such
    /// a node stay cached until a later snapshot lists the node as `Dead` or
    /// superseded, or until the caller invalidates them.
    pub fn newly_dead_since(&self, previous: &MembershipSnapshot) -> Vec<NodeAddress> {
        let candidates: BTreeSet<&NodeAddress> = self
            .members
            .keys()
            .chain(previous.members.keys())
            .collect();
        candidates
            .into_iter()
            .filter(|node| self.is_dead(node) && !previous.is_dead(node))
            .cloned()
            .collect()
    }
}

/// Errors from membership operations.
#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    /// A snapshot was published that does not advance the version.
    #[error("stale membership snapshot {offered} (current is {current})")]
    StaleVersion {
        /// Version that was offered.
        offered: MembershipVersion,
        /// Version currently published.
        current: MembershipVersion,
    },
}

/// Publisher side of the membership snapshot stream.
///
/// Only strictly newer snapshots are accepted. Subscribers see the latest
/// accepted snapshot; bursts of updates coalesce into one notification.
///
/// # Example
///
/// ```rust,ignore
/// let feed = MembershipFeed::new(MembershipSnapshot::with_active(v1, nodes));
/// let mut sub = feed.subscribe();
/// feed.publish(next_snapshot)?;
/// let latest = sub.next().await;
/// ```
#[derive(Debug)]
pub struct MembershipFeed {
    sender: watch::Sender<Arc<MembershipSnapshot>>,
}

impl MembershipFeed {
    /// Create a feed whose current value is `initial`.
    pub fn new(initial: MembershipSnapshot) -> Self {
        let (sender, _) = watch::channel(Arc::new(initial));
        Self { sender }
    }

    /// Publish a newer snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`MembershipError::StaleVersion`] if `snapshot.version` is not
    /// greater than the current version.
    pub fn publish(&self, snapshot: MembershipSnapshot) -> Result<(), MembershipError> {
        let offered = snapshot.version;
        let mut current = MembershipVersion::new();
        let snapshot = Arc::new(snapshot);
        let accepted = self.sender.send_if_modified(|slot: &mut Arc<MembershipSnapshot>| {
            current = slot.version;
            if offered > current {
                *slot = snapshot;
                true
            } else {
                false
            }
        });
        if accepted {
            tracing::debug!(version = %offered, "Membership: published snapshot");
            Ok(())
        } else {
            Err(MembershipError::StaleVersion { offered, current })
        }
    }

    /// The latest published snapshot.
    pub fn current(&self) -> Arc<MembershipSnapshot> {
        self.sender.borrow().clone()
    }

    /// Subscribe to future snapshots.
    pub fn subscribe(&self) -> MembershipSubscription {
        MembershipSubscription {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receiving side of a [`MembershipFeed`].
#[derive(Debug, Clone)]
pub struct MembershipSubscription {
    receiver: watch::Receiver<Arc<MembershipSnapshot>>,
}

impl MembershipSubscription {
    /// The latest snapshot, marking it as seen.
    pub fn latest(&mut self) -> Arc<MembershipSnapshot> {
        self.receiver.borrow_and_update().clone()
    }

    /// Wait for a snapshot newer than the last one seen.
    ///
    /// Returns `None` once the feed has been dropped.
    pub async fn next(&mut self) -> Option<Arc<MembershipSnapshot>> {
        self.receiver.changed().await.ok()?;
        Some(self.latest())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::address::NetworkAddress;

    fn node(port: u16, generation: u64) -> NodeAddress {
        NodeAddress::new(
            NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            generation,
        )
    }

    #[test]
    fn test_membership_version_ordering() {
        let v0 = MembershipVersion::new();
        let v1 = v0.next();
        let v2 = v1.next();

        assert!(v0 < v1);
        assert!(v1 < v2);
        assert_eq!(v2.0, 2);
        assert_eq!(format!("{v2}"), "v2");
    }

    #[test]
    fn test_node_status_terminating() {
        assert!(!NodeStatus::Joining.is_terminating());
        assert!(!NodeStatus::Active.is_terminating());
        assert!(NodeStatus::Stopping.is_terminating());
        assert!(NodeStatus::Dead.is_terminating());
    }

    #[test]
    fn test_removed_node_is_not_newly_dead() {
        let v1 =
            MembershipSnapshot::with_active(MembershipVersion(1), [node(4500, 1), node(4501, 1)]);
        let mut v3 = v1.clone();
        v3.version = MembershipVersion(3);
        v3.members.remove(&node(4501, 1));

        assert!(!v3.is_dead(&node(4501, 1)));
        assert!(v3.newly_dead_since(&v1).is_empty());

        let v4 = v3.updated(&node(4500, 1), NodeStatus::Dead);
        assert_eq!(v4.newly_dead_since(&v1), vec![node(4500, 1)]);
    }

    #[test]
    fn test_updated_bumps_version_and_keeps_original() {
        let v1 = MembershipSnapshot::with_active(MembershipVersion(1), [node(4500, 1)]);
        let v2 = v1.updated(&node(4500, 1), NodeStatus::Dead);

        assert_eq!(v2.version, MembershipVersion(2));
        assert_eq!(v1.status(&node(4500, 1)), Some(NodeStatus::Active));
        assert_eq!(v2.status(&node(4500, 1)), Some(NodeStatus::Dead));
    }

    #[test]
    fn test_unknown_node_is_not_dead() {
        let snap = MembershipSnapshot::with_active(MembershipVersion(1), [node(4500, 1)]);
        assert!(!snap.is_dead(&node(4600, 1)));
        assert!(!snap.is_terminating(&node(4600, 1)));
    }

    #[test]
    fn test_superseded_generation_is_dead() {
        let snap = MembershipSnapshot::with_active(MembershipVersion(1), [node(4500, 2)]);
        assert!(snap.is_dead(&node(4500, 1)));
        assert!(!snap.is_dead(&node(4500, 2)));
    }

    #[test]
    fn test_stopping_is_terminating_but_not_dead() {
        let snap = MembershipSnapshot::with_active(MembershipVersion(1), [node(4500, 1)])
            .updated(&node(4500, 1), NodeStatus::Stopping);
        assert!(snap.is_terminating(&node(4500, 1)));
        assert!(!snap.is_dead(&node(4500, 1)));
    }

    #[test]
    fn test_active_members_sorted_and_filtered() {
        let snap = MembershipSnapshot::with_active(
            MembershipVersion(1),
            [node(4502, 1), node(4500, 1), node(4501, 1)],
        )
        .updated(&node(4501, 1), NodeStatus::Joining);

        assert_eq!(snap.active_members(), vec![node(4500, 1), node(4502, 1)]);
    }

    #[test]
    fn test_newly_dead_since() {
        let v1 = MembershipSnapshot::with_active(
            MembershipVersion(1),
            [node(4500, 1), node(4501, 1), node(4502, 1)],
        );
        let v2 = v1.updated(&node(4500, 1), NodeStatus::Dead);
        let v3 = v2
            .updated(&node(4501, 1), NodeStatus::Dead)
            .updated(&node(4502, 2), NodeStatus::Active);

        assert_eq!(v2.newly_dead_since(&v1), vec![node(4500, 1)]);
        // 4500 was already dead in v2; 4502 gen1 is superseded by gen2.
        assert_eq!(v3.newly_dead_since(&v2), vec![node(4501, 1), node(4502, 1)]);
        assert!(v3.newly_dead_since(&v3).is_empty());
    }

    #[tokio::test]
    async fn test_feed_rejects_stale_versions() {
        let feed = MembershipFeed::new(MembershipSnapshot::with_active(
            MembershipVersion(3),
            [node(4500, 1)],
        ));

        let none: Vec<NodeAddress> = Vec::new();
        let result = feed.publish(MembershipSnapshot::with_active(MembershipVersion(3), none));
        assert!(matches!(
            result,
            Err(MembershipError::StaleVersion {
                offered: MembershipVersion(3),
                current: MembershipVersion(3),
            })
        ));
        assert!(feed
            .publish(MembershipSnapshot::with_active(MembershipVersion(2), Vec::new()))
            .is_err());
        assert_eq!(feed.current().version, MembershipVersion(3));
    }

    #[tokio::test]
    async fn test_subscription_coalesces_to_latest() {
        let feed = MembershipFeed::new(MembershipSnapshot::new());
        let mut sub = feed.subscribe();

        for v in 1..=5 {
            feed.publish(MembershipSnapshot::with_active(MembershipVersion(v), Vec::new()))
                .expect("publish");
        }

        let latest = sub.next().await.expect("feed alive");
        assert_eq!(latest.version, MembershipVersion(5));
    }

    #[tokio::test]
    async fn test_subscription_ends_when_feed_dropped() {
        let feed = MembershipFeed::new(MembershipSnapshot::new());
        let mut sub = feed.subscribe();
        drop(feed);

        assert!(sub.next().await.is_none());
    }
}
