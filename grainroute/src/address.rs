//! Node addressing: where an activation lives.
//!
//! - [`NetworkAddress`]: IP address + port of a node process
//! - [`NodeAddress`]: a network address plus the generation of the process
//!   currently bound to it
//!
//! A node that restarts on the same `ip:port` comes back with a higher
//! generation. The two incarnations are never the same node: records that
//! point at the old generation are stale even though the endpoint matches.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Network endpoint of a node (IPv4/IPv6 + port).
///
/// # Examples
///
/// ```
/// use grainroute::NetworkAddress;
/// use std::net::{IpAddr, Ipv4Addr};
///
/// let addr = NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4500);
/// assert_eq!(addr.to_string(), "127.0.0.1:4500");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkAddress {
    /// IP address (IPv4 or IPv6).
    pub ip: IpAddr,
    /// Port number.
    pub port: u16,
}

impl NetworkAddress {
    /// Create a new network address.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Parse from string "ip:port" format.
    ///
    /// Supports both IPv4 (`127.0.0.1:4500`) and IPv6 (`[::1]:4500`) notation.
    ///
    /// # Errors
    ///
    /// Returns error if IP or port cannot be parsed.
    pub fn parse(s: &str) -> Result<Self, NetworkAddressParseError> {
        let (ip_str, port_str) = if let Some(rest) = s.strip_prefix('[') {
            let (ip, tail) = rest
                .split_once(']')
                .ok_or(NetworkAddressParseError::InvalidIp)?;
            let port = tail
                .strip_prefix(':')
                .ok_or(NetworkAddressParseError::MissingPort)?;
            (ip, port)
        } else {
            s.rsplit_once(':')
                .ok_or(NetworkAddressParseError::MissingPort)?
        };

        let ip: IpAddr = ip_str
            .parse()
            .map_err(|_| NetworkAddressParseError::InvalidIp)?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| NetworkAddressParseError::InvalidPort)?;
        Ok(Self::new(ip, port))
    }
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// Error parsing a network address from string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkAddressParseError {
    /// The IP address could not be parsed.
    #[error("invalid IP address")]
    InvalidIp,
    /// The port number could not be parsed.
    #[error("invalid port number")]
    InvalidPort,
    /// No port separator (`:`) found in the input.
    #[error("missing port separator")]
    MissingPort,
}

/// Identifies a specific node process in the cluster.
///
/// The `generation` is assigned when the process starts and only grows, so
/// a restarted node at the same endpoint is distinguishable from its
/// predecessor.
///
/// Ordering is by endpoint, then generation. Placement relies on this
/// ordering to sort candidates identically on every node.
///
/// # Examples
///
/// ```
/// use grainroute::{NetworkAddress, NodeAddress};
/// use std::net::{IpAddr, Ipv4Addr};
///
/// let addr = NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4500);
/// let node = NodeAddress::new(addr, 1);
/// assert_eq!(node.generation(), 1);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    endpoint: NetworkAddress,
    generation: u64,
}

impl NodeAddress {
    /// Create a new node address.
    pub fn new(endpoint: NetworkAddress, generation: u64) -> Self {
        Self {
            endpoint,
            generation,
        }
    }

    /// The network endpoint of this node.
    pub fn endpoint(&self) -> &NetworkAddress {
        &self.endpoint
    }

    /// The generation counter for this node instance.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True if `other` is a later incarnation at the same endpoint.
    pub fn is_superseded_by(&self, other: &NodeAddress) -> bool {
        self.endpoint == other.endpoint && other.generation > self.generation
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@gen{}", self.endpoint, self.generation)
    }
}
