//! Core protocol types for lpbcast
//!
//! All types here are designed for deterministic serialization via postcard.
//! Field order matters for canonical encoding.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte fixed-size array used for checksums.
pub type Bytes32 = [u8; 32];

// =============================================================================
// IDENTITY TYPES
// =============================================================================

/// Network identity of a node, e.g. `127.0.0.1:9200`.
///
/// The transport resolves a `NodeId` to a reachable endpoint, so the id doubles
/// as the node's address.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id, rejecting empty or whitespace-bearing values
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(Error::InvalidNodeId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for NodeId {
    type Error = Error;

    fn try_from(id: String) -> Result<Self> {
        Self::new(id)
    }
}

impl std::str::FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Event identifier: the origin node plus its local sequence number.
///
/// Only the origin issues sequence numbers for itself, which makes ids
/// globally unique without coordination.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId {
    pub origin: NodeId,
    pub seq: u64,
}

impl EventId {
    pub fn new(origin: NodeId, seq: u64) -> Self {
        Self { origin, seq }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.seq)
    }
}

// =============================================================================
// EVENTS
// =============================================================================

/// An operation disseminated through the gossip layer. Immutable once created.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: EventId,
    /// Opaque operation bytes produced by the document layer
    pub payload: Vec<u8>,
    /// Creation time at the origin (unix millis)
    pub origin_timestamp: u64,
}

impl Event {
    pub fn digest(&self) -> EventDigest {
        EventDigest {
            id: self.id.clone(),
        }
    }
}

/// Identifier-only summary exchanged before full payload transfer
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EventDigest {
    pub id: EventId,
}

// =============================================================================
// MEMBERSHIP
// =============================================================================

/// One peer as known to a node's membership view
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionEntry {
    pub node_id: NodeId,
    /// Incarnation of the node, bumped every time it (re)joins
    pub generation: u64,
    /// Rounds since the last successful contact
    pub heartbeat_age: u32,
}

impl SubscriptionEntry {
    pub fn new(node_id: NodeId, generation: u64) -> Self {
        Self {
            node_id,
            generation,
            heartbeat_age: 0,
        }
    }
}

/// Current unix time in milliseconds
pub fn unix_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
