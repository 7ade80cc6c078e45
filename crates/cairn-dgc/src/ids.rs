//! Identifiers for shared objects and connected client nodes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Identifier of a shared object in the clustered graph.
///
/// Totally ordered and never reused while any client still references it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Create an id from its raw value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value of this id
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ObjectId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectID({})", self.0)
    }
}

/// Identifier of a connected client session.
///
/// Created on client handshake and destroyed on disconnect; the registry entry
/// keyed by a `NodeId` is the only liveness signal for that client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    /// Create a node id from its raw value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value of this id
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientID({})", self.0)
    }
}

/// Ordered set of object ids.
///
/// Garbage sets handed to the store are always ordered so deletion I/O walks
/// the id space sequentially.
pub type ObjectIdSet = BTreeSet<ObjectId>;

/// Build an [`ObjectIdSet`] from raw values.
pub fn id_set<I: IntoIterator<Item = u64>>(raw: I) -> ObjectIdSet {
    raw.into_iter().map(ObjectId::new).collect()
}
