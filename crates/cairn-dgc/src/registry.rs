//! Per-client reference registry
//!
//! Tracks, for every connected node, the set of objects that node has faulted
//! in (its *managed* set) plus speculative prefetches that have not yet been
//! confirmed. Each node's entry is guarded by its own lock; aggregation across
//! nodes takes those locks one at a time and never holds a global lock, so the
//! union it returns is only weakly consistent.
//!
//! Calls naming a node that is unknown or already shut down are treated as a
//! disconnect race: they are logged and ignored.

use crate::ids::{NodeId, ObjectId, ObjectIdSet};
use crate::listeners::ListenerList;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Observer of references entering a node's managed set.
///
/// Called while the node's lock is held, so implementations must be fast and
/// must never call back into the registry for the same node.
pub trait ReferenceListener: Send + Sync {
    /// A single object entered `node`'s managed set
    fn reference_added(&self, node: NodeId, id: ObjectId);

    /// Several objects entered `node`'s managed set
    fn references_added(&self, node: NodeId, ids: &ObjectIdSet) {
        for &id in ids {
            self.reference_added(node, id);
        }
    }
}

#[derive(Default)]
struct NodeEntry {
    managed: FxHashSet<ObjectId>,
    prefetched: FxHashSet<ObjectId>,
    /// Cleared on shutdown; callers that grabbed the entry just before removal
    /// observe this and back off.
    connected: bool,
}

/// Registry of the objects each connected node currently holds
pub struct ReferenceRegistry {
    nodes: RwLock<FxHashMap<NodeId, Arc<Mutex<NodeEntry>>>>,
    listeners: ListenerList<dyn ReferenceListener>,
}

impl Default for ReferenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(FxHashMap::default()),
            listeners: ListenerList::new("reference-registry"),
        }
    }

    /// Register a newly connected node.
    ///
    /// Returns false if the node is already known.
    pub fn startup_node(&self, node: NodeId) -> bool {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&node) {
            debug!(node = %node, "Node already started");
            return false;
        }
        let entry = NodeEntry {
            connected: true,
            ..Default::default()
        };
        nodes.insert(node, Arc::new(Mutex::new(entry)));
        debug!(node = %node, "Node started");
        true
    }

    /// Discard everything known about a node.
    ///
    /// Returns false if the node was not registered.
    pub fn shutdown_node(&self, node: NodeId) -> bool {
        let removed = self.nodes.write().remove(&node);
        match removed {
            Some(entry) => {
                let mut entry = entry.lock();
                let released = entry.managed.len();
                entry.connected = false;
                entry.managed.clear();
                entry.prefetched.clear();
                debug!(node = %node, released, "Node shut down");
                true
            }
            None => {
                warn!(node = %node, "Shutdown of unknown node ignored");
                false
            }
        }
    }

    fn entry(&self, node: NodeId) -> Option<Arc<Mutex<NodeEntry>>> {
        self.nodes.read().get(&node).cloned()
    }

    /// Run `f` on the node's entry under its lock, or log and return `None`.
    fn with_node<R>(
        &self,
        node: NodeId,
        op: &'static str,
        f: impl FnOnce(&mut NodeEntry) -> R,
    ) -> Option<R> {
        let Some(entry) = self.entry(node) else {
            warn!(node = %node, op, "Operation on unknown node ignored");
            return None;
        };
        let mut guard = entry.lock();
        if !guard.connected {
            warn!(node = %node, op, "Operation on disconnected node ignored");
            return None;
        }
        Some(f(&mut guard))
    }

    /// Add one object to a node's managed set.
    ///
    /// Returns true if the object was not already managed by the node.
    pub fn add_reference(&self, node: NodeId, id: ObjectId) -> bool {
        self.with_node(node, "add_reference", |entry| {
            entry.prefetched.remove(&id);
            let added = entry.managed.insert(id);
            if added {
                self.listeners.notify(|l| l.reference_added(node, id));
            }
            added
        })
        .unwrap_or(false)
    }

    /// Add objects to a node's managed set.
    ///
    /// Returns the subset that was not already managed; that subset is what the
    /// caller has to broadcast.
    pub fn add_references(&self, node: NodeId, ids: &ObjectIdSet) -> ObjectIdSet {
        self.with_node(node, "add_references", |entry| {
            let mut added = ObjectIdSet::new();
            for &id in ids {
                entry.prefetched.remove(&id);
                if entry.managed.insert(id) {
                    added.insert(id);
                }
            }
            if !added.is_empty() {
                self.listeners.notify(|l| l.references_added(node, &added));
            }
            trace!(node = %node, requested = ids.len(), added = added.len(), "References added");
            added
        })
        .unwrap_or_default()
    }

    /// Remove `removed` from the node's managed set and strip from `requested`
    /// everything the node still manages.
    pub fn remove_references(
        &self,
        node: NodeId,
        removed: &ObjectIdSet,
        requested: &mut ObjectIdSet,
    ) {
        self.with_node(node, "remove_references", |entry| {
            for id in removed {
                entry.managed.remove(id);
            }
            requested.retain(|id| !entry.managed.contains(id));
        });
    }

    /// Whether the node manages `id`
    pub fn has_reference(&self, node: NodeId, id: ObjectId) -> bool {
        self.entry(node)
            .map(|e| {
                let e = e.lock();
                e.connected && e.managed.contains(&id)
            })
            .unwrap_or(false)
    }

    /// Size of the node's managed set (0 for unknown nodes)
    pub fn reference_count(&self, node: NodeId) -> usize {
        self.entry(node).map(|e| e.lock().managed.len()).unwrap_or(0)
    }

    /// Size of the node's prefetched set (0 for unknown nodes)
    pub fn prefetched_count(&self, node: NodeId) -> usize {
        self.entry(node)
            .map(|e| e.lock().prefetched.len())
            .unwrap_or(0)
    }

    /// Copy of the node's managed set, `None` for unknown nodes
    pub fn managed_ids(&self, node: NodeId) -> Option<ObjectIdSet> {
        let entry = self.entry(node)?;
        let entry = entry.lock();
        entry
            .connected
            .then(|| entry.managed.iter().copied().collect())
    }

    /// Record speculative faults sent to a node ahead of its request.
    ///
    /// Ids the node already manages are not prefetched again.
    pub fn add_prefetched(&self, node: NodeId, ids: &ObjectIdSet) {
        self.with_node(node, "add_prefetched", |entry| {
            for &id in ids {
                if !entry.managed.contains(&id) {
                    entry.prefetched.insert(id);
                }
            }
        });
    }

    /// Objects the store could not find: drop them from the node's
    /// prefetched set without ever adding them to its managed set.
    pub fn missing_object_ids(&self, node: NodeId, ids: &ObjectIdSet) {
        self.with_node(node, "missing_object_ids", |entry| {
            for id in ids {
                entry.prefetched.remove(id);
            }
        });
    }

    fn entries(&self) -> Vec<(NodeId, Arc<Mutex<NodeEntry>>)> {
        self.nodes
            .read()
            .iter()
            .map(|(node, entry)| (*node, entry.clone()))
            .collect()
    }

    /// Union of all managed sets, taking each node lock in turn
    pub fn all_referenced_ids(&self) -> ObjectIdSet {
        let mut out = ObjectIdSet::new();
        self.add_all_referenced_ids_to(&mut out);
        out
    }

    /// Add the union of all managed sets to `out`
    pub fn add_all_referenced_ids_to(&self, out: &mut ObjectIdSet) {
        for (_, entry) in self.entries() {
            let entry = entry.lock();
            if entry.connected {
                out.extend(entry.managed.iter().copied());
            }
        }
    }

    /// Whether any connected node manages `id`
    pub fn is_referenced(&self, id: ObjectId) -> bool {
        self.entries().into_iter().any(|(_, entry)| {
            let entry = entry.lock();
            entry.connected && entry.managed.contains(&id)
        })
    }

    /// Nodes that currently manage `id`
    pub fn nodes_referencing(&self, id: ObjectId) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self
            .entries()
            .into_iter()
            .filter(|(_, entry)| {
                let entry = entry.lock();
                entry.connected && entry.managed.contains(&id)
            })
            .map(|(node, _)| node)
            .collect();
        nodes.sort();
        nodes
    }

    /// Currently connected nodes, sorted
    pub fn connected_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.nodes.read().keys().copied().collect();
        nodes.sort();
        nodes
    }

    /// Number of connected nodes
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Subscribe to reference-added events
    pub fn add_listener(&self, listener: Arc<dyn ReferenceListener>) -> bool {
        self.listeners.add(listener)
    }

    /// Unsubscribe from reference-added events
    pub fn remove_listener(&self, listener: &Arc<dyn ReferenceListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Whether `listener` is subscribed
    pub fn has_listener(&self, listener: &Arc<dyn ReferenceListener>) -> bool {
        self.listeners.contains(listener)
    }

    /// Number of subscribed listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}
