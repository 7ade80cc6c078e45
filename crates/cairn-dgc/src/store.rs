//! Object store collaborator
//!
//! The coordinator never owns objects. It asks an [`ObjectStore`] for roots,
//! candidates and outgoing references, asks it to quiesce mutations before
//! the final rescue pass, and hands it the confirmed garbage set.

use crate::error::{DgcError, DgcResult};
use crate::ids::{ObjectId, ObjectIdSet};
use crate::telemetry::CycleInfo;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, trace};

/// Handle passed to [`ObjectStore::request_quiesce`].
///
/// The store calls [`acknowledge`](Self::acknowledge) once no transaction can
/// change the object graph any more. Acknowledging a cycle that has already
/// been canceled is harmless.
pub struct QuiesceAck {
    iteration: u64,
    ack: Box<dyn FnOnce() + Send>,
}

impl QuiesceAck {
    /// Wrap the callback that moves the coordinator from pausing to paused
    pub fn new(iteration: u64, ack: impl FnOnce() + Send + 'static) -> Self {
        Self {
            iteration,
            ack: Box::new(ack),
        }
    }

    /// Iteration of the cycle waiting for this acknowledgement
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Report that mutations are quiesced
    pub fn acknowledge(self) {
        (self.ack)();
    }
}

impl fmt::Debug for QuiesceAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuiesceAck")
            .field("iteration", &self.iteration)
            .finish_non_exhaustive()
    }
}

/// Storage and object-graph collaborator of the coordinator
pub trait ObjectStore: Send + Sync {
    /// Named roots of the object graph
    fn root_ids(&self) -> ObjectIdSet;

    /// Every object currently stored
    fn all_object_ids(&self) -> ObjectIdSet;

    /// Objects currently resident in memory
    fn object_ids_in_cache(&self) -> ObjectIdSet;

    /// Outgoing references of `id`, loading it if needed; `None` if the
    /// object does not exist
    fn references_from(&self, id: ObjectId) -> Option<Vec<ObjectId>>;

    /// Outgoing references of `id` only if it is resident in memory
    fn cached_references_from(&self, id: ObjectId) -> Option<Vec<ObjectId>>;

    /// Whether `id` is stored
    fn exists(&self, id: ObjectId) -> bool;

    /// Number of stored objects
    fn object_count(&self) -> u64;

    /// Remove the given objects permanently
    fn delete(&self, garbage: &ObjectIdSet) -> DgcResult<()>;

    /// Stop applying graph mutations, then call [`QuiesceAck::acknowledge`].
    ///
    /// May acknowledge synchronously from inside this call.
    fn request_quiesce(&self, ack: QuiesceAck);

    /// Resume applying mutations after a pause (also after a canceled one)
    fn resume_mutations(&self);
}

impl<'s> dyn ObjectStore + 's {
    /// Depth-first walk of everything reachable from `roots`
    pub fn reachable<I>(&self, roots: I) -> Reachable<'_>
    where
        I: IntoIterator<Item = ObjectId>,
    {
        Reachable::new(self, roots)
    }
}

/// Iterator over the objects reachable from a root set.
///
/// Roots are always yielded. Children are followed only when they pass the
/// optional filter, so a walk can be confined to a candidate set.
pub struct Reachable<'a> {
    store: &'a dyn ObjectStore,
    filter: Option<&'a ObjectIdSet>,
    cached_only: bool,
    stack: Vec<ObjectId>,
    seen: FxHashSet<ObjectId>,
}

impl<'a> Reachable<'a> {
    /// Start a walk at `roots`
    pub fn new<I>(store: &'a dyn ObjectStore, roots: I) -> Self
    where
        I: IntoIterator<Item = ObjectId>,
    {
        let mut seen = FxHashSet::default();
        let mut stack = Vec::new();
        for root in roots {
            if seen.insert(root) {
                stack.push(root);
            }
        }
        Self {
            store,
            filter: None,
            cached_only: false,
            stack,
            seen,
        }
    }

    /// Only follow references into `filter`
    pub fn within(mut self, filter: &'a ObjectIdSet) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Only read references of objects resident in memory
    pub fn cached_only(mut self) -> Self {
        self.cached_only = true;
        self
    }
}

impl Iterator for Reachable<'_> {
    type Item = ObjectId;

    fn next(&mut self) -> Option<ObjectId> {
        let id = self.stack.pop()?;
        let references = if self.cached_only {
            self.store.cached_references_from(id)
        } else {
            self.store.references_from(id)
        };
        for child in references.into_iter().flatten() {
            if self.filter.is_some_and(|f| !f.contains(&child)) {
                continue;
            }
            if self.seen.insert(child) {
                self.stack.push(child);
            }
        }
        Some(id)
    }
}

/// External veto on a confirmed garbage set
pub trait DeletionApprover: Send + Sync {
    /// Return false to cancel the cycle instead of deleting `garbage`
    fn approve(&self, info: &CycleInfo, garbage: &ObjectIdSet) -> bool;
}

#[derive(Default)]
struct Graph {
    objects: FxHashMap<ObjectId, Vec<ObjectId>>,
    roots: ObjectIdSet,
    cached: FxHashSet<ObjectId>,
}

/// In-process [`ObjectStore`] over an adjacency map.
///
/// Quiesce requests are acknowledged immediately unless
/// [`hold_acks`](Self::hold_acks) is set, in which case they are kept until
/// [`release_held_acks`](Self::release_held_acks).
#[derive(Default)]
pub struct InMemoryObjectStore {
    graph: RwLock<Graph>,
    hold_acks: AtomicBool,
    held: Mutex<Vec<QuiesceAck>>,
    quiesced: AtomicBool,
    quiesce_requests: AtomicUsize,
    deleted: Mutex<Vec<ObjectIdSet>>,
}

impl InMemoryObjectStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `id` with its outgoing references; the object starts resident
    pub fn insert(&self, id: ObjectId, references: impl IntoIterator<Item = ObjectId>) {
        let mut graph = self.graph.write();
        graph.objects.insert(id, references.into_iter().collect());
        graph.cached.insert(id);
    }

    /// Replace the outgoing references of an existing object
    pub fn set_references(
        &self,
        id: ObjectId,
        references: impl IntoIterator<Item = ObjectId>,
    ) -> bool {
        let mut graph = self.graph.write();
        match graph.objects.get_mut(&id) {
            Some(refs) => {
                *refs = references.into_iter().collect();
                true
            }
            None => false,
        }
    }

    /// Add the edge `from -> to`; false if `from` is not stored
    pub fn link(&self, from: ObjectId, to: ObjectId) -> bool {
        match self.graph.write().objects.get_mut(&from) {
            Some(refs) => {
                refs.push(to);
                true
            }
            None => false,
        }
    }

    /// Remove every edge `from -> to`; false if there was none
    pub fn unlink(&self, from: ObjectId, to: ObjectId) -> bool {
        match self.graph.write().objects.get_mut(&from) {
            Some(refs) => {
                let before = refs.len();
                refs.retain(|r| *r != to);
                refs.len() != before
            }
            None => false,
        }
    }

    /// Mark `id` as a root
    pub fn add_root(&self, id: ObjectId) {
        self.graph.write().roots.insert(id);
    }

    /// Unmark `id` as a root
    pub fn remove_root(&self, id: ObjectId) -> bool {
        self.graph.write().roots.remove(&id)
    }

    /// Drop an object outside of any collection
    pub fn remove(&self, id: ObjectId) -> bool {
        let mut graph = self.graph.write();
        graph.roots.remove(&id);
        graph.cached.remove(&id);
        graph.objects.remove(&id).is_some()
    }

    /// Evict `id` from memory; it stays stored
    pub fn evict(&self, id: ObjectId) -> bool {
        self.graph.write().cached.remove(&id)
    }

    /// Fault `id` back into memory
    pub fn fault_in(&self, id: ObjectId) -> bool {
        let mut graph = self.graph.write();
        if graph.objects.contains_key(&id) {
            graph.cached.insert(id);
            true
        } else {
            false
        }
    }

    /// Keep quiesce acknowledgements instead of sending them
    pub fn hold_acks(&self, hold: bool) {
        self.hold_acks.store(hold, Ordering::SeqCst);
    }

    /// Send every held acknowledgement; returns how many were sent
    pub fn release_held_acks(&self) -> usize {
        let held: Vec<QuiesceAck> = std::mem::take(&mut *self.held.lock());
        let n = held.len();
        for ack in held {
            ack.acknowledge();
        }
        n
    }

    /// Whether mutations are currently quiesced
    pub fn is_quiesced(&self) -> bool {
        self.quiesced.load(Ordering::SeqCst)
    }

    /// Number of quiesce requests received
    pub fn quiesce_requests(&self) -> usize {
        self.quiesce_requests.load(Ordering::SeqCst)
    }

    /// Garbage sets passed to [`ObjectStore::delete`], oldest first
    pub fn deleted_batches(&self) -> Vec<ObjectIdSet> {
        self.deleted.lock().clone()
    }

    /// Total number of objects deleted by collections
    pub fn deleted_count(&self) -> usize {
        self.deleted.lock().iter().map(|b| b.len()).sum()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn root_ids(&self) -> ObjectIdSet {
        self.graph.read().roots.clone()
    }

    fn all_object_ids(&self) -> ObjectIdSet {
        self.graph.read().objects.keys().copied().collect()
    }

    fn object_ids_in_cache(&self) -> ObjectIdSet {
        let graph = self.graph.read();
        graph
            .cached
            .iter()
            .filter(|id| graph.objects.contains_key(id))
            .copied()
            .collect()
    }

    fn references_from(&self, id: ObjectId) -> Option<Vec<ObjectId>> {
        self.graph.read().objects.get(&id).cloned()
    }

    fn cached_references_from(&self, id: ObjectId) -> Option<Vec<ObjectId>> {
        let graph = self.graph.read();
        if !graph.cached.contains(&id) {
            return None;
        }
        graph.objects.get(&id).cloned()
    }

    fn exists(&self, id: ObjectId) -> bool {
        self.graph.read().objects.contains_key(&id)
    }

    fn object_count(&self) -> u64 {
        self.graph.read().objects.len() as u64
    }

    fn delete(&self, garbage: &ObjectIdSet) -> DgcResult<()> {
        let mut graph = self.graph.write();
        if let Some(missing) = garbage.iter().find(|id| !graph.objects.contains_key(id)) {
            return Err(DgcError::Store(format!("cannot delete {missing}: not stored")));
        }
        for id in garbage {
            graph.objects.remove(id);
            graph.cached.remove(id);
            graph.roots.remove(id);
        }
        drop(graph);
        debug!(count = garbage.len(), "Deleted garbage");
        self.deleted.lock().push(garbage.clone());
        Ok(())
    }

    fn request_quiesce(&self, ack: QuiesceAck) {
        self.quiesce_requests.fetch_add(1, Ordering::SeqCst);
        self.quiesced.store(true, Ordering::SeqCst);
        if self.hold_acks.load(Ordering::SeqCst) {
            trace!(iteration = ack.iteration(), "Holding quiesce ack");
            self.held.lock().push(ack);
        } else {
            ack.acknowledge();
        }
    }

    fn resume_mutations(&self) {
        self.quiesced.store(false, Ordering::SeqCst);
        self.held.lock().clear();
    }
}
