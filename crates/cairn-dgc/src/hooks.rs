//! Mark and rescue strategies for the different cycle kinds.
//!
//! A [`GcHook`] decides where candidates come from, which roots the mark
//! walk starts from, how far the walk may go, and which ids rescue passes
//! protect. [`mark`] and [`rescue`] are shared by every kind.

use crate::changes::{NewReferenceCollector, YoungGenCollector};
use crate::ids::{ObjectId, ObjectIdSet};
use crate::registry::ReferenceRegistry;
use crate::store::{ObjectStore, Reachable};
use crate::telemetry::GcType;
use tracing::debug;

/// What a hook can read during a cycle
pub(crate) struct Collaborators<'a> {
    pub(crate) store: &'a dyn ObjectStore,
    pub(crate) registry: &'a ReferenceRegistry,
    pub(crate) new_references: &'a NewReferenceCollector,
    pub(crate) young: Option<&'a YoungGenCollector>,
}

impl Collaborators<'_> {
    /// Ids held by clients plus references written since monitoring began
    fn referenced_and_new(&self) -> ObjectIdSet {
        let mut ids = ObjectIdSet::new();
        self.registry.add_all_referenced_ids_to(&mut ids);
        let from_clients = ids.len();
        self.new_references.add_new_references_to(&mut ids);
        debug!(
            rescue_ids = ids.len(),
            from_clients,
            from_changes = ids.len() - from_clients,
            "Collected rescue ids"
        );
        ids
    }
}

pub(crate) trait GcHook {
    fn gc_type(&self) -> GcType;

    fn candidates(&self, c: &Collaborators<'_>) -> ObjectIdSet;

    /// Roots of the mark walk; `None` skips traversal entirely
    fn roots(&self, c: &Collaborators<'_>, candidates: &ObjectIdSet) -> Option<ObjectIdSet>;

    /// Confine every walk to the candidate set
    fn restrict_to_candidates(&self) -> bool {
        true
    }

    /// Read references of resident objects only
    fn cached_only(&self) -> bool {
        false
    }

    fn rescue_ids(&self, c: &Collaborators<'_>) -> ObjectIdSet {
        c.referenced_and_new()
    }
}

/// Whole graph from the store roots
pub(crate) struct FullHook;

impl GcHook for FullHook {
    fn gc_type(&self) -> GcType {
        GcType::Full
    }

    fn candidates(&self, c: &Collaborators<'_>) -> ObjectIdSet {
        c.store.all_object_ids()
    }

    fn roots(&self, c: &Collaborators<'_>, _candidates: &ObjectIdSet) -> Option<ObjectIdSet> {
        Some(c.store.root_ids())
    }

    fn restrict_to_candidates(&self) -> bool {
        false
    }
}

/// Initialized young objects, walked through resident objects only.
///
/// Everything resident that is not a candidate is a root, as is the
/// remembered set: an old object evicted while holding a young reference is
/// no longer readable but still counts.
pub(crate) struct YoungHook;

impl GcHook for YoungHook {
    fn gc_type(&self) -> GcType {
        GcType::Young
    }

    fn candidates(&self, c: &Collaborators<'_>) -> ObjectIdSet {
        let Some(young) = c.young else {
            return ObjectIdSet::new();
        };
        let candidates = young.candidates();
        debug!(
            tracked = young.young_count(),
            candidates = candidates.len(),
            "Young generation candidates"
        );
        candidates
    }

    fn roots(&self, c: &Collaborators<'_>, candidates: &ObjectIdSet) -> Option<ObjectIdSet> {
        let mut roots = c.young.map(|y| y.remembered_set()).unwrap_or_default();
        roots.extend(c.store.root_ids());
        roots.extend(
            c.store
                .object_ids_in_cache()
                .into_iter()
                .filter(|id| !candidates.contains(id)),
        );
        Some(roots)
    }

    fn cached_only(&self) -> bool {
        true
    }

    fn rescue_ids(&self, c: &Collaborators<'_>) -> ObjectIdSet {
        let mut ids = c.referenced_and_new();
        if let Some(young) = c.young {
            ids.extend(young.remembered_set());
        }
        ids
    }
}

/// Caller-chosen candidates; every other stored object is assumed live
pub(crate) struct InlineGcHook {
    pub(crate) ids: ObjectIdSet,
}

impl GcHook for InlineGcHook {
    fn gc_type(&self) -> GcType {
        GcType::InlineGc
    }

    fn candidates(&self, c: &Collaborators<'_>) -> ObjectIdSet {
        existing(c, &self.ids)
    }

    fn roots(&self, c: &Collaborators<'_>, candidates: &ObjectIdSet) -> Option<ObjectIdSet> {
        let mut roots: ObjectIdSet = c
            .store
            .all_object_ids()
            .into_iter()
            .filter(|id| !candidates.contains(id))
            .collect();
        roots.extend(c.store.root_ids());
        Some(roots)
    }
}

/// Objects the store already knows have no inbound references
pub(crate) struct InlineCleanupHook {
    pub(crate) ids: ObjectIdSet,
}

impl GcHook for InlineCleanupHook {
    fn gc_type(&self) -> GcType {
        GcType::InlineCleanup
    }

    fn candidates(&self, c: &Collaborators<'_>) -> ObjectIdSet {
        let mut candidates = existing(c, &self.ids);
        // A root is never garbage, whatever the caller believes.
        let roots = c.store.root_ids();
        candidates.retain(|id| !roots.contains(id));
        candidates
    }

    fn roots(&self, _c: &Collaborators<'_>, _candidates: &ObjectIdSet) -> Option<ObjectIdSet> {
        None
    }
}

fn existing(c: &Collaborators<'_>, ids: &ObjectIdSet) -> ObjectIdSet {
    ids.iter().copied().filter(|id| c.store.exists(*id)).collect()
}

fn walk<'a>(
    c: &Collaborators<'a>,
    hook: &dyn GcHook,
    roots: impl IntoIterator<Item = ObjectId>,
    candidates: &'a ObjectIdSet,
) -> Reachable<'a> {
    let mut walk = Reachable::new(c.store, roots);
    if hook.restrict_to_candidates() {
        walk = walk.within(candidates);
    }
    if hook.cached_only() {
        walk = walk.cached_only();
    }
    walk
}

/// Remove from `candidates` everything reachable from the hook's roots
pub(crate) fn mark(c: &Collaborators<'_>, hook: &dyn GcHook, candidates: &mut ObjectIdSet) {
    let Some(roots) = hook.roots(c, candidates) else {
        return;
    };
    let live: Vec<ObjectId> = walk(c, hook, roots, candidates)
        .filter(|id| candidates.contains(id))
        .collect();
    for id in &live {
        candidates.remove(id);
    }
}

/// Remove every candidate in `rescue_ids`, and every candidate reachable from
/// one, from `candidates`. Returns how many were removed.
pub(crate) fn rescue(
    c: &Collaborators<'_>,
    candidates: &mut ObjectIdSet,
    rescue_ids: &ObjectIdSet,
) -> u64 {
    let roots: Vec<ObjectId> = rescue_ids
        .iter()
        .copied()
        .filter(|id| candidates.contains(id))
        .collect();
    if roots.is_empty() {
        return 0;
    }
    // Objects reachable from a rescued object are protected whether or not
    // the cycle kind confines its mark walk.
    let saved: Vec<ObjectId> = Reachable::new(c.store, roots)
        .within(candidates)
        .collect();
    let before = candidates.len();
    for id in &saved {
        candidates.remove(id);
    }
    (before - candidates.len()) as u64
}
