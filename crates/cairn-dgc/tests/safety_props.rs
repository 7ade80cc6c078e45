//! Randomized safety check: no held object and no object reachable from a
//! root or a held object is ever deleted, whatever the clients and mutators
//! do before and during a cycle.

use cairn_dgc::{
    CollectionCoordinator, CycleEvent, CycleInfo, CycleListener, CycleOutcome, DgcConfig,
    GcContext, GcRequest, InMemoryObjectStore, NodeId, ObjectId, ObjectIdSet, ObjectStore,
    ReferenceRegistry, id_set,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::{Arc, Weak};

const MAX_OBJECTS: u64 = 16;
const NODES: u8 = 2;

#[derive(Debug, Clone)]
enum Mutation {
    Hold(u8, u64),
    Release(u8, u64),
    Link(u64, u64),
    Unlink(u64, u64),
}

#[derive(Debug, Clone)]
enum Op {
    Mutate(Mutation),
    Gc {
        inline: Option<Vec<u64>>,
        during: Vec<Mutation>,
    },
}

fn oid(n: u64) -> ObjectId {
    ObjectId::new(n)
}

fn node(n: u8) -> NodeId {
    NodeId::new(u64::from(n) + 1)
}

/// Applies mutations the way a well-behaved client would: it can only hold
/// or link objects it can currently reach.
struct Mutator {
    store: Arc<InMemoryObjectStore>,
    registry: Arc<ReferenceRegistry>,
    coordinator: Weak<CollectionCoordinator>,
}

impl Mutator {
    fn live_roots(&self) -> ObjectIdSet {
        let mut roots = self.store.root_ids();
        self.registry.add_all_referenced_ids_to(&mut roots);
        roots
    }

    fn obtainable(&self) -> ObjectIdSet {
        let store: &dyn ObjectStore = &*self.store;
        store
            .reachable(self.live_roots())
            .filter(|id| store.exists(*id))
            .collect()
    }

    fn apply(&self, mutation: &Mutation) {
        let obtainable = self.obtainable();
        match *mutation {
            Mutation::Hold(n, i) => {
                if obtainable.contains(&oid(i)) {
                    self.registry.add_reference(node(n), oid(i));
                }
            }
            Mutation::Release(n, i) => {
                let mut requested = ObjectIdSet::new();
                self.registry
                    .remove_references(node(n), &id_set([i]), &mut requested);
            }
            Mutation::Link(a, b) => {
                if obtainable.contains(&oid(a)) && obtainable.contains(&oid(b)) {
                    self.store.link(oid(a), oid(b));
                    if let Some(coordinator) = self.coordinator.upgrade() {
                        coordinator.changed(oid(a), None, Some(oid(b)));
                    }
                }
            }
            Mutation::Unlink(a, b) => {
                if self.store.unlink(oid(a), oid(b)) {
                    if let Some(coordinator) = self.coordinator.upgrade() {
                        coordinator.changed(oid(a), Some(oid(b)), None);
                    }
                }
            }
        }
    }
}

/// Runs queued mutations right after marking, while the cycle is in flight
struct MidCycle {
    mutator: Arc<Mutator>,
    pending: Mutex<Vec<Mutation>>,
}

impl CycleListener for MidCycle {
    fn on_cycle_event(&self, event: CycleEvent, _info: &CycleInfo) {
        if event == CycleEvent::MarkResults {
            let pending = std::mem::take(&mut *self.pending.lock());
            for mutation in &pending {
                self.mutator.apply(mutation);
            }
        }
    }
}

fn mutation_strategy() -> impl Strategy<Value = Mutation> {
    prop_oneof![
        (0..NODES, 0..MAX_OBJECTS).prop_map(|(n, i)| Mutation::Hold(n, i)),
        (0..NODES, 0..MAX_OBJECTS).prop_map(|(n, i)| Mutation::Release(n, i)),
        (0..MAX_OBJECTS, 0..MAX_OBJECTS).prop_map(|(a, b)| Mutation::Link(a, b)),
        (0..MAX_OBJECTS, 0..MAX_OBJECTS).prop_map(|(a, b)| Mutation::Unlink(a, b)),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => mutation_strategy().prop_map(Op::Mutate),
        1 => prop::collection::vec(mutation_strategy(), 0..6)
            .prop_map(|during| Op::Gc { inline: None, during }),
        1 => (
            prop::collection::vec(0..MAX_OBJECTS, 1..6),
            prop::collection::vec(mutation_strategy(), 0..4),
        )
            .prop_map(|(ids, during)| Op::Gc { inline: Some(ids), during }),
    ]
}

fn assert_safe(mutator: &Mutator) -> Result<(), TestCaseError> {
    for id in mutator.registry.all_referenced_ids() {
        prop_assert!(mutator.store.exists(id), "held object {} was deleted", id);
    }
    let store: &dyn ObjectStore = &*mutator.store;
    for id in store.reachable(mutator.live_roots()) {
        prop_assert!(store.exists(id), "live object {} was deleted", id);
        for child in store.references_from(id).unwrap_or_default() {
            prop_assert!(
                store.exists(child),
                "dangling reference {} -> {}",
                id,
                child
            );
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_collection_never_deletes_live_objects(
        count in 2..MAX_OBJECTS,
        edges in prop::collection::vec((0..MAX_OBJECTS, 0..MAX_OBJECTS), 0..24),
        ops in prop::collection::vec(op_strategy(), 1..40),
    ) {
        let store = Arc::new(InMemoryObjectStore::new());
        for i in 0..count {
            let refs: Vec<ObjectId> = edges
                .iter()
                .filter(|(from, to)| *from % count == i && *to < count)
                .map(|(_, to)| oid(*to))
                .collect();
            store.insert(oid(i), refs);
        }
        store.add_root(oid(0));

        let ctx = GcContext::new_without_timers(
            DgcConfig::new().periodic_enabled(false),
            store.clone(),
        )
        .unwrap();
        ctx.start();
        for n in 0..NODES {
            ctx.registry().startup_node(node(n));
        }

        let mutator = Arc::new(Mutator {
            store: store.clone(),
            registry: ctx.registry().clone(),
            coordinator: Arc::downgrade(ctx.coordinator()),
        });
        let mid_cycle = Arc::new(MidCycle {
            mutator: mutator.clone(),
            pending: Mutex::new(Vec::new()),
        });
        let listener: Arc<dyn CycleListener> = mid_cycle.clone();
        ctx.telemetry().add_listener(listener);

        for op in ops {
            match op {
                Op::Mutate(mutation) => mutator.apply(&mutation),
                Op::Gc { inline, during } => {
                    *mid_cycle.pending.lock() = during;
                    let request = match inline {
                        Some(ids) => GcRequest::InlineGc(id_set(ids)),
                        None => GcRequest::Full,
                    };
                    let info = ctx.coordinator().do_gc(request).unwrap();
                    if let Some(info) = info {
                        prop_assert_eq!(info.outcome, CycleOutcome::Completed);
                        prop_assert!(info.candidate_garbage_count >= info.actual_garbage_count);
                    }
                    assert_safe(&mutator)?;
                }
            }
        }

        // With every client gone, a full cycle leaves exactly the root closure
        for n in 0..NODES {
            ctx.registry().shutdown_node(node(n));
        }
        ctx.coordinator().do_gc(GcRequest::Full).unwrap();
        let dyn_store: &dyn ObjectStore = &*store;
        let live: ObjectIdSet = dyn_store.reachable(store.root_ids()).collect();
        prop_assert_eq!(store.all_object_ids(), live);
    }
}
