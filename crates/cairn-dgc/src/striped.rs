//! Striped set of object ids.
//!
//! The set is partitioned into `concurrency_level` independently locked
//! stripes keyed by a hash of the id, so concurrent inserts from many client
//! fault-ins rarely contend on the same lock.

use crate::ids::ObjectId;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use rustc_hash::{FxHashSet, FxHasher};
use std::hash::{Hash, Hasher};

/// Concurrent set of object ids split across independently locked stripes
pub struct StripedIdSet {
    stripes: Box<[CachePadded<Mutex<FxHashSet<ObjectId>>>]>,
}

impl StripedIdSet {
    /// Create a set with `concurrency_level` stripes (at least one)
    pub fn new(concurrency_level: usize) -> Self {
        let n = concurrency_level.max(1);
        let stripes = (0..n)
            .map(|_| CachePadded::new(Mutex::new(FxHashSet::default())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { stripes }
    }

    #[inline]
    fn stripe(&self, id: ObjectId) -> &Mutex<FxHashSet<ObjectId>> {
        let mut hasher = FxHasher::default();
        id.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.stripes.len();
        &self.stripes[idx]
    }

    /// Insert an id; returns true if it was not present
    pub fn insert(&self, id: ObjectId) -> bool {
        self.stripe(id).lock().insert(id)
    }

    /// Insert every id, locking each stripe once per id
    pub fn insert_all<'a, I>(&self, ids: I)
    where
        I: IntoIterator<Item = &'a ObjectId>,
    {
        for &id in ids {
            self.insert(id);
        }
    }

    /// Membership test
    pub fn contains(&self, id: ObjectId) -> bool {
        self.stripe(id).lock().contains(&id)
    }

    /// Approximate size: stripes are summed one at a time
    pub fn len(&self) -> usize {
        self.stripes.iter().map(|s| s.lock().len()).sum()
    }
}
