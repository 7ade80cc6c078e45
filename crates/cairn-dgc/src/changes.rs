//! Mutation tracking while a cycle runs.
//!
//! Between the start of MARK and the end of the second rescue pass the
//! coordinator keeps two collectors: every reference written into an object
//! is remembered so rescue can protect its target, and the young-generation
//! collector keeps its remembered set stable.

use crate::error::{DgcError, DgcResult};
use crate::ids::{ObjectId, ObjectIdSet};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

/// Collects reference targets written while monitoring is on
#[derive(Default)]
pub(crate) struct NewReferenceCollector {
    /// `Some` while monitoring
    references: Mutex<Option<ObjectIdSet>>,
}

impl NewReferenceCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn start_monitoring(&self) -> DgcResult<()> {
        let mut references = self.references.lock();
        if references.is_some() {
            return Err(DgcError::InvariantViolation(
                "reference monitoring started twice".into(),
            ));
        }
        *references = Some(ObjectIdSet::new());
        Ok(())
    }

    pub(crate) fn stop_monitoring(&self) {
        *self.references.lock() = None;
    }

    #[cfg(test)]
    pub(crate) fn is_monitoring(&self) -> bool {
        self.references.lock().is_some()
    }

    /// `object` now points at `new_ref`; ignored when not monitoring
    pub(crate) fn changed(&self, object: ObjectId, new_ref: Option<ObjectId>) {
        let Some(target) = new_ref else { return };
        if let Some(references) = self.references.lock().as_mut() {
            trace!(%object, %target, "New reference during cycle");
            references.insert(target);
        }
    }

    pub(crate) fn add_new_references_to(&self, out: &mut ObjectIdSet) {
        if let Some(references) = self.references.lock().as_ref() {
            out.extend(references.iter().copied());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum YoungState {
    Uninitialized,
    Initialized,
}

#[derive(Default)]
struct YoungInner {
    objects: FxHashMap<ObjectId, YoungState>,
    /// Young objects referenced from evicted (old) objects
    remembered: FxHashSet<ObjectId>,
    monitoring: bool,
}

impl YoungInner {
    fn forget(&mut self, id: ObjectId) {
        self.objects.remove(&id);
        // While a cycle runs the remembered set must not shrink: an object
        // evicted mid-cycle can still have inbound references from objects the
        // young walk never reads.
        if !self.monitoring {
            self.remembered.remove(&id);
        }
    }
}

/// Tracks recently created objects for young-generation cycles
#[derive(Default)]
pub(crate) struct YoungGenCollector {
    inner: Mutex<YoungInner>,
}

impl YoungGenCollector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn notify_object_created(&self, id: ObjectId) -> DgcResult<()> {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.objects.insert(id, YoungState::Uninitialized) {
            return Err(DgcError::InvariantViolation(format!(
                "{id} created twice (was {previous:?})"
            )));
        }
        Ok(())
    }

    pub(crate) fn notify_object_initialized(&self, id: ObjectId) -> DgcResult<()> {
        let mut inner = self.inner.lock();
        match inner.objects.insert(id, YoungState::Initialized) {
            Some(YoungState::Uninitialized) => Ok(()),
            previous => {
                // Restore what was there so the collector stays consistent.
                match previous {
                    Some(state) => {
                        inner.objects.insert(id, state);
                    }
                    None => {
                        inner.objects.remove(&id);
                    }
                }
                Err(DgcError::InvariantViolation(format!(
                    "{id} initialized while {previous:?}"
                )))
            }
        }
    }

    /// Evicted objects leave the young generation; their references to young
    /// objects become part of the remembered set
    pub(crate) fn notify_objects_evicted(&self, evicted: &[(ObjectId, Vec<ObjectId>)]) {
        let mut inner = self.inner.lock();
        for (id, references) in evicted {
            inner.forget(*id);
            for target in references {
                if inner.objects.contains_key(target) {
                    inner.remembered.insert(*target);
                }
            }
        }
    }

    /// Initialized young objects
    pub(crate) fn candidates(&self) -> ObjectIdSet {
        let inner = self.inner.lock();
        inner
            .objects
            .iter()
            .filter(|(_, state)| **state == YoungState::Initialized)
            .map(|(id, _)| *id)
            .collect()
    }

    pub(crate) fn remembered_set(&self) -> ObjectIdSet {
        self.inner.lock().remembered.iter().copied().collect()
    }

    pub(crate) fn remove_garbage(&self, garbage: &ObjectIdSet) {
        let mut inner = self.inner.lock();
        for id in garbage {
            inner.forget(*id);
        }
    }

    pub(crate) fn start_monitoring(&self) -> DgcResult<()> {
        let mut inner = self.inner.lock();
        if inner.monitoring {
            return Err(DgcError::InvariantViolation(
                "young generation monitoring started twice".into(),
            ));
        }
        inner.monitoring = true;
        Ok(())
    }

    pub(crate) fn stop_monitoring(&self) -> DgcResult<()> {
        let mut inner = self.inner.lock();
        if !inner.monitoring {
            return Err(DgcError::InvariantViolation(
                "young generation monitoring stopped while not running".into(),
            ));
        }
        inner.monitoring = false;
        let YoungInner {
            objects,
            remembered,
            ..
        } = &mut *inner;
        remembered.retain(|id| objects.contains_key(id));
        Ok(())
    }

    pub(crate) fn young_count(&self) -> usize {
        self.inner.lock().objects.len()
    }
}
