//! Copy-on-write subscriber lists.
//!
//! Publishers iterate an immutable snapshot, so listeners may be added or
//! removed while a publish is in flight. Each notification runs under
//! `catch_unwind`: a panicking listener is logged and skipped.

use parking_lot::RwLock;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::{error, warn};

/// Subscriber list owned by a publishing component
pub struct ListenerList<L: ?Sized> {
    /// Human readable owner name used in log messages
    name: &'static str,
    listeners: RwLock<Arc<Vec<Arc<L>>>>,
}

impl<L: ?Sized> ListenerList<L> {
    /// Create an empty list
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            listeners: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Register a listener; returns false (and warns) if already registered
    pub fn add(&self, listener: Arc<L>) -> bool {
        let mut guard = self.listeners.write();
        if guard.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            warn!(list = self.name, "Listener already registered");
            return false;
        }
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(listener);
        *guard = Arc::new(next);
        true
    }

    /// Deregister a listener; returns false (and warns) if it was not registered
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut guard = self.listeners.write();
        if !guard.iter().any(|l| Arc::ptr_eq(l, listener)) {
            warn!(list = self.name, "Listener was not registered");
            return false;
        }
        let next: Vec<Arc<L>> = guard
            .iter()
            .filter(|l| !Arc::ptr_eq(l, listener))
            .cloned()
            .collect();
        *guard = Arc::new(next);
        true
    }

    /// Whether this exact listener is registered
    pub fn contains(&self, listener: &Arc<L>) -> bool {
        self.listeners.read().iter().any(|l| Arc::ptr_eq(l, listener))
    }

    /// Immutable view of the current subscribers
    pub fn snapshot(&self) -> Arc<Vec<Arc<L>>> {
        self.listeners.read().clone()
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Invoke `f` on every listener of the current snapshot.
    ///
    /// Returns the number of listeners that panicked.
    pub fn notify<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&L),
    {
        let snapshot = self.snapshot();
        let mut failed = 0;
        for listener in snapshot.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| f(&**listener)));
            if let Err(payload) = result {
                failed += 1;
                error!(
                    list = self.name,
                    panic = %panic_message(payload.as_ref()),
                    "Listener panicked; continuing"
                );
            }
        }
        failed
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
