//! Live reference oracle
//!
//! Answers "is this object referenced by some client right now" without
//! scanning every node on every question. The answer combines:
//!
//! - a **snapshot**: the union of every node's managed set as of the last
//!   refresh, and
//! - a **live delta**: ids reported by the registry's reference-added events
//!   since that refresh, kept in a [`StripedIdSet`].
//!
//! The oracle may over-report (stale snapshot entries) but never
//! under-reports.
//!
//! ## Refresh
//!
//! Queries never refresh themselves. A query that finds a refresh due wakes
//! the timer thread and answers from the current views. One caller at a time
//! (compare-and-swap on `refreshing`) performs:
//!
//! 1. record the refresh time,
//! 2. arm the registry listener if it is not armed,
//! 3. rotate the delta: a fresh delta becomes current and the previous one is
//!    kept as `retiring`,
//! 4. pull `all_referenced_ids()` without holding the view lock,
//! 5. swap in the new snapshot and drop the retiring delta,
//! 6. notify [`ReferenceSetObserver`]s.
//!
//! The listener is always armed before the pull begins. An id added before
//! the rotation is visible to the pull; an id added after it lands in the
//! delta that survives the swap.
//!
//! ## Idle listeners
//!
//! A timer thread refreshes on schedule and drops the registry listener after
//! `listener_idle_multiplier × refresh_interval` without queries. Until the next
//! refresh re-arms it and completes, the oracle is not *covering* the registry
//! and answers queries straight from [`ReferenceRegistry::is_referenced`].

use crate::config::DgcConfig;
use crate::ids::{NodeId, ObjectId, ObjectIdSet};
use crate::listeners::ListenerList;
use crate::registry::{ReferenceListener, ReferenceRegistry};
use crate::striped::StripedIdSet;
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Observer notified after every completed refresh
pub trait ReferenceSetObserver: Send + Sync {
    /// The snapshot was rebuilt; `referenced` is its size
    fn reference_set_changed(&self, referenced: usize);
}

/// Holder of the current live delta, shared with the registry listener
struct DeltaSlot {
    current: RwLock<Arc<StripedIdSet>>,
}

impl DeltaSlot {
    fn insert(&self, id: ObjectId) {
        // Hold the read guard across the insert so a rotation cannot slip in
        // between loading the pointer and writing through it.
        self.current.read().insert(id);
    }

    fn insert_all(&self, ids: &ObjectIdSet) {
        self.current.read().insert_all(ids);
    }
}

struct DeltaListener {
    slot: Arc<DeltaSlot>,
}

impl ReferenceListener for DeltaListener {
    fn reference_added(&self, _node: NodeId, id: ObjectId) {
        self.slot.insert(id);
    }

    fn references_added(&self, _node: NodeId, ids: &ObjectIdSet) {
        self.slot.insert_all(ids);
    }
}

struct Views {
    snapshot: Arc<FxHashSet<ObjectId>>,
    retiring: Option<Arc<StripedIdSet>>,
}

/// Eventually-consistent "referenced by some client" oracle
pub struct LiveReferenceOracle {
    registry: Arc<ReferenceRegistry>,
    refresh_interval: Duration,
    idle_timeout: Duration,
    concurrency_level: usize,
    views: RwLock<Views>,
    delta: Arc<DeltaSlot>,
    listener: Arc<dyn ReferenceListener>,
    /// Listener currently registered with the registry
    listening: AtomicBool,
    /// Snapshot plus delta are known to cover the registry
    covering: AtomicBool,
    refreshing: AtomicBool,
    last_refresh: Mutex<Option<Instant>>,
    last_access: Mutex<Instant>,
    observers: ListenerList<dyn ReferenceSetObserver>,
    /// Wakes the timer for a refresh; dropping it stops the timer
    wake_tx: Mutex<Option<Sender<()>>>,
    shut_down: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl LiveReferenceOracle {
    /// Create an oracle and start its timer thread.
    ///
    /// No listener is registered until the first refresh.
    pub fn new(registry: Arc<ReferenceRegistry>, config: &DgcConfig) -> Arc<Self> {
        let oracle = Self::new_without_timer(registry, config);
        oracle.spawn_timer();
        oracle
    }

    /// Create an oracle that refreshes only on explicit
    /// [`refresh_now`](Self::refresh_now), [`refresh_if_due`](Self::refresh_if_due)
    /// and [`maintain`](Self::maintain) calls.
    pub fn new_without_timer(registry: Arc<ReferenceRegistry>, config: &DgcConfig) -> Arc<Self> {
        let concurrency_level = config.concurrency_level.max(1);
        let delta = Arc::new(DeltaSlot {
            current: RwLock::new(Arc::new(StripedIdSet::new(concurrency_level))),
        });
        let listener: Arc<dyn ReferenceListener> = Arc::new(DeltaListener {
            slot: delta.clone(),
        });
        Arc::new(Self {
            registry,
            refresh_interval: config.refresh_interval(),
            idle_timeout: config.listener_idle_timeout(),
            concurrency_level,
            views: RwLock::new(Views {
                snapshot: Arc::new(FxHashSet::default()),
                retiring: None,
            }),
            delta,
            listener,
            listening: AtomicBool::new(false),
            covering: AtomicBool::new(false),
            refreshing: AtomicBool::new(false),
            last_refresh: Mutex::new(None),
            last_access: Mutex::new(Instant::now()),
            observers: ListenerList::new("reference-set-observers"),
            wake_tx: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            timer: Mutex::new(None),
        })
    }

    fn spawn_timer(self: &Arc<Self>) {
        let (tx, rx) = bounded::<()>(1);
        let weak: Weak<Self> = Arc::downgrade(self);
        let tick = self.refresh_interval.max(Duration::from_millis(1));
        let spawned = thread::Builder::new()
            .name("dgc-oracle-timer".into())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(tick) {
                        Err(RecvTimeoutError::Timeout) => {
                            let Some(oracle) = weak.upgrade() else { break };
                            oracle.maintain(Instant::now());
                        }
                        Ok(()) => {
                            let Some(oracle) = weak.upgrade() else { break };
                            oracle.refresh_if_due(Instant::now());
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                trace!("Oracle timer stopped");
            });
        match spawned {
            Ok(handle) => {
                *self.wake_tx.lock() = Some(tx);
                *self.timer.lock() = Some(handle);
            }
            Err(e) => {
                error!(error = %e, "Failed to spawn oracle timer; refreshing on explicit calls only");
            }
        }
    }

    /// Whether some client may currently reference `id`.
    ///
    /// Never refreshes on the calling thread. When a refresh is due the timer
    /// thread is woken and the answer comes from the current views.
    pub fn contains(&self, id: ObjectId) -> bool {
        let now = Instant::now();
        self.touch(now);
        if self.is_due(now) {
            self.wake_timer();
        }

        if !self.covering.load(Ordering::Acquire) {
            return self.registry.is_referenced(id);
        }

        let views = self.views.read();
        if views.snapshot.contains(&id) {
            return true;
        }
        if views.retiring.as_ref().is_some_and(|d| d.contains(id)) {
            return true;
        }
        self.delta.current.read().contains(id)
    }

    /// Approximate number of referenced ids (snapshot plus deltas, which may
    /// overlap).
    pub fn size(&self) -> usize {
        self.touch(Instant::now());
        let views = self.views.read();
        let retiring = views.retiring.as_ref().map_or(0, |d| d.len());
        views.snapshot.len() + retiring + self.delta.current.read().len()
    }

    /// Record a reference in the live delta
    pub fn reference_added(&self, id: ObjectId) {
        self.delta.insert(id);
    }

    /// Record several references in the live delta
    pub fn references_added(&self, ids: &ObjectIdSet) {
        self.delta.insert_all(ids);
    }

    fn wake_timer(&self) {
        if let Some(tx) = self.wake_tx.lock().as_ref() {
            // Full means a wakeup is already pending
            let _ = tx.try_send(());
        }
    }

    /// Refresh if the interval has elapsed or the oracle is not covering.
    ///
    /// Returns true if this call performed the refresh.
    pub fn refresh_if_due(&self, now: Instant) -> bool {
        if self.shut_down.load(Ordering::Acquire) || !self.is_due(now) {
            return false;
        }
        self.try_refresh(now)
    }

    /// Refresh now unless another refresh is running.
    ///
    /// Returns true if this call performed the refresh.
    pub fn refresh_now(&self) -> bool {
        self.try_refresh(Instant::now())
    }

    fn is_due(&self, now: Instant) -> bool {
        if !self.covering.load(Ordering::Acquire) {
            return true;
        }
        match *self.last_refresh.lock() {
            Some(last) => now.saturating_duration_since(last) >= self.refresh_interval,
            None => true,
        }
    }

    fn try_refresh(&self, now: Instant) -> bool {
        if self.shut_down.load(Ordering::Acquire) {
            return false;
        }
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.refresh_locked(now);
        self.refreshing.store(false, Ordering::Release);
        true
    }

    /// Body of a refresh; caller owns the `refreshing` flag.
    fn refresh_locked(&self, now: Instant) {
        let started = Instant::now();
        *self.last_refresh.lock() = Some(now);

        self.arm_listener();

        {
            let mut views = self.views.write();
            let fresh = Arc::new(StripedIdSet::new(self.concurrency_level));
            let previous = std::mem::replace(&mut *self.delta.current.write(), fresh);
            views.retiring = Some(previous);
        }

        let pulled: FxHashSet<ObjectId> = self.registry.all_referenced_ids().into_iter().collect();
        let referenced = pulled.len();

        {
            let mut views = self.views.write();
            views.snapshot = Arc::new(pulled);
            views.retiring = None;
        }
        self.covering.store(true, Ordering::Release);

        debug!(
            referenced,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Reference snapshot refreshed"
        );
        self.observers
            .notify(|o| o.reference_set_changed(referenced));
    }

    fn arm_listener(&self) {
        if !self.listening.load(Ordering::Acquire) {
            self.registry.add_listener(self.listener.clone());
            self.listening.store(true, Ordering::Release);
            debug!("Reference listener armed");
        }
    }

    fn disarm_listener(&self) {
        if self.listening.load(Ordering::Acquire) {
            self.covering.store(false, Ordering::Release);
            self.registry.remove_listener(&self.listener);
            self.listening.store(false, Ordering::Release);
            debug!("Reference listener idle; deregistered");
        }
    }

    fn touch(&self, now: Instant) {
        let mut last = self.last_access.lock();
        if now > *last {
            *last = now;
        }
    }

    /// One timer step: drop the listener when idle, otherwise refresh if due.
    ///
    /// Skipped entirely while another thread is refreshing.
    pub fn maintain(&self, now: Instant) {
        if self.shut_down.load(Ordering::Acquire) || !self.listening.load(Ordering::Acquire) {
            return;
        }
        let idle = now.saturating_duration_since(*self.last_access.lock()) >= self.idle_timeout;
        if idle {
            if self
                .refreshing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.disarm_listener();
                self.refreshing.store(false, Ordering::Release);
            }
            return;
        }
        self.refresh_if_due(now);
    }

    /// Whether the registry listener is currently registered
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Whether snapshot plus delta currently cover the registry
    pub fn is_covering(&self) -> bool {
        self.covering.load(Ordering::Acquire)
    }

    /// Time of the last refresh, if any
    pub fn last_refresh(&self) -> Option<Instant> {
        *self.last_refresh.lock()
    }

    /// Subscribe to refresh notifications
    pub fn add_observer(&self, observer: Arc<dyn ReferenceSetObserver>) -> bool {
        self.observers.add(observer)
    }

    /// Unsubscribe from refresh notifications
    pub fn remove_observer(&self, observer: &Arc<dyn ReferenceSetObserver>) -> bool {
        self.observers.remove(observer)
    }

    /// Stop the timer thread and deregister from the registry.
    ///
    /// Later queries answer from the registry and never re-arm the listener.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.stop_timer();
        // Wait out an in-flight refresh so it cannot re-arm after we disarm
        while self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            thread::yield_now();
        }
        self.disarm_listener();
        self.refreshing.store(false, Ordering::Release);
    }

    fn stop_timer(&self) {
        drop(self.wake_tx.lock().take());
        let handle = self.timer.lock().take();
        if let Some(handle) = handle {
            // The timer may hold the last strong reference and run this drop itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for LiveReferenceOracle {
    fn drop(&mut self) {
        self.stop_timer();
        if self.listening.load(Ordering::Acquire) {
            self.registry.remove_listener(&self.listener);
        }
    }
}
