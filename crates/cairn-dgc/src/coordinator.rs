//! Collection coordinator
//!
//! Drives one mark-and-sweep cycle at a time across the object store, the
//! reference registry and the live reference oracle.
//!
//! ## State machine
//!
//! ```text
//! Disabled <-> Sleep -> Running -> Pausing -> Paused -> Delete -> Sleep
//!                         |           |          |
//!                         +-----------+----------+--> Canceled -> Sleep | Disabled
//! ```
//!
//! ## Cycle
//!
//! 1. START: record the object count, begin monitoring reference changes.
//! 2. MARK: walk from the roots; candidates the oracle reports referenced are
//!    rescued right away (pre-rescue).
//! 3. Rescue pass 1 against the registry and the references written since
//!    START. Mutations still flow.
//! 4. PAUSING: ask the store to quiesce and wait, bounded, for the ack.
//! 5. Rescue pass 2 while paused, against the same sources plus the roots.
//! 6. Every remaining candidate must still exist, then the optional
//!    [`DeletionApprover`] sees the garbage set.
//! 7. DELETE, then back to SLEEP.
//!
//! Disable, stop and cancel requests are honored at phase boundaries and
//! immediately while waiting for the pause ack. A canceled cycle deletes
//! nothing.

use crate::changes::{NewReferenceCollector, YoungGenCollector};
use crate::config::DgcConfig;
use crate::error::{DgcError, DgcResult};
use crate::hooks::{
    Collaborators, FullHook, GcHook, InlineCleanupHook, InlineGcHook, YoungHook, mark, rescue,
};
use crate::ids::{ObjectId, ObjectIdSet};
use crate::oracle::LiveReferenceOracle;
use crate::registry::ReferenceRegistry;
use crate::store::{DeletionApprover, ObjectStore, QuiesceAck};
use crate::telemetry::{CycleEvent, CycleInfo, CycleOutcome, CycleTelemetry, GcLogger};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, trace, warn};

/// Coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GcState {
    /// Collection turned off by an operator or after an invariant violation
    Disabled,
    /// Idle; a cycle may start
    Sleep,
    /// Marking and first rescue pass
    Running,
    /// Waiting for the store to quiesce
    Pausing,
    /// Mutations quiesced
    Paused,
    /// Deleting garbage
    Delete,
    /// A cycle is being torn down without deleting anything
    Canceled,
}

impl fmt::Display for GcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GcState::Disabled => "GC_DISABLED",
            GcState::Sleep => "GC_SLEEP",
            GcState::Running => "GC_RUNNING",
            GcState::Pausing => "GC_PAUSING",
            GcState::Paused => "GC_PAUSED",
            GcState::Delete => "GC_DELETE",
            GcState::Canceled => "GC_CANCELED",
        };
        f.write_str(name)
    }
}

/// Kind of cycle to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcRequest {
    /// Whole object graph
    Full,
    /// Young generation only; requires `young_gen_enabled`
    Young,
    /// Collect among these ids, treating every other object as live
    InlineGc(ObjectIdSet),
    /// Delete these ids, which the store reports unreferenced, unless a
    /// client or a new reference rescues them
    InlineCleanup(ObjectIdSet),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelReason {
    Disabled,
    Stopped,
    Requested,
    PauseTimeout,
    Vetoed,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CancelReason::Disabled => "disable requested",
            CancelReason::Stopped => "coordinator stopped",
            CancelReason::Requested => "cancel requested",
            CancelReason::PauseTimeout => "pause not acknowledged in time",
            CancelReason::Vetoed => "deletion not approved",
        };
        f.write_str(reason)
    }
}

enum Abort {
    Canceled(CancelReason),
    Failed(DgcError),
}

impl From<DgcError> for Abort {
    fn from(err: DgcError) -> Self {
        Abort::Failed(err)
    }
}

struct Control {
    state: GcState,
    started: bool,
    disable_requested: bool,
    cancel_requested: bool,
    /// Iteration the current PAUSING state belongs to
    pausing_iteration: u64,
}

impl Control {
    fn abort_reason(&self) -> Option<CancelReason> {
        if !self.started {
            Some(CancelReason::Stopped)
        } else if self.disable_requested {
            Some(CancelReason::Disabled)
        } else if self.cancel_requested {
            Some(CancelReason::Requested)
        } else {
            None
        }
    }

    fn try_disable(&mut self) -> bool {
        match self.state {
            GcState::Sleep => {
                self.state = GcState::Disabled;
                self.disable_requested = false;
                true
            }
            GcState::Disabled => true,
            _ => {
                self.disable_requested = true;
                false
            }
        }
    }
}

struct Scheduler {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Per-cycle bookkeeping owned by the thread driving the cycle
struct Cycle {
    info: CycleInfo,
    started: Instant,
    monitoring: bool,
    young_monitoring: bool,
    quiesce_requested: bool,
}

/// Multi-phase garbage collection state machine
pub struct CollectionCoordinator {
    store: Arc<dyn ObjectStore>,
    registry: Arc<ReferenceRegistry>,
    oracle: Arc<LiveReferenceOracle>,
    telemetry: Arc<CycleTelemetry>,
    approver: RwLock<Option<Arc<dyn DeletionApprover>>>,
    control: Mutex<Control>,
    state_changed: Condvar,
    /// Held for the whole of a cycle
    cycle_lock: Mutex<()>,
    iteration: AtomicU64,
    new_references: NewReferenceCollector,
    young: Option<YoungGenCollector>,
    periodic_enabled: AtomicBool,
    periodic_interval: Duration,
    pause_ack_timeout: Duration,
    scheduler: Mutex<Option<Scheduler>>,
    this: Weak<Self>,
}

impl CollectionCoordinator {
    /// Create a coordinator in `Sleep`, not yet started.
    ///
    /// Registers a [`GcLogger`] on `telemetry`.
    pub fn new(
        config: &DgcConfig,
        store: Arc<dyn ObjectStore>,
        registry: Arc<ReferenceRegistry>,
        oracle: Arc<LiveReferenceOracle>,
        telemetry: Arc<CycleTelemetry>,
    ) -> Arc<Self> {
        telemetry.add_listener(Arc::new(GcLogger::new(config.verbose_gc)));
        Arc::new_cyclic(|this| Self {
            store,
            registry,
            oracle,
            telemetry,
            approver: RwLock::new(None),
            control: Mutex::new(Control {
                state: GcState::Sleep,
                started: false,
                disable_requested: false,
                cancel_requested: false,
                pausing_iteration: 0,
            }),
            state_changed: Condvar::new(),
            cycle_lock: Mutex::new(()),
            iteration: AtomicU64::new(0),
            new_references: NewReferenceCollector::new(),
            young: config.young_gen_enabled.then(YoungGenCollector::new),
            periodic_enabled: AtomicBool::new(config.periodic_enabled),
            periodic_interval: config.periodic_interval(),
            pause_ack_timeout: config.pause_ack_timeout(),
            scheduler: Mutex::new(None),
            this: this.clone(),
        })
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Allow cycles to start and launch the periodic scheduler
    pub fn start(&self) {
        self.control.lock().started = true;
        self.state_changed.notify_all();
        self.spawn_scheduler();
        info!("DGC started");
    }

    /// Cancel any running cycle, stop the scheduler and wait for the cycle
    /// to wind down.
    ///
    /// Must not be called from a cycle listener.
    pub fn stop(&self) {
        self.control.lock().started = false;
        self.state_changed.notify_all();
        self.stop_scheduler();
        drop(self.cycle_lock.lock());
        info!("DGC stopped");
    }

    /// Whether [`start`](Self::start) was called and [`stop`](Self::stop) was not
    pub fn is_started(&self) -> bool {
        self.control.lock().started
    }

    /// Turn periodic full cycles on or off
    pub fn set_periodic_enabled(&self, enabled: bool) {
        self.periodic_enabled.store(enabled, Ordering::SeqCst);
        debug!(enabled, "Periodic DGC toggled");
    }

    /// Whether periodic full cycles are on
    pub fn is_periodic_enabled(&self) -> bool {
        self.periodic_enabled.load(Ordering::SeqCst)
    }

    /// Install or clear the deletion approver
    pub fn set_approver(&self, approver: Option<Arc<dyn DeletionApprover>>) {
        *self.approver.write() = approver;
    }

    /// Telemetry publisher of this coordinator
    pub fn telemetry(&self) -> &Arc<CycleTelemetry> {
        &self.telemetry
    }

    /// Iteration number of the most recently started cycle (0 if none)
    pub fn last_iteration(&self) -> u64 {
        self.iteration.load(Ordering::SeqCst)
    }

    fn spawn_scheduler(&self) {
        if self.periodic_interval.is_zero() {
            debug!("Periodic interval is zero; no periodic scheduler");
            return;
        }
        let mut slot = self.scheduler.lock();
        if slot.is_some() {
            return;
        }
        let (stop_tx, rx) = bounded::<()>(1);
        let weak = self.this.clone();
        let interval = self.periodic_interval;
        let spawned = thread::Builder::new()
            .name("dgc-periodic".into())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let Some(coordinator) = weak.upgrade() else { break };
                            coordinator.run_periodic();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                trace!("Periodic scheduler stopped");
            });
        match spawned {
            Ok(handle) => *slot = Some(Scheduler { stop_tx, handle }),
            Err(e) => error!(error = %e, "Failed to spawn periodic DGC scheduler"),
        }
    }

    fn stop_scheduler(&self) {
        let scheduler = self.scheduler.lock().take();
        if let Some(Scheduler { stop_tx, handle }) = scheduler {
            drop(stop_tx);
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn run_periodic(&self) {
        if !self.is_periodic_enabled() {
            return;
        }
        match self.do_gc(GcRequest::Full) {
            Ok(Some(_)) => {}
            Ok(None) => debug!(state = %self.state(), "Periodic DGC skipped"),
            Err(e) => error!(error = %e, "Periodic DGC failed"),
        }
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    /// Move `Sleep -> Running`; false if not started or not sleeping
    pub fn request_gc_start(&self) -> bool {
        let mut control = self.control.lock();
        if control.started && control.state == GcState::Sleep {
            control.state = GcState::Running;
            control.cancel_requested = false;
            drop(control);
            self.state_changed.notify_all();
            true
        } else {
            false
        }
    }

    /// Re-enable collection after [`disable_gc`](Self::disable_gc) or an
    /// invariant violation
    pub fn enable_gc(&self) {
        let mut control = self.control.lock();
        if control.state == GcState::Disabled {
            control.state = GcState::Sleep;
            control.disable_requested = false;
            drop(control);
            self.state_changed.notify_all();
            info!("DGC enabled");
        } else if control.disable_requested {
            control.disable_requested = false;
            debug!(state = %control.state, "Pending disable request withdrawn");
        } else {
            warn!(state = %control.state, "DGC is already enabled");
        }
    }

    /// Disable collection.
    ///
    /// Succeeds immediately only from `Sleep`; otherwise the request is
    /// recorded, the running cycle is canceled at its next safe point, and
    /// false is returned.
    pub fn disable_gc(&self) -> bool {
        let mut control = self.control.lock();
        let disabled = control.try_disable();
        drop(control);
        self.state_changed.notify_all();
        disabled
    }

    /// Disable collection, waiting up to `timeout` for a running cycle to
    /// reach a safe point
    pub fn disable_gc_and_wait(&self, timeout: Duration) -> bool {
        // Too far out to represent: wait without a deadline
        let deadline = Instant::now().checked_add(timeout);
        let mut control = self.control.lock();
        loop {
            if control.try_disable() {
                self.state_changed.notify_all();
                return true;
            }
            self.state_changed.notify_all();
            let Some(deadline) = deadline else {
                self.state_changed.wait(&mut control);
                continue;
            };
            if self
                .state_changed
                .wait_until(&mut control, deadline)
                .timed_out()
            {
                let disabled = control.try_disable();
                if !disabled {
                    warn!(state = %control.state, "Timed out waiting to disable DGC");
                }
                return disabled;
            }
        }
    }

    /// Enter `Pausing`
    pub fn request_gc_pause(&self) {
        self.control.lock().state = GcState::Pausing;
        self.state_changed.notify_all();
    }

    /// Quiescence reached: `Pausing -> Paused`
    pub fn notify_ready_to_gc(&self) {
        let mut control = self.control.lock();
        if control.state == GcState::Pausing {
            control.state = GcState::Paused;
            drop(control);
            self.state_changed.notify_all();
        }
    }

    fn acknowledge_pause(&self, iteration: u64) {
        let mut control = self.control.lock();
        if control.state == GcState::Pausing && control.pausing_iteration == iteration {
            control.state = GcState::Paused;
            drop(control);
            self.state_changed.notify_all();
        } else {
            trace!(iteration, state = %control.state, "Stale quiesce ack ignored");
        }
    }

    /// Move `Sleep | Paused -> Delete`.
    ///
    /// `Sleep` is the passive-server path, `Paused` the active one.
    pub fn request_gc_delete_start(&self) -> bool {
        let mut control = self.control.lock();
        if matches!(control.state, GcState::Sleep | GcState::Paused) {
            control.state = GcState::Delete;
            drop(control);
            self.state_changed.notify_all();
            true
        } else {
            false
        }
    }

    /// Deletion finished: back to `Sleep`, or `Disabled` if a disable was
    /// requested meanwhile
    pub fn notify_gc_complete(&self) {
        let mut control = self.control.lock();
        if control.disable_requested {
            control.state = GcState::Disabled;
            control.disable_requested = false;
            info!("DGC disabled after completing cycle");
        } else {
            control.state = GcState::Sleep;
        }
        drop(control);
        self.state_changed.notify_all();
    }

    /// Cancel the running cycle (e.g. on losing leadership).
    ///
    /// Returns false if no cycle is running or the cycle has already started
    /// deleting.
    pub fn cancel_cycle(&self) -> bool {
        let mut control = self.control.lock();
        if matches!(
            control.state,
            GcState::Running | GcState::Pausing | GcState::Paused
        ) {
            control.cancel_requested = true;
            drop(control);
            self.state_changed.notify_all();
            true
        } else {
            false
        }
    }

    /// Current state
    pub fn state(&self) -> GcState {
        self.control.lock().state
    }

    /// `Pausing` or `Paused`
    pub fn is_pausing_or_paused(&self) -> bool {
        matches!(self.state(), GcState::Pausing | GcState::Paused)
    }

    /// `Paused`
    pub fn is_paused(&self) -> bool {
        self.state() == GcState::Paused
    }

    /// `Disabled`
    pub fn is_disabled(&self) -> bool {
        self.state() == GcState::Disabled
    }

    fn disable_after_violation(&self, err: &DgcError) {
        error!(error = %err, "DGC invariant violated; collection disabled");
        let mut control = self.control.lock();
        control.try_disable();
        drop(control);
        self.state_changed.notify_all();
    }

    // ========================================================================
    // Mutation hooks
    // ========================================================================

    /// `object`'s reference changed from `old_ref` to `new_ref`.
    ///
    /// While a cycle is monitoring, `new_ref` is protected by later rescue
    /// passes.
    pub fn changed(&self, object: ObjectId, old_ref: Option<ObjectId>, new_ref: Option<ObjectId>) {
        trace!(%object, ?old_ref, ?new_ref, "Reference changed");
        self.new_references.changed(object, new_ref);
    }

    /// A new object was allocated
    pub fn notify_object_created(&self, id: ObjectId) -> DgcResult<()> {
        match &self.young {
            Some(young) => young
                .notify_object_created(id)
                .inspect_err(|e| self.disable_after_violation(e)),
            None => Ok(()),
        }
    }

    /// A new object finished initialization and may be collected as young
    pub fn notify_object_initialized(&self, id: ObjectId) -> DgcResult<()> {
        match &self.young {
            Some(young) => young
                .notify_object_initialized(id)
                .inspect_err(|e| self.disable_after_violation(e)),
            None => Ok(()),
        }
    }

    /// Objects left memory; each comes with its outgoing references
    pub fn notify_objects_evicted(&self, evicted: &[(ObjectId, Vec<ObjectId>)]) {
        if let Some(young) = &self.young {
            young.notify_objects_evicted(evicted);
        }
    }

    // ========================================================================
    // Cycles
    // ========================================================================

    /// Apply a garbage set computed elsewhere (passive server).
    ///
    /// Returns false if the coordinator could not enter `Delete` or the store
    /// refused the deletion.
    pub fn delete_garbage(&self, garbage: &ObjectIdSet) -> bool {
        if !self.request_gc_delete_start() {
            debug!(state = %self.state(), "Cannot delete garbage now");
            return false;
        }
        if let Some(young) = &self.young {
            young.remove_garbage(garbage);
        }
        let result = if garbage.is_empty() {
            Ok(())
        } else {
            self.store.delete(garbage)
        };
        self.notify_gc_complete();
        match result {
            Ok(()) => {
                debug!(count = garbage.len(), "Applied garbage set");
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to apply garbage set");
                false
            }
        }
    }

    /// Run one cycle on the calling thread.
    ///
    /// Returns `Ok(None)` if the cycle could not start (not started, not
    /// sleeping, another cycle running, or young collection requested while
    /// disabled), the finished cycle's record otherwise. Canceled cycles are
    /// not errors; invariant violations are, and leave the coordinator
    /// `Disabled`.
    pub fn do_gc(&self, request: GcRequest) -> DgcResult<Option<CycleInfo>> {
        let Some(hook) = self.hook_for(request) else {
            return Ok(None);
        };
        let Some(_cycle_guard) = self.cycle_lock.try_lock() else {
            debug!("A DGC cycle is already running");
            return Ok(None);
        };
        if !self.request_gc_start() {
            debug!(state = %self.state(), "DGC cycle not started");
            return Ok(None);
        }

        let iteration = self.iteration.fetch_add(1, Ordering::SeqCst) + 1;
        let span = info_span!("dgc_cycle", iteration, gc_type = %hook.gc_type());
        let _enter = span.enter();

        let mut cycle = Cycle {
            info: CycleInfo::new(iteration, hook.gc_type()),
            started: Instant::now(),
            monitoring: false,
            young_monitoring: false,
            quiesce_requested: false,
        };

        match self.run_cycle(hook.as_ref(), &mut cycle) {
            Ok(()) => Ok(Some(cycle.info)),
            Err(Abort::Canceled(reason)) => {
                self.finish_canceled(&mut cycle, reason);
                Ok(Some(cycle.info))
            }
            Err(Abort::Failed(err)) => {
                self.finish_failed(&mut cycle, &err);
                Err(err)
            }
        }
    }

    fn hook_for(&self, request: GcRequest) -> Option<Box<dyn GcHook>> {
        match request {
            GcRequest::Full => Some(Box::new(FullHook)),
            GcRequest::Young if self.young.is_none() => {
                warn!("Young generation DGC requested but not enabled");
                None
            }
            GcRequest::Young => Some(Box::new(YoungHook)),
            GcRequest::InlineGc(ids) => Some(Box::new(InlineGcHook { ids })),
            GcRequest::InlineCleanup(ids) => Some(Box::new(InlineCleanupHook { ids })),
        }
    }

    fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            store: self.store.as_ref(),
            registry: &self.registry,
            new_references: &self.new_references,
            young: self.young.as_ref(),
        }
    }

    fn run_cycle(&self, hook: &dyn GcHook, cycle: &mut Cycle) -> Result<(), Abort> {
        let c = self.collaborators();
        let iteration = cycle.info.iteration;

        cycle.info.begin_object_count = self.store.object_count();
        self.publish(CycleEvent::Start, cycle);
        self.start_monitoring(cycle)?;

        // MARK
        self.publish(CycleEvent::Mark, cycle);
        let mark_started = Instant::now();
        self.oracle.refresh_now();
        let mut candidates = hook.candidates(&c);
        mark(&c, hook, &mut candidates);
        cycle.info.candidate_garbage_count = candidates.len() as u64;
        let referenced = self.oracle_hits(&candidates);
        cycle.info.pre_rescue_count = rescue(&c, &mut candidates, &referenced);
        cycle.info.mark_time = mark_started.elapsed();
        self.publish(CycleEvent::MarkResults, cycle);
        self.check_abort()?;

        // Rescue pass 1, mutations still flowing
        let rescued = rescue(&c, &mut candidates, &hook.rescue_ids(&c));
        cycle.info.rescue_counts.push(rescued);
        self.publish(CycleEvent::Rescue1Complete, cycle);
        self.check_abort()?;

        self.pause(cycle)?;

        // Rescue pass 2, paused
        self.publish(CycleEvent::Rescue2Start, cycle);
        let mut rescue_ids = hook.rescue_ids(&c);
        rescue_ids.extend(self.store.root_ids());
        rescue_ids.extend(self.oracle_hits(&candidates));
        let rescued = rescue(&c, &mut candidates, &rescue_ids);
        cycle.info.rescue_counts.push(rescued);
        self.stop_monitoring(cycle)?;
        self.check_abort()?;

        if let Some(&id) = candidates.iter().find(|id| !self.store.exists(**id)) {
            return Err(DgcError::CandidateMissing { iteration, id }.into());
        }
        cycle.info.actual_garbage_count = candidates.len() as u64;
        self.publish(CycleEvent::MarkComplete, cycle);
        self.publish(CycleEvent::CycleCompleted, cycle);

        let approver = self.approver.read().clone();
        if let Some(approver) = approver {
            if !approver.approve(&cycle.info, &candidates) {
                return Err(Abort::Canceled(CancelReason::Vetoed));
            }
        }

        // DELETE
        self.enter_delete(iteration)?;
        self.publish(CycleEvent::Delete, cycle);
        if let Some(young) = &self.young {
            young.remove_garbage(&candidates);
        }
        self.resume_mutations(cycle);
        let delete_started = Instant::now();
        if !candidates.is_empty() {
            self.store.delete(&candidates)?;
        }
        cycle.info.delete_time = delete_started.elapsed();
        cycle.info.end_object_count = self.store.object_count();
        cycle.info.outcome = CycleOutcome::Completed;
        self.notify_gc_complete();
        self.publish(CycleEvent::Completed, cycle);
        Ok(())
    }

    fn oracle_hits(&self, candidates: &ObjectIdSet) -> ObjectIdSet {
        candidates
            .iter()
            .copied()
            .filter(|id| self.oracle.contains(*id))
            .collect()
    }

    fn pause(&self, cycle: &mut Cycle) -> Result<(), Abort> {
        let iteration = cycle.info.iteration;
        {
            let mut control = self.control.lock();
            control.state = GcState::Pausing;
            control.pausing_iteration = iteration;
        }
        self.state_changed.notify_all();
        self.publish(CycleEvent::Pausing, cycle);

        let started = Instant::now();
        let deadline = started.checked_add(self.pause_ack_timeout);
        cycle.quiesce_requested = true;
        let weak = self.this.clone();
        self.store.request_quiesce(QuiesceAck::new(iteration, move || {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.acknowledge_pause(iteration);
            }
        }));

        let mut control = self.control.lock();
        loop {
            if control.state == GcState::Paused {
                break;
            }
            if let Some(reason) = control.abort_reason() {
                drop(control);
                cycle.info.pause_time = started.elapsed();
                return Err(Abort::Canceled(reason));
            }
            let Some(deadline) = deadline else {
                self.state_changed.wait(&mut control);
                continue;
            };
            if self
                .state_changed
                .wait_until(&mut control, deadline)
                .timed_out()
                && control.state != GcState::Paused
            {
                drop(control);
                let waited = started.elapsed();
                cycle.info.pause_time = waited;
                let err = DgcError::PauseTimeout { iteration, waited };
                warn!(error = %err, "Canceling DGC cycle");
                return Err(Abort::Canceled(CancelReason::PauseTimeout));
            }
        }
        drop(control);
        cycle.info.pause_time = started.elapsed();
        self.publish(CycleEvent::Paused, cycle);
        Ok(())
    }

    /// Last cancellation point: the abort check and `Paused -> Delete` happen
    /// under one lock, so a cancel either lands before deletion or is refused.
    fn enter_delete(&self, iteration: u64) -> Result<(), Abort> {
        let mut control = self.control.lock();
        if let Some(reason) = control.abort_reason() {
            return Err(Abort::Canceled(reason));
        }
        if control.state != GcState::Paused {
            return Err(DgcError::InvariantViolation(format!(
                "cycle {iteration} cannot enter delete from {}",
                control.state
            ))
            .into());
        }
        control.state = GcState::Delete;
        drop(control);
        self.state_changed.notify_all();
        Ok(())
    }

    fn check_abort(&self) -> Result<(), Abort> {
        match self.control.lock().abort_reason() {
            Some(reason) => Err(Abort::Canceled(reason)),
            None => Ok(()),
        }
    }

    fn start_monitoring(&self, cycle: &mut Cycle) -> DgcResult<()> {
        self.new_references.start_monitoring()?;
        cycle.monitoring = true;
        if let Some(young) = &self.young {
            young.start_monitoring()?;
            cycle.young_monitoring = true;
        }
        Ok(())
    }

    fn stop_monitoring(&self, cycle: &mut Cycle) -> DgcResult<()> {
        if cycle.monitoring {
            self.new_references.stop_monitoring();
            cycle.monitoring = false;
        }
        if cycle.young_monitoring {
            cycle.young_monitoring = false;
            if let Some(young) = &self.young {
                young.stop_monitoring()?;
            }
        }
        Ok(())
    }

    fn resume_mutations(&self, cycle: &mut Cycle) {
        if cycle.quiesce_requested {
            cycle.quiesce_requested = false;
            self.store.resume_mutations();
        }
    }

    /// Common teardown of an aborted cycle; returns the state to settle in
    fn tear_down(&self, cycle: &mut Cycle, disable: bool) -> GcState {
        if let Err(e) = self.stop_monitoring(cycle) {
            error!(error = %e, "Failed to stop change monitoring");
        }
        self.resume_mutations(cycle);
        cycle.info.outcome = CycleOutcome::Canceled;

        self.control.lock().state = GcState::Canceled;
        self.state_changed.notify_all();
        self.publish(CycleEvent::Canceled, cycle);

        let mut control = self.control.lock();
        let next = if disable || control.disable_requested {
            GcState::Disabled
        } else {
            GcState::Sleep
        };
        control.state = next;
        control.disable_requested = false;
        control.cancel_requested = false;
        drop(control);
        self.state_changed.notify_all();
        next
    }

    fn finish_canceled(&self, cycle: &mut Cycle, reason: CancelReason) {
        let next = self.tear_down(cycle, reason == CancelReason::Disabled);
        info!(
            iteration = cycle.info.iteration,
            %reason,
            state = %next,
            "DGC cycle canceled; nothing deleted"
        );
    }

    fn finish_failed(&self, cycle: &mut Cycle, err: &DgcError) {
        error!(
            iteration = cycle.info.iteration,
            error = %err,
            "DGC cycle aborted; collection disabled"
        );
        self.tear_down(cycle, true);
    }

    fn publish(&self, event: CycleEvent, cycle: &mut Cycle) {
        cycle.info.elapsed = cycle.started.elapsed();
        self.telemetry.publish(event, &cycle.info);
    }
}

impl Drop for CollectionCoordinator {
    fn drop(&mut self) {
        self.stop_scheduler();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{NodeId, id_set};
    use crate::store::InMemoryObjectStore;
    use crate::telemetry::CycleListener;

    fn oid(n: u64) -> ObjectId {
        ObjectId::new(n)
    }

    struct Harness {
        store: Arc<InMemoryObjectStore>,
        registry: Arc<ReferenceRegistry>,
        telemetry: Arc<CycleTelemetry>,
        coordinator: Arc<CollectionCoordinator>,
    }

    fn harness(config: DgcConfig) -> Harness {
        let store = Arc::new(InMemoryObjectStore::new());
        let registry = Arc::new(ReferenceRegistry::new());
        let oracle = LiveReferenceOracle::new_without_timer(registry.clone(), &config);
        let telemetry = Arc::new(CycleTelemetry::new());
        let coordinator = CollectionCoordinator::new(
            &config,
            store.clone(),
            registry.clone(),
            oracle,
            telemetry.clone(),
        );
        coordinator.start();
        Harness {
            store,
            registry,
            telemetry,
            coordinator,
        }
    }

    fn manual() -> DgcConfig {
        DgcConfig::new().periodic_enabled(false)
    }

    #[derive(Default)]
    struct Events(Mutex<Vec<(CycleEvent, GcState)>>);

    struct StateRecorder {
        events: Arc<Events>,
        coordinator: Weak<CollectionCoordinator>,
    }

    impl CycleListener for StateRecorder {
        fn on_cycle_event(&self, event: CycleEvent, _info: &CycleInfo) {
            let state = self
                .coordinator
                .upgrade()
                .map(|c| c.state())
                .unwrap_or(GcState::Disabled);
            self.events.0.lock().push((event, state));
        }
    }

    #[test]
    fn test_start_requires_started_and_sleep() {
        let config = manual();
        let registry = Arc::new(ReferenceRegistry::new());
        let coordinator = CollectionCoordinator::new(
            &config,
            Arc::new(InMemoryObjectStore::new()),
            registry.clone(),
            LiveReferenceOracle::new_without_timer(registry, &config),
            Arc::new(CycleTelemetry::new()),
        );
        assert!(!coordinator.request_gc_start());
        assert!(coordinator.do_gc(GcRequest::Full).unwrap().is_none());

        coordinator.start();
        assert!(coordinator.request_gc_start());
        assert_eq!(coordinator.state(), GcState::Running);
        assert!(!coordinator.request_gc_start());
        coordinator.notify_gc_complete();
        assert_eq!(coordinator.state(), GcState::Sleep);
    }

    #[test]
    fn test_enable_disable() {
        let h = harness(manual());
        assert!(h.coordinator.disable_gc());
        assert!(h.coordinator.is_disabled());
        assert!(!h.coordinator.request_gc_start());
        assert!(h.coordinator.do_gc(GcRequest::Full).unwrap().is_none());

        h.coordinator.enable_gc();
        assert_eq!(h.coordinator.state(), GcState::Sleep);

        // Disable while running is deferred until the cycle finishes
        assert!(h.coordinator.request_gc_start());
        assert!(!h.coordinator.disable_gc());
        h.coordinator.notify_gc_complete();
        assert!(h.coordinator.is_disabled());
    }

    #[test]
    fn test_manual_transitions() {
        let h = harness(manual());
        assert!(h.coordinator.request_gc_start());
        h.coordinator.request_gc_pause();
        assert!(h.coordinator.is_pausing_or_paused());
        assert!(!h.coordinator.is_paused());
        h.coordinator.notify_ready_to_gc();
        assert!(h.coordinator.is_paused());
        assert!(h.coordinator.request_gc_delete_start());
        assert_eq!(h.coordinator.state(), GcState::Delete);
        assert!(!h.coordinator.request_gc_delete_start());
        h.coordinator.notify_gc_complete();
        assert_eq!(h.coordinator.state(), GcState::Sleep);
    }

    #[test]
    fn test_full_cycle_deletes_unreachable_and_unreferenced() {
        let h = harness(manual());
        h.store.insert(oid(1), [oid(2)]);
        h.store.insert(oid(2), []);
        h.store.insert(oid(3), []);
        h.store.insert(oid(4), [oid(5)]);
        h.store.insert(oid(5), []);
        h.store.add_root(oid(1));
        h.registry.startup_node(NodeId::new(1));
        h.registry.add_reference(NodeId::new(1), oid(4));

        let info = h.coordinator.do_gc(GcRequest::Full).unwrap().unwrap();
        assert_eq!(info.outcome, CycleOutcome::Completed);
        assert_eq!(info.iteration, 1);
        assert_eq!(info.begin_object_count, 5);
        assert_eq!(info.candidate_garbage_count, 3);
        assert_eq!(info.pre_rescue_count, 2);
        assert_eq!(info.actual_garbage_count, 1);
        assert_eq!(info.end_object_count, 4);
        assert_eq!(info.rescue_counts.len(), 2);
        assert_eq!(h.store.deleted_batches(), vec![id_set([3])]);
        assert_eq!(h.coordinator.state(), GcState::Sleep);
        assert!(!h.store.is_quiesced());
    }

    #[test]
    fn test_event_order_and_states() {
        let h = harness(manual());
        h.store.insert(oid(1), []);
        let events = Arc::new(Events::default());
        h.telemetry.add_listener(Arc::new(StateRecorder {
            events: events.clone(),
            coordinator: Arc::downgrade(&h.coordinator),
        }));

        h.coordinator.do_gc(GcRequest::Full).unwrap();
        let recorded = events.0.lock().clone();
        let order: Vec<CycleEvent> = recorded.iter().map(|(e, _)| *e).collect();
        assert_eq!(
            order,
            vec![
                CycleEvent::Start,
                CycleEvent::Mark,
                CycleEvent::MarkResults,
                CycleEvent::Rescue1Complete,
                CycleEvent::Pausing,
                CycleEvent::Paused,
                CycleEvent::Rescue2Start,
                CycleEvent::MarkComplete,
                CycleEvent::CycleCompleted,
                CycleEvent::Delete,
                CycleEvent::Completed,
            ]
        );
        assert_eq!(recorded[4].1, GcState::Pausing);
        assert_eq!(recorded[5].1, GcState::Paused);
        assert_eq!(recorded[9].1, GcState::Delete);
        assert_eq!(recorded[10].1, GcState::Sleep);
    }

    #[test]
    fn test_new_reference_during_cycle_is_rescued() {
        struct Mutator {
            coordinator: Weak<CollectionCoordinator>,
        }
        impl CycleListener for Mutator {
            fn on_cycle_event(&self, event: CycleEvent, _info: &CycleInfo) {
                if event == CycleEvent::MarkResults {
                    if let Some(c) = self.coordinator.upgrade() {
                        // Root 1 now points at 2, after the mark walk saw it
                        c.changed(oid(1), None, Some(oid(2)));
                    }
                }
            }
        }

        let h = harness(manual());
        h.store.insert(oid(1), []);
        h.store.insert(oid(2), []);
        h.store.add_root(oid(1));
        h.telemetry.add_listener(Arc::new(Mutator {
            coordinator: Arc::downgrade(&h.coordinator),
        }));

        let info = h.coordinator.do_gc(GcRequest::Full).unwrap().unwrap();
        assert_eq!(info.candidate_garbage_count, 1);
        assert_eq!(info.rescue1_count(), 1);
        assert_eq!(info.actual_garbage_count, 0);
        assert!(h.store.exists(oid(2)));
    }

    #[test]
    fn test_disable_during_mark_cancels_after_mark() {
        struct Disabler {
            coordinator: Weak<CollectionCoordinator>,
            accepted: AtomicBool,
        }
        impl CycleListener for Disabler {
            fn on_cycle_event(&self, event: CycleEvent, _info: &CycleInfo) {
                if event == CycleEvent::Mark {
                    if let Some(c) = self.coordinator.upgrade() {
                        self.accepted.store(c.disable_gc(), Ordering::SeqCst);
                    }
                }
            }
        }

        let h = harness(manual());
        h.store.insert(oid(1), []);
        let disabler = Arc::new(Disabler {
            coordinator: Arc::downgrade(&h.coordinator),
            accepted: AtomicBool::new(true),
        });
        h.telemetry.add_listener(disabler.clone());

        let info = h.coordinator.do_gc(GcRequest::Full).unwrap().unwrap();
        assert!(!disabler.accepted.load(Ordering::SeqCst));
        assert_eq!(info.outcome, CycleOutcome::Canceled);
        // MARK finished before the request was honored
        assert_eq!(info.candidate_garbage_count, 1);
        assert!(info.rescue_counts.is_empty());
        assert!(h.coordinator.is_disabled());
        assert_eq!(h.store.deleted_count(), 0);
        assert_eq!(h.store.quiesce_requests(), 0);
    }

    #[test]
    fn test_cancel_while_pausing() {
        let h = harness(manual());
        h.store.insert(oid(1), []);
        h.store.hold_acks(true);

        let coordinator = h.coordinator.clone();
        let runner = thread::spawn(move || coordinator.do_gc(GcRequest::Full));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !h.coordinator.is_pausing_or_paused() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(h.coordinator.cancel_cycle());

        let info = runner.join().unwrap().unwrap().unwrap();
        assert_eq!(info.outcome, CycleOutcome::Canceled);
        assert_eq!(h.coordinator.state(), GcState::Sleep);
        assert_eq!(h.store.deleted_count(), 0);
        assert!(!h.store.is_quiesced());
        // The held ack was discarded on resume
        assert_eq!(h.store.release_held_acks(), 0);
    }

    #[test]
    fn test_pause_timeout_cancels() {
        let h = harness(manual().pause_ack_timeout_millis(20));
        h.store.insert(oid(1), []);
        h.store.hold_acks(true);

        let info = h.coordinator.do_gc(GcRequest::Full).unwrap().unwrap();
        assert_eq!(info.outcome, CycleOutcome::Canceled);
        assert!(info.pause_time >= Duration::from_millis(20));
        assert_eq!(h.coordinator.state(), GcState::Sleep);
        assert_eq!(h.store.deleted_count(), 0);

        // Next cycle runs normally once acks flow again
        h.store.hold_acks(false);
        let info = h.coordinator.do_gc(GcRequest::Full).unwrap().unwrap();
        assert_eq!(info.outcome, CycleOutcome::Completed);
        assert_eq!(info.iteration, 2);
    }

    #[test]
    fn test_missing_candidate_disables() {
        struct Remover {
            store: Arc<InMemoryObjectStore>,
        }
        impl CycleListener for Remover {
            fn on_cycle_event(&self, event: CycleEvent, _info: &CycleInfo) {
                if event == CycleEvent::Paused {
                    self.store.remove(oid(2));
                }
            }
        }

        let h = harness(manual());
        h.store.insert(oid(1), []);
        h.store.insert(oid(2), []);
        h.telemetry.add_listener(Arc::new(Remover {
            store: h.store.clone(),
        }));

        let err = h.coordinator.do_gc(GcRequest::Full).unwrap_err();
        assert!(err.is_invariant_violation());
        assert!(matches!(err, DgcError::CandidateMissing { id, .. } if id == oid(2)));
        assert!(h.coordinator.is_disabled());
        assert_eq!(h.store.deleted_count(), 0);
        assert!(!h.store.is_quiesced());

        h.coordinator.enable_gc();
        assert_eq!(h.coordinator.state(), GcState::Sleep);
    }

    #[test]
    fn test_approver_veto() {
        struct Veto;
        impl DeletionApprover for Veto {
            fn approve(&self, _info: &CycleInfo, garbage: &ObjectIdSet) -> bool {
                garbage.is_empty()
            }
        }

        let h = harness(manual());
        h.store.insert(oid(1), []);
        h.coordinator.set_approver(Some(Arc::new(Veto)));

        let info = h.coordinator.do_gc(GcRequest::Full).unwrap().unwrap();
        assert_eq!(info.outcome, CycleOutcome::Canceled);
        assert_eq!(info.actual_garbage_count, 1);
        assert!(h.store.exists(oid(1)));

        h.coordinator.set_approver(None);
        let info = h.coordinator.do_gc(GcRequest::Full).unwrap().unwrap();
        assert_eq!(info.outcome, CycleOutcome::Completed);
        assert!(!h.store.exists(oid(1)));
    }

    #[test]
    fn test_cancel_during_approval_deletes_nothing() {
        struct LeadershipLost {
            coordinator: Weak<CollectionCoordinator>,
            canceled: AtomicBool,
        }
        impl DeletionApprover for LeadershipLost {
            fn approve(&self, _info: &CycleInfo, _garbage: &ObjectIdSet) -> bool {
                if let Some(coordinator) = self.coordinator.upgrade() {
                    self.canceled
                        .store(coordinator.cancel_cycle(), Ordering::SeqCst);
                }
                true
            }
        }

        let h = harness(manual());
        h.store.insert(oid(1), []);
        let approver = Arc::new(LeadershipLost {
            coordinator: Arc::downgrade(&h.coordinator),
            canceled: AtomicBool::new(false),
        });
        h.coordinator.set_approver(Some(approver.clone()));

        let info = h.coordinator.do_gc(GcRequest::Full).unwrap().unwrap();
        assert!(approver.canceled.load(Ordering::SeqCst));
        assert_eq!(info.outcome, CycleOutcome::Canceled);
        assert!(h.store.exists(oid(1)));
        assert_eq!(h.store.deleted_count(), 0);
        assert!(!h.store.is_quiesced());
        assert_eq!(h.coordinator.state(), GcState::Sleep);
    }

    #[test]
    fn test_cancel_refused_once_deleting() {
        struct LateCancel {
            coordinator: Weak<CollectionCoordinator>,
            results: Mutex<Vec<bool>>,
        }
        impl CycleListener for LateCancel {
            fn on_cycle_event(&self, event: CycleEvent, _info: &CycleInfo) {
                if event != CycleEvent::Delete {
                    return;
                }
                if let Some(coordinator) = self.coordinator.upgrade() {
                    self.results.lock().push(coordinator.cancel_cycle());
                }
            }
        }

        let h = harness(manual());
        h.store.insert(oid(1), []);
        let listener = Arc::new(LateCancel {
            coordinator: Arc::downgrade(&h.coordinator),
            results: Mutex::new(Vec::new()),
        });
        h.telemetry.add_listener(listener.clone());

        let info = h.coordinator.do_gc(GcRequest::Full).unwrap().unwrap();
        assert_eq!(*listener.results.lock(), vec![false]);
        assert_eq!(info.outcome, CycleOutcome::Completed);
        assert!(!h.store.exists(oid(1)));
        assert_eq!(h.coordinator.state(), GcState::Sleep);
    }

    #[test]
    fn test_delete_garbage_passive() {
        let h = harness(manual());
        h.store.insert(oid(1), []);
        h.store.insert(oid(2), []);

        assert!(h.coordinator.delete_garbage(&id_set([1])));
        assert!(!h.store.exists(oid(1)));
        assert_eq!(h.coordinator.state(), GcState::Sleep);

        // Store refuses unknown ids; coordinator still returns to sleep
        assert!(!h.coordinator.delete_garbage(&id_set([42])));
        assert_eq!(h.coordinator.state(), GcState::Sleep);

        assert!(h.coordinator.request_gc_start());
        assert!(!h.coordinator.delete_garbage(&id_set([2])));
    }

    #[test]
    fn test_inline_gc_and_cleanup() {
        let h = harness(manual());
        h.store.insert(oid(1), [oid(2)]);
        h.store.insert(oid(2), []);
        h.store.insert(oid(3), []);
        h.store.insert(oid(4), []);
        h.registry.startup_node(NodeId::new(1));
        h.registry.add_reference(NodeId::new(1), oid(4));

        let info = h
            .coordinator
            .do_gc(GcRequest::InlineGc(id_set([2, 3])))
            .unwrap()
            .unwrap();
        assert_eq!(info.gc_type, crate::telemetry::GcType::InlineGc);
        assert_eq!(info.actual_garbage_count, 1);
        assert!(h.store.exists(oid(2)));
        assert!(!h.store.exists(oid(3)));

        let info = h
            .coordinator
            .do_gc(GcRequest::InlineCleanup(id_set([4])))
            .unwrap()
            .unwrap();
        assert_eq!(info.actual_garbage_count, 0);
        assert!(h.store.exists(oid(4)));
    }

    #[test]
    fn test_young_cycle() {
        let h = harness(manual().young_gen_enabled(true));
        h.store.insert(oid(1), [oid(2)]);
        h.store.add_root(oid(1));
        for n in [2, 3] {
            h.coordinator.notify_object_created(oid(n)).unwrap();
            h.store.insert(oid(n), []);
            h.coordinator.notify_object_initialized(oid(n)).unwrap();
        }

        let info = h.coordinator.do_gc(GcRequest::Young).unwrap().unwrap();
        assert_eq!(info.gc_type, crate::telemetry::GcType::Young);
        assert_eq!(info.candidate_garbage_count, 1);
        assert!(!h.store.exists(oid(3)));
        assert!(h.store.exists(oid(2)));
    }

    #[test]
    fn test_young_requires_enabling() {
        let h = harness(manual());
        assert!(h.coordinator.do_gc(GcRequest::Young).unwrap().is_none());
        assert_eq!(h.coordinator.last_iteration(), 0);
    }

    #[test]
    fn test_duplicate_creation_disables() {
        let h = harness(manual().young_gen_enabled(true));
        h.coordinator.notify_object_created(oid(1)).unwrap();
        assert!(h.coordinator.notify_object_created(oid(1)).is_err());
        assert!(h.coordinator.is_disabled());
    }

    #[test]
    fn test_disable_and_wait() {
        let h = harness(manual());
        assert!(h.coordinator.request_gc_start());

        let coordinator = h.coordinator.clone();
        let finisher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            coordinator.notify_gc_complete();
        });
        assert!(h.coordinator.disable_gc_and_wait(Duration::from_secs(5)));
        finisher.join().unwrap();
        assert!(h.coordinator.is_disabled());
    }

    #[test]
    fn test_disable_and_wait_without_deadline() {
        let h = harness(manual());
        assert!(h.coordinator.disable_gc_and_wait(Duration::MAX));
        h.coordinator.enable_gc();

        assert!(h.coordinator.request_gc_start());
        let coordinator = h.coordinator.clone();
        let finisher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            coordinator.notify_gc_complete();
        });
        assert!(h.coordinator.disable_gc_and_wait(Duration::MAX));
        finisher.join().unwrap();
        assert!(h.coordinator.is_disabled());
    }

    #[test]
    fn test_unbounded_pause_wait_still_cancels() {
        let h = harness(manual().pause_ack_timeout_millis(u64::MAX));
        h.store.insert(oid(1), []);
        h.store.hold_acks(true);

        let coordinator = h.coordinator.clone();
        let runner = thread::spawn(move || coordinator.do_gc(GcRequest::Full));
        let deadline = Instant::now() + Duration::from_secs(5);
        while h.coordinator.state() != GcState::Pausing && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(h.coordinator.cancel_cycle());

        let info = runner.join().unwrap().unwrap().unwrap();
        assert_eq!(info.outcome, CycleOutcome::Canceled);
        assert!(h.store.exists(oid(1)));
    }

    #[test]
    fn test_zero_periodic_interval_spawns_no_scheduler() {
        let h = harness(manual().periodic_interval_millis(0));
        assert!(h.coordinator.scheduler.lock().is_none());
        h.coordinator.set_periodic_enabled(true);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(h.coordinator.last_iteration(), 0);
    }

    #[test]
    fn test_periodic_scheduler_runs_cycles() {
        let h = harness(DgcConfig::new().periodic_interval_millis(5));
        h.store.insert(oid(1), []);

        let deadline = Instant::now() + Duration::from_secs(5);
        while h.store.exists(oid(1)) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(!h.store.exists(oid(1)));
        h.coordinator.stop();
        assert!(!h.coordinator.is_started());

        let iteration = h.coordinator.last_iteration();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(h.coordinator.last_iteration(), iteration);
    }
}
