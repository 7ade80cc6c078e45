//! Per-cycle telemetry.
//!
//! The coordinator publishes a [`CycleEvent`] with a copy of the current
//! [`CycleInfo`] at every phase boundary. Listeners only observe: a panicking
//! listener is logged and the cycle carries on.

use crate::error::DgcResult;
use crate::listeners::ListenerList;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Kind of collection cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GcType {
    /// Whole object graph
    Full,
    /// Recently created objects only
    Young,
    /// Objects already known to have no inbound references
    InlineCleanup,
    /// A caller-supplied set of candidates
    InlineGc,
}

impl fmt::Display for GcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GcType::Full => "Full",
            GcType::Young => "YoungGen",
            GcType::InlineCleanup => "InlineCleanup",
            GcType::InlineGc => "InlineGC",
        };
        f.write_str(name)
    }
}

/// How a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleOutcome {
    /// Still running
    InProgress,
    /// Garbage (possibly none) was deleted
    Completed,
    /// Aborted before deletion; nothing was deleted
    Canceled,
}

/// Phase boundaries reported to listeners, in the order a cycle emits them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CycleEvent {
    /// Cycle record allocated
    Start,
    /// Mark phase begins
    Mark,
    /// Traversal and oracle pre-rescue finished
    MarkResults,
    /// First rescue pass finished (mutations still flowing)
    Rescue1Complete,
    /// Quiescence requested
    Pausing,
    /// Quiescence acknowledged
    Paused,
    /// Second rescue pass begins (paused)
    Rescue2Start,
    /// Garbage set is final
    MarkComplete,
    /// Garbage set handed out for approval
    CycleCompleted,
    /// Deletion begins
    Delete,
    /// Deletion done, coordinator back to sleep
    Completed,
    /// Cycle aborted
    Canceled,
}

impl fmt::Display for CycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Counters and timings of one collection cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleInfo {
    /// Monotonic iteration number
    pub iteration: u64,
    /// Kind of cycle
    pub gc_type: GcType,
    /// Wall-clock start, milliseconds since the Unix epoch
    pub start_time_millis: u64,
    /// Objects in the store when the cycle began
    pub begin_object_count: u64,
    /// Objects in the store after deletion
    pub end_object_count: u64,
    /// Objects unreachable from roots after traversal
    pub candidate_garbage_count: u64,
    /// Objects finally deleted
    pub actual_garbage_count: u64,
    /// Candidates protected by the oracle right after traversal
    pub pre_rescue_count: u64,
    /// Candidates protected by each rescue pass, in order
    pub rescue_counts: Vec<u64>,
    /// Time spent in traversal and pre-rescue
    pub mark_time: Duration,
    /// Time spent waiting for quiescence
    pub pause_time: Duration,
    /// Time spent deleting
    pub delete_time: Duration,
    /// Total cycle time so far
    pub elapsed: Duration,
    /// Outcome
    pub outcome: CycleOutcome,
}

impl CycleInfo {
    /// Fresh record for a starting cycle
    pub fn new(iteration: u64, gc_type: GcType) -> Self {
        let start_time_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            iteration,
            gc_type,
            start_time_millis,
            begin_object_count: 0,
            end_object_count: 0,
            candidate_garbage_count: 0,
            actual_garbage_count: 0,
            pre_rescue_count: 0,
            rescue_counts: Vec::new(),
            mark_time: Duration::ZERO,
            pause_time: Duration::ZERO,
            delete_time: Duration::ZERO,
            elapsed: Duration::ZERO,
            outcome: CycleOutcome::InProgress,
        }
    }

    /// Candidates saved by the first rescue pass
    pub fn rescue1_count(&self) -> u64 {
        self.rescue_counts.first().copied().unwrap_or(0)
    }

    /// Candidates saved by the second rescue pass
    pub fn rescue2_count(&self) -> u64 {
        self.rescue_counts.get(1).copied().unwrap_or(0)
    }

    /// True for a full-graph cycle
    pub fn is_full(&self) -> bool {
        self.gc_type == GcType::Full
    }
}

/// Receiver of cycle phase events
pub trait CycleListener: Send + Sync {
    /// Called at every phase boundary with the cycle's state at that moment
    fn on_cycle_event(&self, event: CycleEvent, info: &CycleInfo);
}

/// Publisher of cycle events
pub struct CycleTelemetry {
    listeners: ListenerList<dyn CycleListener>,
}

impl Default for CycleTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleTelemetry {
    /// Create a publisher without listeners
    pub fn new() -> Self {
        Self {
            listeners: ListenerList::new("cycle-telemetry"),
        }
    }

    /// Subscribe; false if already subscribed
    pub fn add_listener(&self, listener: Arc<dyn CycleListener>) -> bool {
        self.listeners.add(listener)
    }

    /// Unsubscribe; false if not subscribed
    pub fn remove_listener(&self, listener: &Arc<dyn CycleListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Number of subscribers
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Deliver `event` to every subscriber
    pub fn publish(&self, event: CycleEvent, info: &CycleInfo) {
        let failed = self.listeners.notify(|l| l.on_cycle_event(event, info));
        if failed > 0 {
            warn!(
                iteration = info.iteration,
                %event,
                failed,
                "Cycle listeners failed"
            );
        }
    }
}

/// Logs every cycle through `tracing`.
///
/// Start, completion and cancellation are always logged at info level;
/// intermediate phases only when verbose.
pub struct GcLogger {
    verbose: bool,
}

impl GcLogger {
    /// Create a logger
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl CycleListener for GcLogger {
    fn on_cycle_event(&self, event: CycleEvent, info: &CycleInfo) {
        match event {
            CycleEvent::Start => info!(
                iteration = info.iteration,
                gc_type = %info.gc_type,
                begin_object_count = info.begin_object_count,
                "DGC start"
            ),
            CycleEvent::Completed => info!(
                iteration = info.iteration,
                gc_type = %info.gc_type,
                candidates = info.candidate_garbage_count,
                pre_rescued = info.pre_rescue_count,
                rescue1 = info.rescue1_count(),
                rescue2 = info.rescue2_count(),
                garbage = info.actual_garbage_count,
                end_object_count = info.end_object_count,
                mark_ms = info.mark_time.as_millis() as u64,
                pause_ms = info.pause_time.as_millis() as u64,
                delete_ms = info.delete_time.as_millis() as u64,
                elapsed_ms = info.elapsed.as_millis() as u64,
                "DGC complete"
            ),
            CycleEvent::Canceled => info!(
                iteration = info.iteration,
                gc_type = %info.gc_type,
                "DGC canceled"
            ),
            _ if self.verbose => info!(iteration = info.iteration, %event, "DGC phase"),
            _ => debug!(iteration = info.iteration, %event, "DGC phase"),
        }
    }
}

/// Bounded history of finished cycles for read-only dashboards
pub struct CycleHistory {
    capacity: usize,
    cycles: Mutex<VecDeque<CycleInfo>>,
}

impl CycleHistory {
    /// Keep at most `capacity` cycles (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            cycles: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Most recent finished cycle
    pub fn latest(&self) -> Option<CycleInfo> {
        self.cycles.lock().back().cloned()
    }

    /// Finished cycles, oldest first
    pub fn snapshot(&self) -> Vec<CycleInfo> {
        self.cycles.lock().iter().cloned().collect()
    }

    /// Number of retained cycles
    pub fn len(&self) -> usize {
        self.cycles.lock().len()
    }

    /// True if no cycle finished yet
    pub fn is_empty(&self) -> bool {
        self.cycles.lock().is_empty()
    }

    /// Retained cycles as a JSON array
    pub fn to_json(&self) -> DgcResult<String> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }
}

impl CycleListener for CycleHistory {
    fn on_cycle_event(&self, event: CycleEvent, info: &CycleInfo) {
        if !matches!(event, CycleEvent::Completed | CycleEvent::Canceled) {
            return;
        }
        let mut cycles = self.cycles.lock();
        if cycles.len() == self.capacity {
            cycles.pop_front();
        }
        cycles.push_back(info.clone());
    }
}
