//! # Cairn distributed garbage collection
//!
//! Decides which objects of a shared object graph are globally unreachable:
//! unreachable from every root *and* not held by any connected client. It
//! deletes exactly that set, and never an object a client currently holds.
//!
//! ## Components
//!
//! - [`ReferenceRegistry`]: per-client managed and prefetched id sets,
//!   each guarded by its own lock, with reference-added listeners
//! - [`LiveReferenceOracle`]: periodic snapshot of the registry plus a
//!   striped live delta, answering "is this id referenced right now"
//! - [`CollectionCoordinator`]: the mark / rescue / pause / delete state
//!   machine with enable, disable, cancel and periodic scheduling
//! - [`CycleTelemetry`]: per-cycle counters published at phase boundaries
//! - [`GcContext`]: wires the above together for one object server
//!
//! Storage, graph traversal data and quiescence are provided by an
//! [`ObjectStore`] implementation; [`InMemoryObjectStore`] is a complete
//! in-process one.

#![warn(clippy::all)]
#![warn(missing_docs)]

mod changes;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
mod hooks;
pub mod ids;
mod listeners;
pub mod oracle;
pub mod registry;
pub mod store;
mod striped;
pub mod telemetry;

pub use config::DgcConfig;
pub use context::GcContext;
pub use coordinator::{CollectionCoordinator, GcRequest, GcState};
pub use error::{DgcError, DgcResult};
pub use ids::{NodeId, ObjectId, ObjectIdSet, id_set};
pub use oracle::{LiveReferenceOracle, ReferenceSetObserver};
pub use registry::{ReferenceListener, ReferenceRegistry};
pub use store::{DeletionApprover, InMemoryObjectStore, ObjectStore, QuiesceAck, Reachable};
pub use telemetry::{
    CycleEvent, CycleHistory, CycleInfo, CycleListener, CycleOutcome, CycleTelemetry, GcLogger,
    GcType,
};
