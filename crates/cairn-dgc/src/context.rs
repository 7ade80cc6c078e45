//! Explicitly constructed collector context.
//!
//! Owns the registry, oracle, telemetry, history and coordinator of one
//! object server. Construction order: registry, oracle, telemetry (with the
//! history listener), coordinator. Teardown runs in reverse: the coordinator
//! stops before the oracle shuts down.

use crate::config::DgcConfig;
use crate::coordinator::CollectionCoordinator;
use crate::error::DgcResult;
use crate::oracle::LiveReferenceOracle;
use crate::registry::ReferenceRegistry;
use crate::store::ObjectStore;
use crate::telemetry::{CycleHistory, CycleTelemetry};
use std::sync::Arc;
use tracing::debug;

/// All collector components of one server
pub struct GcContext {
    config: DgcConfig,
    registry: Arc<ReferenceRegistry>,
    oracle: Arc<LiveReferenceOracle>,
    telemetry: Arc<CycleTelemetry>,
    history: Arc<CycleHistory>,
    coordinator: Arc<CollectionCoordinator>,
}

impl GcContext {
    /// Build every component; the oracle starts its timer thread
    pub fn new(config: DgcConfig, store: Arc<dyn ObjectStore>) -> DgcResult<Self> {
        Self::build(config, store, true)
    }

    /// Build every component without the oracle timer; the oracle refreshes
    /// only when the coordinator marks or on explicit calls
    pub fn new_without_timers(config: DgcConfig, store: Arc<dyn ObjectStore>) -> DgcResult<Self> {
        Self::build(config, store, false)
    }

    fn build(config: DgcConfig, store: Arc<dyn ObjectStore>, timers: bool) -> DgcResult<Self> {
        config.validate()?;
        let registry = Arc::new(ReferenceRegistry::new());
        let oracle = if timers {
            LiveReferenceOracle::new(registry.clone(), &config)
        } else {
            LiveReferenceOracle::new_without_timer(registry.clone(), &config)
        };
        let telemetry = Arc::new(CycleTelemetry::new());
        let history = Arc::new(CycleHistory::new(config.history_capacity));
        telemetry.add_listener(history.clone());
        let coordinator = CollectionCoordinator::new(
            &config,
            store,
            registry.clone(),
            oracle.clone(),
            telemetry.clone(),
        );
        debug!(?config, "GC context created");
        Ok(Self {
            config,
            registry,
            oracle,
            telemetry,
            history,
            coordinator,
        })
    }

    /// Start the coordinator
    pub fn start(&self) {
        self.coordinator.start();
    }

    /// Stop the coordinator, then the oracle. Idempotent.
    pub fn shutdown(&self) {
        self.coordinator.stop();
        self.oracle.shutdown();
    }

    /// Configuration the context was built with
    pub fn config(&self) -> &DgcConfig {
        &self.config
    }

    /// Reference registry
    pub fn registry(&self) -> &Arc<ReferenceRegistry> {
        &self.registry
    }

    /// Live reference oracle
    pub fn oracle(&self) -> &Arc<LiveReferenceOracle> {
        &self.oracle
    }

    /// Cycle telemetry publisher
    pub fn telemetry(&self) -> &Arc<CycleTelemetry> {
        &self.telemetry
    }

    /// History of finished cycles
    pub fn history(&self) -> &Arc<CycleHistory> {
        &self.history
    }

    /// Collection coordinator
    pub fn coordinator(&self) -> &Arc<CollectionCoordinator> {
        &self.coordinator
    }
}

impl Drop for GcContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
