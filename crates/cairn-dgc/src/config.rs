//! Configuration for the reference oracle and the collection coordinator.

use crate::error::{DgcError, DgcResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coordinator and oracle configuration.
///
/// Durations are stored in milliseconds so the struct maps one-to-one onto the
/// recognized configuration keys (`refreshIntervalMillis`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DgcConfig {
    /// Cadence of full oracle snapshots.
    /// Default: 60000
    pub refresh_interval_millis: u64,

    /// Whether SLEEP automatically schedules the next cycle.
    /// Default: true
    pub periodic_enabled: bool,

    /// Delay between periodic cycles.
    /// Default: 3600000 (one hour)
    pub periodic_interval_millis: u64,

    /// Upper bound on the wait for quiescence acknowledgement.
    /// Default: 30000
    pub pause_ack_timeout_millis: u64,

    /// Number of independently locked stripes in the oracle's live delta.
    /// Default: 16
    pub concurrency_level: usize,

    /// Idle refresh intervals after which the oracle drops its registry listener.
    /// Default: 5
    pub listener_idle_multiplier: u32,

    /// Track newly created objects for young-generation collection.
    /// Default: false
    pub young_gen_enabled: bool,

    /// Log every phase of every cycle at info level.
    /// Default: false
    pub verbose_gc: bool,

    /// Cycles retained by the cycle history.
    /// Default: 32
    pub history_capacity: usize,
}

impl Default for DgcConfig {
    fn default() -> Self {
        Self {
            refresh_interval_millis: 60_000,
            periodic_enabled: true,
            periodic_interval_millis: 60 * 60 * 1000,
            pause_ack_timeout_millis: 30_000,
            concurrency_level: 16,
            listener_idle_multiplier: 5,
            young_gen_enabled: false,
            verbose_gc: false,
            history_capacity: 32,
        }
    }
}

impl DgcConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document; missing keys take their defaults.
    pub fn from_json(json: &str) -> DgcResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the coordinator cannot run with.
    pub fn validate(&self) -> DgcResult<()> {
        if self.refresh_interval_millis == 0 {
            return Err(DgcError::Config(
                "refreshIntervalMillis must be greater than zero".into(),
            ));
        }
        // Checked even when disabled: periodic GC can be switched on at runtime
        if self.periodic_interval_millis == 0 {
            return Err(DgcError::Config(
                "periodicIntervalMillis must be greater than zero".into(),
            ));
        }
        if self.concurrency_level == 0 {
            return Err(DgcError::Config(
                "concurrencyLevel must be at least 1".into(),
            ));
        }
        if self.listener_idle_multiplier == 0 {
            return Err(DgcError::Config(
                "listenerIdleMultiplier must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Oracle refresh interval
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_millis)
    }

    /// Inactivity after which the oracle's registry listener is dropped
    pub fn listener_idle_timeout(&self) -> Duration {
        self.refresh_interval() * self.listener_idle_multiplier
    }

    /// Delay between periodic cycles
    pub fn periodic_interval(&self) -> Duration {
        Duration::from_millis(self.periodic_interval_millis)
    }

    /// Bound on the pause acknowledgement wait
    pub fn pause_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.pause_ack_timeout_millis)
    }

    /// Set the oracle refresh interval.
    pub fn refresh_interval_millis(mut self, millis: u64) -> Self {
        self.refresh_interval_millis = millis;
        self
    }

    /// Enable or disable periodic collection.
    pub fn periodic_enabled(mut self, enabled: bool) -> Self {
        self.periodic_enabled = enabled;
        self
    }

    /// Set the delay between periodic cycles.
    pub fn periodic_interval_millis(mut self, millis: u64) -> Self {
        self.periodic_interval_millis = millis;
        self
    }

    /// Set the pause acknowledgement timeout.
    pub fn pause_ack_timeout_millis(mut self, millis: u64) -> Self {
        self.pause_ack_timeout_millis = millis;
        self
    }

    /// Set the number of delta stripes.
    pub fn concurrency_level(mut self, level: usize) -> Self {
        self.concurrency_level = level;
        self
    }

    /// Enable or disable young-generation tracking.
    pub fn young_gen_enabled(mut self, enabled: bool) -> Self {
        self.young_gen_enabled = enabled;
        self
    }

    /// Enable or disable verbose phase logging.
    pub fn verbose_gc(mut self, verbose: bool) -> Self {
        self.verbose_gc = verbose;
        self
    }

    /// Set the idle multiplier of the oracle's registry listener.
    pub fn listener_idle_multiplier(mut self, multiplier: u32) -> Self {
        self.listener_idle_multiplier = multiplier;
        self
    }

    /// Set how many finished cycles the history keeps.
    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }
}
