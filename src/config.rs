//! Tunables for the log system control plane.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Knobs governing recovery, pop batching, and replica liveness.
///
/// Every field has a production default; tests override individual fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Versions a read transaction may span; floors the recovered
    /// known-committed version below a proposed recovery version.
    pub max_read_transaction_life_versions: u64,

    /// Delay before a coalesced data pop is sent, to batch watermarks.
    pub pop_batch_delay_ms: u64,

    /// Delay before a coalesced log-router pop is sent. Routers hold only a
    /// few seconds of data, so their pops go out immediately.
    pub router_pop_batch_delay_ms: u64,

    /// Per-request timeout for replica and worker calls during recovery.
    pub replica_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_read_transaction_life_versions: 5_000_000,
            pop_batch_delay_ms: 1_000,
            router_pop_batch_delay_ms: 0,
            replica_timeout_ms: 400,
        }
    }
}

impl Config {
    pub fn pop_batch_delay(&self) -> Duration {
        Duration::from_millis(self.pop_batch_delay_ms)
    }

    pub fn router_pop_batch_delay(&self) -> Duration {
        Duration::from_millis(self.router_pop_batch_delay_ms)
    }

    pub fn replica_timeout(&self) -> Duration {
        Duration::from_millis(self.replica_timeout_ms)
    }
}
