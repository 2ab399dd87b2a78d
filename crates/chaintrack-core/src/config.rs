//! Tracker configuration and state types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::FilterConfig;

/// Configuration for one event tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Deepest reorg, in blocks, that can be repaired in place. Also the size
    /// of the hot zone synced block by block.
    pub max_block_backlog: u64,
    /// Default (and maximum) span of one `eth_getLogs` range query.
    pub batch_size: u64,
    /// Head polling interval (milliseconds).
    pub poll_interval_ms: u64,
    /// First block to scan when the store is empty.
    pub start_block: Option<u64>,
    /// Attempts per added block when fetching live logs by block hash.
    pub live_retry_attempts: u32,
    /// Delay between those attempts (milliseconds).
    pub live_retry_delay_ms: u64,
    /// Which logs to track.
    pub filter: FilterConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_block_backlog: 10,
            batch_size: 1000,
            poll_interval_ms: 2000,
            start_block: None,
            live_retry_attempts: 5,
            live_retry_delay_ms: 500,
            filter: FilterConfig::default(),
        }
    }
}

impl TrackerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn live_retry_delay(&self) -> Duration {
        Duration::from_millis(self.live_retry_delay_ms)
    }
}

/// Runtime state of an event tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerState {
    /// Not yet started.
    Idle,
    /// Checking the store against the provider's chain identity.
    Preflight,
    /// Range-querying historical logs far behind the head.
    Backfilling,
    /// Syncing the reorg-sensitive blocks near the head one by one.
    HotZone,
    /// Following block tracker deltas.
    Live,
    /// Canceled by the caller.
    Stopped,
    /// Stopped by an error.
    Error,
}

impl std::fmt::Display for TrackerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Preflight => write!(f, "preflight"),
            Self::Backfilling => write!(f, "backfilling"),
            Self::HotZone => write!(f, "hot-zone"),
            Self::Live => write!(f, "live"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}
