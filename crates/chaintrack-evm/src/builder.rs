//! Fluent builder API for event trackers.
//!
//! # Example
//!
//! ```rust,no_run
//! use chaintrack_evm::TrackerBuilder;
//!
//! let config = TrackerBuilder::new()
//!     .address("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48")
//!     .topic(0, "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef")
//!     .max_block_backlog(64)
//!     .batch_size(2000)
//!     .build_config();
//! ```

use std::sync::Arc;

use chaintrack_core::{
    BlockTracker, ChainProvider, EventTracker, FastTrack, FilterConfig, LogStore,
    PollingHeadSource, TrackerConfig,
};

/// Fluent builder for [`TrackerConfig`] and a wired [`EventTracker`].
#[derive(Default)]
pub struct TrackerBuilder {
    config: TrackerConfig,
    fast_track: Option<Arc<dyn FastTrack>>,
    stream_capacity: Option<usize>,
}

impl TrackerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deepest repairable reorg, and the hot-zone size.
    pub fn max_block_backlog(mut self, blocks: u64) -> Self {
        self.config.max_block_backlog = blocks;
        self
    }

    /// Set the number of blocks per `eth_getLogs` range query.
    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set head polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Start an empty entry at this block instead of genesis.
    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = Some(block);
        self
    }

    /// Per-block log fetch retries in the live phase.
    pub fn live_retry(mut self, attempts: u32, delay_ms: u64) -> Self {
        self.config.live_retry_attempts = attempts;
        self.config.live_retry_delay_ms = delay_ms;
        self
    }

    /// Replace the whole filter.
    pub fn filter(mut self, filter: FilterConfig) -> Self {
        self.config.filter = filter;
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.config.filter = self.config.filter.with_address(address);
        self
    }

    pub fn topic(mut self, position: usize, value: impl Into<String>) -> Self {
        self.config.filter = self.config.filter.topic(position, value);
        self
    }

    pub fn fast_track(mut self, fast_track: Arc<dyn FastTrack>) -> Self {
        self.fast_track = Some(fast_track);
        self
    }

    /// Bound the block stream; lagging readers then resync.
    pub fn stream_capacity(mut self, capacity: usize) -> Self {
        self.stream_capacity = Some(capacity);
        self
    }

    /// Build the `TrackerConfig`.
    pub fn build_config(self) -> TrackerConfig {
        self.config
    }

    /// Wire a block tracker and event tracker over `provider` and `store`.
    pub fn build<P: ChainProvider>(self, provider: Arc<P>, store: Arc<dyn LogStore>) -> EventTracker<P> {
        let mut blocks = BlockTracker::new(provider.clone(), self.config.max_block_backlog)
            .with_retry_delay(self.config.live_retry_delay());
        if let Some(capacity) = self.stream_capacity {
            blocks = blocks.with_stream_capacity(capacity);
        }
        let tracker = EventTracker::new(provider, store, Arc::new(blocks), self.config);
        match self.fast_track {
            Some(fast_track) => tracker.with_fast_track(fast_track),
            None => tracker,
        }
    }

    /// A polling head source at the configured interval.
    pub fn polling_head_source<P: ChainProvider>(config: &TrackerConfig, provider: Arc<P>) -> PollingHeadSource<P> {
        PollingHeadSource::new(provider, config.poll_interval())
    }
}
