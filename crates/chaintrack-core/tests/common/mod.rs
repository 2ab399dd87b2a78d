//! Simulated chain provider shared by the integration suites.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chaintrack_core::{
    Block, BlockTag, BlockTracker, ChainProvider, EventTracker, FilterConfig, Log, LogQuery,
    LogSelector, LogStore, ProviderError, TrackerConfig,
};

pub const CONTRACT: &str = "0xc0ffee";
pub const TRANSFER_TOPIC: &str = "0xddf252ad";

type Hook = Box<dyn FnOnce(&mut SimState) + Send>;

/// Chain state behind [`SimChain`]. Orphaned blocks stay queryable by hash.
pub struct SimState {
    pub chain_id: u64,
    canonical: Vec<Block>,
    blocks: HashMap<String, Block>,
    logs: HashMap<String, Vec<Log>>,
    fork: u64,
    log_every: u64,
    /// Range queries spanning more than this many blocks fail with
    /// `TooMuchData`.
    pub max_range: Option<u64>,
    /// Every range query fails with `TooMuchData`.
    pub refuse_ranges: bool,
    /// `to - from` of every range query, in request order.
    pub spans: Vec<u64>,
    pub hash_queries: u64,
    /// The next this many by-hash log queries fail with a transport error.
    pub fail_hash_queries: u32,
    block_hooks: Vec<(BlockTag, Hook)>,
}

impl SimState {
    fn new(genesis_fork: u64, log_every: u64) -> Self {
        let genesis = Block {
            number: 0,
            hash: block_hash(genesis_fork, 0),
            parent_hash: format!("0x{}", "0".repeat(64)),
            timestamp: 0,
        };
        let mut state = Self {
            chain_id: 1,
            canonical: Vec::new(),
            blocks: HashMap::new(),
            logs: HashMap::new(),
            fork: genesis_fork,
            log_every,
            max_range: None,
            refuse_ranges: false,
            spans: Vec::new(),
            hash_queries: 0,
            fail_hash_queries: 0,
            block_hooks: Vec::new(),
        };
        state.insert(genesis, Vec::new());
        state
    }

    fn insert(&mut self, block: Block, logs: Vec<Log>) {
        self.blocks.insert(block.hash.clone(), block.clone());
        self.logs.insert(block.hash.clone(), logs);
        self.canonical.push(block);
    }

    pub fn head(&self) -> Block {
        self.canonical[self.canonical.len() - 1].clone()
    }

    pub fn canonical(&self, number: u64) -> Option<Block> {
        self.canonical.get(number as usize).cloned()
    }

    /// Append `count` blocks to the canonical chain.
    pub fn mine(&mut self, count: u64) {
        for _ in 0..count {
            let parent = self.head();
            let number = parent.number + 1;
            let hash = block_hash(self.fork, number);
            let logs = if self.log_every > 0 && number % self.log_every == 0 {
                vec![Log {
                    address: CONTRACT.into(),
                    topics: vec![TRANSFER_TOPIC.into()],
                    data: format!("0x{:x}", self.fork),
                    block_number: number,
                    block_hash: hash.clone(),
                    transaction_hash: format!("{hash}01"),
                    transaction_index: 0,
                    log_index: 0,
                }]
            } else {
                Vec::new()
            };
            let block = Block {
                number,
                hash,
                parent_hash: parent.hash,
                timestamp: number * 12,
            };
            self.insert(block, logs);
        }
    }

    /// Replace every block from `from` upward with `count` blocks on a new
    /// fork.
    pub fn reorg(&mut self, from: u64, count: u64) {
        self.canonical.truncate(from as usize);
        self.fork += 1;
        self.mine(count);
    }

    /// The logs a fully synced entry for `filter` must hold.
    pub fn expected_logs(&self, filter: &FilterConfig) -> Vec<Log> {
        self.canonical
            .iter()
            .flat_map(|b| self.logs.get(&b.hash).cloned().unwrap_or_default())
            .filter(|l| filter.matches(l))
            .collect()
    }

    pub fn range_queries(&self) -> usize {
        self.spans.len()
    }
}

fn block_hash(fork: u64, number: u64) -> String {
    format!("0x{fork:04x}{number:060x}")
}

/// In-process [`ChainProvider`] over a scriptable chain.
pub struct SimChain {
    state: Mutex<SimState>,
}

impl SimChain {
    pub fn new(log_every: u64) -> Arc<Self> {
        Self::with_genesis_fork(0, log_every)
    }

    /// A chain whose genesis hash differs from [`SimChain::new`]'s.
    pub fn with_genesis_fork(fork: u64, log_every: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState::new(fork, log_every)),
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn mine(&self, count: u64) {
        self.with(|s| s.mine(count));
    }

    pub fn reorg(&self, from: u64, count: u64) {
        self.with(|s| s.reorg(from, count));
    }

    pub fn head(&self) -> Block {
        self.with(|s| s.head())
    }

    pub fn expected_logs(&self, filter: &FilterConfig) -> Vec<Log> {
        self.with(|s| s.expected_logs(filter))
    }

    /// Run `action` right after a `block_by_number(tag)` call is first
    /// answered.
    pub fn after_block_served(&self, tag: BlockTag, action: impl FnOnce(&mut SimState) + Send + 'static) {
        self.with(|s| s.block_hooks.push((tag, Box::new(action))));
    }
}

#[async_trait]
impl ChainProvider for SimChain {
    async fn block_number(&self) -> Result<u64, ProviderError> {
        Ok(self.head().number)
    }

    async fn block_by_number(&self, tag: BlockTag) -> Result<Option<Block>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        let block = match tag {
            BlockTag::Latest => Some(state.head()),
            BlockTag::Number(n) => state.canonical(n),
        };
        let hooks = std::mem::take(&mut state.block_hooks);
        let (ready, pending): (Vec<_>, Vec<_>) = hooks.into_iter().partition(|(at, _)| *at == tag);
        state.block_hooks = pending;
        for (_, hook) in ready {
            hook(&mut state);
        }
        Ok(block)
    }

    async fn block_by_hash(&self, hash: &str, _full_tx: bool) -> Result<Option<Block>, ProviderError> {
        Ok(self.with(|s| s.blocks.get(hash).cloned()))
    }

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        let logs: Vec<Log> = match &query.selector {
            LogSelector::Range { from, to } => {
                state.spans.push(to.saturating_sub(*from));
                if state.refuse_ranges || state.max_range.is_some_and(|k| to - from > k) {
                    return Err(ProviderError::TooMuchData(format!(
                        "query returned more than 10000 results for range {from}..{to}"
                    )));
                }
                (*from..=*to)
                    .filter_map(|n| state.canonical(n))
                    .flat_map(|b| state.logs.get(&b.hash).cloned().unwrap_or_default())
                    .collect()
            }
            LogSelector::BlockHash(hash) => {
                state.hash_queries += 1;
                if state.fail_hash_queries > 0 {
                    state.fail_hash_queries -= 1;
                    return Err(ProviderError::Transport("connection reset".into()));
                }
                state.logs.get(hash).cloned().unwrap_or_default()
            }
        };
        Ok(logs.into_iter().filter(|l| query.filter.matches(l)).collect())
    }

    async fn chain_id(&self) -> Result<u64, ProviderError> {
        Ok(self.with(|s| s.chain_id))
    }
}

pub fn config(backlog: u64, batch_size: u64) -> TrackerConfig {
    TrackerConfig {
        max_block_backlog: backlog,
        batch_size,
        poll_interval_ms: 5,
        live_retry_delay_ms: 5,
        ..TrackerConfig::default()
    }
}

/// A fresh block tracker and event tracker over `sim` and `store`.
pub fn tracker(
    sim: &Arc<SimChain>,
    store: Arc<dyn LogStore>,
    config: TrackerConfig,
) -> EventTracker<SimChain> {
    let blocks = Arc::new(
        BlockTracker::new(sim.clone(), config.max_block_backlog)
            .with_retry_delay(config.live_retry_delay()),
    );
    EventTracker::new(sim.clone(), store, blocks, config)
}
