//! Block tracker: maintains a sliding window of recent canonical blocks,
//! repairs forks, and publishes the resulting `(added, removed)` deltas.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::TrackerError;
use crate::head::{HeadHandler, HeadSource};
use crate::provider::{BlockTag, ChainProvider};
use crate::stream::{BlockStream, Subscription};
use crate::types::{Block, BlockEvent};

/// Ordered, gap-free window of at most `capacity` canonical blocks.
///
/// Adjacent blocks always satisfy `next.extends(prev)`.
#[derive(Debug, Clone)]
pub struct BlockWindow {
    blocks: VecDeque<Block>,
    capacity: usize,
}

impl BlockWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn head(&self) -> Option<&Block> {
        self.blocks.back()
    }

    pub fn oldest(&self) -> Option<&Block> {
        self.blocks.front()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Index of the block with `hash`.
    pub fn position(&self, hash: &str) -> Option<usize> {
        self.blocks.iter().rposition(|b| b.hash == hash)
    }

    pub fn get(&self, index: usize) -> Option<&Block> {
        self.blocks.get(index)
    }

    pub fn to_vec(&self) -> Vec<Block> {
        self.blocks.iter().cloned().collect()
    }

    /// Append `block`, evicting the oldest block when full.
    fn push(&mut self, block: Block) -> Result<(), TrackerError> {
        if let Some(head) = self.blocks.back() {
            if !block.extends(head) {
                return Err(TrackerError::NonContiguous {
                    expected: head.number + 1,
                    got: block.number,
                });
            }
        }
        if self.blocks.len() >= self.capacity {
            self.blocks.pop_front();
        }
        self.blocks.push_back(block);
        Ok(())
    }

    /// Drop every block after `index`, returning them oldest-first.
    fn truncate_after(&mut self, index: usize) -> Vec<Block> {
        self.blocks.drain(index + 1..).collect()
    }

    fn clear(&mut self) {
        self.blocks.clear();
    }
}

/// How a candidate head relates to the window.
enum Resolution {
    /// Oldest-first blocks that extend the current head.
    Extend(Vec<Block>),
    /// Blocks replacing everything after window index `keep`.
    Fork { added: Vec<Block>, keep: usize },
    /// Blocks replacing the whole window.
    Jump(Vec<Block>),
}

/// Authoritative, reorg-corrected view of the last `max_block_backlog`
/// canonical blocks.
///
/// Reconciliation and window mutation are serialized by one lock, so deltas
/// reach [`BlockStream`] subscribers in a single total order.
pub struct BlockTracker<P> {
    provider: Arc<P>,
    window: Mutex<BlockWindow>,
    stream: BlockStream,
    max_block_backlog: u64,
    retry_delay: Duration,
}

impl<P: ChainProvider> BlockTracker<P> {
    pub fn new(provider: Arc<P>, max_block_backlog: u64) -> Self {
        let max_block_backlog = max_block_backlog.max(1);
        Self {
            provider,
            window: Mutex::new(BlockWindow::new(max_block_backlog as usize)),
            stream: BlockStream::new(),
            max_block_backlog,
            retry_delay: Duration::from_millis(500),
        }
    }

    /// Pause between lookups of a parent the provider does not know yet.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Publish on a bounded stream: readers lagging more than `capacity`
    /// events get [`TrackerError::FellBehind`].
    pub fn with_stream_capacity(mut self, capacity: usize) -> Self {
        self.stream = BlockStream::bounded(capacity);
        self
    }

    pub fn max_block_backlog(&self) -> u64 {
        self.max_block_backlog
    }

    /// Fill the window with up to `max_block_backlog` blocks ending at the
    /// provider's latest block. Publishes nothing.
    pub async fn init(&self) -> Result<(), TrackerError> {
        let mut window = self.window.lock().await;
        let head = self
            .provider
            .block_by_number(BlockTag::Latest)
            .await?
            .ok_or_else(|| TrackerError::BlockNotFound("latest".into()))?;

        let count = self.max_block_backlog.min(head.number + 1);
        let mut chain = vec![head];
        let mut misses = 0;
        while (chain.len() as u64) < count {
            let parent = self.fetch_parent(&chain[chain.len() - 1], &mut misses).await?;
            chain.push(parent);
        }

        window.clear();
        for block in chain.into_iter().rev() {
            window.push(block)?;
        }
        tracing::info!(
            head = window.head().map(|b| b.number),
            blocks = window.len(),
            "block tracker initialized"
        );
        Ok(())
    }

    /// Fold `candidate` into the window and publish the delta, if any.
    pub async fn reconcile(&self, candidate: Block) -> Result<Option<BlockEvent>, TrackerError> {
        let mut window = self.window.lock().await;

        if window.position(&candidate.hash).is_some() {
            return Ok(None);
        }
        if let Some(oldest) = window.oldest() {
            if candidate.number < oldest.number {
                tracing::debug!(
                    number = candidate.number,
                    oldest = oldest.number,
                    "ignoring stale head older than the window"
                );
                return Ok(None);
            }
        }

        let mut next = window.clone();
        let (added, removed) = match self.resolve(&window, candidate).await? {
            Resolution::Extend(added) => (added, Vec::new()),
            Resolution::Fork { added, keep } => (added, next.truncate_after(keep)),
            Resolution::Jump(added) => {
                next.clear();
                (added, Vec::new())
            }
        };
        for block in &added {
            next.push(block.clone())?;
        }
        *window = next;

        if !removed.is_empty() {
            tracing::warn!(
                depth = removed.len(),
                from = removed[0].number,
                new_head = window.head().map(|b| b.number),
                "reorg reconciled"
            );
        }

        let event = BlockEvent { added, removed };
        self.stream.publish(event.clone());
        Ok(Some(event))
    }

    async fn resolve(&self, window: &BlockWindow, candidate: Block) -> Result<Resolution, TrackerError> {
        let Some(head) = window.head() else {
            return Ok(Resolution::Extend(vec![candidate]));
        };
        if candidate.parent_hash == head.hash {
            return Ok(Resolution::Extend(vec![candidate]));
        }
        if let Some(keep) = window.position(&candidate.parent_hash) {
            return Ok(Resolution::Fork {
                added: vec![candidate],
                keep,
            });
        }

        if candidate.number > head.number + self.max_block_backlog {
            // Too far ahead to link: re-seed the window below the candidate.
            tracing::info!(
                head = head.number,
                candidate = candidate.number,
                "head jumped past the window; re-seeding"
            );
            let mut added = vec![candidate];
            let mut misses = 0;
            while (added.len() as u64) < self.max_block_backlog {
                let parent = self.fetch_parent(&added[added.len() - 1], &mut misses).await?;
                added.push(parent);
            }
            added.reverse();
            return Ok(Resolution::Jump(added));
        }

        // Unknown parent: fetch ancestors until one links back into the window.
        let at = candidate.number;
        let mut added = vec![candidate];
        let mut fetched = 0u64;
        let mut misses = 0;
        loop {
            if fetched >= self.max_block_backlog {
                return Err(TrackerError::ReorgTooDeep {
                    at,
                    backlog: self.max_block_backlog,
                });
            }
            fetched += 1;

            let parent = self.fetch_parent(&added[added.len() - 1], &mut misses).await?;
            let link = window.position(&parent.parent_hash);
            let linked_to_head = parent.parent_hash == head.hash;
            added.push(parent);
            if let Some(keep) = link {
                added.reverse();
                return Ok(if linked_to_head {
                    Resolution::Extend(added)
                } else {
                    Resolution::Fork { added, keep }
                });
            }
        }
    }

    /// Fetch `child`'s parent. A parent the provider does not know yet is
    /// asked for again after `retry_delay`; one walk gives up after
    /// `max_block_backlog` such misses in total.
    async fn fetch_parent(&self, child: &Block, misses: &mut u64) -> Result<Block, TrackerError> {
        loop {
            if let Some(parent) = self.provider.block_by_hash(&child.parent_hash, false).await? {
                return Ok(parent);
            }
            if *misses >= self.max_block_backlog {
                return Err(TrackerError::BlockNotFound(child.parent_hash.clone()));
            }
            *misses += 1;
            tracing::debug!(
                parent = %child.parent_hash,
                attempt = *misses,
                "parent block not found yet; retrying"
            );
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    /// Copy of the current head block.
    pub async fn header(&self) -> Option<Block> {
        self.window.lock().await.head().cloned()
    }

    /// Copy of the whole window, oldest first.
    pub async fn blocks(&self) -> Vec<Block> {
        self.window.lock().await.to_vec()
    }

    /// Copy of a windowed block.
    pub async fn block_by_hash(&self, hash: &str) -> Option<Block> {
        let window = self.window.lock().await;
        window.position(hash).and_then(|i| window.get(i).cloned())
    }

    /// Subscribe to deltas published after this call.
    pub fn subscribe(&self) -> Subscription<BlockEvent> {
        self.stream.subscribe()
    }

    pub fn stream(&self) -> &BlockStream {
        &self.stream
    }

    /// Feed `source` into this tracker until canceled or a fatal error.
    pub async fn track(
        &self,
        source: &dyn HeadSource,
        cancel: CancellationToken,
    ) -> Result<(), TrackerError> {
        source.track(cancel, self).await
    }
}

#[async_trait]
impl<P: ChainProvider> HeadHandler for BlockTracker<P> {
    async fn on_block(&self, block: Block) -> Result<(), TrackerError> {
        self.reconcile(block).await.map(|_| ())
    }
}
