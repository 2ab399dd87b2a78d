//! Event tracker: keeps one store entry consistent with the canonical chain.
//!
//! A sync runs in phases:
//! 1. **Preflight** (once per instance): the entry's recorded chain identity
//!    must match the provider's.
//! 2. **Origin**: resume after the stored last block, or start from the
//!    configured start block, a fast-track hint, or genesis.
//! 3. **Reconcile**: if the stored last block is no longer canonical, walk
//!    back to the common ancestor and truncate the entry.
//! 4. **Backfill**: range-query logs in adaptive batches until within
//!    `max_block_backlog` of the head.
//! 5. **Hot zone**: fetch the remaining blocks one by one by hash, following
//!    the block tracker's parent chain, and apply them as one event.
//!
//! [`EventTracker::run`] then follows the block tracker's stream, turning
//! every [`BlockEvent`] into a truncate-and-append [`Event`].

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{watch, OnceCell};
use tokio_util::sync::CancellationToken;

use crate::config::{TrackerConfig, TrackerState};
use crate::error::TrackerError;
use crate::fasttrack::FastTrack;
use crate::provider::{BlockTag, ChainProvider, LogQuery};
use crate::store::{Entry, LogStore};
use crate::stream::{Broker, Subscription};
use crate::tracker::BlockTracker;
use crate::types::{Block, BlockEvent, Event, Log};

/// Outcome of translating one live [`BlockEvent`].
enum LiveStep {
    /// Stored; the entry now ends at this block.
    Applied(Block),
    /// Nothing newer than the stored position.
    Skipped,
    /// The event does not connect to the stored position.
    Gap,
}

pub struct EventTracker<P> {
    provider: Arc<P>,
    store: Arc<dyn LogStore>,
    block_tracker: Arc<BlockTracker<P>>,
    config: TrackerConfig,
    fast_track: Option<Arc<dyn FastTrack>>,
    entry: OnceCell<Arc<dyn Entry>>,
    preflight: OnceCell<()>,
    events: Broker<Event>,
    state: watch::Sender<TrackerState>,
}

impl<P: ChainProvider> EventTracker<P> {
    pub fn new(
        provider: Arc<P>,
        store: Arc<dyn LogStore>,
        block_tracker: Arc<BlockTracker<P>>,
        config: TrackerConfig,
    ) -> Self {
        let (state, _) = watch::channel(TrackerState::Idle);
        Self {
            provider,
            store,
            block_tracker,
            config,
            fast_track: None,
            entry: OnceCell::new(),
            preflight: OnceCell::new(),
            events: Broker::new(),
            state,
        }
    }

    /// Use `fast_track` to find the first relevant block of an empty entry.
    pub fn with_fast_track(mut self, fast_track: Arc<dyn FastTrack>) -> Self {
        self.fast_track = Some(fast_track);
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn block_tracker(&self) -> &Arc<BlockTracker<P>> {
        &self.block_tracker
    }

    /// Current phase.
    pub fn state(&self) -> TrackerState {
        *self.state.borrow()
    }

    /// Watch phase transitions.
    pub fn watch_state(&self) -> watch::Receiver<TrackerState> {
        self.state.subscribe()
    }

    /// Subscribe to the events this tracker applies to its entry.
    pub fn subscribe(&self) -> Subscription<Event> {
        self.events.subscribe()
    }

    /// The store entry for the configured filter.
    pub async fn entry(&self) -> Result<Arc<dyn Entry>, TrackerError> {
        self.entry
            .get_or_try_init(|| self.store.get_entry(&self.config.filter))
            .await
            .cloned()
    }

    fn set_state(&self, state: TrackerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "tracker state changed");
        }
    }

    fn finish<T>(&self, result: Result<T, TrackerError>) -> Result<T, TrackerError> {
        if let Err(e) = &result {
            if e.is_canceled() {
                self.set_state(TrackerState::Stopped);
            } else {
                if e.is_fatal() {
                    tracing::error!(error = %e, "store cannot follow this chain; event tracker stopped");
                } else {
                    tracing::warn!(error = %e, "event tracker stopped; sync can be retried");
                }
                self.set_state(TrackerState::Error);
            }
        }
        result
    }

    // ─── Sync ─────────────────────────────────────────────────────────────────

    /// Bring the entry up to the current head. Returns the block the entry
    /// now ends at.
    ///
    /// Progress committed before an error stays committed; calling `sync`
    /// again resumes from it.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<Block, TrackerError> {
        let result = self.sync_inner(cancel).await;
        self.finish(result)
    }

    async fn sync_inner(&self, cancel: &CancellationToken) -> Result<Block, TrackerError> {
        let entry = self.entry().await?;
        self.preflight
            .get_or_try_init(|| self.preflight_check(entry.as_ref(), cancel))
            .await?;

        let mut rounds = 0u32;
        loop {
            let (origin, last) = self.origin(entry.as_ref(), cancel).await?;
            if let Some((origin, last)) = self.backfill(entry.as_ref(), origin, last, cancel).await? {
                if let Some(block) = self.hot_zone(entry.as_ref(), origin, last, cancel).await? {
                    return Ok(block);
                }
            }

            rounds += 1;
            if rounds >= self.config.live_retry_attempts.max(1) {
                return Err(TrackerError::Other(format!(
                    "block tracker head did not link to the stored chain after {rounds} attempts"
                )));
            }
            self.sleep(self.config.live_retry_delay(), cancel).await?;
        }
    }

    async fn preflight_check(
        &self,
        entry: &dyn Entry,
        cancel: &CancellationToken,
    ) -> Result<(), TrackerError> {
        self.set_state(TrackerState::Preflight);
        let genesis = guarded(cancel, self.provider.block_by_number(BlockTag::Number(0)))
            .await?
            .ok_or_else(|| TrackerError::BlockNotFound("0".into()))?;
        let chain_id = guarded(cancel, self.provider.chain_id()).await?;

        match entry.genesis().await? {
            None => {
                entry.upsert_genesis(chain_id, &genesis.hash).await?;
                tracing::info!(chain_id, genesis = %genesis.hash, "recorded chain identity");
            }
            Some(recorded) => {
                if recorded.chain_id != chain_id {
                    return Err(TrackerError::ChainMismatch {
                        recorded: recorded.chain_id,
                        actual: chain_id,
                    });
                }
                if recorded.genesis_hash != genesis.hash {
                    return Err(TrackerError::GenesisMismatch {
                        recorded: recorded.genesis_hash,
                        actual: genesis.hash,
                    });
                }
            }
        }
        Ok(())
    }

    /// First height still to scan, and the block the entry currently ends at.
    async fn origin(
        &self,
        entry: &dyn Entry,
        cancel: &CancellationToken,
    ) -> Result<(u64, Option<Block>), TrackerError> {
        if let Some(last) = entry.get_last_block().await? {
            let ancestor = self.reconcile_position(entry, last, cancel).await?;
            return Ok((ancestor.number + 1, Some(ancestor)));
        }

        if let Some(start) = self.config.start_block {
            let head = guarded(cancel, self.provider.block_number()).await?;
            if start > head {
                return Err(TrackerError::StoreAheadOfHead {
                    stored: start,
                    head,
                });
            }
            tracing::info!(start, "starting at configured block");
            return Ok((start, None));
        }

        if let (Some(fast_track), true) = (&self.fast_track, self.config.filter.has_addresses()) {
            let found = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TrackerError::Canceled),
                res = fast_track.first_block(&self.config.filter.addresses) => res,
            };
            match found {
                Ok(Some(first)) => {
                    tracing::info!(first, "fast-tracked to first relevant block");
                    return Ok((first, None));
                }
                Ok(None) => tracing::info!("fast-track found no activity; scanning from genesis"),
                Err(e) => tracing::warn!(error = %e, "fast-track unavailable; scanning from genesis"),
            }
        }
        Ok((0, None))
    }

    /// Return the newest stored block that is still canonical, truncating the
    /// entry past it if the stored chain was reorged away.
    async fn reconcile_position(
        &self,
        entry: &dyn Entry,
        last: Block,
        cancel: &CancellationToken,
    ) -> Result<Block, TrackerError> {
        let head = guarded(cancel, self.provider.block_number()).await?;
        if last.number > head {
            return Err(TrackerError::StoreAheadOfHead {
                stored: last.number,
                head,
            });
        }

        let mut canonical = guarded(cancel, self.provider.block_by_number(BlockTag::Number(last.number)))
            .await?
            .ok_or_else(|| TrackerError::BlockNotFound(last.number.to_string()))?;
        if canonical.hash == last.hash {
            return Ok(last);
        }

        let backlog = self.block_tracker.max_block_backlog();
        let mut stored = last.clone();
        let mut steps = 0u64;
        while stored.hash != canonical.hash {
            if steps >= backlog || stored.number == 0 {
                return Err(TrackerError::ReorgTooDeep {
                    at: last.number,
                    backlog,
                });
            }
            steps += 1;
            stored = self.fetch_by_hash(&stored.parent_hash, cancel).await?;
            canonical = self.fetch_by_hash(&canonical.parent_hash, cancel).await?;
        }

        let (index, removed) = rollback_point(entry, canonical.number + 1).await?;
        tracing::warn!(
            stored = last.number,
            ancestor = canonical.number,
            depth = steps,
            logs_removed = removed.len(),
            "stored chain was reorged; rolling back"
        );
        self.apply(
            entry,
            Event {
                added: Vec::new(),
                removed,
                truncate_to: Some(index),
                block: canonical.clone(),
            },
        )
        .await?;
        Ok(canonical)
    }

    /// Range-query logs until `origin` is within the backlog of the head.
    /// `None` when a block stored by an earlier batch stopped being canonical.
    async fn backfill(
        &self,
        entry: &dyn Entry,
        mut origin: u64,
        mut last: Option<Block>,
        cancel: &CancellationToken,
    ) -> Result<Option<(u64, Option<Block>)>, TrackerError> {
        let backlog = self.block_tracker.max_block_backlog();
        let default_batch = self.config.batch_size;
        let step = (default_batch / 10).max(1);
        let mut batch = default_batch;
        let mut verified = true;

        loop {
            check(cancel)?;
            if let (false, Some(stored)) = (verified, &last) {
                let canonical =
                    guarded(cancel, self.provider.block_by_number(BlockTag::Number(stored.number))).await?;
                if canonical.as_ref().map(|b| b.hash.as_str()) != Some(stored.hash.as_str()) {
                    tracing::warn!(block = stored.number, "backfilled block was reorged; reconciling again");
                    return Ok(None);
                }
                verified = true;
            }

            let head = guarded(cancel, self.provider.block_number()).await?;
            if head < origin || head - origin + 1 <= backlog {
                return Ok(Some((origin, last)));
            }
            self.set_state(TrackerState::Backfilling);

            let to = origin.saturating_add(batch).min(head - backlog);
            let query = LogQuery::range(&self.config.filter, origin, to);
            let logs = match guarded(cancel, self.provider.get_logs(&query)).await {
                Ok(logs) => logs,
                Err(TrackerError::Provider(e)) if e.is_too_much_data() => {
                    if batch == 0 {
                        return Err(e.into());
                    }
                    batch /= 2;
                    tracing::warn!(from = origin, to, batch, "too much data; shrinking batch");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let block = guarded(cancel, self.provider.block_by_number(BlockTag::Number(to)))
                .await?
                .ok_or_else(|| TrackerError::BlockNotFound(to.to_string()))?;
            let count = logs.len();
            self.apply(entry, Event::append(logs, block.clone())).await?;
            tracing::info!(from = origin, to, logs = count, head, "backfilled batch");

            origin = to + 1;
            last = Some(block);
            verified = false;
            batch = (batch + step).min(default_batch);
        }
    }

    /// Fetch `[origin, head]` block by block along the block tracker's
    /// parent chain. `None` when that chain does not connect to `last`.
    async fn hot_zone(
        &self,
        entry: &dyn Entry,
        origin: u64,
        last: Option<Block>,
        cancel: &CancellationToken,
    ) -> Result<Option<Block>, TrackerError> {
        let head = self.tracker_head(cancel).await?;
        if head.number < origin {
            return match last {
                Some(last) => Ok(Some(last)),
                None => Err(TrackerError::StoreAheadOfHead {
                    stored: origin,
                    head: head.number,
                }),
            };
        }
        self.set_state(TrackerState::HotZone);

        let mut chain = vec![head];
        while chain[chain.len() - 1].number > origin {
            check(cancel)?;
            let parent_hash = chain[chain.len() - 1].parent_hash.clone();
            let parent = match self.block_tracker.block_by_hash(&parent_hash).await {
                Some(parent) => parent,
                None => self.fetch_by_hash(&parent_hash, cancel).await?,
            };
            chain.push(parent);
        }
        chain.reverse();

        if let Some(last) = &last {
            if chain[0].parent_hash != last.hash {
                tracing::warn!(
                    stored = last.number,
                    "hot zone does not extend the stored chain; reconciling again"
                );
                return Ok(None);
            }
        }

        let mut logs = Vec::new();
        for block in &chain {
            logs.extend(self.block_logs(&block.hash, cancel).await?);
        }
        let head = chain[chain.len() - 1].clone();
        let count = logs.len();
        self.apply(entry, Event::append(logs, head.clone())).await?;
        tracing::info!(from = origin, to = head.number, logs = count, "hot zone synced");
        Ok(Some(head))
    }

    /// The block tracker's head, refreshed from the provider's latest block.
    /// An empty or far-behind window is re-initialized instead.
    async fn tracker_head(&self, cancel: &CancellationToken) -> Result<Block, TrackerError> {
        let latest = guarded(cancel, self.provider.block_by_number(BlockTag::Latest))
            .await?
            .ok_or_else(|| TrackerError::BlockNotFound("latest".into()))?;
        let backlog = self.block_tracker.max_block_backlog();
        let stale = match self.block_tracker.header().await {
            Some(head) => head.number + backlog < latest.number,
            None => true,
        };
        if stale {
            guarded(cancel, self.block_tracker.init()).await?;
        } else {
            guarded(cancel, self.block_tracker.reconcile(latest)).await?;
        }
        self.block_tracker
            .header()
            .await
            .ok_or_else(|| TrackerError::BlockNotFound("latest".into()))
    }

    // ─── Live ─────────────────────────────────────────────────────────────────

    /// Sync, then follow the block tracker until canceled or a fatal error.
    ///
    /// The block tracker must be fed by a head source running elsewhere
    /// (see [`BlockTracker::track`]). Returns `Ok(())` on cancellation.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), TrackerError> {
        let result = self.run_inner(&cancel).await;
        match self.finish(result) {
            Err(e) if e.is_canceled() => Ok(()),
            other => other,
        }
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<(), TrackerError> {
        let entry = self.entry().await?;
        // Subscribe first so no delta published during the sync is lost.
        let mut deltas = self.block_tracker.subscribe();
        let mut last = self.sync_inner(cancel).await?;
        self.set_state(TrackerState::Live);
        tracing::info!(block = last.number, "event tracker live");

        loop {
            let delta = match deltas.next(cancel).await {
                Ok(delta) => delta,
                Err(TrackerError::FellBehind) => {
                    tracing::warn!("fell behind the block stream; resyncing");
                    deltas.flush();
                    last = self.sync_inner(cancel).await?;
                    self.set_state(TrackerState::Live);
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.apply_delta(entry.as_ref(), &last, &delta, cancel).await? {
                LiveStep::Applied(block) => last = block,
                LiveStep::Skipped => {}
                LiveStep::Gap => {
                    tracing::info!(stored = last.number, "block stream ahead of store; catching up");
                    last = self.sync_inner(cancel).await?;
                    self.set_state(TrackerState::Live);
                }
            }
        }
    }

    async fn apply_delta(
        &self,
        entry: &dyn Entry,
        last: &Block,
        delta: &BlockEvent,
        cancel: &CancellationToken,
    ) -> Result<LiveStep, TrackerError> {
        let mut base_number = last.number;
        let mut base_hash = last.hash.clone();
        let mut truncate_to = None;
        let mut removed = Vec::new();

        if let Some(first) = delta.removed.first() {
            if first.number <= last.number {
                if !delta.removed.iter().any(|b| b.hash == last.hash) {
                    // The store is not on the superseded branch: either it
                    // already holds the new one, or it is somewhere else.
                    if delta.added.iter().any(|b| b.hash == last.hash) {
                        tracing::debug!(block = last.number, "store already follows this reorg");
                    } else {
                        return Ok(LiveStep::Gap);
                    }
                } else {
                    let (index, logs) = rollback_point(entry, first.number).await?;
                    truncate_to = Some(index);
                    removed = logs;
                    base_number = first.number.saturating_sub(1);
                    base_hash = first.parent_hash.clone();
                    tracing::warn!(
                        from = first.number,
                        logs_removed = removed.len(),
                        "reorg reached the store; rolling back"
                    );
                }
            }
        }

        let added: Vec<&Block> = delta.added.iter().filter(|b| b.number > base_number).collect();
        let Some(first) = added.first() else {
            return Ok(LiveStep::Skipped);
        };
        if first.number != base_number + 1 || first.parent_hash != base_hash {
            return Ok(LiveStep::Gap);
        }

        let mut logs = Vec::new();
        for block in &added {
            logs.extend(self.block_logs(&block.hash, cancel).await?);
        }
        let block = (*added[added.len() - 1]).clone();
        self.apply(
            entry,
            Event {
                added: logs,
                removed,
                truncate_to,
                block: block.clone(),
            },
        )
        .await?;
        tracing::debug!(block = block.number, "applied live block event");
        Ok(LiveStep::Applied(block))
    }

    // ─── Helpers ──────────────────────────────────────────────────────────────

    async fn apply(&self, entry: &dyn Entry, event: Event) -> Result<(), TrackerError> {
        entry.store_event(&event).await?;
        self.events.publish(event);
        Ok(())
    }

    async fn fetch_by_hash(&self, hash: &str, cancel: &CancellationToken) -> Result<Block, TrackerError> {
        guarded(cancel, self.provider.block_by_hash(hash, false))
            .await?
            .ok_or_else(|| TrackerError::BlockNotFound(hash.to_string()))
    }

    /// Logs of one block, retried to ride out providers lagging the head.
    async fn block_logs(&self, hash: &str, cancel: &CancellationToken) -> Result<Vec<Log>, TrackerError> {
        let query = LogQuery::block_hash(&self.config.filter, hash);
        let attempts = self.config.live_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match guarded(cancel, self.provider.get_logs(&query)).await {
                Ok(logs) => return Ok(logs),
                Err(TrackerError::Provider(e)) if attempt < attempts => {
                    tracing::warn!(hash, attempt, error = %e, "block log fetch failed; retrying");
                }
                Err(e) => return Err(e),
            }
            attempt += 1;
            self.sleep(self.config.live_retry_delay(), cancel).await?;
        }
    }

    async fn sleep(&self, duration: std::time::Duration, cancel: &CancellationToken) -> Result<(), TrackerError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(TrackerError::Canceled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

fn check(cancel: &CancellationToken) -> Result<(), TrackerError> {
    if cancel.is_cancelled() {
        Err(TrackerError::Canceled)
    } else {
        Ok(())
    }
}

/// Await `call` unless `cancel` fires first.
async fn guarded<T, E: Into<TrackerError>>(
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T, E>>,
) -> Result<T, TrackerError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TrackerError::Canceled),
        res = call => res.map_err(Into::into),
    }
}

/// Scan the entry newest-first for logs at or after height `number` and
/// return the truncation index plus the logs it removes (oldest-first).
async fn rollback_point(entry: &dyn Entry, number: u64) -> Result<(u64, Vec<Log>), TrackerError> {
    let mut index = entry.last_index().await?;
    let mut removed = Vec::new();
    while index > 0 {
        let Some(log) = entry.get_log(index - 1).await? else {
            break;
        };
        if log.block_number < number {
            break;
        }
        removed.push(log);
        index -= 1;
    }
    removed.reverse();
    Ok((index, removed))
}
