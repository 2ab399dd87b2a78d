//! Log Store contract: persisted logs and sync position per filter.
//!
//! A [`LogStore`] hands out one [`Entry`] per [`FilterConfig`] fingerprint.
//! Implementations include [`MemoryLogStore`] here and `SqliteLogStore` in
//! `chaintrack-storage`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::TrackerError;
use crate::types::{Block, Event, FilterConfig, GenesisRecord, Log};

/// Pluggable persistence keyed by filter fingerprint.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Return the entry for `filter`, creating it on first use.
    async fn get_entry(&self, filter: &FilterConfig) -> Result<Arc<dyn Entry>, TrackerError>;
}

/// Per-filter store state: an append-only log sequence plus the last
/// processed block.
///
/// Only one writer per entry is supported.
#[async_trait]
pub trait Entry: Send + Sync {
    /// Number of stored logs (the next log's index).
    async fn last_index(&self) -> Result<u64, TrackerError>;

    /// Apply `event` atomically: truncate to `event.truncate_to` (if set),
    /// append `event.added`, then set the last block to `event.block`.
    /// On error nothing is applied.
    async fn store_event(&self, event: &Event) -> Result<(), TrackerError>;

    async fn get_log(&self, index: u64) -> Result<Option<Log>, TrackerError>;

    async fn get_last_block(&self) -> Result<Option<Block>, TrackerError>;

    /// Chain identity recorded by a previous preflight.
    async fn genesis(&self) -> Result<Option<GenesisRecord>, TrackerError>;

    /// Record (or overwrite) the chain identity.
    async fn upsert_genesis(&self, chain_id: u64, genesis_hash: &str) -> Result<(), TrackerError>;

    /// All stored logs in order.
    async fn logs(&self) -> Result<Vec<Log>, TrackerError> {
        let len = self.last_index().await?;
        let mut logs = Vec::with_capacity(len as usize);
        for index in 0..len {
            if let Some(log) = self.get_log(index).await? {
                logs.push(log);
            }
        }
        Ok(logs)
    }
}

// ─── In-memory store ──────────────────────────────────────────────────────────

/// In-memory log store for tests and ephemeral trackers.
#[derive(Default)]
pub struct MemoryLogStore {
    entries: Mutex<HashMap<String, Arc<MemoryEntry>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries created so far.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn get_entry(&self, filter: &FilterConfig) -> Result<Arc<dyn Entry>, TrackerError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| TrackerError::Storage(e.to_string()))?;
        let entry = entries.entry(filter.fingerprint()).or_default().clone();
        Ok(entry)
    }
}

#[derive(Default)]
struct EntryState {
    logs: Vec<Log>,
    last_block: Option<Block>,
    genesis: Option<GenesisRecord>,
}

/// One in-memory entry.
#[derive(Default)]
pub struct MemoryEntry {
    state: Mutex<EntryState>,
}

impl MemoryEntry {
    fn state(&self) -> Result<MutexGuard<'_, EntryState>, TrackerError> {
        self.state
            .lock()
            .map_err(|e| TrackerError::Storage(e.to_string()))
    }
}

#[async_trait]
impl Entry for MemoryEntry {
    async fn last_index(&self) -> Result<u64, TrackerError> {
        Ok(self.state()?.logs.len() as u64)
    }

    async fn store_event(&self, event: &Event) -> Result<(), TrackerError> {
        let mut state = self.state()?;
        if let Some(len) = event.truncate_to {
            if len > state.logs.len() as u64 {
                return Err(TrackerError::Storage(format!(
                    "cannot truncate {} logs to length {len}",
                    state.logs.len()
                )));
            }
            state.logs.truncate(len as usize);
        }
        state.logs.extend(event.added.iter().cloned());
        state.last_block = Some(event.block.clone());
        Ok(())
    }

    async fn get_log(&self, index: u64) -> Result<Option<Log>, TrackerError> {
        Ok(self.state()?.logs.get(index as usize).cloned())
    }

    async fn get_last_block(&self) -> Result<Option<Block>, TrackerError> {
        Ok(self.state()?.last_block.clone())
    }

    async fn genesis(&self) -> Result<Option<GenesisRecord>, TrackerError> {
        Ok(self.state()?.genesis.clone())
    }

    async fn upsert_genesis(&self, chain_id: u64, genesis_hash: &str) -> Result<(), TrackerError> {
        self.state()?.genesis = Some(GenesisRecord {
            chain_id,
            genesis_hash: genesis_hash.to_string(),
        });
        Ok(())
    }

    async fn logs(&self) -> Result<Vec<Log>, TrackerError> {
        Ok(self.state()?.logs.clone())
    }
}
