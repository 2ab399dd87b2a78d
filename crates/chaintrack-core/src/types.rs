//! Shared types for block tracking and log synchronization.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::serde_helpers::quantity;

// ─── Block ───────────────────────────────────────────────────────────────────

/// A canonical-chain block header, reduced to what reconciliation needs.
///
/// Identity is `hash`; canonical position is `number`. Serializes in the
/// JSON-RPC shape so `eth_getBlockBy*` results and `newHeads` payloads decode
/// directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Block number.
    #[serde(with = "quantity")]
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    #[serde(default, with = "quantity")]
    pub timestamp: u64,
}

impl Block {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &Block) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} ({})", self.number, self.hash)
    }
}

/// The window delta produced by one reconciliation step.
///
/// Both lists are oldest-first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockEvent {
    /// Blocks that became canonical.
    pub added: Vec<Block>,
    /// Blocks evicted from the canonical window by a fork.
    pub removed: Vec<Block>,
}

impl BlockEvent {
    /// Returns `true` if the event removes any block (a reorg).
    pub fn is_reorg(&self) -> bool {
        !self.removed.is_empty()
    }
}

// ─── Log ─────────────────────────────────────────────────────────────────────

/// A contract event log as returned by `eth_getLogs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(with = "quantity")]
    pub block_number: u64,
    pub block_hash: String,
    pub transaction_hash: String,
    #[serde(with = "quantity")]
    pub transaction_index: u64,
    #[serde(default, with = "quantity")]
    pub log_index: u64,
}

// ─── FilterConfig ────────────────────────────────────────────────────────────

/// Which logs a tracker follows.
///
/// `topics[i]` lists the values accepted at topic position `i`; an empty list
/// is a wildcard. Empty `addresses` matches every contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub topics: Vec<Vec<String>>,
}

impl FilterConfig {
    /// Create a filter for a single contract address.
    pub fn address(addr: impl Into<String>) -> Self {
        Self {
            addresses: vec![addr.into()],
            ..Default::default()
        }
    }

    /// Add another contract address.
    pub fn with_address(mut self, addr: impl Into<String>) -> Self {
        self.addresses.push(addr.into());
        self
    }

    /// Accept `value` at topic `position` (0 = event signature).
    pub fn topic(mut self, position: usize, value: impl Into<String>) -> Self {
        if self.topics.len() <= position {
            self.topics.resize(position + 1, Vec::new());
        }
        self.topics[position].push(value.into());
        self
    }

    /// Returns `true` if the filter restricts contract addresses.
    pub fn has_addresses(&self) -> bool {
        !self.addresses.is_empty()
    }

    /// Canonical form: lower-cased, sorted, de-duplicated, trailing wildcard
    /// positions dropped. Equal filters normalize identically.
    pub fn normalized(&self) -> FilterConfig {
        fn norm(values: &[String]) -> Vec<String> {
            let mut out: Vec<String> = values.iter().map(|v| v.to_ascii_lowercase()).collect();
            out.sort();
            out.dedup();
            out
        }

        let mut topics: Vec<Vec<String>> = self.topics.iter().map(|t| norm(t)).collect();
        while topics.last().is_some_and(|t| t.is_empty()) {
            topics.pop();
        }
        FilterConfig {
            addresses: norm(&self.addresses),
            topics,
        }
    }

    /// Stable key for this filter's store entry: hex SHA-256 of the
    /// normalized JSON encoding.
    pub fn fingerprint(&self) -> String {
        let normalized = self.normalized();
        // Serializing a struct of strings cannot fail.
        let bytes = serde_json::to_vec(&normalized).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// `eth_getLogs` matching semantics, applied locally.
    pub fn matches(&self, log: &Log) -> bool {
        let address_ok = self.addresses.is_empty()
            || self
                .addresses
                .iter()
                .any(|a| a.eq_ignore_ascii_case(&log.address));
        if !address_ok {
            return false;
        }
        self.topics.iter().enumerate().all(|(i, accepted)| {
            accepted.is_empty()
                || log
                    .topics
                    .get(i)
                    .is_some_and(|t| accepted.iter().any(|a| a.eq_ignore_ascii_case(t)))
        })
    }
}

// ─── Event ───────────────────────────────────────────────────────────────────

/// One sync delta applied to a store entry.
///
/// `truncate_to == Some(n)`: first cut the entry's log sequence to length `n`,
/// then append `added`. `None`: append only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub added: Vec<Log>,
    pub removed: Vec<Log>,
    pub truncate_to: Option<u64>,
    /// The last block this delta advances the entry to.
    pub block: Block,
}

impl Event {
    /// An append-only delta.
    pub fn append(added: Vec<Log>, block: Block) -> Self {
        Self {
            added,
            removed: Vec::new(),
            truncate_to: None,
            block,
        }
    }
}

/// Chain identity recorded by the first preflight against an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisRecord {
    pub chain_id: u64,
    pub genesis_hash: String,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
