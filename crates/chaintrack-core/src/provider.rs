//! Read-only chain access consumed by the trackers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::types::{Block, FilterConfig, Log};

/// Block selector for [`ChainProvider::block_by_number`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Number(u64),
}

impl std::fmt::Display for BlockTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Number(n) => write!(f, "0x{n:x}"),
        }
    }
}

/// Which blocks a log query covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogSelector {
    /// Inclusive block range.
    Range { from: u64, to: u64 },
    /// Exactly one block, by hash.
    BlockHash(String),
}

/// A log query: filter plus block selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub filter: FilterConfig,
    pub selector: LogSelector,
}

impl LogQuery {
    pub fn range(filter: &FilterConfig, from: u64, to: u64) -> Self {
        Self {
            filter: filter.clone(),
            selector: LogSelector::Range { from, to },
        }
    }

    pub fn block_hash(filter: &FilterConfig, hash: impl Into<String>) -> Self {
        Self {
            filter: filter.clone(),
            selector: LogSelector::BlockHash(hash.into()),
        }
    }
}

/// Read-only access to a ledger node.
///
/// Implementations are thin RPC wrappers; missing blocks are `Ok(None)`.
#[async_trait]
pub trait ChainProvider: Send + Sync + 'static {
    async fn block_number(&self) -> Result<u64, ProviderError>;

    async fn block_by_number(&self, tag: BlockTag) -> Result<Option<Block>, ProviderError>;

    async fn block_by_hash(&self, hash: &str, full_tx: bool) -> Result<Option<Block>, ProviderError>;

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>, ProviderError>;

    async fn chain_id(&self) -> Result<u64, ProviderError>;
}

#[async_trait]
impl<P: ChainProvider + ?Sized> ChainProvider for std::sync::Arc<P> {
    async fn block_number(&self) -> Result<u64, ProviderError> {
        (**self).block_number().await
    }

    async fn block_by_number(&self, tag: BlockTag) -> Result<Option<Block>, ProviderError> {
        (**self).block_by_number(tag).await
    }

    async fn block_by_hash(&self, hash: &str, full_tx: bool) -> Result<Option<Block>, ProviderError> {
        (**self).block_by_hash(hash, full_tx).await
    }

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>, ProviderError> {
        (**self).get_logs(query).await
    }

    async fn chain_id(&self) -> Result<u64, ProviderError> {
        (**self).chain_id().await
    }
}
