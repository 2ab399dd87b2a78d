//! Error types for block tracking and log synchronization.

use thiserror::Error;

/// Errors returned by a [`ChainProvider`](crate::provider::ChainProvider).
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The node refused a log query because the result would be too large.
    /// Callers shrink the queried range and retry.
    #[error("too much data requested: {0}")]
    TooMuchData(String),

    /// JSON-RPC error returned by the node.
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Connection-level failure (timeout, refused, dropped socket).
    #[error("transport error: {0}")]
    Transport(String),

    /// The response could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Returns `true` for the distinguished "too much data" condition.
    pub fn is_too_much_data(&self) -> bool {
        matches!(self, Self::TooMuchData(_))
    }

    /// Returns `true` if the same call may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Rpc { .. })
    }
}

/// Errors that stop a block tracker or event tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("store belongs to a different chain: recorded chain id {recorded}, provider reports {actual}")]
    ChainMismatch { recorded: u64, actual: u64 },

    #[error("store belongs to a different chain: recorded genesis {recorded}, provider reports {actual}")]
    GenesisMismatch { recorded: String, actual: String },

    #[error("store is ahead of the chain: stored block {stored}, head {head}")]
    StoreAheadOfHead { stored: u64, head: u64 },

    #[error("reorg exceeds configured backlog of {backlog} blocks (detected at block {at})")]
    ReorgTooDeep { at: u64, backlog: u64 },

    #[error("bad block sequence: expected block {expected}, got {got}")]
    NonContiguous { expected: u64, got: u64 },

    #[error("block {0} not found")]
    BlockNotFound(String),

    #[error("subscriber fell too far behind the stream")]
    FellBehind,

    #[error("canceled")]
    Canceled,

    #[error("{0}")]
    Other(String),
}

impl TrackerError {
    /// Returns `true` for conditions that must abort a sync and reach the
    /// caller instead of being retried or resynchronized from scratch.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ChainMismatch { .. }
                | Self::GenesisMismatch { .. }
                | Self::StoreAheadOfHead { .. }
                | Self::ReorgTooDeep { .. }
                | Self::NonContiguous { .. }
        )
    }

    /// Returns `true` for failures a later head can clear: provider faults
    /// and blocks the node does not serve yet.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Provider(_) | Self::BlockNotFound(_))
    }

    /// Returns `true` if the error is a cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}
