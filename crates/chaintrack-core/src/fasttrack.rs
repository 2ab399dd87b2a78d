//! Fast-track: skip scanning from genesis when an external index knows where
//! a filter's contracts first appear.

use async_trait::async_trait;

use crate::error::ProviderError;

/// Discovers the earliest block height relevant to a set of addresses.
#[async_trait]
pub trait FastTrack: Send + Sync {
    /// Lowest block touching any of `addresses`, or `None` if the service
    /// knows of no activity.
    async fn first_block(&self, addresses: &[String]) -> Result<Option<u64>, ProviderError>;
}

/// Fixed answer, for tests and for deployments that know their contracts'
/// creation block.
pub struct StaticFastTrack(pub Option<u64>);

#[async_trait]
impl FastTrack for StaticFastTrack {
    async fn first_block(&self, _addresses: &[String]) -> Result<Option<u64>, ProviderError> {
        Ok(self.0)
    }
}
