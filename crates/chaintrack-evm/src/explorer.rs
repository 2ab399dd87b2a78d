//! Block-explorer fast-track.
//!
//! Asks an Etherscan-compatible API for each address's oldest transaction
//! and hands the lowest height to the event tracker, so an empty entry does
//! not scan from genesis.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use chaintrack_core::serde_helpers::quantity;
use chaintrack_core::{FastTrack, ProviderError};

pub const ETHERSCAN_API: &str = "https://api.etherscan.io/api";

/// [`FastTrack`] backed by an Etherscan-compatible `txlist` endpoint.
pub struct ExplorerFastTrack {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl ExplorerFastTrack {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key: None,
        })
    }

    /// Mainnet Etherscan.
    pub fn etherscan(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Ok(Self::new(ETHERSCAN_API)?.with_api_key(api_key))
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn request(&self, address: &str) -> reqwest::RequestBuilder {
        let mut query = vec![
            ("module", "account"),
            ("action", "txlist"),
            ("address", address),
            ("startblock", "0"),
            ("sort", "asc"),
            ("page", "1"),
            ("offset", "1"),
        ];
        if let Some(key) = &self.api_key {
            query.push(("apikey", key.as_str()));
        }
        self.http.get(&self.base_url).query(&query)
    }

    /// Height of the oldest transaction involving `address`.
    pub async fn first_transaction_block(&self, address: &str) -> Result<Option<u64>, ProviderError> {
        let body: Value = self
            .request(address)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| ProviderError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        parse_txlist(&body)
    }
}

#[async_trait]
impl FastTrack for ExplorerFastTrack {
    async fn first_block(&self, addresses: &[String]) -> Result<Option<u64>, ProviderError> {
        let mut first: Option<u64> = None;
        for address in addresses {
            let found = self.first_transaction_block(address).await?;
            tracing::debug!(address = %address, block = ?found, "explorer first transaction");
            first = match (first, found) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        Ok(first)
    }
}

/// Extract the first transaction's block height from a `txlist` response.
pub fn parse_txlist(body: &Value) -> Result<Option<u64>, ProviderError> {
    let message = body["message"].as_str().unwrap_or_default();
    match &body["result"] {
        Value::Array(txs) => {
            let Some(tx) = txs.first() else {
                return Ok(None);
            };
            let raw = match &tx["blockNumber"] {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                other => {
                    return Err(ProviderError::Decode(format!(
                        "explorer transaction without block number: {other}"
                    )))
                }
            };
            quantity::parse(&raw).map(Some).map_err(ProviderError::Decode)
        }
        Value::String(detail) if message.starts_with("No transactions found") => {
            tracing::trace!(detail = %detail, "explorer reports no transactions");
            Ok(None)
        }
        Value::String(detail) => Err(ProviderError::Rpc {
            code: 0,
            message: format!("explorer error: {message}: {detail}"),
        }),
        other => Err(ProviderError::Decode(format!("unexpected explorer result: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_first_transaction() {
        let body = json!({
            "status": "1",
            "message": "OK",
            "result": [{"blockNumber": "6082465", "hash": "0xabc", "timeStamp": "1532114168"}]
        });
        assert_eq!(parse_txlist(&body).unwrap(), Some(6_082_465));
    }

    #[test]
    fn empty_history_is_none() {
        let body = json!({"status": "0", "message": "No transactions found", "result": []});
        assert_eq!(parse_txlist(&body).unwrap(), None);
    }

    #[test]
    fn api_error_is_reported() {
        let body = json!({"status": "0", "message": "NOTOK", "result": "Invalid API Key"});
        let err = parse_txlist(&body).unwrap_err();
        assert!(err.to_string().contains("Invalid API Key"));
    }

    #[test]
    fn request_carries_txlist_query() {
        let explorer = ExplorerFastTrack::new("https://explorer.test/api")
            .unwrap()
            .with_api_key("KEY");
        let req = explorer.request("0xc0ffee").build().unwrap();
        let query = req.url().query().unwrap();
        assert!(query.contains("module=account"));
        assert!(query.contains("action=txlist"));
        assert!(query.contains("address=0xc0ffee"));
        assert!(query.contains("sort=asc"));
        assert!(query.contains("offset=1"));
        assert!(query.contains("apikey=KEY"));
    }

    #[tokio::test]
    async fn no_addresses_means_no_hint() {
        let explorer = ExplorerFastTrack::new("https://explorer.test/api").unwrap();
        assert_eq!(explorer.first_block(&[]).await.unwrap(), None);
    }
}
