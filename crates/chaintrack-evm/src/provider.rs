//! [`ChainProvider`] over Ethereum JSON-RPC.
//!
//! Uses `eth_blockNumber`, `eth_getBlockByNumber`, `eth_getBlockByHash`,
//! `eth_getLogs` and `eth_chainId`. Node errors that mean "the log query is
//! too large" are mapped to [`ProviderError::TooMuchData`] so the event
//! tracker can shrink its batch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

use chaintrack_core::serde_helpers::quantity;
use chaintrack_core::{Block, BlockTag, ChainProvider, Log, LogQuery, LogSelector, ProviderError};

use crate::transport::{JsonRpcRequest, RpcError, RpcTransport, TransportError};

/// Error codes nodes use for oversized `eth_getLogs` results.
const TOO_MUCH_DATA_CODES: &[i64] = &[-32005];

/// Lower-cased message fragments nodes use for the same condition.
const TOO_MUCH_DATA_MESSAGES: &[&str] = &[
    "query returned more than",
    "response size exceeded",
    "response size should not greater than",
    "too many results",
    "block range is too large",
    "block range too large",
    "exceed maximum block range",
    "exceeds the range limit",
    "range is too large",
];

/// Returns `true` if `err` means the log query asked for too much data.
pub fn is_too_much_data(err: &RpcError) -> bool {
    if TOO_MUCH_DATA_CODES.contains(&err.code) {
        return true;
    }
    let message = err.message.to_ascii_lowercase();
    let data = err
        .data
        .as_ref()
        .and_then(|d| d.as_str())
        .map(|d| d.to_ascii_lowercase())
        .unwrap_or_default();
    TOO_MUCH_DATA_MESSAGES
        .iter()
        .any(|p| message.contains(p) || data.contains(p))
}

fn rpc_error(err: RpcError) -> ProviderError {
    if is_too_much_data(&err) {
        ProviderError::TooMuchData(err.message)
    } else {
        ProviderError::Rpc {
            code: err.code,
            message: err.message,
        }
    }
}

fn transport_error(err: TransportError) -> ProviderError {
    match err {
        TransportError::Deserialization(e) => ProviderError::Decode(e.to_string()),
        other => ProviderError::Transport(other.to_string()),
    }
}

/// Encode a log query as an `eth_getLogs` filter object.
pub fn log_filter_params(query: &LogQuery) -> Value {
    let mut filter = Map::new();
    match query.filter.addresses.as_slice() {
        [] => {}
        [single] => {
            filter.insert("address".into(), json!(single));
        }
        many => {
            filter.insert("address".into(), json!(many));
        }
    }
    if !query.filter.topics.is_empty() {
        let topics: Vec<Value> = query
            .filter
            .topics
            .iter()
            .map(|accepted| match accepted.as_slice() {
                [] => Value::Null,
                [single] => json!(single),
                many => json!(many),
            })
            .collect();
        filter.insert("topics".into(), Value::Array(topics));
    }
    match &query.selector {
        LogSelector::Range { from, to } => {
            filter.insert("fromBlock".into(), json!(BlockTag::Number(*from).to_string()));
            filter.insert("toBlock".into(), json!(BlockTag::Number(*to).to_string()));
        }
        LogSelector::BlockHash(hash) => {
            filter.insert("blockHash".into(), json!(hash));
        }
    }
    Value::Object(filter)
}

/// JSON-RPC implementation of [`ChainProvider`].
pub struct JsonRpcProvider<T> {
    transport: Arc<T>,
    next_id: AtomicU64,
}

impl<T: RpcTransport> JsonRpcProvider<T> {
    pub fn new(transport: T) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    pub fn from_arc(transport: Arc<T>) -> Self {
        Self {
            transport,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<R, ProviderError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(method, id, url = self.transport.url(), "rpc call");
        let resp = self
            .transport
            .send(JsonRpcRequest::new(id, method, params))
            .await
            .map_err(transport_error)?;
        let result = resp.into_result().map_err(rpc_error)?;
        serde_json::from_value(result).map_err(|e| ProviderError::Decode(format!("{method}: {e}")))
    }

    async fn call_quantity(&self, method: &str) -> Result<u64, ProviderError> {
        let raw: String = self.call(method, vec![]).await?;
        quantity::parse(&raw).map_err(|e| ProviderError::Decode(format!("{method}: {e}")))
    }
}

#[async_trait]
impl<T: RpcTransport> ChainProvider for JsonRpcProvider<T> {
    async fn block_number(&self) -> Result<u64, ProviderError> {
        self.call_quantity("eth_blockNumber").await
    }

    async fn block_by_number(&self, tag: BlockTag) -> Result<Option<Block>, ProviderError> {
        self.call("eth_getBlockByNumber", vec![json!(tag.to_string()), json!(false)])
            .await
    }

    async fn block_by_hash(&self, hash: &str, full_tx: bool) -> Result<Option<Block>, ProviderError> {
        self.call("eth_getBlockByHash", vec![json!(hash), json!(full_tx)])
            .await
    }

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>, ProviderError> {
        self.call("eth_getLogs", vec![log_filter_params(query)]).await
    }

    async fn chain_id(&self) -> Result<u64, ProviderError> {
        self.call_quantity("eth_chainId").await
    }
}
