//! chaintrack-evm: Ethereum JSON-RPC provider, explorer fast-track and
//! builder API.

pub mod builder;
pub mod explorer;
pub mod provider;
pub mod transport;

pub use builder::TrackerBuilder;
pub use explorer::ExplorerFastTrack;
pub use provider::{is_too_much_data, JsonRpcProvider};
pub use transport::{JsonRpcRequest, JsonRpcResponse, RpcError, RpcTransport, TransportError};
