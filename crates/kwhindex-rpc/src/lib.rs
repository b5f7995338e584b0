//! kwhindex-rpc: upstream node access for the indexer.
//!
//! - [`jsonrpc`]: JSON-RPC 2.0 wire types
//! - [`transport`]: the [`RpcTransport`] trait with HTTP ([`HttpRpcClient`])
//!   and WebSocket ([`WsRpcClient`]) implementations
//! - [`retry`]: backoff policies for transport errors and null lookups
//! - [`gateway`]: the [`ChainGateway`] seam the engines talk to, and
//!   [`RpcGateway`], its push-or-poll implementation

pub mod error;
pub mod gateway;
pub mod http;
pub mod jsonrpc;
pub mod retry;
pub mod subscriptions;
pub mod transport;
pub mod types;
pub mod ws;

pub use error::TransportError;
pub use gateway::{ChainGateway, GatewayConfig, RpcGateway, DEFAULT_HTTP_URL};
pub use http::{HttpClientConfig, HttpRpcClient};
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId};
pub use retry::{Backoff, RetryConfig, RetryPolicy};
pub use subscriptions::{SubscriptionId, SubscriptionManager};
pub use transport::RpcTransport;
pub use types::{parse_hex_u64, BlockHeader, LogFilter, RawLog, Receipt};
pub use ws::{WsClientConfig, WsRpcClient};
