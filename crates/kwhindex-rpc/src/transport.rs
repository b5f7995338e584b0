//! The `RpcTransport` trait implemented by the HTTP and WebSocket clients.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};

/// A request/response channel to a JSON-RPC node.
///
/// Object-safe; the gateway stores it as `Arc<dyn RpcTransport>`.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Send a single JSON-RPC request and return the response.
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// Endpoint identifier for logs.
    fn url(&self) -> &str;

    /// Call `method` and return the raw result value.
    async fn call(
        &self,
        id: u64,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, TransportError> {
        let resp = self.send(JsonRpcRequest::new(id, method, params)).await?;
        resp.into_result().map_err(TransportError::Rpc)
    }
}
