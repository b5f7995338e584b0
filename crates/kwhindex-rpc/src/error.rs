//! Transport-level error types.

use kwhindex_core::IndexerError;
use thiserror::Error;

use crate::jsonrpc::JsonRpcError;

/// Errors that can occur while talking to the node.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, non-2xx, body error).
    #[error("HTTP error: {0}")]
    Http(String),

    /// WebSocket connection, send or receive failure.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The node answered with a JSON-RPC error object.
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(JsonRpcError),

    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Returns `true` for transient failures worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::WebSocket(_) | Self::Timeout { .. } => true,
            // -32005: limit exceeded / rate limited on most providers
            Self::Rpc(e) => e.code == -32005 || e.code == 429,
            _ => false,
        }
    }
}

impl From<TransportError> for IndexerError {
    fn from(e: TransportError) -> Self {
        IndexerError::Rpc(e.to_string())
    }
}
