//! Error types for the kwhindex pipeline.

use thiserror::Error;

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Decode error in '{event}': {reason}")]
    Decode { event: String, reason: String },

    #[error("Invalid ABI: {0}")]
    Abi(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the error originated in the storage layer.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns `true` if the error should stop the process at startup.
    /// Everything else is logged and retried by the next catch-up.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Config(_))
    }
}
