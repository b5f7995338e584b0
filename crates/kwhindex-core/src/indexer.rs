//! Indexer configuration and state types.

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Default chain id (local development node).
pub const DEFAULT_CHAIN_ID: u64 = 31337;

/// Default number of blocks per `eth_getLogs` range.
pub const DEFAULT_BATCH_SIZE: u64 = 2000;

/// Window scanned behind the tip when no cursor and no start block exist.
pub const DEFAULT_FALLBACK_WINDOW: u64 = 2000;

/// One contract the indexer should follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSlot {
    /// Logical name (`KWHToken`, `EnergyBilling`, `Marketplace`).
    pub name: String,
    /// Deployed address (`0x` + 40 hex digits).
    pub address: String,
    /// ABI JSON, either a bare array or an artifact with an `abi` field.
    pub abi: String,
}

impl ContractSlot {
    pub fn new(name: impl Into<String>, address: impl Into<String>, abi: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            abi: abi.into(),
        }
    }

    /// Returns the error for a malformed address; `Ok` otherwise.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if is_address(&self.address) {
            Ok(())
        } else {
            Err(IndexerError::Config(format!(
                "{} address is not a 20-byte hex address: {:?}",
                self.name, self.address
            )))
        }
    }
}

/// Returns `true` for `0x` followed by exactly 40 hex digits.
pub fn is_address(s: &str) -> bool {
    s.len() == 42
        && (s.starts_with("0x") || s.starts_with("0X"))
        && s[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

/// Configuration for an indexer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Chain id stamped on every record.
    pub chain_id: u64,
    /// First block to index when a contract has no cursor yet.
    pub start_block: Option<u64>,
    /// Blocks held back from the tip during backfill.
    pub confirmations: u64,
    /// Inclusive block span per `eth_getLogs` call.
    pub batch_size: u64,
    /// Blocks behind the tip to start from with neither cursor nor start block.
    pub fallback_window: u64,
    /// Polling interval for new-block and log polling over HTTP (milliseconds).
    pub poll_interval_ms: u64,
    /// Fail startup if the primary token contract is not configured.
    pub require_primary: bool,
    /// Primary token contract. Missing means a warning unless `require_primary`.
    pub token: Option<ContractSlot>,
    /// Billing contract, optional.
    pub billing: Option<ContractSlot>,
    /// Marketplace contract, optional.
    pub marketplace: Option<ContractSlot>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chain_id: DEFAULT_CHAIN_ID,
            start_block: None,
            confirmations: 0,
            batch_size: DEFAULT_BATCH_SIZE,
            fallback_window: DEFAULT_FALLBACK_WINDOW,
            poll_interval_ms: 5000,
            require_primary: false,
            token: None,
            billing: None,
            marketplace: None,
        }
    }
}

impl IndexerConfig {
    /// Configured contracts in fixed order: token, billing, marketplace.
    pub fn contracts(&self) -> impl Iterator<Item = &ContractSlot> {
        [&self.token, &self.billing, &self.marketplace]
            .into_iter()
            .filter_map(Option::as_ref)
    }

    /// Check numeric settings. Contract addresses are checked per slot when
    /// the orchestrator binds them.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.batch_size == 0 {
            return Err(IndexerError::Config("batch_size must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(IndexerError::Config("poll_interval_ms must be at least 1".into()));
        }
        Ok(())
    }
}

/// Runtime state of the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Running the initial catch-up.
    Backfilling,
    /// Following the chain tip.
    Live,
    /// Shutting down gracefully.
    Stopping,
    /// Terminated.
    Stopped,
    /// Encountered an unrecoverable error.
    Error,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Backfilling => write!(f, "backfilling"),
            Self::Live => write!(f, "live"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}
