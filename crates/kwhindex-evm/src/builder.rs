//! Fluent builder API for creating indexers.
//!
//! # Example
//!
//! ```rust,no_run
//! use kwhindex_evm::IndexerBuilder;
//!
//! let config = IndexerBuilder::new()
//!     .chain_id(31337)
//!     .start_block(100)
//!     .confirmations(5)
//!     .batch_size(500)
//!     .token("0x5FbDB2315678afecb367f032d93F642f64180aa3", "[]")
//!     .build_config();
//! ```

use std::sync::Arc;

use kwhindex_core::{ContractSlot, CursorStore, EventStore, IndexerConfig};
use kwhindex_rpc::ChainGateway;

use crate::orchestrator::Orchestrator;

/// Fluent builder for `IndexerConfig`.
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self {
            config: IndexerConfig::default(),
        }
    }

    /// Set the chain id stamped on every record.
    pub fn chain_id(mut self, chain_id: u64) -> Self {
        self.config.chain_id = chain_id;
        self
    }

    /// Set the first block for contracts without a cursor.
    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = Some(block);
        self
    }

    /// Set confirmation depth (blocks behind head before processing).
    pub fn confirmations(mut self, depth: u64) -> Self {
        self.config.confirmations = depth;
        self
    }

    /// Set the number of blocks per `eth_getLogs` batch.
    pub fn batch_size(mut self, size: u64) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Blocks behind the safe tip to start from when nothing else is known.
    pub fn fallback_window(mut self, blocks: u64) -> Self {
        self.config.fallback_window = blocks;
        self
    }

    /// Set the HTTP polling interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Fail startup when the token contract is missing or invalid.
    pub fn require_primary(mut self, required: bool) -> Self {
        self.config.require_primary = required;
        self
    }

    pub fn token(mut self, address: impl Into<String>, abi: impl Into<String>) -> Self {
        self.config.token = Some(ContractSlot::new("KWHToken", address, abi));
        self
    }

    pub fn billing(mut self, address: impl Into<String>, abi: impl Into<String>) -> Self {
        self.config.billing = Some(ContractSlot::new("EnergyBilling", address, abi));
        self
    }

    pub fn marketplace(mut self, address: impl Into<String>, abi: impl Into<String>) -> Self {
        self.config.marketplace = Some(ContractSlot::new("Marketplace", address, abi));
        self
    }

    /// Build the `IndexerConfig`.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Build an orchestrator over the given gateway and stores.
    pub fn build(
        self,
        gateway: Arc<dyn ChainGateway>,
        cursors: Arc<dyn CursorStore>,
        events: Arc<dyn EventStore>,
    ) -> Orchestrator {
        Orchestrator::new(self.config, gateway, cursors, events)
    }
}
