//! Per-contract progress cursors.
//!
//! A cursor stores the next block the backfill engine must process for one
//! contract. It advances only after a batch's writes are durable, so a crash
//! mid-batch re-processes that batch on restart instead of skipping blocks.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::IndexerError;

/// Namespace prefix for per-contract event cursors.
pub const CURSOR_NAMESPACE: &str = "events";

/// Reserved key seeded once at storage initialization.
pub const BOOTSTRAP_KEY: &str = "bootstrap";

/// Deterministic cursor key for a contract address.
///
/// The address is lowercased so checksummed and plain spellings share a key.
pub fn cursor_key(address: &str) -> String {
    format!("{CURSOR_NAMESPACE}:{}", address.trim().to_lowercase())
}

/// Value seeded under [`BOOTSTRAP_KEY`]: `max(0, start_block - 1)`.
pub fn bootstrap_block(start_block: Option<u64>) -> u64 {
    start_block.unwrap_or(0).saturating_sub(1)
}

/// Trait for durable cursor storage.
///
/// Implementations include `InMemoryStorage`, `SqliteStorage`, and
/// `PostgresStorage` in `kwhindex-storage`.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Point lookup.
    async fn get_cursor(&self, key: &str) -> Result<Option<u64>, IndexerError>;

    /// Idempotent upsert, last write wins.
    async fn set_cursor(&self, key: &str, block_number: u64) -> Result<(), IndexerError>;

    /// Insert only if the key is absent. Returns `true` if a row was written.
    async fn seed_cursor(&self, key: &str, block_number: u64) -> Result<bool, IndexerError>;
}

/// Reads and advances per-contract cursors.
#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn CursorStore>,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn CursorStore>) -> Self {
        Self { store }
    }

    /// Load the next block to process for `address`, if any progress exists.
    pub async fn load(&self, address: &str) -> Result<Option<u64>, IndexerError> {
        self.store.get_cursor(&cursor_key(address)).await
    }

    /// Persist `next_block` as the next block to process for `address`.
    pub async fn advance(&self, address: &str, next_block: u64) -> Result<(), IndexerError> {
        let key = cursor_key(address);
        self.store.set_cursor(&key, next_block).await?;
        tracing::debug!(key = %key, next_block, "cursor advanced");
        Ok(())
    }

    /// Seed the global bootstrap cursor (no-op if it already exists).
    pub async fn seed_bootstrap(&self, start_block: Option<u64>) -> Result<(), IndexerError> {
        let value = bootstrap_block(start_block);
        if self.store.seed_cursor(BOOTSTRAP_KEY, value).await? {
            tracing::info!(block = value, "bootstrap cursor seeded");
        }
        Ok(())
    }
}
