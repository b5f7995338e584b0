//! Decode-and-persist for a single raw log.
//!
//! Shared by the backfill and live tail engines so both paths produce
//! identical records and rely on the same insert-if-absent semantics.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use kwhindex_core::{normalize_args, EventRecord, EventStore, IndexerError, TxRecord, TxStatus};
use kwhindex_rpc::{ChainGateway, RawLog};

use crate::descriptor::ContractDescriptor;

pub struct RecordWriter {
    gateway: Arc<dyn ChainGateway>,
    store: Arc<dyn EventStore>,
    chain_id: u64,
}

impl RecordWriter {
    pub fn new(gateway: Arc<dyn ChainGateway>, store: Arc<dyn EventStore>, chain_id: u64) -> Self {
        Self {
            gateway,
            store,
            chain_id,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Decode `log` against `contract` and insert its records if absent.
    ///
    /// Returns `Ok(true)` when a new transaction record was written. Logs
    /// that are removed, undecodable, or lack a transaction hash are skipped
    /// with `Ok(false)`. Only storage failures are returned as errors.
    pub async fn write(&self, contract: &ContractDescriptor, log: &RawLog) -> Result<bool, IndexerError> {
        if log.is_removed() {
            debug!(contract = contract.name(), tx = ?log.tx_hash, "ignoring removed log");
            return Ok(false);
        }

        let decoded = match contract.decode(log) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => {
                warn!(
                    contract = contract.name(),
                    topic0 = log.topic0().unwrap_or("<none>"),
                    "log matches no known event, skipping"
                );
                return Ok(false);
            }
            Err(e) => {
                warn!(contract = contract.name(), error = %e, "failed to decode log, skipping");
                return Ok(false);
            }
        };

        let Some(tx_hash) = log.tx_hash.as_deref() else {
            warn!(contract = contract.name(), event = %decoded.name, "log has no transaction hash, skipping");
            return Ok(false);
        };
        let block_number = log.block_number_u64();

        let receipt = match self.gateway.get_transaction_receipt(tx_hash).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(tx = tx_hash, error = %e, "receipt lookup failed, recording without sender");
                None
            }
        };

        let block_time = match block_number {
            Some(n) => match self.gateway.get_block_time(n).await {
                Ok(Some(ts)) => ts,
                Ok(None) => {
                    warn!(block = n, "block time unavailable, using current time");
                    Utc::now()
                }
                Err(e) => {
                    warn!(block = n, error = %e, "block time lookup failed, using current time");
                    Utc::now()
                }
            },
            None => Utc::now(),
        };

        let record = TxRecord {
            chain_id: self.chain_id,
            block_number,
            block_hash: log
                .block_hash
                .clone()
                .or_else(|| receipt.as_ref().and_then(|r| r.block_hash.clone())),
            tx_hash: tx_hash.to_string(),
            log_index: log.log_index_i64(),
            contract: contract.address().to_string(),
            event: decoded.name,
            args: normalize_args(decoded.args),
            from: receipt.as_ref().map(|r| r.from_lower()).unwrap_or_default(),
            to: receipt.as_ref().map(|r| r.to_lower()).unwrap_or_default(),
            status: TxStatus::Confirmed,
            block_time,
        };

        let inserted = self.store.insert_tx_if_absent(&record).await?;
        self.store.insert_event_if_absent(&EventRecord::from_tx(&record)).await?;
        if inserted {
            debug!(
                contract = contract.name(),
                event = %record.event,
                tx = %record.tx_hash,
                log_index = record.log_index,
                "record stored"
            );
        }
        Ok(inserted)
    }
}
