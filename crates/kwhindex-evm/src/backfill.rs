//! Backfill engine: catch one contract up to the confirmation-safe tip.
//!
//! # Algorithm
//! 1. `safe_tip = latest - confirmations` (saturating).
//! 2. Start at the stored cursor, else the configured start block, else
//!    `safe_tip - fallback_window` (saturating).
//! 3. If start is past the safe tip the contract is caught up.
//! 4. Walk end-inclusive batches `[from, to]`. For each event name fetch the
//!    matching logs and write each one. After the batch, persist `to + 1`.
//!
//! A failure for one event name is logged and does not stop the others in
//! the same batch, but the run then ends without advancing the cursor. The
//! next call re-syncs that batch, which is safe because every write is
//! insert-if-absent.

use std::sync::Arc;

use tracing::{info, warn};

use kwhindex_core::{IndexerConfig, IndexerError, ProgressTracker};
use kwhindex_rpc::{ChainGateway, LogFilter};

use crate::descriptor::ContractDescriptor;
use crate::writer::RecordWriter;

/// Range and window settings, taken from [`IndexerConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillSettings {
    pub start_block: Option<u64>,
    pub confirmations: u64,
    pub batch_size: u64,
    pub fallback_window: u64,
}

impl From<&IndexerConfig> for BackfillSettings {
    fn from(config: &IndexerConfig) -> Self {
        Self {
            start_block: config.start_block,
            confirmations: config.confirmations,
            batch_size: config.batch_size.max(1),
            fallback_window: config.fallback_window,
        }
    }
}

/// Outcome of one backfill call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub contract: String,
    /// Inclusive block ranges processed, in order.
    pub ranges: Vec<(u64, u64)>,
    /// Logs returned by the node across all ranges and event names.
    pub logs: usize,
    /// New transaction records written.
    pub inserted: usize,
    /// Event-name syncs that failed. The run stops at the first batch with
    /// a failure, leaving the cursor at that batch's start.
    pub failures: usize,
}

impl BackfillReport {
    /// `true` when the contract was already caught up.
    pub fn is_noop(&self) -> bool {
        self.ranges.is_empty() && self.failures == 0
    }
}

pub struct Backfill {
    gateway: Arc<dyn ChainGateway>,
    writer: Arc<RecordWriter>,
    progress: ProgressTracker,
    settings: BackfillSettings,
}

impl Backfill {
    pub fn new(
        gateway: Arc<dyn ChainGateway>,
        writer: Arc<RecordWriter>,
        progress: ProgressTracker,
        settings: BackfillSettings,
    ) -> Self {
        Self {
            gateway,
            writer,
            progress,
            settings,
        }
    }

    pub fn settings(&self) -> &BackfillSettings {
        &self.settings
    }

    /// Bring `contract` up to the safe tip.
    ///
    /// Errors only when the tip cannot be read or storage fails. In every
    /// case the cursor stays at the last batch whose event names all synced.
    pub async fn run(&self, contract: &ContractDescriptor) -> Result<BackfillReport, IndexerError> {
        let mut report = BackfillReport {
            contract: contract.name().to_string(),
            ..Default::default()
        };

        let latest = self.gateway.latest_block_number().await?;
        let safe_tip = latest.saturating_sub(self.settings.confirmations);
        let start = match self.progress.load(contract.address()).await? {
            Some(cursor) => cursor,
            None => self
                .settings
                .start_block
                .unwrap_or_else(|| safe_tip.saturating_sub(self.settings.fallback_window)),
        };
        if start > safe_tip {
            return Ok(report);
        }

        info!(
            contract = contract.name(),
            address = contract.address(),
            from = start,
            to = safe_tip,
            "backfill starting"
        );

        let names = contract.event_names();
        let mut from = start;
        while from <= safe_tip {
            let to = from
                .saturating_add(self.settings.batch_size.max(1) - 1)
                .min(safe_tip);

            let failed_before = report.failures;
            for name in &names {
                match self.sync_event(contract, name, from, to).await {
                    Ok((logs, inserted)) => {
                        report.logs += logs;
                        report.inserted += inserted;
                    }
                    Err(e) if e.is_storage() => return Err(e),
                    Err(e) => {
                        report.failures += 1;
                        warn!(
                            contract = contract.name(),
                            event = %name,
                            from,
                            to,
                            error = %e,
                            "event sync failed, continuing with next event"
                        );
                    }
                }
            }

            if report.failures > failed_before {
                warn!(
                    contract = contract.name(),
                    from,
                    to,
                    failures = report.failures - failed_before,
                    "batch incomplete, cursor held for retry"
                );
                break;
            }

            self.progress.advance(contract.address(), to + 1).await?;
            report.ranges.push((from, to));
            info!(contract = contract.name(), from, to, "batch synced");

            from = to + 1;
        }

        Ok(report)
    }

    async fn sync_event(
        &self,
        contract: &ContractDescriptor,
        name: &str,
        from: u64,
        to: u64,
    ) -> Result<(usize, usize), IndexerError> {
        let filter = contract
            .topics_for(name)
            .into_iter()
            .fold(LogFilter::new(from, to).address(contract.address()), |f, t| f.topic(t));
        let logs = self.gateway.get_logs(&filter).await?;

        let mut inserted = 0;
        for log in &logs {
            if self.writer.write(contract, log).await? {
                inserted += 1;
            }
        }
        Ok((logs.len(), inserted))
    }
}
