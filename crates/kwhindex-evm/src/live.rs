//! Live tail engine.
//!
//! Two independent paths keep the store current after the initial backfill:
//!
//! - one log subscription per (contract, event fragment) that decodes and
//!   writes each notification as it arrives;
//! - one new-block subscription that triggers a catch-up backfill of every
//!   contract, covering anything the log subscriptions missed (reconnects,
//!   dropped notifications).
//!
//! Catch-ups are single-flight: a trigger that arrives while one is running
//! is dropped, not queued. Both paths write through insert-if-absent, so a log
//! seen by both is stored once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use kwhindex_core::IndexerError;
use kwhindex_rpc::ChainGateway;

use crate::backfill::Backfill;
use crate::descriptor::ContractDescriptor;
use crate::writer::RecordWriter;

/// Holds the single-flight flag for the lifetime of one catch-up.
///
/// Dropping the guard clears the flag, including when the task panics or is
/// aborted.
struct SyncGuard(Arc<AtomicBool>);

impl SyncGuard {
    fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct LiveTail {
    gateway: Arc<dyn ChainGateway>,
    backfill: Arc<Backfill>,
    writer: Arc<RecordWriter>,
    contracts: Vec<Arc<ContractDescriptor>>,
    syncing: Arc<AtomicBool>,
}

impl LiveTail {
    pub fn new(
        gateway: Arc<dyn ChainGateway>,
        backfill: Arc<Backfill>,
        writer: Arc<RecordWriter>,
        contracts: Vec<Arc<ContractDescriptor>>,
    ) -> Self {
        Self {
            gateway,
            backfill,
            writer,
            contracts,
            syncing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// `true` while a catch-up pass is running.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Subscribe to every event of every contract plus new blocks, and spawn
    /// one task per subscription.
    pub async fn attach(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, IndexerError> {
        let mut tasks = Vec::new();

        for contract in &self.contracts {
            for event in contract.events() {
                let topic0 = event.topic0();
                let mut rx = self.gateway.subscribe_logs(contract.address(), &topic0).await?;
                let writer = Arc::clone(&self.writer);
                let contract = Arc::clone(contract);
                let event_name = event.name.clone();
                tasks.push(tokio::spawn(async move {
                    while let Some(log) = rx.recv().await {
                        if let Err(e) = writer.write(&contract, &log).await {
                            error!(
                                contract = contract.name(),
                                event = %event_name,
                                error = %e,
                                "failed to store live event"
                            );
                        }
                    }
                    debug!(contract = contract.name(), event = %event_name, "log subscription ended");
                }));
            }
            info!(
                contract = contract.name(),
                address = contract.address(),
                events = contract.events().len(),
                "live listeners attached"
            );
        }

        let mut heads = self.gateway.subscribe_new_blocks().await?;
        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Some(head) = heads.recv().await {
                this.trigger_catch_up(head);
            }
            warn!("new block stream ended, tail catch-up stopped");
        }));

        Ok(tasks)
    }

    /// Start a catch-up pass unless one is already running.
    ///
    /// Returns the spawned task, or `None` when the trigger was dropped.
    pub fn trigger_catch_up(self: &Arc<Self>, head: u64) -> Option<JoinHandle<()>> {
        let Some(guard) = SyncGuard::try_acquire(&self.syncing) else {
            debug!(block = head, "catch-up already running, trigger dropped");
            return None;
        };
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            let _guard = guard;
            this.catch_up(head).await;
        }))
    }

    async fn catch_up(&self, head: u64) {
        for contract in &self.contracts {
            match self.backfill.run(contract).await {
                Ok(report) if report.is_noop() => {}
                Ok(report) => info!(
                    block = head,
                    contract = contract.name(),
                    batches = report.ranges.len(),
                    inserted = report.inserted,
                    failures = report.failures,
                    "tail catch-up synced"
                ),
                Err(e) => warn!(
                    block = head,
                    contract = contract.name(),
                    error = %e,
                    "tail catch-up failed"
                ),
            }
        }
    }
}
