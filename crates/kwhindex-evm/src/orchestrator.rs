//! Indexer orchestrator: binds configured contracts, runs the initial
//! backfill for all of them concurrently, then hands over to the live tail.
//!
//! # Lifecycle
//! `Idle → Backfilling → Live → Stopping → Stopped`, or `Error` when storage
//! fails during the initial backfill or listener setup fails. Any other
//! backfill failure is logged and left to the first catch-up.

use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use kwhindex_core::{
    ContractSlot, CursorStore, EventStore, IndexerConfig, IndexerError, IndexerState,
    ProgressTracker,
};
use kwhindex_rpc::ChainGateway;

use crate::backfill::{Backfill, BackfillSettings};
use crate::descriptor::ContractDescriptor;
use crate::live::LiveTail;
use crate::writer::RecordWriter;

pub struct Orchestrator {
    config: IndexerConfig,
    gateway: Arc<dyn ChainGateway>,
    cursors: Arc<dyn CursorStore>,
    events: Arc<dyn EventStore>,
    state: Arc<Mutex<IndexerState>>,
}

impl Orchestrator {
    pub fn new(
        config: IndexerConfig,
        gateway: Arc<dyn ChainGateway>,
        cursors: Arc<dyn CursorStore>,
        events: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            config,
            gateway,
            cursors,
            events,
            state: Arc::new(Mutex::new(IndexerState::Idle)),
        }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn state(&self) -> IndexerState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: IndexerState) {
        *self.state.lock().unwrap() = state;
    }

    /// Resolve every configured slot into a descriptor.
    ///
    /// Slots with a malformed address or ABI are excluded with a warning.
    /// A missing or unusable primary token contract is a warning too, unless
    /// `require_primary` is set.
    pub fn bind(&self) -> Result<Vec<Arc<ContractDescriptor>>, IndexerError> {
        let slots: [(&str, &Option<ContractSlot>, bool); 3] = [
            ("token", &self.config.token, true),
            ("billing", &self.config.billing, false),
            ("marketplace", &self.config.marketplace, false),
        ];

        let mut bound = Vec::new();
        for (role, slot, primary) in slots {
            let Some(slot) = slot else {
                if primary && self.config.require_primary {
                    return Err(IndexerError::Config(
                        "primary token contract address is not configured".into(),
                    ));
                }
                if primary {
                    warn!(role, "primary token contract not configured, skipping");
                } else {
                    info!(role, "contract not configured, skipping");
                }
                continue;
            };

            match slot.validate().and_then(|_| ContractDescriptor::from_slot(slot)) {
                Ok(descriptor) => {
                    info!(
                        role,
                        contract = descriptor.name(),
                        address = descriptor.address(),
                        events = descriptor.event_names().len(),
                        "contract bound"
                    );
                    bound.push(Arc::new(descriptor));
                }
                Err(e) if primary && self.config.require_primary => return Err(e),
                Err(e) => warn!(role, contract = %slot.name, error = %e, "contract excluded"),
            }
        }
        Ok(bound)
    }

    /// Bind contracts, backfill all of them concurrently, then attach the
    /// live listeners.
    ///
    /// Fails on configuration and storage errors only; a contract whose
    /// backfill hits an RPC error still goes live.
    pub async fn start(&self) -> Result<IndexerHandle, IndexerError> {
        self.config.validate()?;
        let contracts = self.bind()?;
        if contracts.is_empty() {
            warn!("no contracts bound, only the block trigger will run");
        }

        let writer = Arc::new(RecordWriter::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.events),
            self.config.chain_id,
        ));
        let backfill = Arc::new(Backfill::new(
            Arc::clone(&self.gateway),
            Arc::clone(&writer),
            ProgressTracker::new(Arc::clone(&self.cursors)),
            BackfillSettings::from(&self.config),
        ));

        self.set_state(IndexerState::Backfilling);
        let results = join_all(contracts.iter().map(|c| backfill.run(c))).await;
        for (contract, result) in contracts.iter().zip(results) {
            match result {
                Ok(report) => info!(
                    contract = contract.name(),
                    batches = report.ranges.len(),
                    logs = report.logs,
                    inserted = report.inserted,
                    failures = report.failures,
                    "initial backfill complete"
                ),
                Err(e) if e.is_fatal() => {
                    error!(contract = contract.name(), error = %e, "initial backfill failed");
                    self.set_state(IndexerState::Error);
                    return Err(e);
                }
                Err(e) => warn!(
                    contract = contract.name(),
                    error = %e,
                    "initial backfill incomplete, next block will retry"
                ),
            }
        }

        let live = Arc::new(LiveTail::new(
            Arc::clone(&self.gateway),
            backfill,
            writer,
            contracts.clone(),
        ));
        let tasks = match live.attach().await {
            Ok(tasks) => tasks,
            Err(e) => {
                self.set_state(IndexerState::Error);
                return Err(e);
            }
        };

        self.set_state(IndexerState::Live);
        info!(contracts = contracts.len(), "indexer live");

        Ok(IndexerHandle {
            state: Arc::clone(&self.state),
            tasks,
            contracts,
            live,
        })
    }
}

/// Running indexer: listener tasks plus shared state.
pub struct IndexerHandle {
    state: Arc<Mutex<IndexerState>>,
    tasks: Vec<JoinHandle<()>>,
    contracts: Vec<Arc<ContractDescriptor>>,
    live: Arc<LiveTail>,
}

impl IndexerHandle {
    pub fn state(&self) -> IndexerState {
        *self.state.lock().unwrap()
    }

    pub fn contracts(&self) -> &[Arc<ContractDescriptor>] {
        &self.contracts
    }

    pub fn live(&self) -> &Arc<LiveTail> {
        &self.live
    }

    /// Stop every listener task and wait for them to finish.
    pub async fn shutdown(self) -> IndexerState {
        *self.state.lock().unwrap() = IndexerState::Stopping;
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        *self.state.lock().unwrap() = IndexerState::Stopped;
        info!("indexer stopped");
        IndexerState::Stopped
    }
}
