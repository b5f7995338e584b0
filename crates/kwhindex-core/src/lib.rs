//! kwhindex-core: foundation for the KWH token event indexer.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator → Backfill / LiveTail
//!                    ├── RpcGateway        (kwhindex-rpc)
//!                    ├── ContractDescriptor (kwhindex-evm)
//!                    ├── normalize          (argument canonicalisation)
//!                    ├── ProgressTracker    (per-contract cursors)
//!                    └── EventStore         (deduplicated tx/event records)
//! ```

pub mod cursor;
pub mod error;
pub mod indexer;
pub mod normalize;
pub mod store;
pub mod types;

pub use cursor::{cursor_key, CursorStore, ProgressTracker, BOOTSTRAP_KEY};
pub use error::IndexerError;
pub use indexer::{ContractSlot, IndexerConfig, IndexerState};
pub use normalize::{normalize, normalize_args, ArgValue, Args};
pub use store::{EventQuery, EventStore};
pub use types::{day_key, EventRecord, TxRecord, TxStatus, NO_LOG_INDEX};
