//! kwhindex-evm: contract descriptors, backfill and live tail engines.

pub mod backfill;
pub mod builder;
pub mod descriptor;
pub mod live;
pub mod orchestrator;
pub mod writer;

pub use backfill::{Backfill, BackfillReport, BackfillSettings};
pub use builder::IndexerBuilder;
pub use descriptor::{ContractDescriptor, DecodedLog, EventSpec};
pub use live::LiveTail;
pub use orchestrator::{IndexerHandle, Orchestrator};
pub use writer::RecordWriter;
