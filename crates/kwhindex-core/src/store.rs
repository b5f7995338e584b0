//! Deduplicated event storage.
//!
//! Both record kinds are keyed by `(tx_hash, log_index)`. Inserting a record
//! whose key already exists is a successful no-op, never an error and never a
//! duplicate row, so the backfill and live paths can both deliver the same
//! log without coordination.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::types::{EventRecord, TxRecord};

/// Filter for read-side queries over transaction records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventQuery {
    /// Only records with one of these event names (empty = all events).
    pub events: Vec<String>,
    /// Only records emitted by this contract.
    pub contract: Option<String>,
    /// Only records whose sender or recipient is this address.
    pub participant: Option<String>,
}

impl EventQuery {
    /// Filter on a set of event names.
    pub fn events<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            events: names.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Restrict to a contract address.
    pub fn contract(mut self, address: impl Into<String>) -> Self {
        self.contract = Some(address.into().to_lowercase());
        self
    }

    /// Restrict to a sender/recipient address.
    pub fn participant(mut self, address: impl Into<String>) -> Self {
        self.participant = Some(address.into().to_lowercase());
        self
    }

    /// Returns `true` if `record` matches this filter.
    pub fn matches(&self, record: &TxRecord) -> bool {
        let event_ok = self.events.is_empty() || self.events.iter().any(|e| *e == record.event);
        let contract_ok = self
            .contract
            .as_deref()
            .map_or(true, |c| c.eq_ignore_ascii_case(&record.contract));
        let participant_ok = self.participant.as_deref().map_or(true, |p| {
            p.eq_ignore_ascii_case(&record.from) || p.eq_ignore_ascii_case(&record.to)
        });
        event_ok && contract_ok && participant_ok
    }
}

/// Trait for durable, deduplicated record storage.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert a transaction record unless one with the same `(tx_hash, log_index)`
    /// exists. Returns `true` if a row was written.
    async fn insert_tx_if_absent(&self, record: &TxRecord) -> Result<bool, IndexerError>;

    /// Insert an event record unless one with the same `(tx_hash, log_index)`
    /// exists. Returns `true` if a row was written.
    async fn insert_event_if_absent(&self, record: &EventRecord) -> Result<bool, IndexerError>;

    /// Most recent matching transaction records, newest block time first.
    async fn query_recent(
        &self,
        filter: &EventQuery,
        limit: usize,
    ) -> Result<Vec<TxRecord>, IndexerError>;

    /// Matching transaction records with `from <= block_time < to`, oldest first.
    async fn query_range(
        &self,
        filter: &EventQuery,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TxRecord>, IndexerError>;

    /// Event records for one UTC day bucket, ordered by block and log index.
    async fn events_by_day(&self, day_key: &str) -> Result<Vec<EventRecord>, IndexerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Args;
    use crate::types::TxStatus;

    fn record(event: &str, contract: &str, from: &str, to: &str) -> TxRecord {
        TxRecord {
            chain_id: 1,
            block_number: Some(1),
            block_hash: None,
            tx_hash: "0x1".into(),
            log_index: 0,
            contract: contract.into(),
            event: event.into(),
            args: Args::new(),
            from: from.into(),
            to: to.into(),
            status: TxStatus::Confirmed,
            block_time: Utc::now(),
        }
    }

    #[test]
    fn empty_filter_matches_all() {
        let q = EventQuery::default();
        assert!(q.matches(&record("Transfer", "0xaaa", "0x1", "0x2")));
    }

    #[test]
    fn event_and_contract_filter() {
        let q = EventQuery::events(["KWHConsumed", "TokensBurned"]).contract("0xAAA");
        assert!(q.matches(&record("KWHConsumed", "0xaaa", "", "")));
        assert!(!q.matches(&record("Transfer", "0xaaa", "", "")));
        assert!(!q.matches(&record("KWHConsumed", "0xbbb", "", "")));
    }

    #[test]
    fn participant_matches_sender_or_recipient() {
        let q = EventQuery::default().participant("0xUser");
        assert!(q.matches(&record("Transfer", "0xa", "0xuser", "0x2")));
        assert!(q.matches(&record("Transfer", "0xa", "0x1", "0xuser")));
        assert!(!q.matches(&record("Transfer", "0xa", "0x1", "0x2")));
    }
}
