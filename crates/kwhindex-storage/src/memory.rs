//! In-memory storage backend.
//!
//! Same uniqueness rules as the SQL backends; all data is lost when the
//! value is dropped. Used by the engine tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use kwhindex_core::{CursorStore, EventQuery, EventRecord, EventStore, IndexerError, TxRecord};

type RecordKey = (String, i64);

#[derive(Default)]
pub struct InMemoryStorage {
    cursors: Mutex<HashMap<String, u64>>,
    txs: Mutex<HashMap<RecordKey, TxRecord>>,
    events: Mutex<HashMap<RecordKey, EventRecord>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tx_count(&self) -> usize {
        self.txs.lock().unwrap().len()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    /// All transaction records ordered by block and log index.
    pub fn txs(&self) -> Vec<TxRecord> {
        let mut all: Vec<_> = self.txs.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| (a.block_number, a.log_index).cmp(&(b.block_number, b.log_index)));
        all
    }

    /// Snapshot of every cursor.
    pub fn cursors(&self) -> HashMap<String, u64> {
        self.cursors.lock().unwrap().clone()
    }

    fn select(&self, filter: &EventQuery) -> Vec<TxRecord> {
        self.txs
            .lock()
            .unwrap()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CursorStore for InMemoryStorage {
    async fn get_cursor(&self, key: &str) -> Result<Option<u64>, IndexerError> {
        Ok(self.cursors.lock().unwrap().get(key).copied())
    }

    async fn set_cursor(&self, key: &str, block_number: u64) -> Result<(), IndexerError> {
        self.cursors.lock().unwrap().insert(key.to_string(), block_number);
        Ok(())
    }

    async fn seed_cursor(&self, key: &str, block_number: u64) -> Result<bool, IndexerError> {
        let mut cursors = self.cursors.lock().unwrap();
        if cursors.contains_key(key) {
            return Ok(false);
        }
        cursors.insert(key.to_string(), block_number);
        Ok(true)
    }
}

#[async_trait]
impl EventStore for InMemoryStorage {
    async fn insert_tx_if_absent(&self, record: &TxRecord) -> Result<bool, IndexerError> {
        let key = (record.tx_hash.clone(), record.log_index);
        let mut txs = self.txs.lock().unwrap();
        if txs.contains_key(&key) {
            return Ok(false);
        }
        txs.insert(key, record.clone());
        Ok(true)
    }

    async fn insert_event_if_absent(&self, record: &EventRecord) -> Result<bool, IndexerError> {
        let key = (record.tx_hash.clone(), record.log_index);
        let mut events = self.events.lock().unwrap();
        if events.contains_key(&key) {
            return Ok(false);
        }
        events.insert(key, record.clone());
        Ok(true)
    }

    async fn query_recent(
        &self,
        filter: &EventQuery,
        limit: usize,
    ) -> Result<Vec<TxRecord>, IndexerError> {
        let mut rows = self.select(filter);
        rows.sort_by(|a, b| {
            (b.block_time, b.block_number, b.log_index).cmp(&(a.block_time, a.block_number, a.log_index))
        });
        rows.truncate(limit);
        Ok(rows)
    }

    async fn query_range(
        &self,
        filter: &EventQuery,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TxRecord>, IndexerError> {
        let mut rows: Vec<_> = self
            .select(filter)
            .into_iter()
            .filter(|r| r.block_time >= from && r.block_time < to)
            .collect();
        rows.sort_by(|a, b| {
            (a.block_time, a.block_number, a.log_index).cmp(&(b.block_time, b.block_number, b.log_index))
        });
        Ok(rows)
    }

    async fn events_by_day(&self, day_key: &str) -> Result<Vec<EventRecord>, IndexerError> {
        let mut rows: Vec<_> = self
            .events
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.day_key == day_key)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.block_number, a.log_index).cmp(&(b.block_number, b.log_index)));
        Ok(rows)
    }
}
