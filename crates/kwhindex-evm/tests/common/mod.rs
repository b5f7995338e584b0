//! Scripted in-memory chain shared by the engine tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_core::dyn_abi::DynSolValue;
use alloy_primitives::{keccak256, Address, U256};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;

use kwhindex_core::IndexerError;
use kwhindex_rpc::{BlockHeader, ChainGateway, LogFilter, RawLog, Receipt};

pub const TOKEN: &str = "0xAAA0000000000000000000000000000000000001";
pub const BILLING: &str = "0xBBB0000000000000000000000000000000000002";
pub const USER: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";
pub const GENESIS_TS: i64 = 1_700_000_000;

pub const TOKEN_ABI: &str = r#"[
    {"type":"event","name":"KWHConsumed","anonymous":false,"inputs":[
        {"name":"user","type":"address","indexed":true},
        {"name":"kwh","type":"uint256","indexed":false}]},
    {"type":"event","name":"Transfer","anonymous":false,"inputs":[
        {"name":"from","type":"address","indexed":true},
        {"name":"to","type":"address","indexed":true},
        {"name":"value","type":"uint256","indexed":false}]}
]"#;

pub const BILLING_ABI: &str = r#"{"contractName":"EnergyBilling","abi":[
    {"type":"event","name":"BillPaid","anonymous":false,"inputs":[
        {"name":"payer","type":"address","indexed":true},
        {"name":"amount","type":"uint256","indexed":false}]}
]}"#;

pub fn topic_of(signature: &str) -> String {
    format!("0x{}", hex::encode(keccak256(signature.as_bytes())))
}

pub fn address_topic(addr: &str) -> String {
    let a: Address = addr.parse().unwrap();
    format!("0x{}", hex::encode(a.into_word()))
}

pub fn uint_data(value: u64) -> String {
    format!("0x{}", hex::encode(DynSolValue::Uint(U256::from(value), 256).abi_encode()))
}

pub fn block_time(number: u64) -> DateTime<Utc> {
    Utc.timestamp_opt(GENESIS_TS + number as i64 * 12, 0).unwrap()
}

/// `KWHConsumed(user, kwh)` emitted by [`TOKEN`].
pub fn consumed(block: u64, tx_hash: &str, log_index: u64, kwh: u64) -> RawLog {
    RawLog {
        address: TOKEN.to_lowercase(),
        topics: vec![topic_of("KWHConsumed(address,uint256)"), address_topic(USER)],
        data: uint_data(kwh),
        block_number: Some(format!("{block:#x}")),
        block_hash: Some(format!("0xb{block}")),
        tx_hash: Some(tx_hash.to_string()),
        log_index: Some(format!("{log_index:#x}")),
        removed: None,
    }
}

/// `BillPaid(payer, amount)` emitted by [`BILLING`].
pub fn bill_paid(block: u64, tx_hash: &str, amount: u64) -> RawLog {
    RawLog {
        address: BILLING.to_lowercase(),
        topics: vec![topic_of("BillPaid(address,uint256)"), address_topic(USER)],
        data: uint_data(amount),
        block_number: Some(format!("{block:#x}")),
        block_hash: None,
        tx_hash: Some(tx_hash.to_string()),
        log_index: Some("0x0".into()),
        removed: None,
    }
}

/// `Transfer(from, to, value)` emitted by [`TOKEN`], from [`USER`] to the token.
pub fn transfer(block: u64, tx_hash: &str, log_index: u64, value: u64) -> RawLog {
    RawLog {
        address: TOKEN.to_lowercase(),
        topics: vec![
            topic_of("Transfer(address,address,uint256)"),
            address_topic(USER),
            address_topic(TOKEN),
        ],
        data: uint_data(value),
        block_number: Some(format!("{block:#x}")),
        block_hash: None,
        tx_hash: Some(tx_hash.to_string()),
        log_index: Some(format!("{log_index:#x}")),
        removed: None,
    }
}

#[derive(Default)]
pub struct MockChain {
    latest: AtomicU64,
    logs: Mutex<Vec<RawLog>>,
    receipts: Mutex<HashMap<String, Receipt>>,
    failing_topics: Mutex<HashSet<String>>,
    log_calls: Mutex<Vec<(u64, u64, Vec<String>)>>,
    latest_calls: AtomicUsize,
    latest_failures: AtomicUsize,
    log_subs: Mutex<Vec<(String, String, mpsc::UnboundedSender<RawLog>)>>,
    head_subs: Mutex<Vec<mpsc::UnboundedSender<u64>>>,
    /// Held by a test to park `latest_block_number` callers.
    pub gate: tokio::sync::Mutex<()>,
}

impl MockChain {
    pub fn new(latest: u64) -> Arc<Self> {
        let chain = Self::default();
        chain.latest.store(latest, Ordering::SeqCst);
        Arc::new(chain)
    }

    pub fn set_latest(&self, latest: u64) {
        self.latest.store(latest, Ordering::SeqCst);
    }

    pub fn add_log(&self, log: RawLog) {
        self.logs.lock().unwrap().push(log);
    }

    pub fn add_receipt(&self, tx_hash: &str, from: &str, to: &str) {
        self.receipts.lock().unwrap().insert(
            tx_hash.to_string(),
            Receipt {
                tx_hash: tx_hash.to_string(),
                from: Some(from.to_string()),
                to: Some(to.to_string()),
                block_number: None,
                block_hash: Some("0xreceipt".into()),
                status: Some("0x1".into()),
            },
        );
    }

    pub fn fail_topic(&self, topic0: String) {
        self.failing_topics.lock().unwrap().insert(topic0);
    }

    pub fn heal_topic(&self, topic0: &str) {
        self.failing_topics.lock().unwrap().remove(topic0);
    }

    /// Make the next `times` calls to `latest_block_number` fail.
    pub fn fail_latest(&self, times: usize) {
        self.latest_failures.store(times, Ordering::SeqCst);
    }

    /// `(from, to)` of every `get_logs` call, in order.
    pub fn log_ranges(&self) -> Vec<(u64, u64)> {
        self.log_calls.lock().unwrap().iter().map(|(f, t, _)| (*f, *t)).collect()
    }

    pub fn log_call_count(&self) -> usize {
        self.log_calls.lock().unwrap().len()
    }

    pub fn latest_calls(&self) -> usize {
        self.latest_calls.load(Ordering::SeqCst)
    }

    pub fn log_subscription_count(&self) -> usize {
        self.log_subs.lock().unwrap().len()
    }

    /// Push `log` to every matching log subscription.
    pub fn emit_log(&self, log: &RawLog) {
        for (address, topic0, tx) in self.log_subs.lock().unwrap().iter() {
            if address.eq_ignore_ascii_case(&log.address) && log.topic0() == Some(topic0.as_str()) {
                let _ = tx.send(log.clone());
            }
        }
    }

    pub fn emit_head(&self, number: u64) {
        for tx in self.head_subs.lock().unwrap().iter() {
            let _ = tx.send(number);
        }
    }
}

#[async_trait]
impl ChainGateway for MockChain {
    async fn latest_block_number(&self) -> Result<u64, IndexerError> {
        self.latest_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .latest_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(IndexerError::Rpc("connection reset".into()));
        }
        let _open = self.gate.lock().await;
        Ok(self.latest.load(Ordering::SeqCst))
    }

    async fn get_block(&self, number: u64) -> Result<Option<BlockHeader>, IndexerError> {
        Ok(Some(BlockHeader {
            number,
            hash: Some(format!("0xb{number}")),
            timestamp: block_time(number).timestamp() as u64,
        }))
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, IndexerError> {
        self.log_calls
            .lock()
            .unwrap()
            .push((filter.from_block, filter.to_block, filter.topic0.clone()));
        let failing = self.failing_topics.lock().unwrap();
        if filter.topic0.iter().any(|t| failing.contains(t)) {
            return Err(IndexerError::Rpc("query returned more than 10000 results".into()));
        }
        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| filter.matches(l))
            .filter(|l| {
                l.block_number_u64()
                    .map_or(false, |n| n >= filter.from_block && n <= filter.to_block)
            })
            .cloned()
            .collect())
    }

    async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, IndexerError> {
        Ok(self.receipts.lock().unwrap().get(tx_hash).cloned())
    }

    async fn subscribe_new_blocks(&self) -> Result<mpsc::UnboundedReceiver<u64>, IndexerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.head_subs.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn subscribe_logs(
        &self,
        address: &str,
        topic0: &str,
    ) -> Result<mpsc::UnboundedReceiver<RawLog>, IndexerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.log_subs
            .lock()
            .unwrap()
            .push((address.to_string(), topic0.to_string(), tx));
        Ok(rx)
    }
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
