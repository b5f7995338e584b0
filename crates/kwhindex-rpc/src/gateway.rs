//! Chain access for the indexing engines.
//!
//! [`ChainGateway`] is the seam the backfill and live engines depend on;
//! tests swap in an in-memory chain. [`RpcGateway`] implements it over a
//! request transport (HTTP, or the WebSocket client when no HTTP URL is
//! configured) plus an optional WebSocket client for push subscriptions.
//! Without push, or when a push stream ends, subscriptions fall back to
//! polling at `poll_interval`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kwhindex_core::IndexerError;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::error::TransportError;
use crate::http::HttpRpcClient;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::transport::RpcTransport;
use crate::types::{parse_hex_u64, BlockHeader, LogFilter, RawLog, Receipt};
use crate::ws::{WsClientConfig, WsRpcClient};

/// Node used when no RPC URL is configured.
pub const DEFAULT_HTTP_URL: &str = "http://127.0.0.1:8545";

/// Upstream chain queries and subscriptions used by the engines.
#[async_trait]
pub trait ChainGateway: Send + Sync {
    async fn latest_block_number(&self) -> Result<u64, IndexerError>;

    /// Block header, or `None` if the node still has not served it after
    /// the lookup retries.
    async fn get_block(&self, number: u64) -> Result<Option<BlockHeader>, IndexerError>;

    /// Timestamp of block `number`.
    async fn get_block_time(&self, number: u64) -> Result<Option<DateTime<Utc>>, IndexerError> {
        Ok(self
            .get_block(number)
            .await?
            .and_then(|b| DateTime::from_timestamp(b.timestamp as i64, 0)))
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, IndexerError>;

    /// Receipt, or `None` if unavailable after the lookup retries.
    async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, IndexerError>;

    /// Stream of new head block numbers.
    async fn subscribe_new_blocks(&self) -> Result<mpsc::UnboundedReceiver<u64>, IndexerError>;

    /// Stream of new logs emitted by `address` with the given topic0.
    async fn subscribe_logs(
        &self,
        address: &str,
        topic0: &str,
    ) -> Result<mpsc::UnboundedReceiver<RawLog>, IndexerError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Interval for block and log polling.
    pub poll_interval: Duration,
    /// Retry policy for null block/receipt lookups.
    pub lookup_retry: RetryConfig,
    /// Maximum cached block timestamps before the cache is cleared.
    pub block_time_cache_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5000),
            lookup_retry: RetryConfig::lookup(),
            block_time_cache_size: 5000,
        }
    }
}

/// Request transport plus a shared id counter; cheap to clone into tasks.
#[derive(Clone)]
struct RpcCaller {
    transport: Arc<dyn RpcTransport>,
    ids: Arc<AtomicU64>,
}

impl RpcCaller {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, TransportError> {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        self.transport.call(id, method, params).await
    }

    async fn block_number(&self) -> Result<u64, TransportError> {
        let v = self.call("eth_blockNumber", vec![]).await?;
        v.as_str()
            .and_then(parse_hex_u64)
            .ok_or_else(|| TransportError::Other(format!("malformed block number: {v}")))
    }

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, TransportError> {
        let v = self.call("eth_getLogs", vec![filter.to_params()]).await?;
        if v.is_null() {
            return Ok(vec![]);
        }
        Ok(serde_json::from_value(v)?)
    }

    async fn block(&self, number: u64) -> Result<Option<BlockHeader>, TransportError> {
        let v = self
            .call("eth_getBlockByNumber", vec![json!(format!("{number:#x}")), json!(false)])
            .await?;
        if v.is_null() {
            return Ok(None);
        }
        BlockHeader::from_json(&v)
            .map(Some)
            .ok_or_else(|| TransportError::Other(format!("malformed block {number}")))
    }

    async fn receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, TransportError> {
        let v = self.call("eth_getTransactionReceipt", vec![json!(tx_hash)]).await?;
        if v.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(v)?))
    }
}

pub struct RpcGateway {
    caller: RpcCaller,
    push: Option<Arc<WsRpcClient>>,
    lookup: RetryPolicy,
    poll_interval: Duration,
    block_times: Mutex<HashMap<u64, u64>>,
    cache_size: usize,
}

impl RpcGateway {
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        push: Option<Arc<WsRpcClient>>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            caller: RpcCaller {
                transport,
                ids: Arc::new(AtomicU64::new(1)),
            },
            push,
            lookup: RetryPolicy::new(config.lookup_retry),
            poll_interval: config.poll_interval,
            block_times: Mutex::new(HashMap::new()),
            cache_size: config.block_time_cache_size.max(1),
        }
    }

    /// Build a gateway from endpoint URLs.
    ///
    /// A WebSocket URL enables push subscriptions. Requests go over HTTP when
    /// an HTTP URL is given, over the socket otherwise; with neither, the
    /// local development node is assumed.
    pub async fn connect(
        http_url: Option<&str>,
        ws_url: Option<&str>,
        config: GatewayConfig,
    ) -> Result<Self, IndexerError> {
        let http_url = http_url.map(str::trim).filter(|u| !u.is_empty());
        let ws_url = ws_url.map(str::trim).filter(|u| !u.is_empty());

        let push = match ws_url {
            Some(url) => Some(Arc::new(WsRpcClient::connect(url, WsClientConfig::default()).await?)),
            None => None,
        };

        let transport: Arc<dyn RpcTransport> = match (http_url, &push) {
            (Some(url), _) => Arc::new(HttpRpcClient::default_for(url)?),
            (None, Some(ws)) => ws.clone(),
            (None, None) => {
                tracing::warn!(url = DEFAULT_HTTP_URL, "no RPC URL configured, using local node");
                Arc::new(HttpRpcClient::default_for(DEFAULT_HTTP_URL)?)
            }
        };

        tracing::info!(
            rpc = transport.url(),
            push = push.is_some(),
            poll_ms = config.poll_interval.as_millis() as u64,
            "gateway ready"
        );
        Ok(Self::new(transport, push, config))
    }

    pub fn url(&self) -> &str {
        self.caller.transport.url()
    }

    pub fn has_push(&self) -> bool {
        self.push.is_some()
    }

    /// Number of cached block timestamps.
    pub fn cached_block_times(&self) -> usize {
        self.block_times.lock().unwrap().len()
    }

    /// Run `fetch` until it yields a value, the node rejects it, or the
    /// lookup policy is exhausted. Misses end in `None`, never an error.
    async fn lookup<T, F, Fut>(&self, what: &'static str, key: &str, mut fetch: F) -> Option<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<Option<T>, TransportError>> + Send,
        T: Send,
    {
        let attempts = self.lookup.max_attempts().max(1);
        for attempt in 1..=attempts {
            match fetch().await {
                Ok(Some(v)) => return Some(v),
                Ok(None) => tracing::debug!(what, key, attempt, "lookup returned null"),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(what, key, attempt, error = %e, "lookup failed")
                }
                Err(e) => {
                    tracing::warn!(what, key, error = %e, "lookup rejected by node");
                    return None;
                }
            }
            if let Some(delay) = self.lookup.next_delay(attempt) {
                tokio::time::sleep(delay).await;
            }
        }
        tracing::warn!(what, key, attempts, "lookup gave up");
        None
    }
}

#[async_trait]
impl ChainGateway for RpcGateway {
    async fn latest_block_number(&self) -> Result<u64, IndexerError> {
        Ok(self.caller.block_number().await?)
    }

    async fn get_block(&self, number: u64) -> Result<Option<BlockHeader>, IndexerError> {
        let key = number.to_string();
        Ok(self.lookup("block", &key, || self.caller.block(number)).await)
    }

    async fn get_block_time(&self, number: u64) -> Result<Option<DateTime<Utc>>, IndexerError> {
        let cached = self.block_times.lock().unwrap().get(&number).copied();
        let secs = match cached {
            Some(secs) => secs,
            None => {
                let Some(block) = self.get_block(number).await? else {
                    return Ok(None);
                };
                let mut cache = self.block_times.lock().unwrap();
                if cache.len() >= self.cache_size {
                    cache.clear();
                }
                cache.insert(number, block.timestamp);
                block.timestamp
            }
        };
        Ok(DateTime::from_timestamp(secs as i64, 0))
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, IndexerError> {
        Ok(self.caller.logs(filter).await?)
    }

    async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<Option<Receipt>, IndexerError> {
        Ok(self.lookup("receipt", tx_hash, || self.caller.receipt(tx_hash)).await)
    }

    async fn subscribe_new_blocks(&self) -> Result<mpsc::UnboundedReceiver<u64>, IndexerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let caller = self.caller.clone();
        let every = self.poll_interval;

        if let Some(ws) = &self.push {
            match ws.subscribe("newHeads", vec![]).await {
                Ok((_, mut heads)) => {
                    tokio::spawn(async move {
                        let mut last = None;
                        while let Some(head) = heads.recv().await {
                            let Some(n) = head["number"].as_str().and_then(parse_hex_u64) else {
                                continue;
                            };
                            last = Some(n);
                            if tx.send(n).is_err() {
                                return;
                            }
                        }
                        tracing::warn!("newHeads stream ended, polling instead");
                        poll_new_blocks(caller, every, tx, last).await;
                    });
                    return Ok(rx);
                }
                Err(e) => tracing::warn!(error = %e, "newHeads subscription failed, polling instead"),
            }
        }

        tokio::spawn(poll_new_blocks(caller, every, tx, None));
        Ok(rx)
    }

    async fn subscribe_logs(
        &self,
        address: &str,
        topic0: &str,
    ) -> Result<mpsc::UnboundedReceiver<RawLog>, IndexerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let caller = self.caller.clone();
        let every = self.poll_interval;
        let filter = LogFilter::default().address(address).topic(topic0);

        if let Some(ws) = &self.push {
            let params = vec![json!({ "address": address, "topics": [topic0] })];
            match ws.subscribe("logs", params).await {
                Ok((_, mut notes)) => {
                    tokio::spawn(async move {
                        let mut next = None;
                        while let Some(note) = notes.recv().await {
                            match serde_json::from_value::<RawLog>(note) {
                                Ok(log) => {
                                    if let Some(n) = log.block_number_u64() {
                                        next = Some(n + 1);
                                    }
                                    if tx.send(log).is_err() {
                                        return;
                                    }
                                }
                                Err(e) => tracing::debug!(error = %e, "skipping malformed log notification"),
                            }
                        }
                        tracing::warn!("logs stream ended, polling instead");
                        poll_logs(caller, every, filter, tx, next).await;
                    });
                    return Ok(rx);
                }
                Err(e) => tracing::warn!(error = %e, "logs subscription failed, polling instead"),
            }
        }

        tokio::spawn(poll_logs(caller, every, filter, tx, None));
        Ok(rx)
    }
}

/// Emit the head number whenever it increases. Ends when the receiver drops.
async fn poll_new_blocks(
    caller: RpcCaller,
    every: Duration,
    tx: mpsc::UnboundedSender<u64>,
    mut last: Option<u64>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if tx.is_closed() {
            return;
        }
        match caller.block_number().await {
            Ok(n) if last.map_or(true, |l| n > l) => {
                last = Some(n);
                if tx.send(n).is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "block poll failed"),
        }
    }
}

/// Emit logs matching `template` from blocks after the head seen at start
/// (or from `next`, when resuming a push stream). Ends when the receiver drops.
async fn poll_logs(
    caller: RpcCaller,
    every: Duration,
    template: LogFilter,
    tx: mpsc::UnboundedSender<RawLog>,
    mut next: Option<u64>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if tx.is_closed() {
            return;
        }
        let head = match caller.block_number().await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "log poll failed");
                continue;
            }
        };
        let Some(from) = next else {
            next = Some(head + 1);
            continue;
        };
        if head < from {
            continue;
        }
        let filter = LogFilter {
            from_block: from,
            to_block: head,
            ..template.clone()
        };
        match caller.logs(&filter).await {
            Ok(logs) => {
                for log in logs {
                    if tx.send(log).is_err() {
                        return;
                    }
                }
                next = Some(head + 1);
            }
            Err(e) => tracing::warn!(from, to = head, error = %e, "log poll failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
    use std::collections::VecDeque;

    /// Scripted node: per-method queues, then per-method defaults.
    #[derive(Default)]
    struct ScriptedNode {
        queued: Mutex<HashMap<String, VecDeque<Value>>>,
        defaults: Mutex<HashMap<String, Value>>,
        seen: Mutex<Vec<JsonRpcRequest>>,
    }

    impl ScriptedNode {
        fn queue(self, method: &str, values: Vec<Value>) -> Self {
            self.queued.lock().unwrap().insert(method.into(), values.into());
            self
        }
        fn default_for(self, method: &str, value: Value) -> Self {
            self.defaults.lock().unwrap().insert(method.into(), value);
            self
        }
        fn calls(&self, method: &str) -> Vec<JsonRpcRequest> {
            self.seen.lock().unwrap().iter().filter(|r| r.method == method).cloned().collect()
        }
    }

    #[async_trait]
    impl RpcTransport for ScriptedNode {
        async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
            self.seen.lock().unwrap().push(req.clone());
            let next = self
                .queued
                .lock()
                .unwrap()
                .get_mut(&req.method)
                .and_then(VecDeque::pop_front);
            let value = match next {
                Some(v) => v,
                None => self
                    .defaults
                    .lock()
                    .unwrap()
                    .get(&req.method)
                    .cloned()
                    .ok_or_else(|| TransportError::Other(format!("unscripted {}", req.method)))?,
            };
            Ok(JsonRpcResponse::ok(req.id, value))
        }

        fn url(&self) -> &str {
            "scripted://node"
        }
    }

    fn fast_config() -> GatewayConfig {
        GatewayConfig {
            poll_interval: Duration::from_millis(5),
            lookup_retry: RetryConfig::linear(Duration::from_millis(1), 3),
            block_time_cache_size: 5000,
        }
    }

    fn gateway(node: Arc<ScriptedNode>, config: GatewayConfig) -> RpcGateway {
        RpcGateway::new(node, None, config)
    }

    fn block_json(n: u64, ts: u64) -> Value {
        json!({ "number": format!("{n:#x}"), "hash": "0xh", "timestamp": format!("{ts:#x}") })
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("stream closed")
    }

    #[tokio::test]
    async fn latest_block_number_parses_hex() {
        let node = Arc::new(ScriptedNode::default().default_for("eth_blockNumber", json!("0x82")));
        assert_eq!(gateway(node, fast_config()).latest_block_number().await.unwrap(), 130);
    }

    #[tokio::test]
    async fn null_block_retried_then_found() {
        let node = Arc::new(ScriptedNode::default().queue(
            "eth_getBlockByNumber",
            vec![Value::Null, Value::Null, block_json(105, 1_700_000_000)],
        ));
        let gw = gateway(node.clone(), fast_config());

        let block = gw.get_block(105).await.unwrap().unwrap();
        assert_eq!(block.timestamp, 1_700_000_000);
        assert_eq!(node.calls("eth_getBlockByNumber").len(), 3);
        assert_eq!(node.calls("eth_getBlockByNumber")[0].params[0], json!("0x69"));
    }

    #[tokio::test]
    async fn missing_receipt_is_none_after_three_attempts() {
        let node = Arc::new(ScriptedNode::default().default_for("eth_getTransactionReceipt", Value::Null));
        let gw = gateway(node.clone(), fast_config());

        assert!(gw.get_transaction_receipt("0xdead").await.unwrap().is_none());
        assert_eq!(node.calls("eth_getTransactionReceipt").len(), 3);
    }

    #[tokio::test]
    async fn block_time_is_cached() {
        let node = Arc::new(
            ScriptedNode::default().default_for("eth_getBlockByNumber", block_json(105, 1_700_000_000)),
        );
        let gw = gateway(node.clone(), fast_config());

        let t1 = gw.get_block_time(105).await.unwrap().unwrap();
        let t2 = gw.get_block_time(105).await.unwrap().unwrap();
        assert_eq!(t1, t2);
        assert_eq!(t1.timestamp(), 1_700_000_000);
        assert_eq!(node.calls("eth_getBlockByNumber").len(), 1);
    }

    #[tokio::test]
    async fn block_time_cache_clears_when_full() {
        let node = Arc::new(ScriptedNode::default().default_for("eth_getBlockByNumber", block_json(1, 10)));
        let gw = gateway(node, GatewayConfig { block_time_cache_size: 2, ..fast_config() });

        gw.get_block_time(1).await.unwrap();
        gw.get_block_time(2).await.unwrap();
        assert_eq!(gw.cached_block_times(), 2);
        gw.get_block_time(3).await.unwrap();
        assert_eq!(gw.cached_block_times(), 1);
    }

    #[tokio::test]
    async fn polled_heads_only_increase() {
        let node = Arc::new(
            ScriptedNode::default()
                .queue("eth_blockNumber", vec![json!("0x1"), json!("0x1"), json!("0x2")])
                .default_for("eth_blockNumber", json!("0x2")),
        );
        let gw = gateway(node, fast_config());
        let mut heads = gw.subscribe_new_blocks().await.unwrap();

        assert_eq!(recv(&mut heads).await, 1);
        assert_eq!(recv(&mut heads).await, 2);
        assert!(tokio::time::timeout(Duration::from_millis(50), heads.recv()).await.is_err());
    }

    #[tokio::test]
    async fn polled_logs_start_after_current_head() {
        let log = json!({
            "address": "0xaaa", "topics": ["0xt"], "data": "0x",
            "blockNumber": "0x12", "transactionHash": "0xdead", "logIndex": "0x0"
        });
        let node = Arc::new(
            ScriptedNode::default()
                .queue("eth_blockNumber", vec![json!("0x10")])
                .default_for("eth_blockNumber", json!("0x12"))
                .queue("eth_getLogs", vec![json!([log])])
                .default_for("eth_getLogs", json!([])),
        );
        let gw = gateway(node.clone(), fast_config());
        let mut logs = gw.subscribe_logs("0xaaa", "0xt").await.unwrap();

        let got = recv(&mut logs).await;
        assert_eq!(got.tx_hash.as_deref(), Some("0xdead"));

        let first = &node.calls("eth_getLogs")[0].params[0];
        assert_eq!(first["fromBlock"], "0x11");
        assert_eq!(first["toBlock"], "0x12");
        assert_eq!(first["address"], json!(["0xaaa"]));
        assert_eq!(first["topics"], json!([["0xt"]]));
    }
}
