//! Chain data as returned by the node.

use kwhindex_core::NO_LOG_INDEX;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A raw EVM log as returned by `eth_getLogs` or a `logs` subscription.
///
/// Numeric fields stay hex-encoded as on the wire; pending logs carry `null`
/// block and index fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(default)]
    pub block_number: Option<String>,
    #[serde(default)]
    pub block_hash: Option<String>,
    #[serde(rename = "transactionHash", default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub log_index: Option<String>,
    #[serde(default)]
    pub removed: Option<bool>,
}

impl RawLog {
    pub fn block_number_u64(&self) -> Option<u64> {
        self.block_number.as_deref().and_then(parse_hex_u64)
    }

    /// Log index, or `-1` when the node omitted it.
    pub fn log_index_i64(&self) -> i64 {
        self.log_index
            .as_deref()
            .and_then(parse_hex_u64)
            .and_then(|n| i64::try_from(n).ok())
            .unwrap_or(NO_LOG_INDEX)
    }

    /// Returns `true` if the node flagged this log as removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }

    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }
}

/// Block fields the indexer needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: Option<String>,
    /// Unix seconds.
    pub timestamp: u64,
}

impl BlockHeader {
    /// Parse an `eth_getBlockByNumber` result or a `newHeads` notification.
    pub fn from_json(v: &Value) -> Option<Self> {
        Some(Self {
            number: parse_hex_u64(v.get("number")?.as_str()?)?,
            hash: v.get("hash").and_then(Value::as_str).map(str::to_string),
            timestamp: parse_hex_u64(v.get("timestamp")?.as_str()?)?,
        })
    }
}

/// Transaction receipt fields the indexer needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(default)]
    pub from: Option<String>,
    /// `None` for contract creations.
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub block_number: Option<String>,
    #[serde(default)]
    pub block_hash: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl Receipt {
    pub fn from_lower(&self) -> String {
        self.from.as_deref().unwrap_or_default().to_lowercase()
    }

    pub fn to_lower(&self) -> String {
        self.to.as_deref().unwrap_or_default().to_lowercase()
    }
}

/// `eth_getLogs` filter over an inclusive block range.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogFilter {
    pub addresses: Vec<String>,
    /// Accepted topic0 values (any-of). Empty matches every event.
    pub topic0: Vec<String>,
    pub from_block: u64,
    pub to_block: u64,
}

impl LogFilter {
    pub fn new(from_block: u64, to_block: u64) -> Self {
        Self {
            from_block,
            to_block,
            ..Default::default()
        }
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.addresses.push(address.into());
        self
    }

    pub fn topic(mut self, topic0: impl Into<String>) -> Self {
        self.topic0.push(topic0.into());
        self
    }

    /// Encode as the single `eth_getLogs` parameter.
    pub fn to_params(&self) -> Value {
        let mut filter = json!({
            "fromBlock": format!("{:#x}", self.from_block),
            "toBlock": format!("{:#x}", self.to_block),
        });
        if !self.addresses.is_empty() {
            filter["address"] = json!(self.addresses);
        }
        if !self.topic0.is_empty() {
            filter["topics"] = json!([self.topic0]);
        }
        filter
    }

    /// Returns `true` if `log` would be selected by this filter's address and
    /// topic clauses (the block range is not checked).
    pub fn matches(&self, log: &RawLog) -> bool {
        let addr_ok = self.addresses.is_empty()
            || self.addresses.iter().any(|a| a.eq_ignore_ascii_case(&log.address));
        let topic_ok = self.topic0.is_empty()
            || log
                .topic0()
                .map_or(false, |t| self.topic0.iter().any(|x| x.eq_ignore_ascii_case(t)));
        addr_ok && topic_ok
    }
}

/// Parse a hex quantity (with or without `0x`).
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    if s.is_empty() {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_quantities() {
        assert_eq!(parse_hex_u64("0x1"), Some(1));
        assert_eq!(parse_hex_u64("0xff"), Some(255));
        assert_eq!(parse_hex_u64("1234"), Some(0x1234));
        assert_eq!(parse_hex_u64("0x"), None);
        assert_eq!(parse_hex_u64("0xzz"), None);
    }

    #[test]
    fn raw_log_from_node_json() {
        let log: RawLog = serde_json::from_value(json!({
            "address": "0x5fbdb2315678afecb367f032d93f642f64180aa3",
            "topics": ["0xabc"],
            "data": "0x",
            "blockNumber": "0x69",
            "blockHash": "0xb1",
            "transactionHash": "0xdead",
            "logIndex": "0x2",
            "removed": false
        }))
        .unwrap();
        assert_eq!(log.block_number_u64(), Some(105));
        assert_eq!(log.log_index_i64(), 2);
        assert_eq!(log.tx_hash.as_deref(), Some("0xdead"));
        assert!(!log.is_removed());
    }

    #[test]
    fn missing_log_index_is_sentinel() {
        let log: RawLog = serde_json::from_value(json!({
            "address": "0x1", "topics": [], "data": "0x", "logIndex": null
        }))
        .unwrap();
        assert_eq!(log.log_index_i64(), -1);
        assert_eq!(log.block_number_u64(), None);
    }

    #[test]
    fn filter_params_shape() {
        let f = LogFilter::new(100, 109).address("0xaaa").topic("0xt1").topic("0xt2");
        let p = f.to_params();
        assert_eq!(p["fromBlock"], "0x64");
        assert_eq!(p["toBlock"], "0x6d");
        assert_eq!(p["address"], json!(["0xaaa"]));
        assert_eq!(p["topics"], json!([["0xt1", "0xt2"]]));
    }

    #[test]
    fn block_header_from_json() {
        let h = BlockHeader::from_json(&json!({
            "number": "0x82", "hash": "0xh", "timestamp": "0x65f0c000"
        }))
        .unwrap();
        assert_eq!(h.number, 130);
        assert_eq!(h.timestamp, 0x65f0c000);
        assert!(BlockHeader::from_json(&Value::Null).is_none());
    }

    #[test]
    fn receipt_addresses_lowercased() {
        let r: Receipt = serde_json::from_value(json!({
            "transactionHash": "0xdead", "from": "0xAbC", "to": null, "status": "0x1"
        }))
        .unwrap();
        assert_eq!(r.from_lower(), "0xabc");
        assert_eq!(r.to_lower(), "");
    }
}
