//! Indexed records written by the backfill and live engines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::normalize::Args;

/// Log index used for records not tied to a specific log.
pub const NO_LOG_INDEX: i64 = -1;

// ─── TxStatus ─────────────────────────────────────────────────────────────────

/// Status marker stored on transaction records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    /// Indexed at or below the confirmation-margined tip, or delivered live.
    #[default]
    Confirmed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
        }
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmed" => Ok(Self::Confirmed),
            other => Err(format!("unknown tx status: {other}")),
        }
    }
}

// ─── TxRecord ─────────────────────────────────────────────────────────────────

/// Transaction-level record, one per `(tx_hash, log_index)`.
///
/// Immutable once written: the store only ever inserts it if absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxRecord {
    pub chain_id: u64,
    pub block_number: Option<u64>,
    pub block_hash: Option<String>,
    pub tx_hash: String,
    /// Position of the log inside its block, or [`NO_LOG_INDEX`].
    pub log_index: i64,
    /// Emitting contract, lowercased.
    pub contract: String,
    pub event: String,
    /// Normalized arguments.
    pub args: Args,
    /// Transaction sender from the receipt, lowercased; empty if unknown.
    pub from: String,
    /// Transaction recipient from the receipt, lowercased; empty if unknown.
    pub to: String,
    pub status: TxStatus,
    pub block_time: DateTime<Utc>,
}

// ─── EventRecord ──────────────────────────────────────────────────────────────

/// Fine-grained event record, one per `(tx_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub chain_id: u64,
    pub block_number: Option<u64>,
    pub tx_hash: String,
    pub log_index: i64,
    pub contract: String,
    pub name: String,
    pub args: Args,
    pub ts: DateTime<Utc>,
    /// UTC calendar day of `ts` (`YYYY-MM-DD`), the daily aggregation bucket.
    pub day_key: String,
}

impl EventRecord {
    /// Derive the event record from its transaction-level counterpart.
    pub fn from_tx(tx: &TxRecord) -> Self {
        Self {
            chain_id: tx.chain_id,
            block_number: tx.block_number,
            tx_hash: tx.tx_hash.clone(),
            log_index: tx.log_index,
            contract: tx.contract.clone(),
            name: if tx.event.is_empty() { "Unknown".into() } else { tx.event.clone() },
            args: tx.args.clone(),
            ts: tx.block_time,
            day_key: day_key(&tx.block_time),
        }
    }
}

/// UTC day bucket (`YYYY-MM-DD`) for a timestamp.
pub fn day_key(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::ArgValue;
    use chrono::TimeZone;

    fn tx(event: &str) -> TxRecord {
        let mut args = Args::new();
        args.insert("kwh".into(), ArgValue::from("5"));
        TxRecord {
            chain_id: 31337,
            block_number: Some(105),
            block_hash: Some("0xb105".into()),
            tx_hash: "0xdead".into(),
            log_index: 2,
            contract: "0xaaa".into(),
            event: event.into(),
            args,
            from: "0x111".into(),
            to: "0xaaa".into(),
            status: TxStatus::Confirmed,
            block_time: Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 59).unwrap(),
        }
    }

    #[test]
    fn day_key_is_utc_date() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 59).unwrap();
        assert_eq!(day_key(&ts), "2024-03-09");
    }

    #[test]
    fn event_record_from_tx() {
        let ev = EventRecord::from_tx(&tx("KWHConsumed"));
        assert_eq!(ev.name, "KWHConsumed");
        assert_eq!(ev.day_key, "2024-03-09");
        assert_eq!(ev.log_index, 2);
        assert_eq!(ev.args["kwh"], ArgValue::from("5"));
    }

    #[test]
    fn unnamed_event_falls_back_to_unknown() {
        assert_eq!(EventRecord::from_tx(&tx("")).name, "Unknown");
    }

    #[test]
    fn status_roundtrip() {
        assert_eq!("confirmed".parse::<TxStatus>().unwrap(), TxStatus::Confirmed);
        assert!("pending".parse::<TxStatus>().is_err());
        assert_eq!(serde_json::to_string(&TxStatus::Confirmed).unwrap(), "\"confirmed\"");
    }
}
