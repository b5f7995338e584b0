//! Runtime settings from environment variables (after loading `.env`).
//!
//! Address variables accept the names used by existing deployments, e.g.
//! both `KWH_TOKEN_ADDRESS` and `KWHTOKEN_ADDR` for the token contract.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use kwhindex_core::indexer::{DEFAULT_BATCH_SIZE, DEFAULT_CHAIN_ID, DEFAULT_FALLBACK_WINDOW};
use kwhindex_core::{ContractSlot, IndexerConfig};
use kwhindex_rpc::GatewayConfig;

use crate::logging::LogConfig;

const TOKEN_ABI: &str = include_str!("../abis/KWHToken.json");
const BILLING_ABI: &str = include_str!("../abis/EnergyBilling.json");
const MARKETPLACE_ABI: &str = include_str!("../abis/Marketplace.json");

#[derive(Debug, Clone)]
pub struct Settings {
    pub chain_id: u64,
    pub rpc_url: Option<String>,
    pub rpc_ws_url: Option<String>,
    pub database_url: Option<String>,
    pub start_block: Option<u64>,
    pub confirmations: u64,
    pub batch_size: u64,
    pub poll_ms: u64,
    pub require_primary: bool,
    pub token_address: Option<String>,
    pub billing_address: Option<String>,
    pub marketplace_address: Option<String>,
    /// ABI files replacing the embedded ones.
    pub token_abi_path: Option<PathBuf>,
    pub billing_abi_path: Option<PathBuf>,
    pub marketplace_abi_path: Option<PathBuf>,
    pub log: LogConfig,
}

impl Settings {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup. Empty values count as unset.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let first = |keys: &[&str]| {
            keys.iter()
                .filter_map(|k| get(k))
                .map(|v| v.trim().to_string())
                .find(|v| !v.is_empty())
        };

        Ok(Self {
            chain_id: parse_or(first(&["CHAIN_ID"]), "CHAIN_ID", DEFAULT_CHAIN_ID)?,
            rpc_url: first(&["RPC_URL", "ANVIL_RPC"]),
            rpc_ws_url: first(&["RPC_WS_URL"]),
            database_url: first(&["DATABASE_URL"]),
            start_block: first(&["START_BLOCK"])
                .map(|v| v.parse().with_context(|| format!("invalid START_BLOCK: {v:?}")))
                .transpose()?,
            confirmations: parse_or(first(&["CONFIRMATIONS"]), "CONFIRMATIONS", 0)?,
            batch_size: parse_or(first(&["BATCH_SIZE"]), "BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            poll_ms: parse_or(first(&["POLL_MS"]), "POLL_MS", 5000)?,
            require_primary: parse_bool(first(&["REQUIRE_PRIMARY"]), "REQUIRE_PRIMARY")?,
            token_address: first(&["KWH_TOKEN_ADDRESS", "KWHTOKEN_ADDR", "TOKEN_ADDRESS"]),
            billing_address: first(&["BILLING_ADDRESS", "BILLING_ADDR"]),
            marketplace_address: first(&["MARKETPLACE_ADDRESS", "MARKET_ADDR", "MARKETPLACE_ADDR"]),
            token_abi_path: first(&["KWH_TOKEN_ABI"]).map(PathBuf::from),
            billing_abi_path: first(&["BILLING_ABI"]).map(PathBuf::from),
            marketplace_abi_path: first(&["MARKETPLACE_ABI"]).map(PathBuf::from),
            log: LogConfig {
                level: first(&["LOG_LEVEL"]).unwrap_or_else(|| "info".into()),
                components: first(&["LOG_COMPONENTS"])
                    .map(|v| LogConfig::parse_components(&v).map_err(|e| anyhow!("invalid LOG_COMPONENTS: {e}")))
                    .transpose()?
                    .unwrap_or_default(),
                json: parse_bool(first(&["LOG_JSON"]), "LOG_JSON")?,
            },
        })
    }

    /// The storage connection string. Running without one is fatal.
    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| anyhow!("DATABASE_URL is not set (use sqlite:<path>, postgres://..., or memory)"))
    }

    /// Assemble the indexer configuration, reading ABI override files.
    pub fn indexer_config(&self) -> Result<IndexerConfig> {
        let slot = |name: &str, address: &Option<String>, path: &Option<PathBuf>, embedded: &str| {
            address
                .as_ref()
                .map(|a| Ok::<_, anyhow::Error>(ContractSlot::new(name, a, load_abi(path, embedded)?)))
                .transpose()
        };

        Ok(IndexerConfig {
            chain_id: self.chain_id,
            start_block: self.start_block,
            confirmations: self.confirmations,
            batch_size: self.batch_size,
            fallback_window: DEFAULT_FALLBACK_WINDOW,
            poll_interval_ms: self.poll_ms,
            require_primary: self.require_primary,
            token: slot("KWHToken", &self.token_address, &self.token_abi_path, TOKEN_ABI)?,
            billing: slot("EnergyBilling", &self.billing_address, &self.billing_abi_path, BILLING_ABI)?,
            marketplace: slot(
                "Marketplace",
                &self.marketplace_address,
                &self.marketplace_abi_path,
                MARKETPLACE_ABI,
            )?,
        })
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            poll_interval: Duration::from_millis(self.poll_ms.max(1)),
            ..Default::default()
        }
    }
}

fn load_abi(path: &Option<PathBuf>, embedded: &str) -> Result<String> {
    match path {
        Some(p) => std::fs::read_to_string(p)
            .with_context(|| format!("cannot read ABI file {}", p.display())),
        None => Ok(embedded.to_string()),
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(v) => v.parse().with_context(|| format!("invalid {key}: {v:?}")),
        None => Ok(default),
    }
}

fn parse_bool(value: Option<String>, key: &str) -> Result<bool> {
    match value.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(anyhow!("invalid {key}: {other:?} (expected true or false)")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const TOKEN: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

    fn settings(vars: &[(&str, &str)]) -> Result<Settings> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Settings::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.chain_id, 31337);
        assert_eq!(s.confirmations, 0);
        assert_eq!(s.batch_size, 2000);
        assert_eq!(s.poll_ms, 5000);
        assert_eq!(s.start_block, None);
        assert!(!s.require_primary);
        assert!(s.database_url().is_err());
    }

    #[test]
    fn legacy_address_aliases() {
        let s = settings(&[("KWHTOKEN_ADDR", TOKEN), ("MARKET_ADDR", TOKEN)]).unwrap();
        assert_eq!(s.token_address.as_deref(), Some(TOKEN));
        assert_eq!(s.marketplace_address.as_deref(), Some(TOKEN));

        let s = settings(&[("KWH_TOKEN_ADDRESS", TOKEN), ("KWHTOKEN_ADDR", "0xother")]).unwrap();
        assert_eq!(s.token_address.as_deref(), Some(TOKEN));
    }

    #[test]
    fn empty_values_count_as_unset() {
        let s = settings(&[("KWH_TOKEN_ADDRESS", "  "), ("KWHTOKEN_ADDR", TOKEN), ("START_BLOCK", "")])
            .unwrap();
        assert_eq!(s.token_address.as_deref(), Some(TOKEN));
        assert_eq!(s.start_block, None);
    }

    #[test]
    fn log_components_feed_filter_directives() {
        let s = settings(&[("LOG_LEVEL", "warn"), ("LOG_COMPONENTS", "kwhindex-evm=debug")]).unwrap();
        assert_eq!(s.log.directives(), "warn,kwhindex_evm=debug");
        assert!(settings(&[("LOG_COMPONENTS", "debug")]).is_err());
    }

    #[test]
    fn bad_numbers_rejected() {
        assert!(settings(&[("CONFIRMATIONS", "five")]).is_err());
        assert!(settings(&[("REQUIRE_PRIMARY", "maybe")]).is_err());
    }

    #[test]
    fn indexer_config_uses_embedded_abis() {
        let s = settings(&[
            ("KWH_TOKEN_ADDRESS", TOKEN),
            ("START_BLOCK", "100"),
            ("CONFIRMATIONS", "5"),
            ("REQUIRE_PRIMARY", "true"),
        ])
        .unwrap();
        let config = s.indexer_config().unwrap();
        assert_eq!(config.start_block, Some(100));
        assert_eq!(config.confirmations, 5);
        assert!(config.require_primary);
        let token = config.token.unwrap();
        assert_eq!(token.name, "KWHToken");
        assert!(token.abi.contains("KWHConsumed"));
        assert!(config.billing.is_none());
    }

    #[test]
    fn missing_abi_file_is_an_error() {
        let s = settings(&[("BILLING_ADDR", TOKEN), ("BILLING_ABI", "/nonexistent/abi.json")]).unwrap();
        assert!(s.indexer_config().is_err());
    }
}
