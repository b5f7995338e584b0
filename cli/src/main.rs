//! kwhindex CLI: run the KWH token event indexer and inspect its progress.
//!
//! Usage:
//! ```bash
//! # Index the configured contracts, then follow the chain tip
//! kwhindex run --rpc-url http://127.0.0.1:8545 --database-url sqlite:./kwh.db
//!
//! # Print the stored cursor of every configured contract
//! kwhindex status
//!
//! # Show defaults
//! kwhindex info
//! ```
//!
//! Every flag falls back to its environment variable; a `.env` file in the
//! working directory is loaded first.

mod logging;
mod settings;
mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

use kwhindex_core::{cursor_key, ProgressTracker, BOOTSTRAP_KEY};
use kwhindex_evm::Orchestrator;
use kwhindex_rpc::{RpcGateway, DEFAULT_HTTP_URL};
use kwhindex_storage::mask_credentials;

use crate::logging::init_tracing;
use crate::settings::Settings;
use crate::storage::Storage;

#[derive(Parser)]
#[command(
    name = "kwhindex",
    version,
    about = "Event indexer for the KWH energy token contracts"
)]
struct Cli {
    /// Log level or filter directives (overrides LOG_LEVEL)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Backfill every configured contract, then follow the chain tip
    Run(RunArgs),
    /// Print stored cursors for the configured contracts
    Status(StorageArgs),
    /// Show default settings
    Info,
}

#[derive(Args)]
struct StorageArgs {
    /// Storage connection string: sqlite:<path>, postgres://..., or memory
    #[arg(long)]
    database_url: Option<String>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    storage: StorageArgs,

    /// HTTP JSON-RPC endpoint
    #[arg(long)]
    rpc_url: Option<String>,

    /// WebSocket endpoint for push subscriptions
    #[arg(long)]
    ws_url: Option<String>,

    /// First block for contracts without a cursor
    #[arg(long)]
    start_block: Option<u64>,

    /// Blocks held back from the tip during backfill
    #[arg(long)]
    confirmations: Option<u64>,

    /// Blocks per eth_getLogs range
    #[arg(long)]
    batch_size: Option<u64>,

    /// HTTP polling interval in milliseconds
    #[arg(long)]
    poll_ms: Option<u64>,

    /// Abort startup if the token contract is missing or invalid
    #[arg(long)]
    require_primary: bool,
}

impl RunArgs {
    fn apply(self, settings: &mut Settings) {
        self.storage.apply(settings);
        if self.rpc_url.is_some() {
            settings.rpc_url = self.rpc_url;
        }
        if self.ws_url.is_some() {
            settings.rpc_ws_url = self.ws_url;
        }
        if self.start_block.is_some() {
            settings.start_block = self.start_block;
        }
        if let Some(n) = self.confirmations {
            settings.confirmations = n;
        }
        if let Some(n) = self.batch_size {
            settings.batch_size = n;
        }
        if let Some(n) = self.poll_ms {
            settings.poll_ms = n;
        }
        settings.require_primary |= self.require_primary;
    }
}

impl StorageArgs {
    fn apply(self, settings: &mut Settings) {
        if self.database_url.is_some() {
            settings.database_url = self.database_url;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::from_env()?;
    if let Some(level) = cli.log_level {
        settings.log.level = level;
    }
    settings.log.json |= cli.log_json;

    match cli.command {
        Command::Info => {
            cmd_info();
            Ok(())
        }
        Command::Status(args) => {
            args.apply(&mut settings);
            cmd_status(&settings).await
        }
        Command::Run(args) => {
            args.apply(&mut settings);
            init_tracing(&settings.log);
            cmd_run(&settings).await
        }
    }
}

async fn cmd_run(settings: &Settings) -> Result<()> {
    let database_url = settings.database_url()?;
    let storage = Storage::open(database_url)
        .await
        .with_context(|| format!("cannot open storage at {}", mask_credentials(database_url)))?;

    ProgressTracker::new(storage.cursors())
        .seed_bootstrap(settings.start_block)
        .await
        .context("cannot seed bootstrap cursor")?;

    let gateway = RpcGateway::connect(
        settings.rpc_url.as_deref(),
        settings.rpc_ws_url.as_deref(),
        settings.gateway_config(),
    )
    .await
    .context("cannot reach RPC node")?;

    let orchestrator = Orchestrator::new(
        settings.indexer_config()?,
        Arc::new(gateway),
        storage.cursors(),
        storage.events(),
    );
    let handle = match orchestrator.start().await {
        Ok(handle) => handle,
        Err(e) => {
            storage.close().await;
            return Err(e).context("indexer failed to start");
        }
    };

    shutdown_signal().await;
    info!("shutdown signal received");
    handle.shutdown().await;
    storage.close().await;
    Ok(())
}

async fn cmd_status(settings: &Settings) -> Result<()> {
    let database_url = settings.database_url()?;
    let storage = Storage::open(database_url)
        .await
        .with_context(|| format!("cannot open storage at {}", mask_credentials(database_url)))?;
    let cursors = storage.cursors();

    println!("storage: {}", mask_credentials(database_url));
    match cursors.get_cursor(BOOTSTRAP_KEY).await? {
        Some(block) => println!("  {BOOTSTRAP_KEY:<14} {block}"),
        None => println!("  {BOOTSTRAP_KEY:<14} (not seeded)"),
    }

    let contracts = [
        ("KWHToken", &settings.token_address),
        ("EnergyBilling", &settings.billing_address),
        ("Marketplace", &settings.marketplace_address),
    ];
    for (name, address) in contracts {
        let Some(address) = address else {
            println!("  {name:<14} (not configured)");
            continue;
        };
        match cursors.get_cursor(&cursor_key(address)).await? {
            Some(next) => println!("  {name:<14} {address}  next block {next}"),
            None => println!("  {name:<14} {address}  (no progress yet)"),
        }
    }

    storage.close().await;
    Ok(())
}

fn cmd_info() {
    println!("KWHIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default chain id: 31337");
    println!("  Default RPC: {DEFAULT_HTTP_URL}");
    println!("  Default confirmation depth: 0 blocks");
    println!("  Default batch size: 2000 blocks/call");
    println!("  Fallback window without cursor or start block: 2000 blocks");
    println!("  HTTP polling interval: 5000 ms");
    println!("  Storage backends: memory, SQLite, PostgreSQL");
    println!("  Contracts: KWHToken (primary), EnergyBilling, Marketplace");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
