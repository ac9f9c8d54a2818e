//! rustcoin-node - headless chain daemon
//!
//! Runs the full chain-and-pool engine: connects outbound to seed peers,
//! downloads and verifies the block chain, relays transactions, and exposes
//! a JSON-RPC surface for clients.

use anyhow::{Context, Result};
use clap::Parser;
use rustcoin_core::chain::BlockChain;
use rustcoin_core::mempool::TransactionStore;
use rustcoin_core::script::StructuralVerifier;
use rustcoin_core::storage;
use rustcoin_network::sender::TransactionSender;
use rustcoin_network::PeerManager;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod node;
mod rpc;

use config::NodeConfig;
use node::Node;

/// rustcoin full node daemon
#[derive(Parser)]
#[command(name = "rustcoin-node")]
#[command(about = "rustcoin full node - chain sync, mempool, and relay", long_about = None)]
struct Cli {
    /// Path to a JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seed peers (host:port), in addition to the config file's
    #[arg(long)]
    seed: Vec<String>,

    /// Storage URI override
    #[arg(long)]
    storage_uri: Option<String>,

    /// Maintain per-address transaction indices
    #[arg(long)]
    live_accounting: bool,

    /// JSON-RPC port override
    #[arg(long)]
    rpc_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    config.network.seeds.extend(cli.seed.iter().cloned());
    if let Some(uri) = cli.storage_uri {
        config.storage.uri = uri;
    }
    if cli.live_accounting {
        config.feature.live_accounting = true;
    }
    if let Some(port) = cli.rpc_port {
        config.rpc.port = port;
    }

    info!("rustcoin-node {} starting", env!("CARGO_PKG_VERSION"));

    let storage = storage::open(&config.storage.uri)
        .with_context(|| format!("opening storage '{}'", config.storage.uri))?;
    let genesis = config.genesis_block()?;
    let chain = Arc::new(BlockChain::new(storage.clone(), genesis));
    let pool = Arc::new(TransactionStore::new(
        storage,
        Arc::new(StructuralVerifier),
        config.feature.live_accounting,
    ));

    // The tip is not rehydrated yet; peers learn our height from later invs
    let network_config = config.network_config(0)?;
    let peers = Arc::new(PeerManager::new(network_config));
    let sender = Arc::new(TransactionSender::default());

    let node = Arc::new(Node::new(config, chain, pool, peers, sender));

    tokio::select! {
        result = node.start() => {
            if let Err(e) = &result {
                error!("node stopped with error: {e:#}");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    }
}
