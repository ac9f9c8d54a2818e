//! Node configuration
//!
//! Loaded from an optional JSON file, with command-line overrides applied on
//! top. Every section has working defaults so a bare `rustcoin-node` starts
//! an in-memory mainnet node.

use anyhow::{Context, Result};
use rustcoin_core::block::Block;
use rustcoin_core::genesis;
use rustcoin_network::{protocol, NetworkConfig};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub feature: FeatureSection,
    pub storage: StorageSection,
    pub network: NetworkSection,
    pub rpc: RpcSection,
}

/// Optional engine features
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FeatureSection {
    /// Maintain and emit per-address transaction indices
    pub live_accounting: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Opaque URI handed to the storage engine
    pub uri: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            uri: "mem:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Network magic bytes
    pub magic: u32,
    /// Hex-encoded genesis block; the built-in mainnet genesis when empty
    pub genesis: String,
    /// Seed peers to dial on startup, as host:port strings
    pub seeds: Vec<String>,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            magic: protocol::MAINNET_MAGIC,
            genesis: String::new(),
            seeds: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcSection {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for RpcSection {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8332,
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Genesis block for the configured network.
    pub fn genesis_block(&self) -> Result<Block> {
        if self.network.genesis.is_empty() {
            return Ok(genesis::mainnet_genesis());
        }
        let bytes = hex::decode(&self.network.genesis).context("decoding network.genesis hex")?;
        genesis::genesis_from_bytes(&bytes)
            .map_err(|e| anyhow::anyhow!("parsing network.genesis block: {e}"))
    }

    /// Assemble the networking layer's configuration.
    pub fn network_config(&self, start_height: i32) -> Result<NetworkConfig> {
        let mut seeds: Vec<SocketAddr> = Vec::with_capacity(self.network.seeds.len());
        for seed in &self.network.seeds {
            seeds.push(
                seed.parse()
                    .with_context(|| format!("parsing seed address '{seed}'"))?,
            );
        }
        Ok(NetworkConfig {
            magic: self.network.magic,
            seeds,
            start_height,
            ..NetworkConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert!(!config.feature.live_accounting);
        assert_eq!(config.storage.uri, "mem:");
        assert_eq!(config.network.magic, protocol::MAINNET_MAGIC);
        assert!(config.rpc.enabled);
        assert_eq!(config.rpc.port, 8332);
    }

    #[test]
    fn test_parse_partial_json() {
        let parsed: NodeConfig = serde_json::from_str(
            r#"{
                "feature": { "live_accounting": true },
                "network": { "seeds": ["127.0.0.1:8333"] }
            }"#,
        )
        .unwrap();
        assert!(parsed.feature.live_accounting);
        assert_eq!(parsed.storage.uri, "mem:");
        let net = parsed.network_config(0).unwrap();
        assert_eq!(net.seeds.len(), 1);
    }

    #[test]
    fn test_default_genesis_is_mainnet() {
        let config = NodeConfig::default();
        let block = config.genesis_block().unwrap();
        assert_eq!(
            rustcoin_core::utils::hash_to_hex(&block.hash()),
            genesis::GENESIS_HASH_HEX
        );
    }

    #[test]
    fn test_custom_genesis_round_trip() {
        let custom = genesis::mainnet_genesis();
        let config: NodeConfig = serde_json::from_str(&format!(
            r#"{{ "network": {{ "genesis": "{}" }} }}"#,
            hex::encode(custom.serialize())
        ))
        .unwrap();
        assert_eq!(config.genesis_block().unwrap().hash(), custom.hash());
    }

    #[test]
    fn test_bad_seed_rejected() {
        let parsed: NodeConfig = serde_json::from_str(
            r#"{ "network": { "seeds": ["not-an-addr"] } }"#,
        )
        .unwrap();
        assert!(parsed.network_config(0).is_err());
    }
}
