use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{Protocol, ProtocolConfig, ProtocolTable};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub id: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct P2PConfig {
    pub address: String,
    pub port: u16,
    /// Capacity of the discovery and data-transfer queues.
    pub queue_capacity: usize,
    /// Discovery sleeps a random whole number of seconds below this bound.
    pub max_discovery_delay_secs: u64,
    pub reputation_decay_interval_secs: u64,
    pub chain_sync_interval_secs: u64,
    /// Peers not seen for this long are evicted on each decay tick. Unset keeps them forever.
    pub peer_ttl_secs: Option<u64>,
}

impl Default for P2PConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 7000,
            queue_capacity: 100,
            max_discovery_delay_secs: 30,
            reputation_decay_interval_secs: 600,
            chain_sync_interval_secs: 300,
            peer_ttl_secs: None,
        }
    }
}

impl P2PConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn reputation_decay_interval(&self) -> Duration {
        Duration::from_secs(self.reputation_decay_interval_secs)
    }

    pub fn chain_sync_interval(&self) -> Duration {
        Duration::from_secs(self.chain_sync_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_name: String,
    /// Threshold applied to transactions that do not carry their own.
    pub similarity_threshold: f64,
    pub enabled_chains: Vec<ChainConfig>,
    /// Overrides for the reference protocol profiles.
    pub protocols: HashMap<Protocol, ProtocolConfig>,
    pub worker_threads: Option<usize>,
    pub api: ApiConfig,
    pub p2p: P2PConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: "node1".to_string(),
            similarity_threshold: 0.7,
            enabled_chains: Vec::new(),
            protocols: HashMap::new(),
            worker_threads: None,
            api: ApiConfig::default(),
            p2p: P2PConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
        .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(Error::Config(format!(
                "similarity_threshold {} outside [-1, 1]",
                self.similarity_threshold
            )));
        }
        if self.p2p.queue_capacity == 0 {
            return Err(Error::Config("p2p.queue_capacity must be positive".into()));
        }
        if self.p2p.reputation_decay_interval_secs == 0 || self.p2p.chain_sync_interval_secs == 0 {
            return Err(Error::Config("p2p intervals must be positive".into()));
        }
        if let Some(chain) = self.enabled_chains.iter().find(|c| c.id.is_empty()) {
            return Err(Error::Config(format!("chain with empty id (endpoint {:?})", chain.endpoint)));
        }
        Ok(())
    }

    /// Reference profiles with this config's overrides applied.
    pub fn protocol_table(&self) -> ProtocolTable {
        let mut table = ProtocolTable::default();
        for (protocol, profile) in &self.protocols {
            table.set(*protocol, *profile);
        }
        table
    }
}
