use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::vector::{self, Generator};

/// Closed set of known chain protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Btc,
    Eth,
    Sol,
    Dot,
    Unknown,
}

impl Protocol {
    /// Maps a protocol tag or a well-known chain name onto a protocol.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "btc" | "bitcoin" => Protocol::Btc,
            "eth" | "ethereum" => Protocol::Eth,
            "sol" | "solana" => Protocol::Sol,
            "dot" | "polkadot" => Protocol::Dot,
            _ => Protocol::Unknown,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Protocol::Btc => "btc",
            Protocol::Eth => "eth",
            Protocol::Sol => "sol",
            Protocol::Dot => "dot",
            Protocol::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Static performance profile of a protocol. Times are in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub block_time: f64,
    pub confirmation_time: f64,
    pub tps: f64,
    pub finality_time: f64,
    pub cost_weight: f64,
}

// Normalization bounds for protocol-shaped generators
const MAX_TPS: f64 = 65_000.0;
const MAX_FINALITY: f64 = 3_600.0;

#[derive(Debug, Clone)]
pub struct ProtocolTable {
    configs: HashMap<Protocol, ProtocolConfig>,
}

impl Default for ProtocolTable {
    fn default() -> Self {
        let mut configs = HashMap::new();
        configs.insert(Protocol::Btc, ProtocolConfig {
            block_time: 600.0,       // 10 minutes
            confirmation_time: 3600.0,
            tps: 7.0,
            finality_time: 3600.0,
            cost_weight: 1.0,
        });
        configs.insert(Protocol::Eth, ProtocolConfig {
            block_time: 12.0,
            confirmation_time: 180.0,
            tps: 15.0,
            finality_time: 180.0,
            cost_weight: 0.8,
        });
        configs.insert(Protocol::Sol, ProtocolConfig {
            block_time: 0.4,
            confirmation_time: 2.0,
            tps: 65000.0,
            finality_time: 2.0,
            cost_weight: 0.1,
        });
        configs.insert(Protocol::Dot, ProtocolConfig {
            block_time: 6.0,
            confirmation_time: 30.0,
            tps: 1000.0,
            finality_time: 30.0,
            cost_weight: 0.5,
        });
        Self { configs }
    }
}

impl ProtocolTable {
    pub fn get(&self, protocol: Protocol) -> Option<&ProtocolConfig> {
        self.configs.get(&protocol)
    }

    /// Overrides (or adds) the profile for `protocol`. `Unknown` is never stored.
    pub fn set(&mut self, protocol: Protocol, config: ProtocolConfig) {
        if protocol != Protocol::Unknown {
            self.configs.insert(protocol, config);
        }
    }

    /// State-vector generator shaped by the protocol profile. Unknown
    /// protocols get the plain fallback generator.
    pub fn generator(&self, protocol: Protocol) -> Generator {
        let Some(config) = self.get(protocol).copied() else {
            return vector::default_generator();
        };

        let speed = (1.0 + config.tps).ln() / (1.0 + MAX_TPS).ln();
        let finality = 1.0 - config.finality_time / MAX_FINALITY;
        let cost = 1.0 - config.cost_weight;
        let scale = (speed + finality + cost) / 3.0;

        Arc::new(move |d| vector::fallback_element(d) * scale)
    }
}
