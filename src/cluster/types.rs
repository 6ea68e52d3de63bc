// src/cluster/types.rs
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Peers each stored record is pushed to.
pub const REPLICATION_FACTOR: usize = 3;
/// Dimensions averaged by the peer-selection similarity proxy.
pub const PEER_SIMILARITY_DIMENSIONS: usize = 10;
/// Threshold and window of `QueryData`'s local similarity search.
pub const QUERY_THRESHOLD: f64 = 0.7;
pub const QUERY_DIMENSIONS: usize = 50;
/// Maximum routing-vector distance at which a discovered candidate is connected.
pub const CONNECT_THRESHOLD: f64 = 0.5;
/// Multiplier applied to every tracked reputation on each decay tick.
pub const REPUTATION_DECAY: f64 = 0.9;
/// Vector elements carried by replicated records and query vectors.
pub const WIRE_DIMENSIONS: usize = 50;

pub fn unix_now() -> u64 {
    SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or_default()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: String,
    pub address: String,
    /// Unix seconds.
    pub last_seen: u64,
    /// In `[0, 1]`.
    pub reputation: f64,
}

impl PeerInfo {
    pub fn new(node_id: impl Into<String>, address: impl Into<String>, reputation: f64) -> Self {
        Self {
            node_id: node_id.into(),
            address: address.into(),
            last_seen: unix_now(),
            reputation: reputation.clamp(0.0, 1.0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryKind {
    Discover,
    Announce,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerDiscoveryMessage {
    pub sender_id: String,
    pub sender_addr: String,
    pub kind: DiscoveryKind,
    /// Comparable value the receiver seeds the sender's reputation with.
    pub reputation: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataTransferMessage {
    pub sender_id: String,
    pub recipient_id: String,
    pub data_id: String,
    /// seahash of `payload`.
    pub vector_hash: u64,
    /// rkyv-encoded record, see `cluster::codec`.
    pub payload: Vec<u8>,
    pub timestamp: u64,
    pub signer: Option<String>,
    pub signature: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum QueryRequest {
    /// Records similar to a materialized query window.
    Similar { sender_id: String, elements: Vec<f64> },
    /// Every record the peer holds.
    Wildcard { sender_id: String },
}
