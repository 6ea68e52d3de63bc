use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use rand::seq::IteratorRandom;
use rand::Rng;

use crate::error::{Error, Result};
use crate::model::DatabaseRecord;
use super::codec;
use super::node::P2PNode;
use super::types::{DataTransferMessage, PeerDiscoveryMessage, PeerInfo, QueryRequest, PEER_SIMILARITY_DIMENSIONS};

/// How a node reaches the rest of the network.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Hands a replication message to its recipient.
    async fn deliver(&self, msg: DataTransferMessage) -> Result<()>;

    /// Runs `request` on `peer` and returns copies of the matching records.
    async fn query(&self, peer: &PeerInfo, request: QueryRequest) -> Result<Vec<DatabaseRecord>>;

    /// Tells `peer` about the local node.
    async fn announce(&self, peer: &PeerInfo, msg: PeerDiscoveryMessage) -> Result<()>;

    /// Next discovery candidate. `None` lets the node synthesize one.
    async fn candidate(&self, _local_id: &str) -> Option<PeerInfo> {
        None
    }
}

/// Transport that reaches nobody: sends succeed without effect and
/// remote queries come back empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackTransport;

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn deliver(&self, _msg: DataTransferMessage) -> Result<()> {
        Ok(())
    }

    async fn query(&self, _peer: &PeerInfo, _request: QueryRequest) -> Result<Vec<DatabaseRecord>> {
        Ok(Vec::new())
    }

    async fn announce(&self, _peer: &PeerInfo, _msg: PeerDiscoveryMessage) -> Result<()> {
        Ok(())
    }
}

/// In-process network joining several nodes. Every exchange goes through
/// the wire codec, so nodes only ever see copies of each other's records.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<String, Weak<P2PNode>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn join(&self, node: &Arc<P2PNode>) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes.insert(node.node_id().to_string(), Arc::downgrade(node));
    }

    pub fn leave(&self, node_id: &str) {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        nodes.remove(node_id);
    }

    pub fn member_count(&self) -> usize {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn lookup(&self, node_id: &str) -> Result<Arc<P2PNode>> {
        let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
        nodes
        .get(node_id)
        .and_then(Weak::upgrade)
        .ok_or_else(|| Error::ReplicationFailure(format!("peer {node_id} unreachable")))
    }
}

#[async_trait]
impl PeerTransport for MemoryNetwork {
    async fn deliver(&self, msg: DataTransferMessage) -> Result<()> {
        let recipient = self.lookup(&msg.recipient_id)?;
        recipient.receive_replica(&msg)?;
        Ok(())
    }

    async fn query(&self, peer: &PeerInfo, request: QueryRequest) -> Result<Vec<DatabaseRecord>> {
        let target = self.lookup(&peer.node_id)?;
        target
        .answer_query(&request)
        .iter()
        .map(|record| codec::decode_record(&codec::encode_record(record)?))
        .collect()
    }

    async fn announce(&self, peer: &PeerInfo, msg: PeerDiscoveryMessage) -> Result<()> {
        let target = self.lookup(&peer.node_id)?;
        target.receive_discovery(msg).await
    }

    async fn candidate(&self, local_id: &str) -> Option<PeerInfo> {
        let node = {
            let nodes = self.nodes.read().unwrap_or_else(PoisonError::into_inner);
            let mut rng = rand::thread_rng();
            nodes
            .iter()
            .filter(|(id, _)| id.as_str() != local_id)
            .filter_map(|(_, weak)| weak.upgrade())
            .choose(&mut rng)?
        };

        let dimension = rand::thread_rng().gen_range(0..PEER_SIMILARITY_DIMENSIONS);
        Some(PeerInfo::new(
            node.node_id(),
            node.address(),
            node.routing_vector().get_element(dimension),
        ))
    }
}
