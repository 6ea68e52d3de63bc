use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ordered_float::OrderedFloat;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, info, warn};

use crate::collab::Signer;
use crate::config::P2PConfig;
use crate::error::{Error, Result};
use crate::filter::ReplicaFilter;
use crate::index::VectorIndex;
use crate::model::DatabaseRecord;
use crate::vector::{Generator, LazyVector};
use super::codec;
use super::network::PeerTransport;
use super::types::{
    unix_now, DataTransferMessage, DiscoveryKind, PeerDiscoveryMessage, PeerInfo, QueryRequest,
    CONNECT_THRESHOLD, PEER_SIMILARITY_DIMENSIONS, QUERY_DIMENSIONS, QUERY_THRESHOLD,
    REPLICATION_FACTOR, REPUTATION_DECAY, WIRE_DIMENSIONS,
};

/// Routing-vector dimensions sampled when deciding whether to connect a candidate.
const ROUTING_SAMPLE_DIMENSIONS: usize = 5;
/// Sizing of the inbound replica filter.
const REPLICA_FILTER_ITEMS: usize = 100_000;
const REPLICA_FILTER_FP_RATE: f64 = 0.01;

struct Inbox {
    discovery: mpsc::Receiver<PeerDiscoveryMessage>,
    data: mpsc::Receiver<DataTransferMessage>,
}

/// A network peer holding a replicated slice of the vector database.
///
/// The local database, the peer table and the reputation table sit behind
/// independent locks and no operation holds two of them at once, so
/// cross-structure invariants (a stored record reaching its replicas, a
/// peer having a reputation entry) only hold eventually.
pub struct P2PNode {
    node_id: String,
    address: String,
    routing_vector: LazyVector,
    peers: RwLock<HashMap<String, PeerInfo>>,
    local_database: VectorIndex,
    reputation: RwLock<HashMap<String, f64>>,
    seen: Mutex<ReplicaFilter>,
    /// Payload digest of the last replica applied per record id.
    applied: RwLock<HashMap<String, u64>>,
    transport: Arc<dyn PeerTransport>,
    signer: Option<Arc<dyn Signer>>,
    settings: P2PConfig,
    discovery_tx: mpsc::Sender<PeerDiscoveryMessage>,
    data_tx: mpsc::Sender<DataTransferMessage>,
    inbox: Mutex<Option<Inbox>>,
}

impl fmt::Debug for P2PNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("P2PNode")
        .field("node_id", &self.node_id)
        .field("address", &self.address)
        .field("peer_count", &self.peer_count())
        .field("records", &self.local_database.len())
        .finish()
    }
}

/// Hex digest of the current time and a random salt.
pub fn generate_node_id() -> String {
    let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_nanos())
    .unwrap_or_default();
    let salt: i64 = rand::random();
    format!("{:016x}", seahash::hash(format!("{nanos}{salt}").as_bytes()))
}

/// Deterministic per-node generator with values in `[0, 1]`.
pub fn routing_generator(node_id: &str) -> Generator {
    let node_id = node_id.to_string();
    Arc::new(move |d| seahash::hash(format!("{node_id}{d}").as_bytes()) as f64 / u64::MAX as f64)
}

impl P2PNode {
    pub fn new(settings: P2PConfig, transport: Arc<dyn PeerTransport>) -> Self {
        let node_id = generate_node_id();
        let capacity = settings.queue_capacity.max(1);
        let (discovery_tx, discovery_rx) = mpsc::channel(capacity);
        let (data_tx, data_rx) = mpsc::channel(capacity);

        Self {
            routing_vector: LazyVector::from_generator(routing_generator(&node_id)),
            node_id,
            address: settings.listen_addr(),
            peers: RwLock::new(HashMap::new()),
            local_database: VectorIndex::new(),
            reputation: RwLock::new(HashMap::new()),
            seen: Mutex::new(ReplicaFilter::new(REPLICA_FILTER_ITEMS, REPLICA_FILTER_FP_RATE)),
            applied: RwLock::new(HashMap::new()),
            transport,
            signer: None,
            settings,
            discovery_tx,
            data_tx,
            inbox: Mutex::new(Some(Inbox { discovery: discovery_rx, data: data_rx })),
        }
    }

    /// Signs every outgoing replication payload with `signer`.
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn routing_vector(&self) -> &LazyVector {
        &self.routing_vector
    }

    pub fn local_database(&self) -> &VectorIndex {
        &self.local_database
    }

    pub fn settings(&self) -> &P2PConfig {
        &self.settings
    }

    /// Snapshot of the peer table, ordered by node id.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<_> = peers.values().cloned().collect();
        list.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        list
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn reputation_of(&self, node_id: &str) -> Option<f64> {
        let reputation = self.reputation.read().unwrap_or_else(PoisonError::into_inner);
        reputation.get(node_id).copied()
    }

    /// Connects `peer` unless it is already known or is this node.
    /// Seeds its reputation from the peer's advertised value.
    pub fn add_peer(&self, peer: PeerInfo) -> bool {
        if peer.node_id == self.node_id {
            return false;
        }
        let node_id = peer.node_id.clone();
        let advertised = peer.reputation;

        {
            let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
            if peers.contains_key(&node_id) {
                return false;
            }
            peers.insert(node_id.clone(), peer);
        }
        {
            let mut reputation = self.reputation.write().unwrap_or_else(PoisonError::into_inner);
            reputation.entry(node_id.clone()).or_insert(advertised);
        }

        info!(peer = %node_id, "connected to peer");
        true
    }

    /// Average of `1 - |reputation - routing[i]|` over the first
    /// `PEER_SIMILARITY_DIMENSIONS` routing elements.
    pub fn peer_similarity(&self, reputation: f64) -> f64 {
        let routing = self.routing_vector.window(PEER_SIMILARITY_DIMENSIONS);
        let total: f64 = routing.iter().map(|r| 1.0 - (reputation - r).abs()).sum();
        total / PEER_SIMILARITY_DIMENSIONS as f64
    }

    /// Up to `count` peers ranked by `peer_similarity`, ties broken by node id.
    pub fn select_replication_peers(&self, count: usize) -> Vec<PeerInfo> {
        let mut candidates = self.peers();
        let reputation = self
        .reputation
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

        candidates.sort_by_cached_key(|peer| {
            let value = reputation.get(&peer.node_id).copied().unwrap_or(peer.reputation);
            Reverse(OrderedFloat(self.peer_similarity(value)))
        });
        candidates.truncate(count);
        candidates
    }

    /// Queues one replication message per selected peer, then stores the
    /// record locally whatever the outcome. Returns the number of queued
    /// messages. Blocks while the data-transfer queue is full.
    pub async fn store_data(&self, record: DatabaseRecord) -> Result<usize> {
        if record.id.is_empty() {
            return Err(Error::InvalidInput("record id is empty".into()));
        }

        let payload = codec::encode_record(&record)?;
        let digest = codec::payload_digest(&payload);
        let (signer, signature) = match &self.signer {
            Some(s) => (Some(s.public_key()), Some(s.sign(&payload))),
            None => (None, None),
        };

        let targets = self.select_replication_peers(REPLICATION_FACTOR);
        let mut queued = 0;
        let mut failure = None;
        for peer in &targets {
            let msg = DataTransferMessage {
                sender_id: self.node_id.clone(),
                recipient_id: peer.node_id.clone(),
                data_id: record.id.clone(),
                vector_hash: digest,
                payload: payload.clone(),
                timestamp: unix_now(),
                signer: signer.clone(),
                signature: signature.clone(),
            };
            if self.data_tx.send(msg).await.is_err() {
                failure = Some(Error::ReplicationFailure(format!(
                    "data-transfer queue closed before reaching {}",
                    peer.node_id
                )));
                break;
            }
            queued += 1;
        }

        let id = record.id.clone();
        self.local_database.insert(record)?;
        self.mark_applied(&id, digest);
        debug!(record = %id, replicas = queued, "record stored");

        match failure {
            Some(e) => Err(e),
            None => Ok(queued),
        }
    }

    /// Local similarity matches merged with every peer's answer. Peers that
    /// fail to answer are logged and skipped.
    pub async fn query_data(&self, vector: &LazyVector) -> Vec<DatabaseRecord> {
        let mut results = self
        .local_database
        .advanced_query(QUERY_THRESHOLD, vector, QUERY_DIMENSIONS);

        let request = QueryRequest::Similar {
            sender_id: self.node_id.clone(),
            elements: vector.window(WIRE_DIMENSIONS),
        };
        results.extend(self.query_peers(request).await);
        results
    }

    /// Every record held locally or by any peer.
    pub async fn query_all(&self) -> Vec<DatabaseRecord> {
        let mut results = self.local_database.records();
        let request = QueryRequest::Wildcard { sender_id: self.node_id.clone() };
        results.extend(self.query_peers(request).await);
        results
    }

    async fn query_peers(&self, request: QueryRequest) -> Vec<DatabaseRecord> {
        let mut results = Vec::new();
        for peer in self.peers() {
            match self.transport.query(&peer, request.clone()).await {
                Ok(records) => results.extend(records),
                Err(e) => warn!(peer = %peer.node_id, error = %e, "peer query failed"),
            }
        }
        results
    }

    /// Answers a peer's query from the local database only.
    pub fn answer_query(&self, request: &QueryRequest) -> Vec<DatabaseRecord> {
        match request {
            QueryRequest::Similar { elements, .. } => {
                let query = LazyVector::from_elements(elements.clone());
                self.local_database.advanced_query(QUERY_THRESHOLD, &query, QUERY_DIMENSIONS)
            }
            QueryRequest::Wildcard { .. } => self.local_database.records(),
        }
    }

    /// Applies an inbound replica. Returns `false` when the identical
    /// replica is already stored.
    pub fn receive_replica(&self, msg: &DataTransferMessage) -> Result<bool> {
        if codec::payload_digest(&msg.payload) != msg.vector_hash {
            return Err(Error::InvalidInput(format!("digest mismatch for {}", msg.data_id)));
        }

        // The filter only rules replicas out; a hit is confirmed against the
        // digest of what is actually stored under that id.
        let maybe_seen = self
        .seen
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .maybe_seen(&msg.data_id, msg.vector_hash);
        if maybe_seen && self.applied_digest(&msg.data_id) == Some(msg.vector_hash) {
            debug!(record = %msg.data_id, from = %msg.sender_id, "duplicate replica skipped");
            return Ok(false);
        }

        let record = codec::decode_record(&msg.payload)?;
        if record.id != msg.data_id {
            return Err(Error::InvalidInput(format!(
                "payload id {} does not match {}",
                record.id, msg.data_id
            )));
        }
        self.local_database.insert(record)?;
        self.mark_applied(&msg.data_id, msg.vector_hash);

        debug!(record = %msg.data_id, from = %msg.sender_id, "replica stored");
        Ok(true)
    }

    fn applied_digest(&self, id: &str) -> Option<u64> {
        let applied = self.applied.read().unwrap_or_else(PoisonError::into_inner);
        applied.get(id).copied()
    }

    fn mark_applied(&self, id: &str, digest: u64) {
        self.seen
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .mark_seen(id, digest);
        self.applied
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(id.to_string(), digest);
    }

    /// Queues an inbound discovery message for the dispatcher.
    pub async fn receive_discovery(&self, msg: PeerDiscoveryMessage) -> Result<()> {
        self.discovery_tx
        .send(msg)
        .await
        .map_err(|_| Error::ReplicationFailure("discovery queue closed".into()))
    }

    fn synthesize_candidate(&self) -> PeerInfo {
        let mut rng = rand::thread_rng();
        let address = format!("192.168.1.{}", rng.gen_range(0..255));
        let reputation = self
        .routing_vector
        .get_element(rng.gen_range(0..PEER_SIMILARITY_DIMENSIONS));
        PeerInfo::new(generate_node_id(), address, reputation)
    }

    /// Connect test: routing value at a random sampled dimension within
    /// `CONNECT_THRESHOLD` of the candidate's reputation.
    pub fn evaluate_candidate(&self, candidate: &PeerInfo) -> bool {
        let dimension = rand::thread_rng().gen_range(0..ROUTING_SAMPLE_DIMENSIONS);
        let routing_value = self.routing_vector.get_element(dimension);
        (routing_value - candidate.reputation).abs() < CONNECT_THRESHOLD
    }

    fn hello(&self, kind: DiscoveryKind) -> PeerDiscoveryMessage {
        let dimension = rand::thread_rng().gen_range(0..PEER_SIMILARITY_DIMENSIONS);
        PeerDiscoveryMessage {
            sender_id: self.node_id.clone(),
            sender_addr: self.address.clone(),
            kind,
            reputation: self.routing_vector.get_element(dimension),
        }
    }

    /// One discovery cycle. Returns the newly connected peer, if any.
    pub async fn discover_once(&self) -> Result<Option<PeerInfo>> {
        let candidate = match self.transport.candidate(&self.node_id).await {
            Some(peer) => peer,
            None => self.synthesize_candidate(),
        };

        if !self.evaluate_candidate(&candidate) || !self.add_peer(candidate.clone()) {
            return Ok(None);
        }

        let hello = self.hello(DiscoveryKind::Discover);
        self.transport.announce(&candidate, hello).await?;
        Ok(Some(candidate))
    }

    fn process_discovery(&self, msg: PeerDiscoveryMessage) {
        if msg.sender_id == self.node_id {
            return;
        }

        let refreshed = {
            let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
            match peers.get_mut(&msg.sender_id) {
                Some(peer) => {
                    peer.last_seen = unix_now();
                    peer.address = msg.sender_addr.clone();
                    true
                }
                None => false,
            }
        };
        let peer = PeerInfo::new(msg.sender_id.clone(), msg.sender_addr.clone(), msg.reputation);
        if !refreshed {
            self.add_peer(peer.clone());
        }

        // The reply may wait on the sender's full discovery queue, so it
        // must not hold up this node's dispatcher.
        if msg.kind == DiscoveryKind::Discover {
            let reply = self.hello(DiscoveryKind::Announce);
            let transport = self.transport.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.announce(&peer, reply).await {
                    warn!(peer = %peer.node_id, error = %e, "announce reply failed");
                }
            });
        }
    }

    async fn process_data(&self, msg: DataTransferMessage) {
        let recipient = msg.recipient_id.clone();
        let data_id = msg.data_id.clone();
        if let Err(e) = self.transport.deliver(msg).await {
            warn!(peer = %recipient, record = %data_id, error = %e, "replication delivery failed");
        }
    }

    /// Multiplies every tracked reputation by `REPUTATION_DECAY`.
    pub fn decay_reputation(&self) -> usize {
        let mut reputation = self.reputation.write().unwrap_or_else(PoisonError::into_inner);
        for value in reputation.values_mut() {
            *value *= REPUTATION_DECAY;
        }
        reputation.len()
    }

    /// Drops peers last seen more than `ttl_secs` before `now`.
    pub fn evict_stale_peers(&self, ttl_secs: u64, now: u64) -> Vec<String> {
        let evicted: Vec<String> = {
            let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
            let stale: Vec<String> = peers
            .values()
            .filter(|p| now.saturating_sub(p.last_seen) > ttl_secs)
            .map(|p| p.node_id.clone())
            .collect();
            for id in &stale {
                peers.remove(id);
            }
            stale
        };

        if !evicted.is_empty() {
            let mut reputation = self.reputation.write().unwrap_or_else(PoisonError::into_inner);
            for id in &evicted {
                reputation.remove(id);
            }
            info!(count = evicted.len(), "evicted stale peers");
        }
        evicted
    }

    /// Spawns the discovery, dispatch and reputation tasks. Each stops once
    /// `shutdown` flips to `true` or its sender is dropped.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>> {
        let inbox = self
        .inbox
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .ok_or_else(|| Error::InvalidInput(format!("node {} already started", self.node_id)))?;

        info!(node = %self.node_id, addr = %self.address, "starting p2p node");

        Ok(vec![
            tokio::spawn(self.clone().run_discovery(shutdown.clone())),
            tokio::spawn(self.clone().run_dispatch(inbox, shutdown.clone())),
            tokio::spawn(self.clone().run_reputation(shutdown)),
        ])
    }

    async fn run_discovery(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        debug!(node = %self.node_id, "discovery task started");
        while !*shutdown.borrow() {
            match self.discover_once().await {
                Ok(Some(peer)) => debug!(peer = %peer.node_id, "discovered peer"),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "discovery cycle failed"),
            }

            let max_delay = self.settings.max_discovery_delay_secs.max(1);
            let delay = Duration::from_secs(rand::thread_rng().gen_range(0..max_delay));
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(delay) => {}
            }
        }
        debug!(node = %self.node_id, "discovery task stopped");
    }

    async fn run_dispatch(self: Arc<Self>, mut inbox: Inbox, mut shutdown: watch::Receiver<bool>) {
        debug!(node = %self.node_id, "dispatch task started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(msg) = inbox.discovery.recv() => self.process_discovery(msg),
                Some(msg) = inbox.data.recv() => self.process_data(msg).await,
                else => break,
            }
        }
        debug!(node = %self.node_id, "dispatch task stopped");
    }

    async fn run_reputation(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.settings.reputation_decay_interval().max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let decayed = self.decay_reputation();
                    let evicted = match self.settings.peer_ttl_secs {
                        Some(ttl) => self.evict_stale_peers(ttl, unix_now()).len(),
                        None => 0,
                    };
                    debug!(decayed, evicted, "reputation decay tick");
                }
            }
        }
    }
}
