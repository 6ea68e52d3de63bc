use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use crate::agglomerator::Agglomerator;
use crate::error::{Error, Result};
use crate::model::{
    Chain, DatabaseRecord, Transaction, META_CHAIN, META_PEER_ID, META_STATUS, META_TYPE,
    TYPE_CHAIN_REGISTRATION, TYPE_PEER_TRANSACTION, TYPE_TRANSACTION,
};
use super::node::P2PNode;

pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_PENDING: &str = "pending";

/// Extends chain registration and routing across the peer network.
pub struct P2PAgglomerator {
    agglomerator: Arc<Agglomerator>,
    node: Arc<P2PNode>,
    /// Chains announced by other nodes, keyed by announcing peer, then chain id.
    peer_chains: RwLock<HashMap<String, HashMap<String, Chain>>>,
}

impl fmt::Debug for P2PAgglomerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("P2PAgglomerator")
        .field("agglomerator", &self.agglomerator)
        .field("node", &self.node)
        .finish()
    }
}

fn hop_record(tx: &Transaction, chain_id: &str) -> DatabaseRecord {
    DatabaseRecord::new(format!("{}_{}", tx.id, chain_id), tx.state_vector.clone())
    .with_meta(META_CHAIN, chain_id)
}

impl P2PAgglomerator {
    pub fn new(agglomerator: Arc<Agglomerator>, node: Arc<P2PNode>) -> Self {
        Self {
            agglomerator,
            node,
            peer_chains: RwLock::new(HashMap::new()),
        }
    }

    pub fn agglomerator(&self) -> &Arc<Agglomerator> {
        &self.agglomerator
    }

    pub fn node(&self) -> &Arc<P2PNode> {
        &self.node
    }

    /// Registers `chain` locally, then announces it to the network.
    /// A failed announcement leaves the local registration in place.
    pub async fn register_chain(&self, chain: Chain) -> Result<()> {
        self.agglomerator.register_chain(chain.clone())?;
        self.announce_chain(&chain).await?;
        Ok(())
    }

    /// Stores a registration record for `chain` and queues its replicas.
    /// Blocks while the node's data-transfer queue is full.
    pub async fn announce_chain(&self, chain: &Chain) -> Result<usize> {
        let announcement = chain
        .registration_record()
        .with_meta(META_TYPE, TYPE_CHAIN_REGISTRATION)
        .with_meta(META_PEER_ID, self.node.node_id());

        let replicas = self.node.store_data(announcement).await?;
        debug!(chain = %chain.id, replicas, "chain announced");
        Ok(replicas)
    }

    /// Picks the best chain among local and peer-announced candidates and
    /// executes the route hop by hop. Returns the chain ids of the route.
    ///
    /// Every local chain is a candidate whatever its similarity, and
    /// `tx.similarity_threshold` is not consulted; only peer announcements
    /// are filtered, by the fixed query threshold of the peer search.
    ///
    /// The transaction record is replicated before any hop runs. Hops are
    /// applied in order without rollback: a failing hop leaves earlier hops
    /// in place.
    pub async fn process_transaction(&self, tx: &Transaction) -> Result<Vec<String>> {
        if tx.id.is_empty() {
            return Err(Error::InvalidInput("transaction id is empty".into()));
        }

        let matches = self.node.query_data(&tx.state_vector).await;

        let mut candidates = self.agglomerator.list_chains();
        let mut seen: HashSet<String> = candidates.iter().map(|c| c.id.clone()).collect();
        for record in &matches {
            if let Some(chain) = Chain::from_registration(record) {
                if seen.insert(chain.id.clone()) {
                    candidates.push(chain);
                }
            }
        }

        let route: Vec<String> = self
        .agglomerator
        .scorer()
        .find_optimal_route(&candidates, tx)
        .map(|chain| vec![chain.id.clone()])
        .ok_or(Error::NoRouteFound)?;
        debug!(tx = %tx.id, candidates = candidates.len(), route = ?route, "route selected");

        let record = tx.record().with_meta(META_TYPE, TYPE_TRANSACTION);
        self.agglomerator.vector_index().insert(record.clone())?;
        self.node.store_data(record).await?;

        for chain_id in &route {
            self.execute_hop(tx, chain_id).await?;
        }

        info!(tx = %tx.id, route = ?route, "transaction routed over network");
        Ok(route)
    }

    async fn execute_hop(&self, tx: &Transaction, chain_id: &str) -> Result<()> {
        match self.agglomerator.get_chain(chain_id) {
            Ok(chain) => {
                let record = hop_record(tx, chain_id).with_meta(META_STATUS, STATUS_PROCESSING);
                chain.transaction_pool().insert(record)
            }
            Err(_) => {
                let record = hop_record(tx, chain_id)
                .with_meta(META_TYPE, TYPE_PEER_TRANSACTION)
                .with_meta(META_STATUS, STATUS_PENDING);
                self.node.store_data(record).await.map(|_| ())
            }
        }
    }

    /// Pulls every chain registration visible on the network into the
    /// per-peer map. Returns the number of registrations seen.
    pub async fn sync_chains(&self) -> usize {
        let records = self.node.query_all().await;

        let mut peer_chains = self.peer_chains.write().unwrap_or_else(PoisonError::into_inner);
        let mut synced = 0;
        for record in &records {
            let Some(peer_id) = record.meta_str(META_PEER_ID) else {
                continue;
            };
            if peer_id == self.node.node_id() {
                continue;
            }
            if let Some(chain) = Chain::from_registration(record) {
                peer_chains
                .entry(peer_id.to_string())
                .or_default()
                .insert(chain.id.clone(), chain);
                synced += 1;
            }
        }
        synced
    }

    /// Snapshot of synced peer chains, ordered by peer then chain id.
    pub fn peer_chains(&self) -> BTreeMap<String, Vec<Chain>> {
        let peer_chains = self.peer_chains.read().unwrap_or_else(PoisonError::into_inner);
        peer_chains
        .iter()
        .map(|(peer, chains)| {
            let mut list: Vec<_> = chains.values().cloned().collect();
            list.sort_by(|a, b| a.id.cmp(&b.id));
            (peer.clone(), list)
        })
        .collect()
    }

    /// Starts the node's tasks plus the periodic chain sync.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<Vec<JoinHandle<()>>> {
        let mut handles = self.node.start(shutdown.clone())?;
        handles.push(tokio::spawn(self.clone().run_sync(shutdown)));
        Ok(handles)
    }

    async fn run_sync(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.node.settings().chain_sync_interval();
        if period.is_zero() {
            warn!("chain sync disabled: zero interval");
            return;
        }
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let synced = self.sync_chains().await;
                    debug!(synced, "chain sync tick");
                }
            }
        }
    }
}
