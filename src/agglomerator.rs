use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::model::{Chain, Transaction};
use crate::router::{RouteScorer, ROUTE_DIMENSIONS};

/// Registry of chains plus a global index of chain and transaction vectors.
pub struct Agglomerator {
    chains: RwLock<HashMap<String, Chain>>,
    vector_index: VectorIndex,
    scorer: RouteScorer,
}

impl fmt::Debug for Agglomerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agglomerator")
        .field("chain_count", &self.chain_count())
        .field("indexed", &self.vector_index.len())
        .finish()
    }
}

impl Default for Agglomerator {
    fn default() -> Self {
        Self::new(RouteScorer::default())
    }
}

impl Agglomerator {
    pub fn new(scorer: RouteScorer) -> Self {
        Self {
            chains: RwLock::new(HashMap::new()),
            vector_index: VectorIndex::new(),
            scorer,
        }
    }

    pub fn scorer(&self) -> &RouteScorer {
        &self.scorer
    }

    pub fn vector_index(&self) -> &VectorIndex {
        &self.vector_index
    }

    /// Registers `chain` with a fresh transaction pool. Re-registering an
    /// id replaces the previous chain.
    pub fn register_chain(&self, mut chain: Chain) -> Result<()> {
        if chain.id.is_empty() {
            return Err(Error::InvalidInput("chain id is empty".into()));
        }

        let mut chains = self.chains.write().unwrap_or_else(PoisonError::into_inner);
        chain.transaction_pool = Arc::new(VectorIndex::new());

        let record = chain.registration_record();
        info!(chain = %chain.id, protocol = %chain.protocol, "registering chain");
        chains.insert(chain.id.clone(), chain);

        self.vector_index.insert(record)
    }

    /// Routes `tx` between its endpoint chains.
    ///
    /// Fails with `NoRouteFound` when no indexed vector meets the
    /// transaction threshold. The matched candidates are not checked
    /// against `from_chain`/`to_chain`; those are resolved separately and
    /// fail with `ChainNotFound`. The transaction record is indexed
    /// globally before the endpoint lookup.
    pub fn process_transaction(&self, tx: &Transaction) -> Result<()> {
        if tx.id.is_empty() {
            return Err(Error::InvalidInput("transaction id is empty".into()));
        }

        let chains = self.chains.read().unwrap_or_else(PoisonError::into_inner);

        let matches = self.vector_index.advanced_query(
            tx.similarity_threshold,
            &tx.state_vector,
            ROUTE_DIMENSIONS,
        );
        if matches.is_empty() {
            return Err(Error::NoRouteFound);
        }
        debug!(tx = %tx.id, candidates = matches.len(), "similar vectors found");

        let record = tx.record();
        self.vector_index.insert(record.clone())?;

        let from = chains
        .get(&tx.from_chain)
        .ok_or_else(|| Error::ChainNotFound(tx.from_chain.clone()))?;
        let to = chains
        .get(&tx.to_chain)
        .ok_or_else(|| Error::ChainNotFound(tx.to_chain.clone()))?;

        from.transaction_pool.insert(record.clone())?;
        to.transaction_pool.insert(record)?;

        info!(tx = %tx.id, from = %tx.from_chain, to = %tx.to_chain, "transaction routed");
        Ok(())
    }

    /// Snapshot of registered chains, ordered by id.
    pub fn list_chains(&self) -> Vec<Chain> {
        let chains = self.chains.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<_> = chains.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn get_chain(&self, id: &str) -> Result<Chain> {
        let chains = self.chains.read().unwrap_or_else(PoisonError::into_inner);
        chains
        .get(id)
        .cloned()
        .ok_or_else(|| Error::ChainNotFound(id.to_string()))
    }

    pub fn chain_count(&self) -> usize {
        self.chains.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{META_ENDPOINT, META_PROTOCOL};
    use crate::protocol::Protocol;
    use crate::vector::LazyVector;

    fn registered(ids: &[(&str, Protocol)]) -> Agglomerator {
        let agg = Agglomerator::default();
        for (id, protocol) in ids {
            agg.register_chain(Chain::new(*id, *protocol, format!("http://{id}"), LazyVector::default()))
            .unwrap();
        }
        agg
    }

    #[test]
    fn routes_into_both_pools() {
        let agg = registered(&[("eth-1", Protocol::Eth), ("btc-1", Protocol::Btc)]);
        let tx = Transaction::new("tx1", "eth-1", "btc-1", LazyVector::default(), 0.5);

        agg.process_transaction(&tx).unwrap();

        assert!(agg.get_chain("eth-1").unwrap().transaction_pool().contains("tx1"));
        assert!(agg.get_chain("btc-1").unwrap().transaction_pool().contains("tx1"));
        assert!(agg.vector_index().contains("tx1"));
    }

    #[test]
    fn unknown_source_chain_fails_fast() {
        let agg = registered(&[("eth-1", Protocol::Eth)]);
        let tx = Transaction::new("tx2", "ghost", "eth-1", LazyVector::default(), 0.5);

        assert_eq!(
            agg.process_transaction(&tx),
            Err(Error::ChainNotFound("ghost".into()))
        );
        assert!(agg.get_chain("eth-1").unwrap().transaction_pool().is_empty());
    }

    #[test]
    fn unknown_destination_chain_fails() {
        let agg = registered(&[("eth-1", Protocol::Eth)]);
        let tx = Transaction::new("tx3", "eth-1", "ghost", LazyVector::default(), 0.5);

        assert_eq!(
            agg.process_transaction(&tx),
            Err(Error::ChainNotFound("ghost".into()))
        );
    }

    #[test]
    fn orthogonal_vectors_have_no_route() {
        let agg = Agglomerator::default();
        for id in ["a", "b"] {
            let alternating = LazyVector::new(|d| if d % 2 == 0 { 1.0 } else { -1.0 });
            agg.register_chain(Chain::new(id, Protocol::Eth, "", alternating)).unwrap();
        }

        let paired = LazyVector::new(|d| if d % 4 < 2 { 1.0 } else { -1.0 });
        let tx = Transaction::new("tx4", "a", "b", paired, 0.99);

        assert_eq!(agg.process_transaction(&tx), Err(Error::NoRouteFound));
        assert!(!agg.vector_index().contains("tx4"));
    }

    #[test]
    fn reregistration_replaces_chain_and_pool() {
        let agg = registered(&[("eth-1", Protocol::Eth), ("btc-1", Protocol::Btc)]);
        let tx = Transaction::new("tx5", "eth-1", "btc-1", LazyVector::default(), 0.5);
        agg.process_transaction(&tx).unwrap();

        agg.register_chain(Chain::new("eth-1", Protocol::Sol, "http://new", LazyVector::default()))
        .unwrap();

        let chain = agg.get_chain("eth-1").unwrap();
        assert_eq!(chain.protocol, Protocol::Sol);
        assert!(chain.transaction_pool().is_empty());
        assert_eq!(agg.chain_count(), 2);
        assert_eq!(
            agg.vector_index().get("eth-1").unwrap().meta_str(META_PROTOCOL),
            Some("sol")
        );
    }

    #[test]
    fn list_is_sorted_and_get_reports_missing() {
        let agg = registered(&[("sol-1", Protocol::Sol), ("btc-1", Protocol::Btc)]);
        let ids: Vec<_> = agg.list_chains().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["btc-1", "sol-1"]);
        assert_eq!(
            agg.vector_index().get("btc-1").unwrap().meta_str(META_ENDPOINT),
            Some("http://btc-1")
        );
        assert!(matches!(agg.get_chain("nope"), Err(Error::ChainNotFound(_))));
    }
}
