use crate::model::{Chain, Transaction};
use crate::protocol::ProtocolTable;
use crate::vector;

// Route weights; they sum to 1.0
pub const SPEED_WEIGHT: f64 = 0.30;
pub const FINALITY_WEIGHT: f64 = 0.25;
pub const COST_WEIGHT: f64 = 0.20;
pub const SIMILARITY_WEIGHT: f64 = 0.25;

/// Dimension window for chain/transaction similarity.
pub const ROUTE_DIMENSIONS: usize = 50;

/// Per-(chain, transaction) desirability inputs. Higher is better for all four.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RouteMetrics {
    pub speed: f64,
    pub finality: f64,
    pub cost: f64,
    pub similarity: f64,
}

pub fn evaluate_route(metrics: &RouteMetrics) -> f64 {
    metrics.speed * SPEED_WEIGHT
    + metrics.finality * FINALITY_WEIGHT
    + metrics.cost * COST_WEIGHT
    + metrics.similarity * SIMILARITY_WEIGHT
}

/// Scores candidate chains for a transaction from protocol profiles and
/// state-vector similarity.
#[derive(Debug, Clone, Default)]
pub struct RouteScorer {
    protocols: ProtocolTable,
}

impl RouteScorer {
    pub fn new(protocols: ProtocolTable) -> Self {
        Self { protocols }
    }

    pub fn protocols(&self) -> &ProtocolTable {
        &self.protocols
    }

    /// All-zero metrics when the chain's protocol has no profile.
    pub fn route_metrics(&self, chain: &Chain, tx: &Transaction) -> RouteMetrics {
        let Some(config) = self.protocols.get(chain.protocol) else {
            return RouteMetrics::default();
        };

        RouteMetrics {
            speed: (1.0 + config.tps).ln() / config.block_time,
            finality: 1.0 / config.finality_time,
            cost: 1.0 - config.cost_weight,
            similarity: vector::similarity(&chain.state_vector, &tx.state_vector, ROUTE_DIMENSIONS),
        }
    }

    pub fn score(&self, chain: &Chain, tx: &Transaction) -> f64 {
        let score = evaluate_route(&self.route_metrics(chain, tx));
        if score.is_nan() { f64::NEG_INFINITY } else { score }
    }

    /// Single-hop selection: the highest-scoring chain. Ties go to the
    /// earliest candidate, so callers control determinism through order.
    pub fn find_optimal_route<'a>(&self, chains: &'a [Chain], tx: &Transaction) -> Option<&'a Chain> {
        let mut best: Option<(&Chain, f64)> = None;
        for chain in chains {
            let score = self.score(chain, tx);
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((chain, score)),
            }
        }
        best.map(|(chain, _)| chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Protocol;
    use crate::vector::LazyVector;

    fn chain(id: &str, protocol: Protocol) -> Chain {
        Chain::new(id, protocol, "", LazyVector::default())
    }

    fn tx() -> Transaction {
        Transaction::new("tx", "a", "b", LazyVector::default(), 0.5)
    }

    #[test]
    fn weights_sum_to_one() {
        let total = SPEED_WEIGHT + FINALITY_WEIGHT + COST_WEIGHT + SIMILARITY_WEIGHT;
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn metrics_follow_protocol_profile() {
        let scorer = RouteScorer::default();
        let m = scorer.route_metrics(&chain("eth-1", Protocol::Eth), &tx());

        assert!((m.speed - 16f64.ln() / 12.0).abs() < 1e-12);
        assert!((m.finality - 1.0 / 180.0).abs() < 1e-12);
        assert!((m.cost - 0.2).abs() < 1e-12);
        assert!((m.similarity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_protocol_scores_zero() {
        let scorer = RouteScorer::default();
        let m = scorer.route_metrics(&chain("x", Protocol::Unknown), &tx());
        assert_eq!(m, RouteMetrics::default());
        assert_eq!(evaluate_route(&m), 0.0);
    }

    #[test]
    fn picks_highest_score() {
        let scorer = RouteScorer::default();
        let chains = vec![
            chain("btc-1", Protocol::Btc),
            chain("sol-1", Protocol::Sol),
            chain("eth-1", Protocol::Eth),
        ];
        let best = scorer.find_optimal_route(&chains, &tx()).unwrap();
        assert_eq!(best.id, "sol-1");
    }

    #[test]
    fn ties_resolve_to_first_candidate() {
        let scorer = RouteScorer::default();
        let chains = vec![chain("dot-a", Protocol::Dot), chain("dot-b", Protocol::Dot)];
        assert_eq!(scorer.find_optimal_route(&chains, &tx()).unwrap().id, "dot-a");

        let unknown = vec![chain("u1", Protocol::Unknown), chain("u2", Protocol::Unknown)];
        assert_eq!(scorer.find_optimal_route(&unknown, &tx()).unwrap().id, "u1");

        assert!(scorer.find_optimal_route(&[], &tx()).is_none());
    }
}
