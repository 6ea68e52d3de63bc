use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::index::VectorIndex;
use crate::protocol::Protocol;
use crate::vector::LazyVector;

/// Free-form record annotations.
pub type Metadata = HashMap<String, Value>;

// Metadata keys and record types shared by the router and the cluster layer
pub const META_TYPE: &str = "type";
pub const META_PROTOCOL: &str = "protocol";
pub const META_ENDPOINT: &str = "endpoint";
pub const META_PEER_ID: &str = "peer_id";
pub const META_FROM_CHAIN: &str = "fromChain";
pub const META_TO_CHAIN: &str = "toChain";
pub const META_CHAIN: &str = "chain";
pub const META_STATUS: &str = "status";

pub const TYPE_CHAIN_REGISTRATION: &str = "chain_registration";
pub const TYPE_TRANSACTION: &str = "transaction";
pub const TYPE_PEER_TRANSACTION: &str = "peer_transaction";

/// The unit stored in a `VectorIndex`.
#[derive(Debug, Clone, Default)]
pub struct DatabaseRecord {
    pub id: String,
    pub metadata: Metadata,
    pub vector: LazyVector,
}

impl DatabaseRecord {
    pub fn new(id: impl Into<String>, vector: LazyVector) -> Self {
        Self {
            id: id.into(),
            metadata: Metadata::new(),
            vector,
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn record_type(&self) -> Option<&str> {
        self.meta_str(META_TYPE)
    }
}

/// An external blockchain network known to the router.
#[derive(Debug, Clone)]
pub struct Chain {
    pub id: String,
    pub protocol: Protocol,
    pub endpoint: String,
    pub state_vector: LazyVector,
    pub(crate) transaction_pool: Arc<VectorIndex>,
}

impl Chain {
    pub fn new(
        id: impl Into<String>,
        protocol: Protocol,
        endpoint: impl Into<String>,
        state_vector: LazyVector,
    ) -> Self {
        Self {
            id: id.into(),
            protocol,
            endpoint: endpoint.into(),
            state_vector,
            transaction_pool: Arc::new(VectorIndex::new()),
        }
    }

    pub fn transaction_pool(&self) -> &VectorIndex {
        &self.transaction_pool
    }

    /// Record announcing this chain to the rest of the network.
    pub fn registration_record(&self) -> DatabaseRecord {
        DatabaseRecord::new(self.id.clone(), self.state_vector.clone())
        .with_meta(META_PROTOCOL, self.protocol.tag())
        .with_meta(META_ENDPOINT, self.endpoint.clone())
    }

    /// Rebuilds a chain from a `chain_registration` record.
    pub fn from_registration(record: &DatabaseRecord) -> Option<Self> {
        if record.record_type() != Some(TYPE_CHAIN_REGISTRATION) {
            return None;
        }
        let protocol = Protocol::from_tag(record.meta_str(META_PROTOCOL).unwrap_or_default());
        let endpoint = record.meta_str(META_ENDPOINT).unwrap_or_default();
        Some(Self::new(record.id.clone(), protocol, endpoint, record.vector.clone()))
    }
}

/// A cross-chain transfer request. Consumed once by the router.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: String,
    pub from_chain: String,
    pub to_chain: String,
    pub payload: Vec<u8>,
    pub state_vector: LazyVector,
    pub similarity_threshold: f64,
}

impl Transaction {
    pub fn new(
        id: impl Into<String>,
        from_chain: impl Into<String>,
        to_chain: impl Into<String>,
        state_vector: LazyVector,
        similarity_threshold: f64,
    ) -> Self {
        Self {
            id: id.into(),
            from_chain: from_chain.into(),
            to_chain: to_chain.into(),
            payload: Vec::new(),
            state_vector,
            similarity_threshold,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn record(&self) -> DatabaseRecord {
        DatabaseRecord::new(self.id.clone(), self.state_vector.clone())
        .with_meta(META_FROM_CHAIN, self.from_chain.clone())
        .with_meta(META_TO_CHAIN, self.to_chain.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_round_trips_through_metadata() {
        let chain = Chain::new("eth-1", Protocol::Eth, "http://eth", LazyVector::default());
        let record = chain
        .registration_record()
        .with_meta(META_TYPE, TYPE_CHAIN_REGISTRATION);

        let rebuilt = Chain::from_registration(&record).unwrap();
        assert_eq!(rebuilt.id, "eth-1");
        assert_eq!(rebuilt.protocol, Protocol::Eth);
        assert_eq!(rebuilt.endpoint, "http://eth");
    }

    #[test]
    fn other_record_types_are_not_chains() {
        let record = DatabaseRecord::new("tx", LazyVector::default())
        .with_meta(META_TYPE, TYPE_TRANSACTION);
        assert!(Chain::from_registration(&record).is_none());
        assert!(Chain::from_registration(&DatabaseRecord::default()).is_none());
    }
}
