//! Peer-to-peer layer: replicated node storage, discovery and
//! network-wide routing.

pub mod agglomerator;
pub mod codec;
pub mod network;
pub mod node;
pub mod types;

pub use agglomerator::P2PAgglomerator;
pub use network::{LoopbackTransport, MemoryNetwork, PeerTransport};
pub use node::P2PNode;
pub use types::{DataTransferMessage, PeerDiscoveryMessage, PeerInfo, QueryRequest};
