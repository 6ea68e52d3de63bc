//! Cross-chain transaction router.
//!
//! Chains and transactions are described by lazily generated state
//! vectors. The [`Agglomerator`] routes a transaction by vector similarity
//! and protocol metrics; the [`cluster`] layer replicates registrations
//! and routing records across peers.

pub mod agglomerator;
pub mod cluster;
pub mod collab;
pub mod config;
pub mod error;
pub mod filter;
pub mod index;
pub mod model;
pub mod module;
pub mod protocol;
pub mod router;
pub mod server;
pub mod vector;

pub use agglomerator::Agglomerator;
pub use cluster::{P2PAgglomerator, P2PNode};
pub use error::{Error, Result};
pub use index::VectorIndex;
pub use model::{Chain, DatabaseRecord, Transaction};
pub use module::{AgglomeratorModule, Routing};
pub use protocol::Protocol;
pub use router::RouteScorer;
pub use vector::{similarity, LazyVector};
