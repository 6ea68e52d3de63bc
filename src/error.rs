use thiserror::Error;

/// Failure kinds surfaced by indexing, routing and replication.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// No registered chain meets the similarity threshold of a transaction.
    #[error("no route found between chains")]
    NoRouteFound,

    #[error("chain not found: {0}")]
    ChainNotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A replication message could not be handed to the transfer queue or transport.
    #[error("replication failure: {0}")]
    ReplicationFailure(String),

    #[error("module not running (state: {0})")]
    NotRunning(String),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
