use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agglomerator::Agglomerator;
use crate::cluster::{P2PAgglomerator, P2PNode, PeerTransport};
use crate::config::{ChainConfig, NodeConfig};
use crate::error::{Error, Result};
use crate::model::{Chain, Transaction};
use crate::protocol::Protocol;
use crate::router::RouteScorer;
use crate::vector::LazyVector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    Uninitialized,
    Initialized,
    Running,
    Paused,
    Error,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleState::Uninitialized => "uninitialized",
            ModuleState::Initialized => "initialized",
            ModuleState::Running => "running",
            ModuleState::Paused => "paused",
            ModuleState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Named state machine shared by every module kind.
#[derive(Debug)]
pub struct Lifecycle {
    name: String,
    state: RwLock<ModuleState>,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(ModuleState::Uninitialized),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ModuleState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_state(&self, next: ModuleState) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        debug!(module = %self.name, from = %*state, to = %next, "state change");
        *state = next;
    }

    /// Moves `from` to `to`, failing with `InvalidInput` from any other state.
    pub fn transition(&self, from: ModuleState, to: ModuleState) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(Error::InvalidInput(format!(
                "module {} is {}, expected {}",
                self.name, *state, from
            )));
        }
        debug!(module = %self.name, from = %from, to = %to, "state change");
        *state = to;
        Ok(())
    }

    pub fn initialize(&self) -> Result<()> {
        self.transition(ModuleState::Uninitialized, ModuleState::Initialized)
    }

    pub fn terminate(&self) {
        self.set_state(ModuleState::Uninitialized);
    }

    pub fn health_check(&self) -> Result<()> {
        match self.state() {
            state @ (ModuleState::Uninitialized | ModuleState::Error) => {
                Err(Error::NotRunning(state.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Fails with `NotRunning` unless the module is running.
    pub fn ensure_running(&self) -> Result<()> {
        match self.state() {
            ModuleState::Running => Ok(()),
            state => Err(Error::NotRunning(state.to_string())),
        }
    }
}

#[async_trait]
pub trait Module: Send + Sync {
    fn lifecycle(&self) -> &Lifecycle;

    async fn initialize(&self) -> Result<()>;

    async fn start(&self) -> Result<()>;

    async fn terminate(&self) -> Result<()>;

    fn name(&self) -> &str {
        self.lifecycle().name()
    }

    fn state(&self) -> ModuleState {
        self.lifecycle().state()
    }

    fn health_check(&self) -> Result<()> {
        self.lifecycle().health_check()
    }
}

/// Where `AgglomeratorModule::process_transaction` sends a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Routing {
    /// Registry lookup of both endpoints, no network traffic.
    #[default]
    Local,
    /// Candidate discovery and hop execution across peers.
    Network,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub name: String,
    pub node_id: String,
    pub state: ModuleState,
    pub chains: usize,
    pub peers: usize,
    pub records: usize,
}

/// Router module: a lifecycle plus the network-wide agglomerator.
pub struct AgglomeratorModule {
    lifecycle: Lifecycle,
    config: NodeConfig,
    network: Arc<P2PAgglomerator>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for AgglomeratorModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgglomeratorModule")
        .field("name", &self.lifecycle.name())
        .field("state", &self.lifecycle.state())
        .field("network", &self.network)
        .finish()
    }
}

impl AgglomeratorModule {
    pub fn new(config: NodeConfig, transport: Arc<dyn PeerTransport>) -> Result<Self> {
        config.validate()?;
        let node = Arc::new(P2PNode::new(config.p2p.clone(), transport));
        Ok(Self::with_node(config, node))
    }

    /// Builds the module around an existing node, e.g. one with a signer
    /// attached or joined to a `MemoryNetwork`.
    pub fn with_node(config: NodeConfig, node: Arc<P2PNode>) -> Self {
        let agglomerator = Arc::new(Agglomerator::new(RouteScorer::new(config.protocol_table())));
        let (shutdown, _) = watch::channel(false);
        Self {
            lifecycle: Lifecycle::new(config.node_name.clone()),
            network: Arc::new(P2PAgglomerator::new(agglomerator, node)),
            config,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn network(&self) -> &Arc<P2PAgglomerator> {
        &self.network
    }

    pub fn agglomerator(&self) -> &Arc<Agglomerator> {
        self.network.agglomerator()
    }

    /// Builds a chain whose state vector follows its protocol profile.
    pub fn chain_from_config(&self, cfg: &ChainConfig) -> Chain {
        let protocol = Protocol::from_tag(&cfg.protocol);
        let generator = self.agglomerator().scorer().protocols().generator(protocol);
        Chain::new(cfg.id.clone(), protocol, cfg.endpoint.clone(), LazyVector::from_generator(generator))
    }

    /// Registers a chain. Allowed in every state; the network announcement
    /// is deferred to `start` until the node's tasks are running.
    pub async fn register_chain(&self, cfg: &ChainConfig) -> Result<Chain> {
        if cfg.id.is_empty() {
            return Err(Error::InvalidInput("chain id is empty".into()));
        }
        let chain = self.chain_from_config(cfg);
        match self.lifecycle.state() {
            ModuleState::Running | ModuleState::Paused => self.network.register_chain(chain).await?,
            _ => self.agglomerator().register_chain(chain)?,
        }
        self.agglomerator().get_chain(&cfg.id)
    }

    pub fn list_chains(&self) -> Vec<Chain> {
        self.agglomerator().list_chains()
    }

    pub fn get_chain(&self, id: &str) -> Result<Chain> {
        self.agglomerator().get_chain(id)
    }

    /// Routes `tx` and returns the chain ids it touched.
    pub async fn process_transaction(&self, tx: &Transaction, routing: Routing) -> Result<Vec<String>> {
        self.lifecycle.ensure_running()?;
        match routing {
            Routing::Local => {
                self.agglomerator().process_transaction(tx)?;
                Ok(vec![tx.from_chain.clone(), tx.to_chain.clone()])
            }
            Routing::Network => self.network.process_transaction(tx).await,
        }
    }

    pub fn pause(&self) -> Result<()> {
        self.lifecycle.transition(ModuleState::Running, ModuleState::Paused)?;
        info!(module = %self.lifecycle.name(), "paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.lifecycle.transition(ModuleState::Paused, ModuleState::Running)?;
        info!(module = %self.lifecycle.name(), "resumed");
        Ok(())
    }

    pub fn status(&self) -> ModuleStatus {
        let node = self.network.node();
        ModuleStatus {
            name: self.lifecycle.name().to_string(),
            node_id: node.node_id().to_string(),
            state: self.lifecycle.state(),
            chains: self.agglomerator().chain_count(),
            peers: node.peer_count(),
            records: node.local_database().len(),
        }
    }
}

#[async_trait]
impl Module for AgglomeratorModule {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Registers every configured chain locally. Any failure leaves the
    /// module in the `Error` state.
    async fn initialize(&self) -> Result<()> {
        if self.lifecycle.state() != ModuleState::Uninitialized {
            return Err(Error::InvalidInput(format!(
                "module {} already initialized",
                self.lifecycle.name()
            )));
        }

        for cfg in &self.config.enabled_chains {
            if let Err(e) = self.register_chain(cfg).await {
                error!(chain = %cfg.id, error = %e, "chain registration failed");
                self.lifecycle.set_state(ModuleState::Error);
                return Err(e);
            }
        }

        self.lifecycle.initialize()?;
        info!(
            module = %self.lifecycle.name(),
            chains = self.config.enabled_chains.len(),
            "module initialized"
        );
        Ok(())
    }

    /// Starts the network tasks, then announces every registered chain.
    async fn start(&self) -> Result<()> {
        self.lifecycle.transition(ModuleState::Initialized, ModuleState::Running)?;

        match self.network.start(self.shutdown.subscribe()) {
            Ok(handles) => {
                self.tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(handles);
            }
            Err(e) => {
                self.lifecycle.set_state(ModuleState::Error);
                return Err(e);
            }
        }

        for chain in self.list_chains() {
            if let Err(e) = self.network.announce_chain(&chain).await {
                warn!(chain = %chain.id, error = %e, "chain announcement failed");
            }
        }
        info!(module = %self.lifecycle.name(), "module running");
        Ok(())
    }

    /// Signals every background task to stop and waits for them.
    async fn terminate(&self) -> Result<()> {
        self.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        self.lifecycle.terminate();
        info!(module = %self.lifecycle.name(), "module terminated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::PeerInfo;
    use crate::cluster::LoopbackTransport;
    use std::time::Duration;

    fn config() -> NodeConfig {
        NodeConfig {
            enabled_chains: vec![
                ChainConfig { id: "eth-1".into(), protocol: "eth".into(), endpoint: "http://eth".into() },
                ChainConfig { id: "btc-1".into(), protocol: "btc".into(), endpoint: "http://btc".into() },
            ],
            ..NodeConfig::default()
        }
    }

    fn module(config: NodeConfig) -> AgglomeratorModule {
        AgglomeratorModule::new(config, Arc::new(LoopbackTransport)).unwrap()
    }

    #[test]
    fn lifecycle_health_follows_state() {
        let lifecycle = Lifecycle::new("m");
        assert!(matches!(lifecycle.health_check(), Err(Error::NotRunning(_))));
        lifecycle.initialize().unwrap();
        assert!(lifecycle.health_check().is_ok());
        assert!(lifecycle.initialize().is_err());
        lifecycle.set_state(ModuleState::Error);
        assert_eq!(lifecycle.health_check(), Err(Error::NotRunning("error".into())));
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let module = module(config());
        assert_eq!(module.state(), ModuleState::Uninitialized);

        module.initialize().await.unwrap();
        assert_eq!(module.state(), ModuleState::Initialized);
        assert_eq!(module.list_chains().len(), 2);

        let vector = module.get_chain("eth-1").unwrap().state_vector;
        let tx = Transaction::new("tx1", "eth-1", "btc-1", vector, 0.5);
        assert!(matches!(
            module.process_transaction(&tx, Routing::Local).await,
            Err(Error::NotRunning(_))
        ));

        module.start().await.unwrap();
        let touched = module.process_transaction(&tx, Routing::Local).await.unwrap();
        assert_eq!(touched, vec!["eth-1".to_string(), "btc-1".to_string()]);
        assert!(module.get_chain("btc-1").unwrap().transaction_pool().contains("tx1"));

        module.pause().unwrap();
        assert_eq!(
            module.process_transaction(&tx, Routing::Local).await,
            Err(Error::NotRunning("paused".into()))
        );
        assert!(module.pause().is_err());
        module.resume().unwrap();

        let status = module.status();
        assert_eq!(status.state, ModuleState::Running);
        assert_eq!(status.chains, 2);

        module.terminate().await.unwrap();
        assert_eq!(module.state(), ModuleState::Uninitialized);
    }

    #[tokio::test]
    async fn network_routing_returns_route() {
        let module = module(config());
        module.initialize().await.unwrap();
        module.start().await.unwrap();

        let vector = module.get_chain("eth-1").unwrap().state_vector;
        let tx = Transaction::new("tx2", "eth-1", "btc-1", vector, 0.5);
        let route = module.process_transaction(&tx, Routing::Network).await.unwrap();
        assert_eq!(route.len(), 1);

        module.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn many_chains_with_seeded_peers_initialize_without_dispatch() {
        let enabled_chains = (0..40)
        .map(|i| ChainConfig { id: format!("c{i}"), protocol: "eth".into(), endpoint: String::new() })
        .collect();
        let module = module(NodeConfig { enabled_chains, ..NodeConfig::default() });
        let node = module.network().node().clone();
        for i in 0..3 {
            node.add_peer(PeerInfo::new(format!("seed-{i}"), "10.0.0.1", 0.5));
        }

        let initialized = tokio::time::timeout(Duration::from_secs(5), module.initialize()).await;
        assert!(matches!(initialized, Ok(Ok(()))));
        assert_eq!(module.list_chains().len(), 40);
        assert!(!node.local_database().contains("c0"));

        tokio::time::timeout(Duration::from_secs(5), module.start()).await.unwrap().unwrap();
        assert!((0..40).all(|i| node.local_database().contains(&format!("c{i}"))));

        // Registered while running: announced straight away
        module
        .register_chain(&ChainConfig { id: "late".into(), protocol: "dot".into(), endpoint: String::new() })
        .await
        .unwrap();
        assert!(node.local_database().contains("late"));

        module.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn start_requires_initialization() {
        let module = module(NodeConfig::default());
        assert!(matches!(module.start().await, Err(Error::InvalidInput(_))));
        module.initialize().await.unwrap();
        assert!(matches!(module.initialize().await, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = NodeConfig { similarity_threshold: 3.0, ..NodeConfig::default() };
        assert!(matches!(
            AgglomeratorModule::new(config, Arc::new(LoopbackTransport)),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn unknown_protocol_chain_still_registers() {
        let module = module(NodeConfig::default());
        let chain = module
        .register_chain(&ChainConfig { id: "x".into(), protocol: "cosmos".into(), endpoint: String::new() })
        .await
        .unwrap();
        assert_eq!(chain.protocol, Protocol::Unknown);
        assert!(matches!(
            module.register_chain(&ChainConfig { id: String::new(), protocol: String::new(), endpoint: String::new() }).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
