use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use agglomerator::cluster::types::{DiscoveryKind, PeerDiscoveryMessage, PeerInfo};
use agglomerator::cluster::{MemoryNetwork, P2PAgglomerator, P2PNode};
use agglomerator::config::P2PConfig;
use agglomerator::model::{META_STATUS, META_TO_CHAIN, META_TYPE, TYPE_PEER_TRANSACTION, TYPE_TRANSACTION};
use agglomerator::protocol::ProtocolTable;
use agglomerator::{Agglomerator, Chain, DatabaseRecord, Error, LazyVector, Protocol, Transaction};

fn mesh(size: usize) -> (Arc<MemoryNetwork>, Vec<Arc<P2PNode>>) {
    mesh_with(size, P2PConfig::default())
}

fn mesh_with(size: usize, base: P2PConfig) -> (Arc<MemoryNetwork>, Vec<Arc<P2PNode>>) {
    let network = MemoryNetwork::new();
    let nodes: Vec<Arc<P2PNode>> = (0..size)
    .map(|i| {
        let settings = P2PConfig { port: 7000 + i as u16, ..base.clone() };
        Arc::new(P2PNode::new(settings, network.clone()))
    })
    .collect();

    for node in &nodes {
        network.join(node);
        for other in &nodes {
            node.add_peer(PeerInfo::new(other.node_id(), other.address(), 0.5));
        }
    }
    (network, nodes)
}

fn start_all(nodes: &[Arc<P2PNode>], shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    nodes
    .iter()
    .flat_map(|node| node.start(shutdown.clone()).unwrap())
    .collect()
}

async fn stop(shutdown: watch::Sender<bool>, handles: Vec<JoinHandle<()>>) {
    shutdown.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn wave() -> LazyVector {
    LazyVector::new(|d| (d as f64 * 0.3).sin())
}

fn protocol_chain(id: &str, protocol: Protocol) -> Chain {
    let generator = ProtocolTable::default().generator(protocol);
    Chain::new(id, protocol, format!("http://{id}"), LazyVector::from_generator(generator))
}

#[tokio::test]
async fn stored_records_reach_every_replica() {
    let (_network, nodes) = mesh(4);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = start_all(&nodes, &shutdown_rx);

    let sent = nodes[0].store_data(DatabaseRecord::new("r1", wave())).await.unwrap();
    assert_eq!(sent, 3);

    for node in &nodes[1..] {
        let node = node.clone();
        assert!(eventually(|| node.local_database().contains("r1")).await);
    }
    let replica = nodes[2].local_database().get("r1").unwrap();
    assert_eq!(replica.vector.get_element(7), wave().get_element(7));

    stop(shutdown_tx, handles).await;
}

#[tokio::test]
async fn queries_fan_out_to_peers() {
    let (network, nodes) = mesh(3);

    // Not started: records stay where they were stored
    nodes[1].local_database().insert(DatabaseRecord::new("remote", wave())).unwrap();
    nodes[2].local_database().insert(DatabaseRecord::new("other", LazyVector::new(|d| d as f64))).unwrap();

    let similar = nodes[0].query_data(&wave()).await;
    assert!(similar.iter().any(|r| r.id == "remote"));
    assert!(similar.iter().all(|r| r.id != "other"));

    let all = nodes[0].query_all().await;
    assert_eq!(all.len(), 2);

    network.leave(nodes[1].node_id());
    let after_leave = nodes[0].query_all().await;
    assert_eq!(after_leave.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["other"]);
}

#[tokio::test]
async fn discovery_connects_both_sides() {
    let network = MemoryNetwork::new();
    let a = Arc::new(P2PNode::new(P2PConfig::default(), network.clone()));
    let b = Arc::new(P2PNode::new(P2PConfig { port: 7001, ..P2PConfig::default() }, network.clone()));
    network.join(&a);
    network.join(&b);
    assert_eq!(network.member_count(), 2);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = b.start(shutdown_rx).unwrap();

    let mut connected = None;
    for _ in 0..100 {
        if let Some(peer) = a.discover_once().await.unwrap() {
            connected = Some(peer);
            break;
        }
    }
    let peer = connected.expect("candidate never accepted");
    assert_eq!(peer.node_id, b.node_id());

    let b_view = b.clone();
    assert!(eventually(|| b_view.peer_count() == 1).await);
    assert_eq!(b.peers()[0].node_id, a.node_id());

    stop(shutdown_tx, handles).await;
}

#[tokio::test]
async fn peer_hop_is_replicated_as_pending() {
    let (_network, nodes) = mesh(2);
    let local = P2PAgglomerator::new(Arc::new(Agglomerator::default()), nodes[0].clone());
    let remote = P2PAgglomerator::new(Arc::new(Agglomerator::default()), nodes[1].clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = start_all(&nodes, &shutdown_rx);

    let sol = protocol_chain("sol-1", Protocol::Sol);
    let vector = sol.state_vector.clone();
    remote.register_chain(sol).await.unwrap();

    let tx = Transaction::new("tx9", "sol-1", "sol-1", vector, 0.5);
    let route = local.process_transaction(&tx).await.unwrap();
    assert_eq!(route, vec!["sol-1".to_string()]);

    let hop = nodes[0].local_database().get("tx9_sol-1").unwrap();
    assert_eq!(hop.meta_str(META_TYPE), Some(TYPE_PEER_TRANSACTION));
    assert_eq!(hop.meta_str(META_STATUS), Some("pending"));

    let remote_node = nodes[1].clone();
    assert!(eventually(|| remote_node.local_database().contains("tx9_sol-1")).await);
    assert!(eventually(|| remote_node.local_database().contains("tx9")).await);
    let distributed = nodes[1].local_database().get("tx9").unwrap();
    assert_eq!(distributed.meta_str(META_TYPE), Some(TYPE_TRANSACTION));
    assert_eq!(distributed.meta_str(META_TO_CHAIN), Some("sol-1"));

    stop(shutdown_tx, handles).await;
}

#[tokio::test]
async fn sync_collects_chains_announced_by_peers() {
    let (_network, nodes) = mesh(3);
    let observer = P2PAgglomerator::new(Arc::new(Agglomerator::default()), nodes[0].clone());
    let eth = P2PAgglomerator::new(Arc::new(Agglomerator::default()), nodes[1].clone());
    let btc = P2PAgglomerator::new(Arc::new(Agglomerator::default()), nodes[2].clone());

    // Not started: announcements stay on the announcing node
    eth.register_chain(protocol_chain("eth-1", Protocol::Eth)).await.unwrap();
    btc.register_chain(protocol_chain("btc-1", Protocol::Btc)).await.unwrap();

    assert_eq!(observer.sync_chains().await, 2);
    let synced = observer.peer_chains();
    assert_eq!(synced.len(), 2);
    assert_eq!(synced[nodes[1].node_id()][0].id, "eth-1");
    assert_eq!(synced[nodes[2].node_id()][0].protocol, Protocol::Btc);
}

#[tokio::test]
async fn unknown_chains_have_no_route() {
    let (_network, nodes) = mesh(2);
    let local = P2PAgglomerator::new(Arc::new(Agglomerator::default()), nodes[0].clone());

    let tx = Transaction::new("tx0", "a", "b", wave(), 0.7);
    assert_eq!(local.process_transaction(&tx).await, Err(Error::NoRouteFound));
}

#[tokio::test]
async fn crossing_discovery_floods_do_not_stall_replication() {
    let tight = P2PConfig { queue_capacity: 1, ..P2PConfig::default() };
    let (_network, nodes) = mesh_with(2, tight);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = start_all(&nodes, &shutdown_rx);

    // Each side keeps the other's one-slot discovery queue full while
    // both dispatchers owe replies
    let floods: Vec<_> = [(0, 1), (1, 0)]
    .into_iter()
    .map(|(from, to)| {
        let sender = nodes[from].clone();
        let target = nodes[to].clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                let hello = PeerDiscoveryMessage {
                    sender_id: sender.node_id().to_string(),
                    sender_addr: sender.address().to_string(),
                    kind: DiscoveryKind::Discover,
                    reputation: 0.5,
                };
                target.receive_discovery(hello).await.unwrap();
            }
        })
    })
    .collect();
    for flood in floods {
        tokio::time::timeout(Duration::from_secs(10), flood).await.unwrap().unwrap();
    }

    let sent = tokio::time::timeout(
        Duration::from_secs(5),
        nodes[0].store_data(DatabaseRecord::new("after-flood", wave())),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(sent, 1);

    let receiver = nodes[1].clone();
    assert!(eventually(|| receiver.local_database().contains("after-flood")).await);

    stop(shutdown_tx, handles).await;
}
