#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use eskka_core::{
    AckListener, BincodeCodec, ClusterState, ClusterStateStore, Discovery, DiscoveryConfig,
    DiscoveryError, DiscoveryNode, Envelope, MemberStatus, NodeId, PartitionConfig, Transport,
};

/// In-memory mesh standing in for the network: every node gets an inbox, and
/// links between nodes can be cut and healed to model partitions.
pub struct LoopbackNet {
    links: DashMap<SocketAddr, mpsc::UnboundedSender<(Envelope, SocketAddr)>>,
    cuts: DashSet<(SocketAddr, SocketAddr)>,
}

impl LoopbackNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { links: DashMap::new(), cuts: DashSet::new() })
    }

    pub fn open(self: &Arc<Self>, addr: SocketAddr) -> Arc<LoopbackTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.links.insert(addr, tx);
        Arc::new(LoopbackTransport { addr, net: Arc::clone(self), rx: tokio::sync::Mutex::new(rx) })
    }

    /// Cuts both directions between two nodes.
    pub fn cut(&self, a: SocketAddr, b: SocketAddr) {
        self.cuts.insert((a, b));
        self.cuts.insert((b, a));
    }

    pub fn heal(&self, a: SocketAddr, b: SocketAddr) {
        self.cuts.remove(&(a, b));
        self.cuts.remove(&(b, a));
    }

    /// Cuts `addr` off from every node in `others`.
    pub fn isolate(&self, addr: SocketAddr, others: &[SocketAddr]) {
        for other in others {
            if *other != addr {
                self.cut(addr, *other);
            }
        }
    }

    pub fn rejoin(&self, addr: SocketAddr, others: &[SocketAddr]) {
        for other in others {
            self.heal(addr, *other);
        }
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, envelope: Envelope) {
        if self.cuts.contains(&(from, to)) {
            return;
        }
        if let Some(tx) = self.links.get(&to) {
            let _ = tx.send((envelope, from));
        }
    }
}

pub struct LoopbackTransport {
    addr: SocketAddr,
    net: Arc<LoopbackNet>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Envelope, SocketAddr)>>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send(&self, to: SocketAddr, envelope: &Envelope) -> Result<(), DiscoveryError> {
        self.net.deliver(self.addr, to, envelope.clone());
        Ok(())
    }

    async fn recv(&self) -> Result<(Envelope, SocketAddr), DiscoveryError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(received) => Ok(received),
            None => std::future::pending().await,
        }
    }
}

/// Mesh address for the n-th test node.
pub fn node_addr(index: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 9400 + index)
}

/// Discovery configuration shrunk to test timescales.
pub fn test_config(seeds: &[SocketAddr]) -> DiscoveryConfig {
    DiscoveryConfig {
        seed_nodes: seeds.iter().map(ToString::to_string).collect(),
        heartbeat_interval: Duration::from_millis(50),
        acceptable_heartbeat_pause: Duration::from_millis(200),
        partition: PartitionConfig {
            eval_delay: Duration::from_millis(400),
            ping_timeout: Duration::from_millis(200),
        },
        publish_timeout: Duration::from_secs(2),
        startup_timeout: Duration::from_secs(10),
        ..DiscoveryConfig::default()
    }
}

pub struct TestNode {
    pub addr: SocketAddr,
    pub discovery: Arc<Discovery>,
    pub store: Arc<ClusterStateStore>,
    pub initial_state: watch::Receiver<bool>,
}

impl TestNode {
    /// Member statuses as this node sees them, keyed by address.
    pub fn view(&self) -> HashMap<SocketAddr, MemberStatus> {
        self.discovery
            .members()
            .into_iter()
            .map(|m| (m.addr, m.status))
            .collect()
    }

    pub fn sees_up(&self, addr: SocketAddr) -> bool {
        self.view().get(&addr) == Some(&MemberStatus::Up)
    }

    /// True once `addr` has been evicted from this node's view: downed (and
    /// possibly already pruned away).
    pub fn sees_downed(&self, addr: SocketAddr) -> bool {
        match self.view().get(&addr) {
            None => true,
            Some(MemberStatus::Down | MemberStatus::Removed) => true,
            Some(_) => false,
        }
    }
}

pub async fn start_node(
    net: &Arc<LoopbackNet>,
    addr: SocketAddr,
    config: DiscoveryConfig,
) -> TestNode {
    let transport = net.open(addr);
    let store = ClusterStateStore::new(ClusterState::initial(NodeId::generate()));
    let discovery = Discovery::new(config, Arc::clone(&store), Arc::new(BincodeCodec));
    let (init_tx, initial_state) = watch::channel(false);
    discovery
        .add_initial_state_listener(move |_| {
            let _ = init_tx.send(true);
        })
        .expect("register listener before start");
    discovery
        .start_with_transport(transport)
        .await
        .expect("node joins the cluster");
    TestNode { addr, discovery, store, initial_state }
}

/// Polls `cond` until it holds or the deadline passes.
pub async fn eventually(deadline: Duration, what: &str, cond: impl Fn() -> bool) {
    let end = tokio::time::Instant::now() + deadline;
    loop {
        if cond() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < end,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Builds the next cluster state a master host would publish: everyone
/// currently up, mastered by the local node.
pub fn next_state(node: &TestNode) -> ClusterState {
    let current = node.store.current();
    let me = node.discovery.local_member().expect("node is started");
    let nodes = node
        .discovery
        .members()
        .into_iter()
        .filter(|m| m.status == MemberStatus::Up)
        .map(|m| {
            (
                m.id.clone(),
                DiscoveryNode { id: m.id, addr: m.addr, master_eligible: m.roles.master_eligible },
            )
        })
        .collect();
    ClusterState {
        version: current.version + 1,
        local_node_id: current.local_node_id.clone(),
        master_node_id: Some(me.id),
        nodes,
        routing_table: current.routing_table.clone(),
        metadata: current.metadata.clone(),
        blocks: Default::default(),
    }
}

/// Ack listener that records every outcome per node, for completeness
/// assertions.
pub struct CollectingAcks {
    outcomes: Mutex<HashMap<NodeId, Vec<Option<String>>>>,
}

impl CollectingAcks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { outcomes: Mutex::new(HashMap::new()) })
    }

    pub fn outcomes(&self) -> HashMap<NodeId, Vec<Option<String>>> {
        self.outcomes.lock().clone()
    }

    pub fn total(&self) -> usize {
        self.outcomes.lock().values().map(Vec::len).sum()
    }
}

impl AckListener for CollectingAcks {
    fn node_ack(&self, node: &NodeId, error: Option<&str>) {
        self.outcomes
            .lock()
            .entry(node.clone())
            .or_default()
            .push(error.map(str::to_string));
    }
}
