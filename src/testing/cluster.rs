//! In-process Raft cluster on an `InMemoryNetwork`
//!
//! Nodes are numbered from 0; node `i` has id `NodeId::from_u128(i + 1)`.
//! Every node keeps its `MemoryStorage` across restarts, so stopping and
//! starting a node behaves like a crash and recovery.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::core::config::RaftConfig;
use crate::core::error::RaftError;
use crate::core::server::{RaftServer, WaitType};
use crate::core::types::{Configuration, NodeId, Snapshot};
use crate::state_machine::{encode_value, HashState, HashStateMachine, SharedHashState, SnapshotStore};
use crate::storage::MemoryStorage;
use crate::transport::InMemoryNetwork;

const CHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// A single test node in the cluster
pub struct TestNode {
    pub id: NodeId,
    /// None while the node is down
    pub server: Option<RaftServer>,
    pub storage: MemoryStorage,
    /// State of the node's current state machine instance
    pub state: SharedHashState,
    handle: Option<JoinHandle<()>>,
}

/// A test cluster of Raft nodes
pub struct TestCluster {
    pub network: Arc<InMemoryNetwork>,
    pub snapshots: Arc<SnapshotStore>,
    pub nodes: Vec<TestNode>,
    config: RaftConfig,
}

impl TestCluster {
    /// Create and start a new 3-node cluster
    pub async fn new() -> Self {
        Self::with_nodes(3).await
    }

    pub async fn with_nodes(count: usize) -> Self {
        Self::with_nodes_and_config(count, Self::test_config()).await
    }

    pub async fn with_nodes_and_config(count: usize, config: RaftConfig) -> Self {
        Self::with_network(count, config, InMemoryNetwork::new()).await
    }

    /// Start `count` nodes sharing an initial configuration of all of them
    pub async fn with_network(count: usize, config: RaftConfig, network: InMemoryNetwork) -> Self {
        let snapshots = Arc::new(SnapshotStore::new());
        let network = Arc::new(network.with_snapshot_store(snapshots.clone()));
        let ids: Vec<NodeId> = (0..count).map(Self::node_id).collect();
        let bootstrap = Snapshot::bootstrap(Configuration::from_ids(ids.iter().copied()));

        let mut cluster = TestCluster {
            network,
            snapshots,
            nodes: Vec::new(),
            config,
        };
        for id in ids {
            cluster.push_node(id, MemoryStorage::with_snapshot(bootstrap.clone())).await;
        }
        cluster
    }

    /// Fast clock for tests, meant to run on paused tokio time
    pub fn test_config() -> RaftConfig {
        RaftConfig::default()
            .with_tick_interval(Duration::from_millis(10))
            .with_election_timeout(10)
    }

    pub fn node_id(index: usize) -> NodeId {
        NodeId::from_u128(index as u128 + 1)
    }

    async fn push_node(&mut self, id: NodeId, storage: MemoryStorage) {
        self.nodes.push(TestNode {
            id,
            server: None,
            storage,
            state: Default::default(),
            handle: None,
        });
        let index = self.nodes.len() - 1;
        self.start_node(index).await;
    }

    /// Start a node that is down, from whatever its storage holds
    pub async fn start_node(&mut self, index: usize) {
        let id = self.nodes[index].id;
        let state_machine = HashStateMachine::new(id, self.snapshots.clone());
        let state = state_machine.state();
        let handle = self.network.register(id);
        let server = RaftServer::start(
            id,
            Arc::new(self.network.transport(id)),
            Box::new(state_machine),
            Arc::new(self.nodes[index].storage.clone()),
            self.config.clone(),
        )
        .await
        .unwrap_or_else(|e| panic!("node {} failed to start: {}", index, e));

        let node = &mut self.nodes[index];
        node.handle = Some(handle.serve(server.clone()));
        node.server = Some(server);
        node.state = state;
    }

    /// Stop a node and detach it from the network
    pub async fn stop_node(&mut self, index: usize) {
        let node = &mut self.nodes[index];
        self.network.unregister(node.id);
        if let Some(server) = node.server.take() {
            server.stop().await;
        }
        if let Some(handle) = node.handle.take() {
            handle.abort();
        }
    }

    pub async fn restart_node(&mut self, index: usize) {
        self.stop_node(index).await;
        self.start_node(index).await;
    }

    /// Start a node with empty storage. It joins once a leader adds it
    /// with `add_server`.
    pub async fn add_node(&mut self) -> usize {
        let id = Self::node_id(self.nodes.len());
        self.push_node(id, MemoryStorage::new()).await;
        self.nodes.len() - 1
    }

    /// Running server of a node; panics if the node is down
    pub fn server(&self, index: usize) -> &RaftServer {
        self.nodes[index]
            .server
            .as_ref()
            .unwrap_or_else(|| panic!("node {} is down", index))
    }

    pub fn state(&self, index: usize) -> HashState {
        self.nodes[index].state.lock().clone()
    }

    /// Index of a running node that believes it leads in the highest term
    pub fn leader(&self) -> Option<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(index, node)| node.server.as_ref().map(|server| (index, server)))
            .filter(|(_, server)| server.is_leader())
            .max_by_key(|(_, server)| server.current_term())
            .map(|(index, _)| index)
    }

    /// Wait for a leader to be elected, with timeout
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<usize> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(leader) = self.leader() {
                return Some(leader);
            }
            sleep(self.config.tick_interval).await;
        }
        None
    }

    /// Make a specific node the leader
    pub async fn elect(&self, index: usize) -> Result<(), RaftError> {
        self.server(index).elect_me_leader().await
    }

    /// Propose `value` on node `index` and wait for it to commit
    pub async fn propose(&self, index: usize, value: u64) -> Result<(), RaftError> {
        self.server(index).add_entry(encode_value(value), WaitType::Committed).await
    }

    /// Wait until node `index` applied at least `count` commands
    pub async fn wait_applied(&self, index: usize, count: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.nodes[index].state.lock().applied >= count {
                return true;
            }
            sleep(self.config.tick_interval).await;
        }
        false
    }

    /// Wait until every running node holds the same applied state
    pub async fn wait_converged(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let mut states = self
                .nodes
                .iter()
                .filter(|node| node.server.is_some())
                .map(|node| node.state.lock().clone());
            if let Some(first) = states.next() {
                if states.all(|state| state == first) {
                    return true;
                }
            }
            sleep(self.config.tick_interval).await;
        }
        false
    }

    /// Add node `index` to the configuration through the current leader
    pub async fn add_server(&self, leader: usize, index: usize) -> Result<(), RaftError> {
        let id = self.nodes[index].id;
        self.server(leader).add_server(id, Bytes::new(), CHANGE_TIMEOUT).await
    }

    pub async fn remove_server(&self, leader: usize, id: NodeId) -> Result<(), RaftError> {
        self.server(leader).remove_server(id, CHANGE_TIMEOUT).await
    }

    pub fn isolate(&self, index: usize) {
        self.network.isolate(self.nodes[index].id);
    }

    pub fn disconnect(&self, a: usize, b: usize) {
        self.network.disconnect(self.nodes[a].id, self.nodes[b].id);
    }

    pub fn heal(&self) {
        self.network.heal_all();
    }

    /// Index of the node with the given id
    pub fn find(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|node| node.id == id)
    }

    /// Stop every running node
    pub async fn shutdown(mut self) {
        for index in 0..self.nodes.len() {
            self.stop_node(index).await;
        }
    }
}
