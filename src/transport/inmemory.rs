//! In-memory transport implementation for testing
//!
//! Every registered node owns a bounded request channel. Transports push
//! messages into the target's channel and a `NodeHandle` task drains it into
//! the node's `RaftServer`. The network can cut links between nodes and drop
//! a seeded fraction of one-way messages.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::core::error::RaftError;
use crate::core::message::{
    AppendReply, AppendRequest, InstallSnapshot, KeepAlive, Message, SnapshotReply, VoteReply, VoteRequest,
};
use crate::core::server::RaftServer;
use crate::core::types::NodeId;
use crate::state_machine::SnapshotStore;
use crate::transport::{Transport, TransportError};

const CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

/// Request types that can be sent to a node
pub(crate) enum Request {
    Message {
        from: NodeId,
        message: Message,
    },
    KeepAlive {
        from: NodeId,
        keepalive: KeepAlive,
    },
    Snapshot {
        from: NodeId,
        request: InstallSnapshot,
        reply: oneshot::Sender<SnapshotReply>,
    },
}

#[derive(Default)]
struct NetworkState {
    senders: HashMap<NodeId, mpsc::Sender<Request>>,
    /// Cut links, stored in both directions
    disconnected: HashSet<(NodeId, NodeId)>,
    packet_loss: Option<(f64, ChaCha8Rng)>,
}

impl NetworkState {
    fn is_cut(&self, from: NodeId, to: NodeId) -> bool {
        self.disconnected.contains(&(from, to))
    }

    fn should_drop(&mut self) -> bool {
        match &mut self.packet_loss {
            Some((rate, rng)) => rng.random_bool(*rate),
            None => false,
        }
    }
}

/// Shared medium all in-memory transports of a cluster talk through
pub struct InMemoryNetwork {
    state: Mutex<NetworkState>,
    snapshots: Option<Arc<SnapshotStore>>,
    snapshot_timeout: Duration,
}

impl Default for InMemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NetworkState::default()),
            snapshots: None,
            snapshot_timeout: DEFAULT_SNAPSHOT_TIMEOUT,
        }
    }

    /// Drop each one-way message with probability `rate`, deterministically
    /// for a given seed
    pub fn with_packet_loss(self, rate: f64, seed: u64) -> Self {
        assert!((0.0..=1.0).contains(&rate), "packet loss rate must be within [0, 1]");
        self.state.lock().packet_loss = Some((rate, ChaCha8Rng::seed_from_u64(seed)));
        self
    }

    pub fn stop_packet_loss(&self) {
        self.state.lock().packet_loss = None;
    }

    /// Copy state machine snapshot data along with install requests
    pub fn with_snapshot_store(mut self, store: Arc<SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn with_snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.snapshot_timeout = timeout;
        self
    }

    /// Transport used by node `id` to reach the others
    pub fn transport(self: &Arc<Self>, id: NodeId) -> InMemoryTransport {
        InMemoryTransport {
            id,
            network: self.clone(),
            members: Mutex::new(HashMap::new()),
            aborted: AtomicBool::new(false),
        }
    }

    /// Attach node `id` to the network. Registering again replaces the
    /// previous inbox, which ends the old handle's loop.
    pub fn register(&self, id: NodeId) -> NodeHandle {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        self.state.lock().senders.insert(id, sender);
        NodeHandle { id, receiver }
    }

    /// Detach a node, as if it crashed
    pub fn unregister(&self, id: NodeId) {
        self.state.lock().senders.remove(&id);
    }

    /// Cut the link between two nodes in both directions
    pub fn disconnect(&self, a: NodeId, b: NodeId) {
        let mut state = self.state.lock();
        state.disconnected.insert((a, b));
        state.disconnected.insert((b, a));
    }

    pub fn connect(&self, a: NodeId, b: NodeId) {
        let mut state = self.state.lock();
        state.disconnected.remove(&(a, b));
        state.disconnected.remove(&(b, a));
    }

    /// Cut every link of a node
    pub fn isolate(&self, id: NodeId) {
        let mut state = self.state.lock();
        let others: Vec<NodeId> = state.senders.keys().copied().filter(|other| *other != id).collect();
        for other in others {
            state.disconnected.insert((id, other));
            state.disconnected.insert((other, id));
        }
    }

    pub fn heal_all(&self) {
        self.state.lock().disconnected.clear();
    }

    /// Best-effort delivery: cut links and packet loss drop silently
    fn send(&self, from: NodeId, to: NodeId, request: Request) -> Result<(), TransportError> {
        let sender = {
            let mut state = self.state.lock();
            if state.is_cut(from, to) || state.should_drop() {
                trace!(from = %from, to = %to, "message dropped");
                return Ok(());
            }
            state.senders.get(&to).cloned().ok_or(TransportError::NodeNotFound)?
        };
        match sender.try_send(request) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(from = %from, to = %to, "inbox full, message dropped");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::ConnectionFailed),
        }
    }

    async fn send_snapshot(
        &self,
        from: NodeId,
        to: NodeId,
        request: InstallSnapshot,
    ) -> Result<SnapshotReply, TransportError> {
        let sender = {
            let state = self.state.lock();
            if state.is_cut(from, to) {
                return Err(TransportError::ConnectionFailed);
            }
            state.senders.get(&to).cloned().ok_or(TransportError::NodeNotFound)?
        };

        let id = request.snapshot.id;
        if let Some(store) = &self.snapshots {
            if !id.is_nil() && !store.copy(from, to, id) {
                debug!(from = %from, to = %to, snapshot = %id, "snapshot data is gone");
                return Err(TransportError::ConnectionFailed);
            }
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Request::Snapshot {
                from,
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TransportError::ConnectionFailed)?;

        tokio::time::timeout(self.snapshot_timeout, reply_rx)
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|_| TransportError::ConnectionFailed)
    }
}

/// One node's endpoint on an `InMemoryNetwork`
pub struct InMemoryTransport {
    id: NodeId,
    network: Arc<InMemoryNetwork>,
    /// Nodes announced through `add_node`
    members: Mutex<HashMap<NodeId, Bytes>>,
    aborted: AtomicBool,
}

impl InMemoryTransport {
    fn check_open(&self) -> Result<(), TransportError> {
        if self.aborted.load(Ordering::Acquire) {
            Err(TransportError::Aborted)
        } else {
            Ok(())
        }
    }

    fn send(&self, target: NodeId, message: Message) -> Result<(), TransportError> {
        self.check_open()?;
        let request = Request::Message { from: self.id, message };
        self.network.send(self.id, target, request)
    }

    /// Nodes currently known through `add_node`/`remove_node`
    pub fn members(&self) -> HashSet<NodeId> {
        self.members.lock().keys().copied().collect()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send_append_request(&self, target: NodeId, request: AppendRequest) -> Result<(), TransportError> {
        self.send(target, Message::AppendRequest(request))
    }

    async fn send_append_reply(&self, target: NodeId, reply: AppendReply) -> Result<(), TransportError> {
        self.send(target, Message::AppendReply(reply))
    }

    async fn send_vote_request(&self, target: NodeId, request: VoteRequest) -> Result<(), TransportError> {
        self.send(target, Message::VoteRequest(request))
    }

    async fn send_vote_reply(&self, target: NodeId, reply: VoteReply) -> Result<(), TransportError> {
        self.send(target, Message::VoteReply(reply))
    }

    async fn send_keepalive(&self, target: NodeId, keepalive: KeepAlive) -> Result<(), TransportError> {
        self.check_open()?;
        let request = Request::KeepAlive { from: self.id, keepalive };
        self.network.send(self.id, target, request)
    }

    async fn send_snapshot(&self, target: NodeId, request: InstallSnapshot) -> Result<SnapshotReply, TransportError> {
        self.check_open()?;
        self.network.send_snapshot(self.id, target, request).await
    }

    fn add_node(&self, id: NodeId, info: Bytes) {
        self.members.lock().insert(id, info);
    }

    fn remove_node(&self, id: NodeId) {
        self.members.lock().remove(&id);
    }

    async fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }
}

/// Handle for a node that processes incoming requests
pub struct NodeHandle {
    id: NodeId,
    receiver: mpsc::Receiver<Request>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Feed incoming requests to `server` until it stops or the inbox is
    /// replaced
    pub fn serve(mut self, server: RaftServer) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(request) = self.receiver.recv().await {
                match request {
                    Request::Message { from, message } => {
                        if let Err(RaftError::Stopped) = server.step(from, message) {
                            break;
                        }
                    }
                    Request::KeepAlive { from, keepalive } => {
                        if let Err(RaftError::Stopped) = server.keepalive(from, keepalive) {
                            break;
                        }
                    }
                    Request::Snapshot { from, request, reply } => {
                        // loading can take a while, keep serving other messages
                        let server = server.clone();
                        tokio::spawn(async move {
                            match server.apply_snapshot(from, request).await {
                                Ok(result) => {
                                    let _ = reply.send(result);
                                }
                                Err(e) => debug!(from = %from, error = %e, "snapshot install failed"),
                            }
                        });
                    }
                }
            }
            trace!(id = %self.id, "node handle finished");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote_reply() -> VoteReply {
        VoteReply {
            current_term: 1,
            vote_granted: true,
        }
    }

    async fn next_message(handle: &mut NodeHandle) -> Option<(NodeId, Message)> {
        match handle.receiver.try_recv().ok()? {
            Request::Message { from, message } => Some((from, message)),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_message_reaches_target() {
        let network = Arc::new(InMemoryNetwork::new());
        let (a, b) = (NodeId::from_u128(1), NodeId::from_u128(2));
        let _handle_a = network.register(a);
        let mut handle_b = network.register(b);

        network.transport(a).send_vote_reply(b, vote_reply()).await.unwrap();

        let (from, message) = next_message(&mut handle_b).await.unwrap();
        assert_eq!(from, a);
        assert!(matches!(message, Message::VoteReply(r) if r.vote_granted));
    }

    #[tokio::test]
    async fn test_keepalive_is_delivered_separately() {
        let network = Arc::new(InMemoryNetwork::new());
        let (a, b) = (NodeId::from_u128(1), NodeId::from_u128(2));
        let mut handle_b = network.register(b);
        let keepalive = KeepAlive {
            current_term: 3,
            leader_id: a,
        };

        network.transport(a).send_keepalive(b, keepalive.clone()).await.unwrap();

        match handle_b.receiver.try_recv().unwrap() {
            Request::KeepAlive { from, keepalive: received } => {
                assert_eq!(from, a);
                assert_eq!(received, keepalive);
            }
            _ => panic!("expected a keepalive"),
        }
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let network = Arc::new(InMemoryNetwork::new());
        let a = NodeId::from_u128(1);
        let result = network.transport(a).send_vote_reply(NodeId::from_u128(9), vote_reply()).await;
        assert_eq!(result, Err(TransportError::NodeNotFound));
    }

    #[tokio::test]
    async fn test_disconnect_drops_until_connected() {
        let network = Arc::new(InMemoryNetwork::new());
        let (a, b) = (NodeId::from_u128(1), NodeId::from_u128(2));
        let mut handle_b = network.register(b);
        let transport = network.transport(a);

        network.disconnect(a, b);
        transport.send_vote_reply(b, vote_reply()).await.unwrap();
        assert!(next_message(&mut handle_b).await.is_none());

        network.connect(a, b);
        transport.send_vote_reply(b, vote_reply()).await.unwrap();
        assert!(next_message(&mut handle_b).await.is_some());
    }

    #[tokio::test]
    async fn test_packet_loss_is_seeded() {
        let delivered = |seed| async move {
            let network = Arc::new(InMemoryNetwork::new().with_packet_loss(0.5, seed));
            let (a, b) = (NodeId::from_u128(1), NodeId::from_u128(2));
            let mut handle_b = network.register(b);
            let transport = network.transport(a);
            let mut pattern = Vec::new();
            for _ in 0..32 {
                transport.send_vote_reply(b, vote_reply()).await.unwrap();
                pattern.push(next_message(&mut handle_b).await.is_some());
            }
            pattern
        };

        let first = delivered(7).await;
        assert_eq!(first, delivered(7).await);
        assert!(first.iter().any(|d| *d));
        assert!(first.iter().any(|d| !*d));
    }

    #[tokio::test]
    async fn test_aborted_transport_refuses_sends() {
        let network = Arc::new(InMemoryNetwork::new());
        let (a, b) = (NodeId::from_u128(1), NodeId::from_u128(2));
        let _handle_b = network.register(b);
        let transport = network.transport(a);
        transport.abort().await;
        assert_eq!(transport.send_vote_reply(b, vote_reply()).await, Err(TransportError::Aborted));
    }

    #[tokio::test]
    async fn test_membership_notifications() {
        let network = Arc::new(InMemoryNetwork::new());
        let transport = network.transport(NodeId::from_u128(1));
        let b = NodeId::from_u128(2);
        transport.add_node(b, Bytes::from_static(b"addr-b"));
        assert!(transport.members().contains(&b));
        transport.remove_node(b);
        assert!(transport.members().is_empty());
    }
}
