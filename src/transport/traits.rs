//! Transport abstraction for Raft RPC communication

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::core::message::{
    AppendReply, AppendRequest, InstallSnapshot, KeepAlive, SnapshotReply, VoteReply, VoteRequest,
};
use crate::core::types::NodeId;

/// Transport abstraction for Raft RPC communication
///
/// Every send except `send_snapshot` is one-way and best-effort: replies come
/// back later through the receiving server's entry points. A lost message is
/// not an error, the protocol retries on its own timer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_append_request(&self, target: NodeId, request: AppendRequest) -> Result<(), TransportError>;

    async fn send_append_reply(&self, target: NodeId, reply: AppendReply) -> Result<(), TransportError>;

    async fn send_vote_request(&self, target: NodeId, request: VoteRequest) -> Result<(), TransportError>;

    async fn send_vote_reply(&self, target: NodeId, reply: VoteReply) -> Result<(), TransportError>;

    /// Leader liveness signal, sent every tick. Transports serving many
    /// groups may coalesce these per target node.
    async fn send_keepalive(&self, _target: NodeId, _keepalive: KeepAlive) -> Result<(), TransportError> {
        Ok(())
    }

    /// Ship a snapshot, together with whatever state machine data its id
    /// refers to, and wait for the peer to load it
    async fn send_snapshot(&self, target: NodeId, request: InstallSnapshot) -> Result<SnapshotReply, TransportError>;

    /// A node joined the configuration. `info` is the opaque address data
    /// stored with the member.
    fn add_node(&self, id: NodeId, info: Bytes);

    /// A node left the configuration
    fn remove_node(&self, id: NodeId);

    /// Called once on server shutdown
    async fn abort(&self) {}
}

/// Errors that can occur during transport operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection to the target node failed
    #[error("connection failed")]
    ConnectionFailed,
    /// Request timed out
    #[error("request timed out")]
    Timeout,
    /// Target node not found
    #[error("node not found")]
    NodeNotFound,
    /// The transport was shut down
    #[error("transport aborted")]
    Aborted,
}
