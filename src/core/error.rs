//! Errors surfaced to callers of the Raft server

use thiserror::Error;

use super::types::NodeId;
use crate::state_machine::StateMachineError;
use crate::storage::StorageError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum RaftError {
    /// This node is not the leader (includes leader hint if known)
    #[error("not a leader, current leader: {}", display_leader(.leader))]
    NotLeader { leader: Option<NodeId> },

    #[error("a configuration change is already in progress")]
    ConfChangeInProgress,

    #[error("configuration must contain at least one member")]
    EmptyConfiguration,

    /// The entry was replaced by one from a newer leader before committing
    #[error("entry was dropped because of a leader change")]
    DroppedEntry,

    /// The entry may or may not have been committed
    #[error("commit status of the entry is unknown")]
    CommitStatusUnknown,

    #[error("raft server is stopped")]
    Stopped,

    #[error("a snapshot is already being installed")]
    SnapshotInProgress,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("state machine error: {0}")]
    StateMachine(#[from] StateMachineError),
}

fn display_leader(leader: &Option<NodeId>) -> String {
    leader.map_or_else(|| "unknown".to_string(), |id| id.to_string())
}
