//! State machine abstraction for Raft
//!
//! The state machine is the application logic that Raft coordinates.
//! When log entries are committed, their commands are applied to it in log
//! order, possibly several commits in one batch.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::core::types::SnapshotId;

/// Error returned by the user state machine. Ends the applier loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct StateMachineError(pub String);

impl StateMachineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// State machine trait - the application logic that Raft coordinates
///
/// Implementations must be deterministic: applying the same commands
/// in the same order must produce the same state on all nodes. A command
/// may be applied again after a restart, from the last loaded snapshot on.
#[async_trait]
pub trait StateMachine: Send {
    /// Apply committed commands in log order
    async fn apply(&mut self, commands: Vec<Bytes>) -> Result<(), StateMachineError>;

    /// Capture everything applied so far, returns an id for `load_snapshot`
    async fn take_snapshot(&mut self) -> Result<SnapshotId, StateMachineError>;

    /// The snapshot is no longer referenced by the log
    fn drop_snapshot(&mut self, id: SnapshotId);

    /// Replace the current state with a snapshot
    async fn load_snapshot(&mut self, id: SnapshotId) -> Result<(), StateMachineError>;

    /// Called once when the applier stops
    async fn abort(&mut self) {}
}
