//! Raft consensus core
//!
//! A deterministic Raft state machine (`core::fsm`) plus the async server
//! that turns its decisions into persisted state, network messages and
//! applied commands. Storage, transport and the user state machine are
//! pluggable through traits; in-memory versions of each are included for
//! tests.

pub mod core;
pub mod state_machine;
pub mod storage;
pub mod transport;

/// Testing utilities for integration tests.
pub mod testing;

pub use crate::core::message::Message;
pub use crate::core::types::{Configuration, EntryPayload, Index, LogEntry, NodeId, Snapshot, SnapshotId, Term};
pub use crate::core::{RaftConfig, RaftError, RaftServer, WaitType};
