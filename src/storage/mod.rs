//! Storage abstraction for Raft persistent state
//!
//! Raft requires certain state to be persisted to stable storage before
//! it is acted upon: the current term and vote, the log and the latest
//! snapshot descriptor.
//!
//! - `MemoryStorage`: in-memory storage for tests and simulations

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::types::{Index, LogEntryPtr, NodeId, Snapshot, Term};

pub use memory::MemoryStorage;

/// Errors that can occur during storage operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// I/O error (e.g., disk full, permission denied)
    #[error("I/O error: {0}")]
    Io(String),
    /// Data corruption detected
    #[error("data corruption: {0}")]
    Corruption(String),
    /// Storage not initialized
    #[error("storage not initialized")]
    NotInitialized,
}

/// Storage trait for Raft persistent state
///
/// Implementations must ensure durability: every write must survive a crash
/// once the returned future completes. Writes are issued by a single task in
/// order, and a truncation must be visible before entries stored after it.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist term and vote atomically
    async fn store_term_and_vote(&self, term: Term, vote: Option<NodeId>) -> Result<(), StorageError>;

    /// Returns (0, None) on a fresh start
    async fn load_term_and_vote(&self) -> Result<(Term, Option<NodeId>), StorageError>;

    /// Persist the snapshot descriptor and drop stored entries with index
    /// at or below `snapshot.index - preserve_log_entries`. Entries past the
    /// snapshot index are kept.
    async fn store_snapshot(&self, snapshot: &Snapshot, preserve_log_entries: usize) -> Result<(), StorageError>;

    /// Latest snapshot, None on a fresh start
    async fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError>;

    /// Append entries after the stored ones
    async fn store_log_entries(&self, entries: &[LogEntryPtr]) -> Result<(), StorageError>;

    /// Truncate the log from the given index (inclusive)
    /// Removes all entries with index >= from_index
    async fn truncate_log(&self, from_index: Index) -> Result<(), StorageError>;

    /// All stored entries in index order
    async fn load_log(&self) -> Result<Vec<LogEntryPtr>, StorageError>;

    /// Called once on server shutdown
    async fn abort(&self) {}
}
