//! In-memory storage implementation for testing
//!
//! No disk I/O. Clones share the same state, so a test can stop a server
//! and start a new one on the same storage to simulate a restart.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Storage, StorageError};
use crate::core::types::{Index, LogEntryPtr, NodeId, Snapshot, Term};

#[derive(Debug, Default)]
struct State {
    term: Term,
    vote: Option<NodeId>,
    log: Vec<LogEntryPtr>,
    snapshot: Option<Snapshot>,
}

/// In-memory storage implementation
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<State>>,
}

impl MemoryStorage {
    /// Create a new empty in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage of a node that has never run, seeded with a bootstrap
    /// snapshot carrying the initial configuration
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        let storage = Self::new();
        storage.state.lock().snapshot = Some(snapshot);
        storage
    }

    /// Index of the first stored entry, if any
    pub fn first_log_index(&self) -> Option<Index> {
        self.state.lock().log.first().map(|e| e.index)
    }

    pub fn log_len(&self) -> usize {
        self.state.lock().log.len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store_term_and_vote(&self, term: Term, vote: Option<NodeId>) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        state.term = term;
        state.vote = vote;
        Ok(())
    }

    async fn load_term_and_vote(&self) -> Result<(Term, Option<NodeId>), StorageError> {
        let state = self.state.lock();
        Ok((state.term, state.vote))
    }

    async fn store_snapshot(&self, snapshot: &Snapshot, preserve_log_entries: usize) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        let keep_above = snapshot.index.saturating_sub(preserve_log_entries as Index);
        state.log.retain(|e| e.index > keep_above);
        state.snapshot = Some(snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.state.lock().snapshot.clone())
    }

    async fn store_log_entries(&self, entries: &[LogEntryPtr]) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if let (Some(last), Some(first)) = (state.log.last(), entries.first()) {
            if first.index != last.index + 1 {
                return Err(StorageError::Corruption(format!(
                    "entry {} does not follow stored entry {}",
                    first.index, last.index
                )));
            }
        }
        state.log.extend(entries.iter().cloned());
        Ok(())
    }

    async fn truncate_log(&self, from_index: Index) -> Result<(), StorageError> {
        self.state.lock().log.retain(|e| e.index < from_index);
        Ok(())
    }

    async fn load_log(&self) -> Result<Vec<LogEntryPtr>, StorageError> {
        Ok(self.state.lock().log.clone())
    }
}
