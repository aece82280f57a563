//! Hashing state machine used to verify replicas
//!
//! Every command is a little-endian `u64`. Applying it folds the value into a
//! running hash, so two replicas that applied the same commands in the same
//! order hold the same hash. Snapshots are serialized to JSON and kept in a
//! `SnapshotStore` that can be shared by a whole test cluster; the in-memory
//! transport copies snapshot data between nodes through it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{StateMachine, StateMachineError};
use crate::core::types::{NodeId, SnapshotId};

const HASH_SEED: u64 = 0xcbf2_9ce4_8422_2325;
const HASH_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Encode a value as a command for `HashStateMachine`
pub fn encode_value(value: u64) -> Bytes {
    Bytes::copy_from_slice(&value.to_le_bytes())
}

fn decode_value(command: &[u8]) -> Result<u64, StateMachineError> {
    let bytes: [u8; 8] = command
        .try_into()
        .map_err(|_| StateMachineError(format!("expected an 8 byte command, got {} bytes", command.len())))?;
    Ok(u64::from_le_bytes(bytes))
}

fn fold(hash: u64, value: u64) -> u64 {
    (hash ^ value).wrapping_mul(HASH_PRIME)
}

/// Hash a replica holds after applying `values` in order
pub fn hash_values(values: impl IntoIterator<Item = u64>) -> u64 {
    values.into_iter().fold(HASH_SEED, fold)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashState {
    pub hash: u64,
    /// Number of commands applied
    pub applied: u64,
    /// Applied values in order
    pub values: Vec<u64>,
}

impl Default for HashState {
    fn default() -> Self {
        Self {
            hash: HASH_SEED,
            applied: 0,
            values: Vec::new(),
        }
    }
}

/// State that stays readable after the state machine is handed to a server
pub type SharedHashState = Arc<Mutex<HashState>>;

/// Serialized snapshots keyed by owning node
#[derive(Debug, Default)]
pub struct SnapshotStore {
    snapshots: Mutex<HashMap<(NodeId, SnapshotId), Vec<u8>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, node: NodeId, id: SnapshotId, state: &HashState) -> Result<(), StateMachineError> {
        let data = serde_json::to_vec(state).map_err(|e| StateMachineError(e.to_string()))?;
        self.snapshots.lock().insert((node, id), data);
        Ok(())
    }

    pub fn load(&self, node: NodeId, id: SnapshotId) -> Result<HashState, StateMachineError> {
        let snapshots = self.snapshots.lock();
        let data = snapshots
            .get(&(node, id))
            .ok_or_else(|| StateMachineError(format!("snapshot {} of node {} not found", id, node)))?;
        serde_json::from_slice(data).map_err(|e| StateMachineError(e.to_string()))
    }

    pub fn remove(&self, node: NodeId, id: SnapshotId) {
        self.snapshots.lock().remove(&(node, id));
    }

    /// Ship a snapshot to another node. Returns false if `from` no longer has it.
    pub fn copy(&self, from: NodeId, to: NodeId, id: SnapshotId) -> bool {
        let mut snapshots = self.snapshots.lock();
        match snapshots.get(&(from, id)).cloned() {
            Some(data) => {
                snapshots.insert((to, id), data);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, node: NodeId, id: SnapshotId) -> bool {
        self.snapshots.lock().contains_key(&(node, id))
    }

    /// Number of snapshots a node holds
    pub fn count(&self, node: NodeId) -> usize {
        self.snapshots.lock().keys().filter(|(n, _)| *n == node).count()
    }
}

pub struct HashStateMachine {
    node: NodeId,
    state: SharedHashState,
    snapshots: Arc<SnapshotStore>,
}

impl HashStateMachine {
    pub fn new(node: NodeId, snapshots: Arc<SnapshotStore>) -> Self {
        Self {
            node,
            state: Arc::new(Mutex::new(HashState::default())),
            snapshots,
        }
    }

    /// Handle for inspecting the state from outside
    pub fn state(&self) -> SharedHashState {
        self.state.clone()
    }
}

#[async_trait]
impl StateMachine for HashStateMachine {
    async fn apply(&mut self, commands: Vec<Bytes>) -> Result<(), StateMachineError> {
        let mut state = self.state.lock();
        for command in commands {
            let value = decode_value(&command)?;
            state.hash = fold(state.hash, value);
            state.applied += 1;
            state.values.push(value);
        }
        Ok(())
    }

    async fn take_snapshot(&mut self) -> Result<SnapshotId, StateMachineError> {
        let id = SnapshotId::random();
        let state = self.state.lock().clone();
        self.snapshots.save(self.node, id, &state)?;
        debug!(node = %self.node, snapshot = %id, applied = state.applied, "took snapshot");
        Ok(id)
    }

    fn drop_snapshot(&mut self, id: SnapshotId) {
        self.snapshots.remove(self.node, id);
    }

    async fn load_snapshot(&mut self, id: SnapshotId) -> Result<(), StateMachineError> {
        let loaded = self.snapshots.load(self.node, id)?;
        debug!(node = %self.node, snapshot = %id, applied = loaded.applied, "loaded snapshot");
        *self.state.lock() = loaded;
        Ok(())
    }
}
