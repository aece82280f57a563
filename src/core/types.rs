//! Identifiers, log entries, configurations and snapshots shared by every layer

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Election epoch. Never decreases on a given node.
pub type Term = u64;

/// 1-based position in the log; 0 means "no entry".
pub type Index = u64;

/// Cluster member identity. The nil id stands for "no leader".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generate a fresh random id
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Seed for per-node deterministic randomness
    pub(crate) fn seed(&self) -> u64 {
        let value = self.0.as_u128();
        (value as u64) ^ ((value >> 64) as u64)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of a snapshot owned by the user state machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotId(Uuid);

impl SnapshotId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cluster membership. `previous` is non-empty only while a joint
/// configuration is in effect. Each member carries an opaque
/// connection-info blob for the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub current: BTreeMap<NodeId, Bytes>,
    pub previous: BTreeMap<NodeId, Bytes>,
}

impl Configuration {
    pub fn new(members: impl IntoIterator<Item = (NodeId, Bytes)>) -> Self {
        Self {
            current: members.into_iter().collect(),
            previous: BTreeMap::new(),
        }
    }

    /// Configuration whose members carry no connection info
    pub fn from_ids(ids: impl IntoIterator<Item = NodeId>) -> Self {
        Self::new(ids.into_iter().map(|id| (id, Bytes::new())))
    }

    pub fn is_joint(&self) -> bool {
        !self.previous.is_empty()
    }

    /// Whether `id` votes in either half of the configuration
    pub fn contains(&self, id: &NodeId) -> bool {
        self.current.contains_key(id) || self.previous.contains_key(id)
    }

    /// Union of current and previous members
    pub fn members(&self) -> BTreeSet<NodeId> {
        self.current.keys().chain(self.previous.keys()).copied().collect()
    }

    /// Joint configuration moving from this one to `members`
    pub fn enter_joint(&self, members: BTreeMap<NodeId, Bytes>) -> Self {
        Self {
            current: members,
            previous: self.current.clone(),
        }
    }

    /// Final configuration after a joint one commits
    pub fn leave_joint(&self) -> Self {
        Self {
            current: self.current.clone(),
            previous: BTreeMap::new(),
        }
    }

    /// Connection info of a member, looking at both halves
    pub fn info(&self, id: &NodeId) -> Option<&Bytes> {
        self.current.get(id).or_else(|| self.previous.get(id))
    }
}

/// What a log entry carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Opaque user command handed to the state machine
    Command(Bytes),
    /// Membership change
    Configuration(Configuration),
    /// No-op appended by a new leader and by read barriers
    Dummy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: Index,
    pub payload: EntryPayload,
}

/// Entries are immutable once created and shared between the log,
/// outgoing messages and the applier.
pub type LogEntryPtr = Arc<LogEntry>;

/// Point-in-time compaction of every entry up to and including `index`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub index: Index,
    pub term: Term,
    /// Configuration in effect at `index`
    pub config: Configuration,
    pub id: SnapshotId,
}

impl Snapshot {
    /// Empty snapshot carrying only the initial cluster configuration
    pub fn bootstrap(config: Configuration) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }
}
