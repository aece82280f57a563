//! Raft RPC message shapes
//!
//! Every message carries the sender's current term. Replies are separate
//! one-way messages, except for snapshot installation which the transport
//! runs as a request/response exchange.

use serde::{Deserialize, Serialize};

use super::types::{Index, LogEntryPtr, NodeId, Snapshot, Term};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub current_term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: Index,
    pub last_log_term: Term,
    /// Set when the current leader asked the candidate to take over;
    /// bypasses leader stickiness on the receiver.
    pub leadership_transfer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReply {
    pub current_term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRequest {
    pub current_term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: Index,
    pub prev_log_term: Term,
    pub leader_commit: Index,
    pub entries: Vec<LogEntryPtr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppendResult {
    /// The follower's log now matches the leader's up to `last_new_index`
    Accepted { last_new_index: Index },
    /// `non_matching_index` is the request's `prev_log_index`. The hint lets
    /// the leader skip a whole term at once: `conflict_term` is the term the
    /// follower holds at that index (None when its log is too short) and
    /// `first_index_of_conflict_term` where that term starts.
    Rejected {
        non_matching_index: Index,
        last_index: Index,
        conflict_term: Option<Term>,
        first_index_of_conflict_term: Index,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendReply {
    pub current_term: Term,
    pub commit_index: Index,
    pub result: AppendResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshot {
    pub current_term: Term,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotReply {
    pub current_term: Term,
    pub success: bool,
}

/// Best-effort liveness signal from a leader. Never answered, so it cannot
/// tell a stale leader about a newer term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAlive {
    pub current_term: Term,
    pub leader_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    AppendRequest(AppendRequest),
    AppendReply(AppendReply),
    VoteRequest(VoteRequest),
    VoteReply(VoteReply),
    InstallSnapshot(InstallSnapshot),
    SnapshotReply(SnapshotReply),
}

impl Message {
    pub fn term(&self) -> Term {
        match self {
            Message::AppendRequest(m) => m.current_term,
            Message::AppendReply(m) => m.current_term,
            Message::VoteRequest(m) => m.current_term,
            Message::VoteReply(m) => m.current_term,
            Message::InstallSnapshot(m) => m.current_term,
            Message::SnapshotReply(m) => m.current_term,
        }
    }
}
