//! Leader-side replication progress and candidate-side vote counting

use std::collections::{BTreeSet, HashMap};

use super::types::{Configuration, Index, NodeId};

/// How the leader currently feeds a follower
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationState {
    /// Next index unknown: send one append at a time and wait for the answer
    Probe,
    /// Log matches: stream appends optimistically
    Pipeline,
    /// A snapshot up to `index` is being transferred
    Snapshot { index: Index },
}

#[derive(Debug, Clone)]
pub struct FollowerProgress {
    pub next_index: Index,
    pub match_index: Index,
    pub state: ReplicationState,
    /// Probe outstanding, no further appends until it is answered or retried
    pub probe_sent: bool,
    /// Appends sent in pipeline mode and not yet acknowledged
    pub in_flight: usize,
    /// Heard from during the current check-quorum window
    pub recently_active: bool,
}

impl FollowerProgress {
    fn new(next_index: Index) -> Self {
        Self {
            next_index,
            match_index: 0,
            state: ReplicationState::Probe,
            probe_sent: false,
            in_flight: 0,
            recently_active: false,
        }
    }

    pub fn become_probe(&mut self) {
        self.state = ReplicationState::Probe;
        self.probe_sent = false;
        self.in_flight = 0;
    }

    pub fn become_pipeline(&mut self) {
        self.state = ReplicationState::Pipeline;
        self.probe_sent = false;
        self.in_flight = 0;
    }

    pub fn become_snapshot(&mut self, index: Index) {
        self.state = ReplicationState::Snapshot { index };
        self.probe_sent = false;
        self.in_flight = 0;
    }

    pub fn can_send(&self, max_in_flight: usize) -> bool {
        match self.state {
            ReplicationState::Probe => !self.probe_sent,
            ReplicationState::Pipeline => self.in_flight < max_in_flight,
            ReplicationState::Snapshot { .. } => false,
        }
    }
}

/// Progress of every voting member, the leader included. Dropped wholesale
/// when the leader steps down.
#[derive(Debug, Default)]
pub struct Tracker {
    progress: HashMap<NodeId, FollowerProgress>,
    current: BTreeSet<NodeId>,
    previous: BTreeSet<NodeId>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Align tracked members with `config`. New members start probing at
    /// `next_index`; members that left are forgotten.
    pub fn set_configuration(&mut self, config: &Configuration, next_index: Index) {
        self.current = config.current.keys().copied().collect();
        self.previous = config.previous.keys().copied().collect();
        let members = config.members();
        self.progress.retain(|id, _| members.contains(id));
        for id in members {
            self.progress
                .entry(id)
                .or_insert_with(|| FollowerProgress::new(next_index));
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<&FollowerProgress> {
        self.progress.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut FollowerProgress> {
        self.progress.get_mut(id)
    }

    /// Every tracked member except `leader`, in a stable order
    pub fn followers(&self, leader: NodeId) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.progress.keys().copied().filter(|id| *id != leader).collect();
        ids.sort();
        ids
    }

    /// Highest index replicated on a quorum. In joint consensus both halves
    /// must agree.
    pub fn committed_index(&self) -> Index {
        let current = self.quorum_match(&self.current);
        if self.previous.is_empty() {
            current
        } else {
            current.min(self.quorum_match(&self.previous))
        }
    }

    fn quorum_match(&self, voters: &BTreeSet<NodeId>) -> Index {
        if voters.is_empty() {
            return 0;
        }
        let mut matched: Vec<Index> = voters
            .iter()
            .map(|id| self.progress.get(id).map_or(0, |p| p.match_index))
            .collect();
        matched.sort_unstable_by(|a, b| b.cmp(a));
        matched[voters.len() / 2]
    }

    /// Whether a quorum was heard from in the last window; `leader` always counts
    pub fn quorum_active(&self, leader: NodeId) -> bool {
        let active = |voters: &BTreeSet<NodeId>| {
            let count = voters
                .iter()
                .filter(|id| **id == leader || self.progress.get(id).is_some_and(|p| p.recently_active))
                .count();
            voters.is_empty() || count > voters.len() / 2
        };
        active(&self.current) && active(&self.previous)
    }

    pub fn reset_activity(&mut self) {
        for progress in self.progress.values_mut() {
            progress.recently_active = false;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteResult {
    Unknown,
    Won,
    Lost,
}

#[derive(Debug)]
struct Tally {
    voters: BTreeSet<NodeId>,
    granted: BTreeSet<NodeId>,
    rejected: BTreeSet<NodeId>,
}

impl Tally {
    fn new(voters: BTreeSet<NodeId>) -> Self {
        Self {
            voters,
            granted: BTreeSet::new(),
            rejected: BTreeSet::new(),
        }
    }

    fn register(&mut self, id: NodeId, granted: bool) {
        if !self.voters.contains(&id) || self.granted.contains(&id) || self.rejected.contains(&id) {
            return;
        }
        if granted {
            self.granted.insert(id);
        } else {
            self.rejected.insert(id);
        }
    }

    fn result(&self) -> VoteResult {
        let quorum = self.voters.len() / 2 + 1;
        if self.granted.len() >= quorum {
            VoteResult::Won
        } else if self.voters.len() - self.rejected.len() < quorum {
            VoteResult::Lost
        } else {
            VoteResult::Unknown
        }
    }
}

/// Votes collected by a candidate. Each voter counts once, whatever it sends.
#[derive(Debug)]
pub struct Votes {
    current: Tally,
    previous: Option<Tally>,
}

impl Votes {
    pub fn new(config: &Configuration) -> Self {
        let previous = config
            .is_joint()
            .then(|| Tally::new(config.previous.keys().copied().collect()));
        Self {
            current: Tally::new(config.current.keys().copied().collect()),
            previous,
        }
    }

    pub fn register(&mut self, id: NodeId, granted: bool) {
        self.current.register(id, granted);
        if let Some(previous) = &mut self.previous {
            previous.register(id, granted);
        }
    }

    pub fn result(&self) -> VoteResult {
        let previous = self.previous.as_ref().map_or(VoteResult::Won, Tally::result);
        match (self.current.result(), previous) {
            (VoteResult::Won, VoteResult::Won) => VoteResult::Won,
            (VoteResult::Lost, _) | (_, VoteResult::Lost) => VoteResult::Lost,
            _ => VoteResult::Unknown,
        }
    }
}
