//! Deterministic simulation of a cluster of bare `Fsm`s
//!
//! No tasks and no clock: the simulation ticks every node once per round,
//! persists outputs instantly and delivers the previous round's messages in
//! a seeded random order, dropping some. Invariants are checked after every
//! round and violations panic.

use std::collections::{BTreeMap, BTreeSet};

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::core::config::RaftConfig;
use crate::core::fsm::{Fsm, SnapshotOutput};
use crate::core::log::Log;
use crate::core::message::Message;
use crate::core::types::{Configuration, EntryPayload, Index, LogEntryPtr, NodeId, Snapshot, SnapshotId, Term};
use crate::state_machine::encode_value;

/// What a node has persisted, mirroring `MemoryStorage`
struct Persisted {
    term: Term,
    vote: Option<NodeId>,
    snapshot: Snapshot,
    entries: Vec<LogEntryPtr>,
}

impl Persisted {
    fn store_snapshot(&mut self, output: &SnapshotOutput) {
        let index = output.snapshot.index;
        let keep_above = index.saturating_sub(output.preserve_log_entries as Index);
        self.entries.retain(|e| e.index > keep_above);
        if output.log_discarded {
            self.entries.retain(|e| e.index <= index);
        }
        self.snapshot = output.snapshot.clone();
    }

    fn store_entries(&mut self, entries: &[LogEntryPtr]) {
        if let Some(first) = entries.first() {
            self.entries.retain(|e| e.index < first.index);
            self.entries.extend(entries.iter().cloned());
        }
    }

    fn restore(&self) -> Log {
        let mut entries = self.entries.clone();
        if entries.last().is_some_and(|e| e.index < self.snapshot.index) {
            entries.clear();
        }
        Log::new(self.snapshot.clone(), entries)
    }
}

struct SimNode {
    fsm: Fsm,
    persisted: Persisted,
    /// Highest index handed out as committed
    applied: Index,
    up: bool,
}

pub struct Simulation {
    config: RaftConfig,
    nodes: Vec<SimNode>,
    in_flight: Vec<(NodeId, NodeId, Message)>,
    rng: ChaCha8Rng,
    drop_rate: f64,
    isolated: BTreeSet<NodeId>,
    /// Every entry any node reported committed
    committed: BTreeMap<Index, LogEntryPtr>,
    leaders: BTreeMap<Term, NodeId>,
    commit_seen: BTreeMap<NodeId, Index>,
    rounds: u64,
}

impl Simulation {
    pub fn new(nodes: usize, seed: u64) -> Self {
        Self::with_config(nodes, seed, RaftConfig::default().with_election_timeout(10))
    }

    pub fn with_config(count: usize, seed: u64, config: RaftConfig) -> Self {
        let ids: Vec<NodeId> = (0..count).map(|i| NodeId::from_u128(i as u128 + 1)).collect();
        let bootstrap = Snapshot::bootstrap(Configuration::from_ids(ids.iter().copied()));
        let nodes = ids
            .iter()
            .map(|id| {
                let persisted = Persisted {
                    term: 0,
                    vote: None,
                    snapshot: bootstrap.clone(),
                    entries: Vec::new(),
                };
                SimNode {
                    fsm: Fsm::new(*id, 0, None, persisted.restore(), &config),
                    persisted,
                    applied: 0,
                    up: true,
                }
            })
            .collect();
        Self {
            config,
            nodes,
            in_flight: Vec::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            drop_rate: 0.0,
            isolated: BTreeSet::new(),
            committed: BTreeMap::new(),
            leaders: BTreeMap::new(),
            commit_seen: BTreeMap::new(),
            rounds: 0,
        }
    }

    /// Drop each delivered message with probability `rate`
    pub fn with_drop_rate(mut self, rate: f64) -> Self {
        self.drop_rate = rate;
        self
    }

    pub fn fsm(&self, index: usize) -> &Fsm {
        &self.nodes[index].fsm
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    fn position(&self, id: NodeId) -> usize {
        self.nodes
            .iter()
            .position(|node| node.fsm.id() == id)
            .unwrap_or_else(|| panic!("unknown node {}", id))
    }

    /// Up node leading in the highest term
    pub fn leader(&self) -> Option<usize> {
        (0..self.nodes.len())
            .filter(|i| self.nodes[*i].up && self.nodes[*i].fsm.is_leader())
            .max_by_key(|i| self.nodes[*i].fsm.current_term())
    }

    /// Propose `value` on the current leader, returns the entry's index
    pub fn propose(&mut self, value: u64) -> Option<Index> {
        let leader = self.leader()?;
        let entry = self.nodes[leader].fsm.propose(encode_value(value)).ok()?;
        self.flush(leader);
        Some(entry.index)
    }

    /// Values of committed commands in log order
    pub fn committed_values(&self) -> Vec<u64> {
        self.committed
            .values()
            .filter_map(|entry| match &entry.payload {
                EntryPayload::Command(command) => {
                    let bytes: [u8; 8] = command.as_ref().try_into().ok()?;
                    Some(u64::from_le_bytes(bytes))
                }
                _ => None,
            })
            .collect()
    }

    pub fn committed_len(&self) -> usize {
        self.committed.len()
    }

    /// Lose volatile state. The node keeps what it persisted.
    pub fn crash(&mut self, index: usize) {
        self.nodes[index].up = false;
    }

    pub fn recover(&mut self, index: usize) {
        let node = &mut self.nodes[index];
        let id = node.fsm.id();
        let persisted = &node.persisted;
        node.fsm = Fsm::new(id, persisted.term, persisted.vote, persisted.restore(), &self.config);
        node.applied = persisted.snapshot.index;
        node.up = true;
        // the commit index restarts from the snapshot
        self.commit_seen.insert(id, persisted.snapshot.index);
    }

    pub fn isolate(&mut self, index: usize) {
        let id = self.nodes[index].fsm.id();
        self.isolated.insert(id);
    }

    pub fn heal(&mut self) {
        self.isolated.clear();
    }

    /// Compact node `index`'s log up to everything it has applied
    pub fn compact(&mut self, index: usize, trailing: usize) -> bool {
        let node = &mut self.nodes[index];
        if !node.up {
            return false;
        }
        let applied = node.applied;
        let taken = node
            .fsm
            .apply_local_snapshot(applied, SnapshotId::random(), trailing)
            .is_some();
        self.flush(index);
        taken
    }

    /// Tick every node once, then deliver the messages sent so far
    pub fn round(&mut self) {
        self.rounds += 1;
        for i in 0..self.nodes.len() {
            if self.nodes[i].up {
                self.nodes[i].fsm.tick();
                self.flush(i);
            }
        }

        let mut messages = std::mem::take(&mut self.in_flight);
        messages.shuffle(&mut self.rng);
        for (from, to, message) in messages {
            self.deliver(from, to, message);
        }
        self.check_invariants();
    }

    pub fn run(&mut self, rounds: u64) {
        for _ in 0..rounds {
            self.round();
        }
    }

    /// Run until a leader exists, up to `max_rounds`
    pub fn run_until_leader(&mut self, max_rounds: u64) -> Option<usize> {
        for _ in 0..max_rounds {
            if let Some(leader) = self.leader() {
                return Some(leader);
            }
            self.round();
        }
        self.leader()
    }

    fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        !self.isolated.contains(&from) && !self.isolated.contains(&to) && self.nodes[self.position(to)].up
    }

    fn deliver(&mut self, from: NodeId, to: NodeId, message: Message) {
        let sender = self.position(from);
        let lost = !self.reachable(from, to) || self.rng.random_bool(self.drop_rate);
        match message {
            Message::InstallSnapshot(request) if lost => {
                // a failed transfer is reported back like the driver does
                if self.nodes[sender].up {
                    let (index, term) = (request.snapshot.index, request.current_term);
                    self.nodes[sender].fsm.snapshot_status(to, index, term, false);
                    self.flush(sender);
                }
            }
            Message::InstallSnapshot(request) => {
                let (index, term) = (request.snapshot.index, request.current_term);
                let target = self.position(to);
                self.nodes[target].fsm.step(from, Message::InstallSnapshot(request));
                self.flush(target);
                // transfers are request/response, the reply goes back at once
                let reply = self
                    .in_flight
                    .iter()
                    .rposition(|(f, t, m)| *f == to && *t == from && matches!(m, Message::SnapshotReply(_)))
                    .map(|position| self.in_flight.remove(position));
                if let Some((_, _, Message::SnapshotReply(reply))) = reply {
                    if self.nodes[sender].up {
                        let success = reply.success;
                        self.nodes[sender].fsm.step(to, Message::SnapshotReply(reply));
                        self.nodes[sender].fsm.snapshot_status(to, index, term, success);
                        self.flush(sender);
                    }
                }
            }
            _ if lost => {}
            message => {
                let target = self.position(to);
                self.nodes[target].fsm.step(from, message);
                self.flush(target);
            }
        }
    }

    /// Persist and route everything a node has output, like the I/O loop
    fn flush(&mut self, index: usize) {
        loop {
            let node = &mut self.nodes[index];
            if !node.fsm.has_output() {
                break;
            }
            let output = node.fsm.poll_output();
            let id = node.fsm.id();

            if let Some((term, vote)) = output.term_and_vote {
                node.persisted.term = term;
                node.persisted.vote = vote;
            }
            if let Some(snapshot) = &output.snapshot {
                node.persisted.store_snapshot(snapshot);
                if !snapshot.local {
                    node.applied = node.applied.max(snapshot.snapshot.index);
                }
            }
            if let Some(last) = output.log_entries.last() {
                node.persisted.store_entries(&output.log_entries);
                node.fsm.mark_stable(last.term, last.index);
            }
            if let Some(last) = output.committed.last() {
                node.applied = last.index;
            }

            for (to, message) in output.messages {
                self.in_flight.push((id, to, message));
            }
            for entry in output.committed {
                self.record_commit(id, entry);
            }
        }
    }

    fn record_commit(&mut self, id: NodeId, entry: LogEntryPtr) {
        match self.committed.get(&entry.index) {
            Some(existing) => assert_eq!(
                existing, &entry,
                "node {} committed a different entry at index {}",
                id, entry.index
            ),
            None => {
                self.committed.insert(entry.index, entry);
            }
        }
    }

    /// Panic if any safety property is broken
    pub fn check_invariants(&mut self) {
        for i in 0..self.nodes.len() {
            let node = &self.nodes[i];
            if !node.up {
                continue;
            }
            let id = node.fsm.id();
            let term = node.fsm.current_term();

            if node.fsm.is_leader() {
                let leader = *self.leaders.entry(term).or_insert(id);
                assert_eq!(leader, id, "two leaders in term {}", term);
            }

            let commit = node.fsm.commit_index();
            let seen = self.commit_seen.entry(id).or_insert(0);
            assert!(commit >= *seen, "commit index of {} went back from {} to {}", id, seen, commit);
            *seen = commit;
        }

        let up: Vec<usize> = (0..self.nodes.len()).filter(|i| self.nodes[*i].up).collect();
        for (n, a) in up.iter().enumerate() {
            for b in &up[n + 1..] {
                check_log_matching(self.nodes[*a].fsm.log(), self.nodes[*b].fsm.log());
            }
        }

        // a deposed leader may not have heard of its successor yet
        let newest_term = self.leaders.keys().next_back().copied();
        let leader = self
            .leader()
            .filter(|i| Some(self.nodes[*i].fsm.current_term()) == newest_term);
        if let Some(leader) = leader {
            let log = self.nodes[leader].fsm.log();
            for (index, entry) in self.committed.range(log.snapshot().index + 1..) {
                assert_eq!(
                    log.term_for(*index),
                    Some(entry.term),
                    "leader {} is missing committed entry {}",
                    self.nodes[leader].fsm.id(),
                    index
                );
            }
        }
    }
}

/// Two logs that agree on an entry agree on every entry before it
fn check_log_matching(a: &Log, b: &Log) {
    let low = a.start_index().max(b.start_index());
    let high = a.last_index().min(b.last_index());
    let mut matched = false;
    for index in (low..=high).rev() {
        if matched {
            assert_eq!(a[index], b[index], "logs diverge at {} below a matching entry", index);
        } else if a[index].term == b[index].term {
            assert_eq!(a[index], b[index], "entries with the same term differ at {}", index);
            matched = true;
        }
    }
}
