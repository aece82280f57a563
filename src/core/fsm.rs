//! Deterministic Raft protocol state machine
//!
//! `Fsm` never performs I/O. Inputs arrive through `tick`, `step`, the
//! `propose*` calls and `mark_stable`; every decision is buffered and handed
//! out as one `FsmOutput` batch by `poll_output`. The caller must finish
//! processing a batch (persist, send, apply) before polling the next one.
//!
//! Given the same sequence of inputs two instances with the same id end up in
//! the same state: the only randomness, the election timeout, comes from an
//! RNG seeded with the node id.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, trace, warn};

use super::config::RaftConfig;
use super::error::RaftError;
use super::log::Log;
use super::message::{
    AppendReply, AppendRequest, AppendResult, InstallSnapshot, KeepAlive, Message, SnapshotReply,
    VoteReply, VoteRequest,
};
use super::progress::{ReplicationState, Tracker, VoteResult, Votes};
use super::types::{
    Configuration, EntryPayload, Index, LogEntry, LogEntryPtr, NodeId, Snapshot, SnapshotId, Term,
};

/// Public view of the node's role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Role together with the state that only exists in that role
#[derive(Debug)]
enum RoleState {
    Follower,
    Candidate { votes: Votes },
    Leader { tracker: Tracker },
}

/// A snapshot the driver has to persist
#[derive(Debug, Clone)]
pub struct SnapshotOutput {
    pub snapshot: Snapshot,
    /// Entries at or below the snapshot index to keep in storage
    pub preserve_log_entries: usize,
    /// Taken by this node's state machine; otherwise received from the
    /// leader and still to be loaded
    pub local: bool,
    /// The whole log was dropped, storage must drop entries past the snapshot too
    pub log_discarded: bool,
}

/// One batch of work for the driver, processed in field order
#[derive(Debug, Default)]
pub struct FsmOutput {
    pub term_and_vote: Option<(Term, Option<NodeId>)>,
    pub snapshot: Option<SnapshotOutput>,
    pub log_entries: Vec<LogEntryPtr>,
    pub messages: Vec<(NodeId, Message)>,
    pub committed: Vec<LogEntryPtr>,
    /// Effective configuration, present when it changed since the last batch
    pub configuration: Option<Configuration>,
}

impl FsmOutput {
    pub fn is_empty(&self) -> bool {
        self.term_and_vote.is_none()
            && self.snapshot.is_none()
            && self.log_entries.is_empty()
            && self.messages.is_empty()
            && self.committed.is_empty()
            && self.configuration.is_none()
    }
}

/// What the driver has already been told
#[derive(Debug)]
struct Observed {
    term: Term,
    vote: Option<NodeId>,
    commit_index: Index,
    config: Configuration,
}

pub struct Fsm {
    id: NodeId,
    current_term: Term,
    voted_for: Option<NodeId>,
    current_leader: Option<NodeId>,
    commit_index: Index,
    log: Log,
    role: RoleState,
    config: RaftConfig,
    rng: ChaCha8Rng,
    election_elapsed: u64,
    randomized_election_timeout: u64,
    heartbeat_elapsed: u64,
    observed: Observed,
    /// First log index not yet handed out for persistence
    unpersisted_from: Index,
    messages: Vec<(NodeId, Message)>,
    pending_snapshot: Option<SnapshotOutput>,
}

impl Fsm {
    /// Rebuild a node from its persisted term, vote and log. The node starts
    /// as a follower with the commit index at the snapshot boundary.
    pub fn new(
        id: NodeId,
        current_term: Term,
        voted_for: Option<NodeId>,
        log: Log,
        config: &RaftConfig,
    ) -> Self {
        let commit_index = log.snapshot().index;
        let unpersisted_from = log.next_index();
        let mut fsm = Self {
            id,
            current_term,
            voted_for,
            current_leader: None,
            commit_index,
            log,
            role: RoleState::Follower,
            config: config.clone(),
            rng: ChaCha8Rng::seed_from_u64(id.seed()),
            election_elapsed: 0,
            randomized_election_timeout: 0,
            heartbeat_elapsed: 0,
            observed: Observed {
                term: current_term,
                vote: voted_for,
                commit_index,
                // empty so the first batch announces the configuration
                config: Configuration::default(),
            },
            unpersisted_from,
            messages: Vec::new(),
            pending_snapshot: None,
        };
        fsm.reset_election_timeout();
        fsm
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.current_leader
    }

    pub fn commit_index(&self) -> Index {
        self.commit_index
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn configuration(&self) -> &Configuration {
        self.log.configuration()
    }

    pub fn role(&self) -> Role {
        match self.role {
            RoleState::Follower => Role::Follower,
            RoleState::Candidate { .. } => Role::Candidate,
            RoleState::Leader { .. } => Role::Leader,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, RoleState::Leader { .. })
    }

    pub fn is_follower(&self) -> bool {
        matches!(self.role, RoleState::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self.role, RoleState::Candidate { .. })
    }

    /// Replication progress of a peer, only while leader
    pub fn progress(&self, peer: &NodeId) -> Option<&super::progress::FollowerProgress> {
        match &self.role {
            RoleState::Leader { tracker } => tracker.get(peer),
            _ => None,
        }
    }

    fn is_voter(&self) -> bool {
        self.log.configuration().contains(&self.id)
    }

    /// A leader was heard from within the last election timeout
    fn leader_is_live(&self) -> bool {
        self.current_leader.is_some() && self.election_elapsed < self.config.election_timeout
    }

    fn reset_election_timeout(&mut self) {
        let base = self.config.election_timeout;
        self.randomized_election_timeout = self.rng.random_range(base..2 * base);
    }

    // ---- inputs -------------------------------------------------------------

    /// Advance the logical clock by one tick
    pub fn tick(&mut self) {
        self.election_elapsed += 1;
        if self.is_leader() {
            self.tick_leader();
        } else if self.election_elapsed >= self.randomized_election_timeout && self.is_voter() {
            debug!(id = %self.id, term = self.current_term, "election timeout");
            self.become_candidate(false);
        }
    }

    fn tick_leader(&mut self) {
        if self.election_elapsed >= self.config.election_timeout {
            self.election_elapsed = 0;
            if let RoleState::Leader { tracker } = &mut self.role {
                let active = tracker.quorum_active(self.id);
                tracker.reset_activity();
                if !active {
                    warn!(id = %self.id, term = self.current_term, "lost contact with a quorum, stepping down");
                    self.become_follower(None);
                    return;
                }
            }
        }
        self.heartbeat_elapsed += 1;
        if self.heartbeat_elapsed >= self.config.heartbeat_interval {
            self.heartbeat_elapsed = 0;
            self.broadcast_heartbeat();
        }
    }

    /// Start an election right away. With `leadership_transfer` set, peers
    /// grant votes even if they still hear from a leader.
    pub fn campaign(&mut self, leadership_transfer: bool) {
        if self.is_leader() || !self.is_voter() {
            return;
        }
        self.become_candidate(leadership_transfer);
    }

    /// Append a user command. Only a leader accepts proposals.
    pub fn propose(&mut self, command: Bytes) -> Result<LogEntryPtr, RaftError> {
        self.ensure_leader()?;
        Ok(self.add_entry(EntryPayload::Command(command)))
    }

    /// Append a no-op, used by read barriers
    pub fn propose_dummy(&mut self) -> Result<LogEntryPtr, RaftError> {
        self.ensure_leader()?;
        Ok(self.add_entry(EntryPayload::Dummy))
    }

    /// Start moving the cluster to `members` through a joint configuration.
    /// The final configuration is appended automatically once the joint one
    /// commits.
    pub fn propose_config_change(
        &mut self,
        members: BTreeMap<NodeId, Bytes>,
    ) -> Result<LogEntryPtr, RaftError> {
        self.ensure_leader()?;
        if members.is_empty() {
            return Err(RaftError::EmptyConfiguration);
        }
        let config = self.log.configuration();
        // also wait until something from this term commits, so the previous
        // leader's unfinished change cannot overlap with ours
        if config.is_joint()
            || self.log.last_conf_index() > self.commit_index
            || self.log.term_for(self.commit_index) != Some(self.current_term)
        {
            return Err(RaftError::ConfChangeInProgress);
        }
        let joint = config.enter_joint(members);
        info!(id = %self.id, term = self.current_term, members = joint.current.len(), "entering joint configuration");
        Ok(self.add_entry(EntryPayload::Configuration(joint)))
    }

    fn ensure_leader(&self) -> Result<(), RaftError> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(RaftError::NotLeader {
                leader: self.current_leader,
            })
        }
    }

    /// Feed a message received from `from`
    pub fn step(&mut self, from: NodeId, message: Message) {
        let term = message.term();
        if term > self.current_term {
            if let Message::VoteRequest(request) = &message {
                if !request.leadership_transfer && self.leader_is_live() {
                    debug!(id = %self.id, candidate = %from, term, "ignoring vote request while the leader is alive");
                    return;
                }
            }
            let leader = match &message {
                Message::AppendRequest(_) | Message::InstallSnapshot(_) => Some(from),
                _ => None,
            };
            debug!(id = %self.id, term = self.current_term, new_term = term, from = %from, "observed a higher term");
            self.update_current_term(term);
            self.become_follower(leader);
        } else if term < self.current_term {
            self.reply_to_stale(from, &message);
            return;
        }

        match message {
            Message::AppendRequest(request) => self.handle_append_request(from, request),
            Message::AppendReply(reply) => self.handle_append_reply(from, reply),
            Message::VoteRequest(request) => self.handle_vote_request(from, request),
            Message::VoteReply(reply) => self.handle_vote_reply(from, reply),
            Message::InstallSnapshot(request) => self.handle_install_snapshot(from, request),
            // transfer outcome arrives through snapshot_status
            Message::SnapshotReply(_) => {}
        }
    }

    /// Reset the election timer on a follower of the same term. Keepalives
    /// never change the term or demote anyone.
    pub fn keepalive(&mut self, from: NodeId, keepalive: KeepAlive) {
        if keepalive.current_term != self.current_term || self.is_leader() {
            trace!(id = %self.id, from = %from, "ignoring keepalive");
            return;
        }
        if self.is_candidate() {
            self.become_follower(Some(keepalive.leader_id));
        }
        self.current_leader = Some(keepalive.leader_id);
        self.election_elapsed = 0;
    }

    /// Entries through `index` of `term` are durable. No-op if the log
    /// changed under the write or the index is already stable.
    pub fn mark_stable(&mut self, term: Term, index: Index) {
        if index <= self.log.stable_index() || index > self.log.last_index() {
            return;
        }
        if self.log.term_for(index) != Some(term) {
            trace!(id = %self.id, index, term, "stable entry was replaced");
            return;
        }
        self.log.mark_stable(index);
        if let RoleState::Leader { tracker } = &mut self.role {
            if let Some(own) = tracker.get_mut(&self.id) {
                own.match_index = index;
                own.next_index = index + 1;
            }
            self.maybe_commit();
        }
    }

    /// Outcome of the transfer of snapshot `index` to `peer`, started while
    /// leading in `term`. Results of transfers the progress no longer waits
    /// for are ignored.
    pub fn snapshot_status(&mut self, peer: NodeId, index: Index, term: Term, success: bool) {
        if term != self.current_term {
            trace!(id = %self.id, peer = %peer, index, term, "ignoring snapshot status from an older term");
            return;
        }
        let RoleState::Leader { tracker } = &mut self.role else {
            return;
        };
        let Some(progress) = tracker.get_mut(&peer) else {
            return;
        };
        if progress.state != (ReplicationState::Snapshot { index }) {
            trace!(id = %self.id, peer = %peer, index, "ignoring status of a superseded snapshot transfer");
            return;
        }
        if success {
            progress.match_index = progress.match_index.max(index);
            progress.next_index = progress.match_index + 1;
            progress.become_probe();
            info!(id = %self.id, peer = %peer, index, "snapshot transfer finished");
            self.maybe_commit();
            self.replicate_to(peer, false);
        } else {
            warn!(id = %self.id, peer = %peer, index, "snapshot transfer failed");
            progress.become_probe();
            // retried by the next heartbeat
            progress.probe_sent = true;
        }
    }

    /// Compact the log up to `index` after the state machine took snapshot
    /// `id` of everything applied through `index`. Returns the snapshot to
    /// record, or None when it is obsolete and should be dropped.
    pub fn apply_local_snapshot(
        &mut self,
        index: Index,
        id: SnapshotId,
        trailing: usize,
    ) -> Option<Snapshot> {
        if self.pending_snapshot.is_some() || index <= self.log.snapshot().index {
            return None;
        }
        assert!(
            index <= self.observed.commit_index,
            "snapshot at {} covers entries that were never committed",
            index
        );
        let term = self.log.term_for(index)?;
        let snapshot = Snapshot {
            index,
            term,
            config: self.log.configuration_at(index),
            id,
        };
        debug!(id = %self.id, index, term, "compacting log");
        self.log.apply_snapshot(snapshot.clone(), trailing);
        self.pending_snapshot = Some(SnapshotOutput {
            snapshot: snapshot.clone(),
            preserve_log_entries: trailing,
            local: true,
            log_discarded: false,
        });
        Some(snapshot)
    }

    // ---- output -------------------------------------------------------------

    pub fn has_output(&self) -> bool {
        (self.current_term, self.voted_for) != (self.observed.term, self.observed.vote)
            || self.pending_snapshot.is_some()
            || self.unpersisted_from <= self.log.last_index()
            || !self.messages.is_empty()
            || self.commit_index > self.observed.commit_index
            || *self.log.configuration() != self.observed.config
    }

    /// Drain everything decided since the previous call
    pub fn poll_output(&mut self) -> FsmOutput {
        let mut output = FsmOutput::default();

        if (self.current_term, self.voted_for) != (self.observed.term, self.observed.vote) {
            output.term_and_vote = Some((self.current_term, self.voted_for));
            self.observed.term = self.current_term;
            self.observed.vote = self.voted_for;
        }

        output.snapshot = self.pending_snapshot.take();

        let last_index = self.log.last_index();
        if self.unpersisted_from <= last_index {
            let from = self.unpersisted_from.max(self.log.start_index());
            output.log_entries = self.log.entries_between(from, last_index);
            self.unpersisted_from = last_index + 1;
        }

        output.messages = std::mem::take(&mut self.messages);

        if self.commit_index > self.observed.commit_index {
            let from = self.observed.commit_index + 1;
            assert!(
                from >= self.log.start_index(),
                "committed entry {} was compacted before it was applied",
                from
            );
            output.committed = self.log.entries_between(from, self.commit_index);
            self.observed.commit_index = self.commit_index;
        }

        if *self.log.configuration() != self.observed.config {
            let config = self.log.configuration().clone();
            self.observed.config = config.clone();
            output.configuration = Some(config);
        }

        output
    }

    // ---- role transitions ---------------------------------------------------

    fn update_current_term(&mut self, term: Term) {
        assert!(term > self.current_term, "term must grow");
        self.current_term = term;
        self.voted_for = None;
    }

    fn become_follower(&mut self, leader: Option<NodeId>) {
        let was_follower = self.is_follower();
        self.role = RoleState::Follower;
        self.current_leader = leader;
        self.election_elapsed = 0;
        self.reset_election_timeout();
        if !was_follower {
            info!(id = %self.id, term = self.current_term, leader = ?leader, "became follower");
        }
    }

    fn become_candidate(&mut self, leadership_transfer: bool) {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.current_leader = None;
        self.election_elapsed = 0;
        self.reset_election_timeout();

        let config = self.log.configuration().clone();
        let mut votes = Votes::new(&config);
        votes.register(self.id, true);
        let won = votes.result() == VoteResult::Won;
        self.role = RoleState::Candidate { votes };
        info!(id = %self.id, term = self.current_term, "became candidate");

        if won {
            self.become_leader();
            return;
        }

        let request = VoteRequest {
            current_term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
            leadership_transfer,
        };
        for member in config.members() {
            if member != self.id {
                self.messages.push((member, Message::VoteRequest(request.clone())));
            }
        }
    }

    fn become_leader(&mut self) {
        assert!(!self.is_leader(), "node is already a leader");
        let mut tracker = Tracker::new();
        tracker.set_configuration(self.log.configuration(), self.log.next_index());
        if let Some(own) = tracker.get_mut(&self.id) {
            own.match_index = self.log.stable_index();
            own.next_index = own.match_index + 1;
        }
        self.role = RoleState::Leader { tracker };
        self.current_leader = Some(self.id);
        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;
        info!(id = %self.id, term = self.current_term, "became leader");

        self.add_entry(EntryPayload::Dummy);
        self.maybe_finish_conf_change();
    }

    // ---- leader side --------------------------------------------------------

    fn add_entry(&mut self, payload: EntryPayload) -> LogEntryPtr {
        assert!(self.is_leader(), "only a leader appends new entries");
        let entry = Arc::new(LogEntry {
            term: self.current_term,
            index: self.log.next_index(),
            payload,
        });
        self.log.append(Arc::clone(&entry));
        trace!(id = %self.id, index = entry.index, term = entry.term, "appended entry");
        if let (EntryPayload::Configuration(config), RoleState::Leader { tracker }) =
            (&entry.payload, &mut self.role)
        {
            tracker.set_configuration(config, entry.index);
        }
        self.replicate();
        entry
    }

    fn replicate(&mut self) {
        let followers = match &self.role {
            RoleState::Leader { tracker } => tracker.followers(self.id),
            _ => return,
        };
        for id in followers {
            self.replicate_to(id, false);
        }
    }

    fn broadcast_heartbeat(&mut self) {
        let RoleState::Leader { tracker } = &mut self.role else {
            return;
        };
        let followers = tracker.followers(self.id);
        for id in &followers {
            if let Some(progress) = tracker.get_mut(id) {
                if progress.state == ReplicationState::Probe {
                    progress.probe_sent = false;
                }
            }
        }
        for id in followers {
            self.replicate_to(id, true);
        }
    }

    /// Send `to` whatever it is missing. With `allow_empty` an append goes out
    /// even when there is nothing new, serving as heartbeat and probe.
    fn replicate_to(&mut self, to: NodeId, mut allow_empty: bool) {
        let RoleState::Leader { tracker } = &mut self.role else {
            return;
        };
        let Some(progress) = tracker.get_mut(&to) else {
            return;
        };
        loop {
            if let ReplicationState::Snapshot { .. } = progress.state {
                return;
            }
            let prev_log_index = progress.next_index - 1;
            let Some(prev_log_term) = self.log.term_for(prev_log_index) else {
                let snapshot = self.log.snapshot().clone();
                debug!(id = %self.id, peer = %to, index = snapshot.index, "peer is behind the log, sending snapshot");
                progress.become_snapshot(snapshot.index);
                self.messages.push((
                    to,
                    Message::InstallSnapshot(InstallSnapshot {
                        current_term: self.current_term,
                        snapshot,
                    }),
                ));
                return;
            };

            let entries = if progress.can_send(self.config.max_in_flight_appends) {
                self.log
                    .entries_from(progress.next_index, self.config.max_entries_per_append)
            } else {
                Vec::new()
            };
            if entries.is_empty() && !allow_empty {
                return;
            }

            let mut more = false;
            match progress.state {
                ReplicationState::Probe => progress.probe_sent = true,
                ReplicationState::Pipeline => {
                    if let Some(last) = entries.last() {
                        progress.next_index = last.index + 1;
                        progress.in_flight += 1;
                        more = true;
                    }
                }
                ReplicationState::Snapshot { .. } => unreachable!(),
            }

            trace!(id = %self.id, peer = %to, prev_log_index, count = entries.len(), "sending append");
            self.messages.push((
                to,
                Message::AppendRequest(AppendRequest {
                    current_term: self.current_term,
                    leader_id: self.id,
                    prev_log_index,
                    prev_log_term,
                    leader_commit: self.commit_index,
                    entries,
                }),
            ));
            if !more {
                return;
            }
            allow_empty = false;
        }
    }

    fn handle_append_reply(&mut self, from: NodeId, reply: AppendReply) {
        let RoleState::Leader { tracker } = &mut self.role else {
            return;
        };
        let Some(progress) = tracker.get_mut(&from) else {
            return;
        };
        progress.recently_active = true;

        match reply.result {
            AppendResult::Accepted { last_new_index } => {
                progress.match_index = progress.match_index.max(last_new_index);
                progress.next_index = progress.next_index.max(progress.match_index + 1);
                match progress.state {
                    ReplicationState::Probe => progress.become_pipeline(),
                    ReplicationState::Pipeline => {
                        progress.in_flight = progress.in_flight.saturating_sub(1)
                    }
                    ReplicationState::Snapshot { .. } => {}
                }
                self.maybe_commit();
            }
            AppendResult::Rejected {
                non_matching_index,
                last_index,
                conflict_term,
                first_index_of_conflict_term,
            } => {
                if non_matching_index < progress.match_index
                    || matches!(progress.state, ReplicationState::Snapshot { .. })
                {
                    trace!(id = %self.id, peer = %from, "ignoring stale rejection");
                    return;
                }
                // jump past the whole conflicting term instead of walking back one by one
                let hint = match conflict_term {
                    Some(term) => self
                        .log
                        .last_index_of_term(term)
                        .map_or(first_index_of_conflict_term, |index| index + 1),
                    None => last_index + 1,
                };
                let next = hint
                    .min(non_matching_index)
                    .max(progress.match_index + 1)
                    .max(1);
                debug!(id = %self.id, peer = %from, rejected = non_matching_index, next, "append rejected, backing off");
                progress.next_index = next;
                progress.become_probe();
            }
        }
        self.replicate_to(from, false);
    }

    fn maybe_commit(&mut self) {
        let RoleState::Leader { tracker } = &self.role else {
            return;
        };
        let index = tracker.committed_index();
        if index <= self.commit_index {
            return;
        }
        // entries of older terms commit only indirectly
        if self.log.term_for(index) != Some(self.current_term) {
            return;
        }
        debug!(id = %self.id, term = self.current_term, index, "advancing commit index");
        self.commit_index = index;
        self.maybe_finish_conf_change();
    }

    fn maybe_finish_conf_change(&mut self) {
        if !self.is_leader() || self.log.last_conf_index() > self.commit_index {
            return;
        }
        let config = self.log.configuration();
        if config.is_joint() {
            let next = config.leave_joint();
            info!(id = %self.id, term = self.current_term, "joint configuration committed, leaving it");
            self.add_entry(EntryPayload::Configuration(next));
        } else if !config.current.contains_key(&self.id) {
            info!(id = %self.id, term = self.current_term, "removed from the configuration, stepping down");
            self.become_follower(None);
        }
    }

    // ---- follower side ------------------------------------------------------

    fn reply_to_stale(&mut self, from: NodeId, message: &Message) {
        let reply = match message {
            Message::AppendRequest(request) => Message::AppendReply(AppendReply {
                current_term: self.current_term,
                commit_index: self.commit_index,
                result: AppendResult::Rejected {
                    non_matching_index: request.prev_log_index,
                    last_index: self.log.last_index(),
                    conflict_term: None,
                    first_index_of_conflict_term: 0,
                },
            }),
            Message::VoteRequest(_) => Message::VoteReply(VoteReply {
                current_term: self.current_term,
                vote_granted: false,
            }),
            Message::InstallSnapshot(_) => Message::SnapshotReply(SnapshotReply {
                current_term: self.current_term,
                success: false,
            }),
            _ => {
                trace!(id = %self.id, from = %from, "ignoring stale reply");
                return;
            }
        };
        self.messages.push((from, reply));
    }

    fn follow(&mut self, leader: NodeId) {
        match self.role {
            RoleState::Leader { .. } => {
                panic!("two leaders in term {}: {} and {}", self.current_term, self.id, leader)
            }
            RoleState::Candidate { .. } => self.become_follower(Some(leader)),
            RoleState::Follower => {}
        }
        self.current_leader = Some(leader);
        self.election_elapsed = 0;
    }

    fn handle_append_request(&mut self, from: NodeId, request: AppendRequest) {
        self.follow(from);
        let result = self.accept_entries(request);
        self.messages.push((
            from,
            Message::AppendReply(AppendReply {
                current_term: self.current_term,
                commit_index: self.commit_index,
                result,
            }),
        ));
    }

    fn accept_entries(&mut self, request: AppendRequest) -> AppendResult {
        let prev = request.prev_log_index;
        let last_index = self.log.last_index();
        if prev > last_index {
            return AppendResult::Rejected {
                non_matching_index: prev,
                last_index,
                conflict_term: None,
                first_index_of_conflict_term: last_index + 1,
            };
        }
        // no term means `prev` sits below our snapshot, so it is committed and matches
        if let Some(term) = self.log.term_for(prev) {
            if term != request.prev_log_term {
                let first = if prev >= self.log.start_index() {
                    self.log.first_index_of_term_at(prev)
                } else {
                    prev
                };
                debug!(id = %self.id, prev, term, expected = request.prev_log_term, "log mismatch");
                return AppendResult::Rejected {
                    non_matching_index: prev,
                    last_index,
                    conflict_term: Some(term),
                    first_index_of_conflict_term: first,
                };
            }
        }

        let last_new_index = prev + request.entries.len() as Index;
        let snapshot_index = self.log.snapshot().index;
        let new_entries: Vec<LogEntryPtr> = request
            .entries
            .into_iter()
            .skip_while(|e| e.index <= snapshot_index || self.log.term_for(e.index) == Some(e.term))
            .collect();

        if let Some(first) = new_entries.first() {
            if first.index <= self.log.last_index() {
                assert!(
                    first.index > self.commit_index,
                    "entry {} conflicts with a committed entry (commit index {})",
                    first.index,
                    self.commit_index
                );
                debug!(id = %self.id, from = first.index, "truncating conflicting suffix");
                self.log.truncate_suffix(first.index);
                self.unpersisted_from = self.unpersisted_from.min(first.index);
            }
            for entry in new_entries {
                self.log.append(entry);
            }
        }

        let commit = request.leader_commit.min(last_new_index);
        if commit > self.commit_index {
            trace!(id = %self.id, commit, "follower commit index advanced");
            self.commit_index = commit;
        }
        AppendResult::Accepted { last_new_index }
    }

    fn handle_vote_request(&mut self, from: NodeId, request: VoteRequest) {
        let can_vote = self.voted_for == Some(request.candidate_id)
            || (self.voted_for.is_none() && self.current_leader.is_none());
        let log_ok = (request.last_log_term, request.last_log_index)
            >= (self.log.last_term(), self.log.last_index());
        let granted = can_vote && log_ok;
        if granted {
            self.voted_for = Some(request.candidate_id);
            self.election_elapsed = 0;
        }
        debug!(id = %self.id, term = self.current_term, candidate = %request.candidate_id, granted, "vote request");
        self.messages.push((
            from,
            Message::VoteReply(VoteReply {
                current_term: self.current_term,
                vote_granted: granted,
            }),
        ));
    }

    fn handle_vote_reply(&mut self, from: NodeId, reply: VoteReply) {
        let RoleState::Candidate { votes } = &mut self.role else {
            return;
        };
        votes.register(from, reply.vote_granted);
        match votes.result() {
            VoteResult::Won => self.become_leader(),
            VoteResult::Lost => {
                debug!(id = %self.id, term = self.current_term, "election lost, waiting for a new timeout")
            }
            VoteResult::Unknown => {}
        }
    }

    fn handle_install_snapshot(&mut self, from: NodeId, request: InstallSnapshot) {
        self.follow(from);
        let snapshot = request.snapshot;
        let success = if snapshot.index <= self.commit_index {
            debug!(id = %self.id, index = snapshot.index, "already have the snapshot's entries");
            true
        } else if self.pending_snapshot.is_some() {
            // a local snapshot is still waiting to be persisted, the leader retries
            false
        } else {
            info!(id = %self.id, index = snapshot.index, term = snapshot.term, "installing snapshot from leader");
            let log_discarded = self.log.apply_snapshot(snapshot.clone(), 0);
            self.commit_index = snapshot.index;
            self.observed.commit_index = snapshot.index;
            self.unpersisted_from = self.unpersisted_from.max(self.log.start_index());
            self.pending_snapshot = Some(SnapshotOutput {
                snapshot,
                preserve_log_entries: 0,
                local: false,
                log_discarded,
            });
            true
        };
        self.messages.push((
            from,
            Message::SnapshotReply(SnapshotReply {
                current_term: self.current_term,
                success,
            }),
        ));
    }
}

impl std::fmt::Debug for Fsm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fsm")
            .field("id", &self.id)
            .field("role", &self.role())
            .field("current_term", &self.current_term)
            .field("voted_for", &self.voted_for)
            .field("current_leader", &self.current_leader)
            .field("commit_index", &self.commit_index)
            .field("last_index", &self.log.last_index())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn id(n: u128) -> NodeId {
        NodeId::from_u128(n)
    }

    fn config() -> RaftConfig {
        RaftConfig::default().with_election_timeout(10)
    }

    fn entry(term: Term, index: Index) -> LogEntryPtr {
        Arc::new(LogEntry {
            term,
            index,
            payload: EntryPayload::Command(Bytes::from(format!("{index}"))),
        })
    }

    /// Helper to create an FSM whose log holds entries of the given terms
    fn new_test_fsm(me: u128, members: &[u128], terms: &[Term]) -> Fsm {
        let cluster = Configuration::from_ids(members.iter().map(|&n| id(n)));
        let entries = terms
            .iter()
            .enumerate()
            .map(|(i, &t)| entry(t, i as Index + 1))
            .collect();
        let log = Log::new(Snapshot::bootstrap(cluster), entries);
        let term = terms.last().copied().unwrap_or(0);
        Fsm::new(id(me), term, None, log, &config())
    }

    /// Tick until the node starts an election
    fn tick_until_candidate(fsm: &mut Fsm) {
        for _ in 0..100 {
            if !fsm.is_follower() {
                return;
            }
            fsm.tick();
        }
        panic!("node never started an election");
    }

    /// Make `fsm` leader of a cluster where every peer grants its vote
    fn elect(fsm: &mut Fsm) {
        tick_until_candidate(fsm);
        let term = fsm.current_term();
        let peers: Vec<NodeId> = fsm.configuration().members().into_iter().filter(|p| *p != fsm.id()).collect();
        for peer in peers {
            fsm.step(
                peer,
                Message::VoteReply(VoteReply {
                    current_term: term,
                    vote_granted: true,
                }),
            );
        }
        assert!(fsm.is_leader());
    }

    /// Persist everything the node wants persisted and return its messages
    fn persist(fsm: &mut Fsm) -> FsmOutput {
        let output = fsm.poll_output();
        if let Some(last) = output.log_entries.last() {
            fsm.mark_stable(last.term, last.index);
        }
        output
    }

    fn append_request(term: Term, leader: NodeId, prev: (Index, Term), commit: Index, entries: Vec<LogEntryPtr>) -> Message {
        Message::AppendRequest(AppendRequest {
            current_term: term,
            leader_id: leader,
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            leader_commit: commit,
            entries,
        })
    }

    fn last_reply(output: &FsmOutput) -> &Message {
        &output.messages.last().expect("no reply sent").1
    }

    #[test]
    fn test_new_fsm_is_follower() {
        let fsm = new_test_fsm(1, &[1, 2, 3], &[]);
        assert_eq!(fsm.role(), Role::Follower);
        assert_eq!(fsm.current_term(), 0);
        assert_eq!(fsm.current_leader(), None);
        assert_eq!(fsm.commit_index(), 0);
    }

    #[test]
    fn test_same_inputs_same_decisions() {
        let mut a = new_test_fsm(1, &[1, 2, 3], &[]);
        let mut b = new_test_fsm(1, &[1, 2, 3], &[]);
        let mut ticks_a = 0;
        while a.is_follower() {
            a.tick();
            ticks_a += 1;
        }
        for _ in 0..ticks_a {
            b.tick();
        }
        assert!(b.is_candidate());
        assert_eq!(a.poll_output().messages, b.poll_output().messages);
    }

    #[test]
    fn test_election_timeout_starts_election() {
        let mut fsm = new_test_fsm(1, &[1, 2, 3], &[1, 1]);
        for _ in 0..9 {
            fsm.tick();
        }
        // the randomized timeout is never shorter than the base timeout
        assert!(fsm.is_follower());

        tick_until_candidate(&mut fsm);
        assert_eq!(fsm.current_term(), 2);
        assert_eq!(fsm.voted_for(), Some(id(1)));

        let output = fsm.poll_output();
        assert_eq!(output.term_and_vote, Some((2, Some(id(1)))));
        let targets: Vec<NodeId> = output.messages.iter().map(|(to, _)| *to).collect();
        assert_eq!(targets, vec![id(2), id(3)]);
        match &output.messages[0].1 {
            Message::VoteRequest(request) => {
                assert_eq!(request.last_log_index, 2);
                assert_eq!(request.last_log_term, 1);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_split_vote_restarts_election() {
        let mut fsm = new_test_fsm(1, &[1, 2, 3], &[]);
        tick_until_candidate(&mut fsm);
        assert_eq!(fsm.current_term(), 1);
        for _ in 0..20 {
            fsm.tick();
        }
        assert!(fsm.is_candidate());
        assert!(fsm.current_term() > 1);
    }

    #[test]
    fn test_non_member_never_campaigns() {
        let mut fsm = new_test_fsm(4, &[1, 2, 3], &[]);
        for _ in 0..100 {
            fsm.tick();
        }
        assert!(fsm.is_follower());
        assert_eq!(fsm.current_term(), 0);
    }

    #[traced_test]
    #[test]
    fn test_single_node_elects_itself_and_commits_dummy() {
        let mut fsm = new_test_fsm(1, &[1], &[]);
        tick_until_candidate(&mut fsm);
        assert!(fsm.is_leader());
        assert!(logs_contain("became leader"));

        // the dummy entry commits once it is durable
        assert_eq!(fsm.log().last_index(), 1);
        assert_eq!(fsm.commit_index(), 0);
        let output = persist(&mut fsm);
        assert_eq!(output.log_entries.len(), 1);
        assert_eq!(output.log_entries[0].payload, EntryPayload::Dummy);
        assert_eq!(fsm.commit_index(), 1);

        let output = fsm.poll_output();
        assert_eq!(output.committed.len(), 1);
    }

    #[test]
    fn test_vote_granted_once_per_term() {
        let mut fsm = new_test_fsm(1, &[1, 2, 3], &[]);
        let request = |candidate: u128| {
            Message::VoteRequest(VoteRequest {
                current_term: 1,
                candidate_id: id(candidate),
                last_log_index: 0,
                last_log_term: 0,
                leadership_transfer: false,
            })
        };

        fsm.step(id(2), request(2));
        fsm.step(id(3), request(3));
        // a repeated request from the same candidate is granted again
        fsm.step(id(2), request(2));

        let granted: Vec<bool> = fsm
            .poll_output()
            .messages
            .iter()
            .map(|(_, m)| match m {
                Message::VoteReply(reply) => reply.vote_granted,
                other => panic!("unexpected message {other:?}"),
            })
            .collect();
        assert_eq!(granted, vec![true, false, true]);
        assert_eq!(fsm.voted_for(), Some(id(2)));
    }

    #[test]
    fn test_vote_denied_candidate_log_has_older_term() {
        // Our log: [term 1, term 2]; candidate's last entry is term 1 at a higher index
        let mut fsm = new_test_fsm(1, &[1, 2, 3], &[1, 2]);
        fsm.step(
            id(2),
            Message::VoteRequest(VoteRequest {
                current_term: 3,
                candidate_id: id(2),
                last_log_index: 5,
                last_log_term: 1,
                leadership_transfer: false,
            }),
        );
        let output = fsm.poll_output();
        assert!(matches!(last_reply(&output), Message::VoteReply(r) if !r.vote_granted));
        // the term is still adopted
        assert_eq!(fsm.current_term(), 3);
        assert_eq!(fsm.voted_for(), None);
    }

    #[test]
    fn test_vote_denied_candidate_log_shorter_same_term() {
        let mut fsm = new_test_fsm(1, &[1, 2, 3], &[1, 1, 1]);
        fsm.step(
            id(2),
            Message::VoteRequest(VoteRequest {
                current_term: 2,
                candidate_id: id(2),
                last_log_index: 2,
                last_log_term: 1,
                leadership_transfer: false,
            }),
        );
        let output = fsm.poll_output();
        assert!(matches!(last_reply(&output), Message::VoteReply(r) if !r.vote_granted));
    }

    #[test]
    fn test_follower_with_live_leader_ignores_vote_request() {
        let mut fsm = new_test_fsm(1, &[1, 2, 3], &[]);
        fsm.step(id(2), append_request(1, id(2), (0, 0), 0, vec![]));
        fsm.poll_output();

        let vote = |transfer| {
            Message::VoteRequest(VoteRequest {
                current_term: 2,
                candidate_id: id(3),
                last_log_index: 0,
                last_log_term: 0,
                leadership_transfer: transfer,
            })
        };
        fsm.step(id(3), vote(false));
        assert_eq!(fsm.current_term(), 1);
        assert!(fsm.poll_output().messages.is_empty());

        // a leadership transfer overrides stickiness
        fsm.step(id(3), vote(true));
        assert_eq!(fsm.current_term(), 2);
        assert_eq!(fsm.voted_for(), Some(id(3)));
    }

    #[test]
    fn test_higher_term_makes_leader_step_down() {
        let mut fsm = new_test_fsm(1, &[1, 2, 3], &[]);
        elect(&mut fsm);
        let term = fsm.current_term();
        fsm.step(
            id(2),
            Message::AppendReply(AppendReply {
                current_term: term + 1,
                commit_index: 0,
                result: AppendResult::Rejected {
                    non_matching_index: 0,
                    last_index: 0,
                    conflict_term: None,
                    first_index_of_conflict_term: 0,
                },
            }),
        );
        assert!(fsm.is_follower());
        assert_eq!(fsm.current_term(), term + 1);
        assert!(fsm.progress(&id(2)).is_none());
    }

    #[test]
    fn test_candidate_defers_to_leader_of_same_term() {
        let mut fsm = new_test_fsm(1, &[1, 2, 3], &[]);
        tick_until_candidate(&mut fsm);
        let term = fsm.current_term();
        fsm.step(id(2), append_request(term, id(2), (0, 0), 0, vec![]));
        assert!(fsm.is_follower());
        assert_eq!(fsm.current_leader(), Some(id(2)));
    }

    #[test]
    fn test_stale_append_is_rejected_with_current_term() {
        let mut fsm = new_test_fsm(1, &[1, 2, 3], &[1, 2]);
        fsm.step(id(2), append_request(1, id(2), (1, 1), 1, vec![]));
        let output = fsm.poll_output();
        match last_reply(&output) {
            Message::AppendReply(reply) => {
                assert_eq!(reply.current_term, 2);
                assert!(matches!(reply.result, AppendResult::Rejected { .. }));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_follower_truncates_spurious_suffix() {
        // Follower holds uncommitted entries from term 2 that the new leader never saw
        let mut fsm = new_test_fsm(1, &[1, 2, 3], &[1, 1, 2, 2, 2]);
        fsm.poll_output();

        fsm.step(id(2), append_request(3, id(2), (2, 1), 2, vec![entry(3, 3)]));
        let output = persist(&mut fsm);
        assert!(matches!(
            last_reply(&output),
            Message::AppendReply(AppendReply { result: AppendResult::Accepted { last_new_index: 3 }, .. })
        ));
        assert_eq!(fsm.log().last_index(), 3);
        assert_eq!(fsm.log().term_for(3), Some(3));
        assert_eq!(fsm.commit_index(), 2);
        // only the replacement entry needs to be written
        assert_eq!(output.log_entries.len(), 1);
        assert_eq!(output.log_entries[0].index, 3);
    }

    #[test]
    fn test_identical_entries_are_not_rewritten() {
        let mut fsm = new_test_fsm(1, &[1, 2, 3], &[1, 1, 1]);
        fsm.poll_output();
        fsm.step(id(2), append_request(1, id(2), (0, 0), 0, vec![entry(1, 1), entry(1, 2)]));
        let output = fsm.poll_output();
        assert!(output.log_entries.is_empty());
        assert_eq!(fsm.log().last_index(), 3);
    }

    #[test]
    fn test_mismatch_reply_carries_conflict_hint() {
        let mut fsm = new_test_fsm(1, &[1, 2, 3], &[1, 2, 2, 2]);
        fsm.step(id(2), append_request(5, id(2), (4, 4), 0, vec![]));
        let output = fsm.poll_output();
        match last_reply(&output) {
            Message::AppendReply(AppendReply {
                result:
                    AppendResult::Rejected {
                        non_matching_index,
                        conflict_term,
                        first_index_of_conflict_term,
                        ..
                    },
                ..
            }) => {
                assert_eq!(*non_matching_index, 4);
                assert_eq!(*conflict_term, Some(2));
                assert_eq!(*first_index_of_conflict_term, 2);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_leader_skips_back_whole_term_on_rejection() {
        let mut fsm = new_test_fsm(1, &[1, 2], &[1, 1, 3, 3, 3]);
        elect(&mut fsm);
        persist(&mut fsm);
        assert_eq!(fsm.progress(&id(2)).unwrap().next_index, 6);

        let term = fsm.current_term();
        fsm.step(
            id(2),
            Message::AppendReply(AppendReply {
                current_term: term,
                commit_index: 0,
                result: AppendResult::Rejected {
                    non_matching_index: 5,
                    last_index: 7,
                    conflict_term: Some(2),
                    first_index_of_conflict_term: 3,
                },
            }),
        );
        // we have no term 2, so resume where the follower's term 2 started
        let progress = fsm.progress(&id(2)).unwrap();
        assert_eq!(progress.next_index, 3);
        assert_eq!(progress.state, ReplicationState::Probe);
        let output = fsm.poll_output();
        match last_reply(&output) {
            Message::AppendRequest(request) => {
                assert_eq!(request.prev_log_index, 2);
                assert_eq!(request.prev_log_term, 1);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_leader_does_not_count_old_term_entries() {
        // Entry 2 from term 1 is replicated on a majority but belongs to an older term
        let mut fsm = new_test_fsm(1, &[1, 2, 3], &[1, 1]);
        elect(&mut fsm);
        let term = fsm.current_term();
        persist(&mut fsm);
        let accept = |index| {
            Message::AppendReply(AppendReply {
                current_term: term,
                commit_index: 0,
                result: AppendResult::Accepted { last_new_index: index },
            })
        };

        fsm.step(id(2), accept(2));
        assert_eq!(fsm.commit_index(), 0);

        // the dummy entry of the current term commits everything below it
        fsm.step(id(2), accept(3));
        assert_eq!(fsm.commit_index(), 3);
    }

    #[test]
    fn test_mark_stable_is_idempotent_and_ignores_replaced_entries() {
        let mut fsm = new_test_fsm(1, &[1, 2, 3], &[1]);
        fsm.poll_output();
        fsm.step(id(2), append_request(2, id(2), (1, 1), 0, vec![entry(2, 2), entry(2, 3)]));
        fsm.mark_stable(2, 3);
        fsm.mark_stable(2, 3);
        assert_eq!(fsm.log().stable_index(), 3);

        // entry 3 is replaced by a newer leader before its write completes
        fsm.step(id(3), append_request(3, id(3), (2, 2), 0, vec![entry(3, 3)]));
        assert_eq!(fsm.log().stable_index(), 2);
        fsm.mark_stable(2, 3);
        assert_eq!(fsm.log().stable_index(), 2);
        // past the end of the log
        fsm.mark_stable(3, 10);
        assert_eq!(fsm.log().stable_index(), 2);

        fsm.mark_stable(3, 3);
        assert_eq!(fsm.log().stable_index(), 3);
    }

    #[test]
    fn test_propose_on_follower_redirects_to_leader() {
        let mut fsm = new_test_fsm(1, &[1, 2, 3], &[]);
        fsm.step(id(2), append_request(1, id(2), (0, 0), 0, vec![]));
        match fsm.propose(Bytes::from_static(b"x")) {
            Err(RaftError::NotLeader { leader }) => assert_eq!(leader, Some(id(2))),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_propose_appends_in_current_term() {
        let mut fsm = new_test_fsm(1, &[1], &[]);
        elect(&mut fsm);
        let entry = fsm.propose(Bytes::from_static(b"x")).unwrap();
        assert_eq!(entry.term, fsm.current_term());
        assert_eq!(entry.index, 2);
    }

    #[test]
    fn test_config_change_goes_through_joint_consensus() {
        let mut fsm = new_test_fsm(1, &[1], &[]);
        elect(&mut fsm);
        persist(&mut fsm);
        assert_eq!(fsm.commit_index(), 1);

        let members = Configuration::from_ids([id(1), id(2)]).current;
        let joint = fsm.propose_config_change(members.clone()).unwrap();
        assert!(matches!(&joint.payload, EntryPayload::Configuration(c) if c.is_joint()));
        assert!(matches!(
            fsm.propose_config_change(members),
            Err(RaftError::ConfChangeInProgress)
        ));

        // the joint entry needs both halves: the old one (just us) and the new one
        let output = persist(&mut fsm);
        assert!(output.configuration.unwrap().is_joint());
        assert_eq!(fsm.commit_index(), 1);

        let term = fsm.current_term();
        fsm.step(
            id(2),
            Message::AppendReply(AppendReply {
                current_term: term,
                commit_index: 0,
                result: AppendResult::Accepted { last_new_index: 2 },
            }),
        );
        assert_eq!(fsm.commit_index(), 2);
        // the final configuration was appended right away
        assert_eq!(fsm.log().last_conf_index(), 3);
        assert!(!fsm.configuration().is_joint());
        assert_eq!(fsm.configuration().current.len(), 2);
    }

    #[test]
    fn test_leader_steps_down_without_quorum() {
        let mut fsm = new_test_fsm(1, &[1, 2, 3], &[]);
        elect(&mut fsm);
        for _ in 0..10 {
            fsm.tick();
        }
        assert!(fsm.is_follower());
        assert_eq!(fsm.current_leader(), None);
    }

    #[test]
    fn test_heartbeats_keep_followers_probing() {
        let mut fsm = new_test_fsm(1, &[1, 2], &[]);
        elect(&mut fsm);
        fsm.poll_output();
        fsm.tick();
        let output = fsm.poll_output();
        assert!(output
            .messages
            .iter()
            .any(|(to, m)| *to == id(2) && matches!(m, Message::AppendRequest(_))));
    }

    #[test]
    fn test_local_snapshot_compacts_log() {
        let mut fsm = new_test_fsm(1, &[1, 2], &[1, 1, 1]);
        elect(&mut fsm);
        persist(&mut fsm);
        // nothing committed yet
        assert!(fsm.apply_local_snapshot(0, SnapshotId::random(), 0).is_none());

        // follower acknowledges the dummy entry so everything commits
        let term = fsm.current_term();
        fsm.step(
            id(2),
            Message::AppendReply(AppendReply {
                current_term: term,
                commit_index: 0,
                result: AppendResult::Accepted { last_new_index: 4 },
            }),
        );
        assert_eq!(fsm.commit_index(), 4);
        let output = fsm.poll_output();
        assert_eq!(output.committed.len(), 4);

        let snapshot = fsm.apply_local_snapshot(4, SnapshotId::random(), 1).unwrap();
        assert_eq!(snapshot.term, term);
        assert_eq!(snapshot.config, *fsm.configuration());
        assert_eq!(fsm.log().start_index(), 4);
        assert_eq!(fsm.log().snapshot().index, 4);

        let output = fsm.poll_output();
        let compacted = output.snapshot.unwrap();
        assert!(compacted.local);
        assert_eq!(compacted.preserve_log_entries, 1);
        // an older snapshot is refused
        assert!(fsm.apply_local_snapshot(3, SnapshotId::random(), 0).is_none());
    }

    #[test]
    fn test_snapshot_status_resumes_replication() {
        let mut fsm = new_test_fsm(1, &[1, 2], &[]);
        elect(&mut fsm);
        let term = fsm.current_term();
        persist(&mut fsm);
        fsm.step(
            id(2),
            Message::AppendReply(AppendReply {
                current_term: term,
                commit_index: 0,
                result: AppendResult::Accepted { last_new_index: 1 },
            }),
        );
        fsm.propose(Bytes::from_static(b"a")).unwrap();
        fsm.propose(Bytes::from_static(b"b")).unwrap();
        fsm.step(
            id(2),
            Message::AppendReply(AppendReply {
                current_term: term,
                commit_index: 0,
                result: AppendResult::Accepted { last_new_index: 3 },
            }),
        );
        persist(&mut fsm);
        assert_eq!(fsm.commit_index(), 3);
        fsm.poll_output();
        fsm.apply_local_snapshot(3, SnapshotId::random(), 0).unwrap();
        fsm.poll_output();

        // a third member joins with an empty log
        fsm.propose_config_change(Configuration::from_ids([id(1), id(2), id(3)]).current)
            .unwrap();
        let output = fsm.poll_output();
        let snapshot_to_new_member = output
            .messages
            .iter()
            .any(|(to, m)| *to == id(3) && matches!(m, Message::InstallSnapshot(_)));
        assert!(!snapshot_to_new_member, "new member is probed first");

        fsm.step(
            id(3),
            Message::AppendReply(AppendReply {
                current_term: term,
                commit_index: 0,
                result: AppendResult::Rejected {
                    non_matching_index: 3,
                    last_index: 0,
                    conflict_term: None,
                    first_index_of_conflict_term: 1,
                },
            }),
        );
        let output = fsm.poll_output();
        assert!(output
            .messages
            .iter()
            .any(|(to, m)| *to == id(3) && matches!(m, Message::InstallSnapshot(s) if s.snapshot.index == 3)));
        assert_eq!(
            fsm.progress(&id(3)).unwrap().state,
            ReplicationState::Snapshot { index: 3 }
        );

        fsm.snapshot_status(id(3), 3, term, false);
        assert_eq!(fsm.progress(&id(3)).unwrap().state, ReplicationState::Probe);
        fsm.tick();
        assert_eq!(
            fsm.progress(&id(3)).unwrap().state,
            ReplicationState::Snapshot { index: 3 }
        );

        fsm.snapshot_status(id(3), 3, term, true);
        let progress = fsm.progress(&id(3)).unwrap();
        assert_eq!(progress.match_index, 3);
        assert_eq!(progress.next_index, 4);
    }

    #[test]
    fn test_stale_snapshot_transfer_is_ignored() {
        let accept = |fsm: &mut Fsm, term: Term, last_new_index: Index| {
            fsm.step(
                id(2),
                Message::AppendReply(AppendReply {
                    current_term: term,
                    commit_index: 0,
                    result: AppendResult::Accepted { last_new_index },
                }),
            );
        };
        let reject_from_3 = |fsm: &mut Fsm, term: Term, last_index: Index| {
            fsm.step(
                id(3),
                Message::AppendReply(AppendReply {
                    current_term: term,
                    commit_index: 0,
                    result: AppendResult::Rejected {
                        non_matching_index: last_index,
                        last_index,
                        conflict_term: None,
                        first_index_of_conflict_term: 1,
                    },
                }),
            );
        };

        let mut fsm = new_test_fsm(1, &[1, 2, 3], &[]);
        elect(&mut fsm);
        let old_term = fsm.current_term();
        persist(&mut fsm);
        fsm.propose(Bytes::from_static(b"a")).unwrap();
        fsm.propose(Bytes::from_static(b"b")).unwrap();
        persist(&mut fsm);
        accept(&mut fsm, old_term, 3);
        assert_eq!(fsm.commit_index(), 3);
        fsm.poll_output();
        fsm.apply_local_snapshot(3, SnapshotId::random(), 0).unwrap();
        fsm.poll_output();
        reject_from_3(&mut fsm, old_term, 0);
        assert_eq!(
            fsm.progress(&id(3)).unwrap().state,
            ReplicationState::Snapshot { index: 3 }
        );

        // deposed, then elected again in a later term with a newer snapshot
        fsm.step(
            id(2),
            Message::AppendReply(AppendReply {
                current_term: old_term + 1,
                commit_index: 0,
                result: AppendResult::Rejected {
                    non_matching_index: 0,
                    last_index: 0,
                    conflict_term: None,
                    first_index_of_conflict_term: 0,
                },
            }),
        );
        assert!(fsm.is_follower());
        elect(&mut fsm);
        let term = fsm.current_term();
        persist(&mut fsm);
        fsm.propose(Bytes::from_static(b"c")).unwrap();
        persist(&mut fsm);
        accept(&mut fsm, term, 5);
        assert_eq!(fsm.commit_index(), 5);
        fsm.poll_output();
        fsm.apply_local_snapshot(5, SnapshotId::random(), 0).unwrap();
        fsm.poll_output();
        reject_from_3(&mut fsm, term, 3);
        assert_eq!(
            fsm.progress(&id(3)).unwrap().state,
            ReplicationState::Snapshot { index: 5 }
        );

        // the first transfer completes late
        fsm.step(
            id(3),
            Message::SnapshotReply(SnapshotReply {
                current_term: old_term,
                success: true,
            }),
        );
        fsm.snapshot_status(id(3), 3, old_term, true);
        fsm.snapshot_status(id(3), 3, term, true);
        let progress = fsm.progress(&id(3)).unwrap();
        assert_eq!(progress.state, ReplicationState::Snapshot { index: 5 });
        assert_eq!(progress.match_index, 0);

        fsm.snapshot_status(id(3), 5, term, true);
        let progress = fsm.progress(&id(3)).unwrap();
        assert_eq!(progress.match_index, 5);
        assert_eq!(progress.next_index, 6);
    }

    #[test]
    fn test_follower_installs_snapshot() {
        let mut fsm = new_test_fsm(1, &[1, 2], &[1, 1]);
        fsm.poll_output();
        let snapshot = Snapshot {
            index: 10,
            term: 3,
            config: Configuration::from_ids([id(1), id(2)]),
            id: SnapshotId::random(),
        };
        fsm.step(
            id(2),
            Message::InstallSnapshot(InstallSnapshot {
                current_term: 3,
                snapshot: snapshot.clone(),
            }),
        );
        assert_eq!(fsm.commit_index(), 10);
        assert_eq!(fsm.log().next_index(), 11);

        let output = fsm.poll_output();
        let installed = output.snapshot.clone().unwrap();
        assert!(!installed.local);
        assert!(installed.log_discarded);
        assert_eq!(installed.snapshot, snapshot);
        // nothing below the snapshot is handed to the applier
        assert!(output.committed.is_empty());
        assert!(matches!(last_reply(&output), Message::SnapshotReply(r) if r.success));

        // the follower continues from the snapshot boundary
        fsm.step(id(2), append_request(3, id(2), (10, 3), 11, vec![entry(3, 11)]));
        assert_eq!(fsm.commit_index(), 11);
    }

    #[test]
    fn test_keepalive_resets_election_timer_only_in_same_term() {
        let mut fsm = new_test_fsm(1, &[1, 2, 3], &[]);
        fsm.step(id(2), append_request(1, id(2), (0, 0), 0, vec![]));
        for _ in 0..50 {
            fsm.tick();
            fsm.keepalive(
                id(2),
                KeepAlive {
                    current_term: 1,
                    leader_id: id(2),
                },
            );
        }
        assert!(fsm.is_follower());

        fsm.keepalive(
            id(3),
            KeepAlive {
                current_term: 5,
                leader_id: id(3),
            },
        );
        assert_eq!(fsm.current_term(), 1);
        assert_eq!(fsm.current_leader(), Some(id(2)));
    }

    #[test]
    #[should_panic(expected = "conflicts with a committed entry")]
    fn test_overwriting_committed_entry_is_fatal() {
        let mut fsm = new_test_fsm(1, &[1, 2, 3], &[]);
        fsm.step(id(2), append_request(1, id(2), (0, 0), 1, vec![entry(1, 1)]));
        assert_eq!(fsm.commit_index(), 1);
        fsm.step(id(3), append_request(2, id(3), (0, 0), 0, vec![entry(2, 1)]));
    }
}
