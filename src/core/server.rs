//! RaftServer - drives the deterministic `Fsm` against real collaborators
//!
//! Three background tasks run per server:
//! - the ticker advances the FSM's logical clock every `tick_interval`
//! - the I/O loop polls FSM output and handles each batch in order: term and
//!   vote, snapshot, log entries, membership, messages, committed entries
//! - the applier feeds committed commands to the user state machine and takes
//!   local snapshots
//!
//! Client calls and incoming messages go straight into the FSM under a short
//! lock and wake the I/O loop.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::config::RaftConfig;
use super::error::RaftError;
use super::fsm::{Fsm, FsmOutput, Role, SnapshotOutput};
use super::log::Log;
use super::message::{
    AppendReply, AppendRequest, InstallSnapshot, KeepAlive, Message, SnapshotReply, VoteReply, VoteRequest,
};
use super::types::{Configuration, EntryPayload, Index, LogEntryPtr, NodeId, Snapshot, SnapshotId, Term};
use crate::state_machine::{StateMachine, StateMachineError};
use crate::storage::Storage;
use crate::transport::Transport;

/// Point at which a proposal is reported done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitType {
    Committed,
    Applied,
}

type Reply = oneshot::Sender<Result<(), RaftError>>;

struct OpStatus {
    /// Term the entry was appended in
    term: Term,
    done: Reply,
}

/// Pending proposals keyed by log index, one registry per wait type
#[derive(Default)]
struct Waiters {
    committed: BTreeMap<Index, OpStatus>,
    applied: BTreeMap<Index, OpStatus>,
    /// Highest index whose committed waiters were resolved
    commit_notified: Index,
    /// Highest index whose applied waiters were resolved
    apply_notified: Index,
    stopped: bool,
}

impl Waiters {
    fn registry(&mut self, wait: WaitType) -> &mut BTreeMap<Index, OpStatus> {
        match wait {
            WaitType::Committed => &mut self.committed,
            WaitType::Applied => &mut self.applied,
        }
    }

    fn notified(&self, wait: WaitType) -> Index {
        match wait {
            WaitType::Committed => self.commit_notified,
            WaitType::Applied => self.apply_notified,
        }
    }

    fn notify(&mut self, wait: WaitType, entries: &[LogEntryPtr]) {
        let (Some(first), Some(last)) = (entries.first(), entries.last()) else {
            return;
        };
        let registry = self.registry(wait);
        // anything below the batch was skipped by a snapshot
        fail_through(registry, first.index - 1);
        for entry in entries {
            if let Some(status) = registry.remove(&entry.index) {
                let result = if status.term == entry.term {
                    Ok(())
                } else {
                    Err(RaftError::DroppedEntry)
                };
                let _ = status.done.send(result);
            }
        }
        match wait {
            WaitType::Committed => self.commit_notified = last.index,
            WaitType::Applied => self.apply_notified = last.index,
        }
    }

    /// A snapshot covered everything through `index`
    fn skip_through(&mut self, wait: WaitType, index: Index) {
        fail_through(self.registry(wait), index);
        match wait {
            WaitType::Committed => self.commit_notified = self.commit_notified.max(index),
            WaitType::Applied => self.apply_notified = self.apply_notified.max(index),
        }
    }

    /// Leadership was lost: entries past `commit_index` may or may not commit
    fn fail_uncommitted(&mut self, commit_index: Index) {
        for registry in [&mut self.committed, &mut self.applied] {
            for (_, status) in registry.split_off(&(commit_index + 1)) {
                let _ = status.done.send(Err(RaftError::CommitStatusUnknown));
            }
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
        for registry in [&mut self.committed, &mut self.applied] {
            for (_, status) in std::mem::take(registry) {
                let _ = status.done.send(Err(RaftError::Stopped));
            }
        }
    }
}

fn fail_through(registry: &mut BTreeMap<Index, OpStatus>, index: Index) {
    let rest = registry.split_off(&(index + 1));
    for (_, status) in std::mem::replace(registry, rest) {
        let _ = status.done.send(Err(RaftError::CommitStatusUnknown));
    }
}

/// A proposed entry together with the handle to wait for it
pub struct Proposal {
    pub term: Term,
    pub index: Index,
    done: oneshot::Receiver<Result<(), RaftError>>,
}

impl Proposal {
    /// Resolve once the entry is committed or applied, depending on the
    /// wait type it was proposed with
    pub async fn wait(self) -> Result<(), RaftError> {
        self.done.await.unwrap_or(Err(RaftError::Stopped))
    }
}

/// Work handed from the I/O loop to the applier, in commit order
enum ApplyMessage {
    Entries(Vec<LogEntryPtr>),
    LoadSnapshot {
        snapshot: Snapshot,
        done: oneshot::Sender<Result<(), StateMachineError>>,
    },
    DropSnapshot(SnapshotId),
}

pub(crate) struct ServerInner {
    id: NodeId,
    config: RaftConfig,
    fsm: Mutex<Fsm>,
    fsm_changed: Notify,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn Storage>,
    waiters: Mutex<Waiters>,
    /// Reply channel of the snapshot install being processed, with its sender
    snapshot_application: Mutex<Option<(NodeId, oneshot::Sender<SnapshotReply>)>>,
    snapshot_transfers: Mutex<Vec<JoinHandle<()>>>,
    abort: watch::Sender<bool>,
    stopped: AtomicBool,
    tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
}

/// State the I/O loop carries between batches
struct IoState {
    /// Last log index handed to storage
    persisted_last: Index,
    snapshot_id: SnapshotId,
    members: BTreeMap<NodeId, Bytes>,
    was_leader: bool,
}

/// Handle to a running Raft server. Clones share the same server.
#[derive(Clone)]
pub struct RaftServer {
    inner: Arc<ServerInner>,
}

impl RaftServer {
    /// Load persisted state, restore the state machine from the latest
    /// snapshot and start the background tasks
    pub async fn start(
        id: NodeId,
        transport: Arc<dyn Transport>,
        mut state_machine: Box<dyn StateMachine>,
        storage: Arc<dyn Storage>,
        config: RaftConfig,
    ) -> Result<Self, RaftError> {
        let (term, vote) = storage.load_term_and_vote().await?;
        let snapshot = storage.load_snapshot().await?.unwrap_or_default();
        let mut entries = storage.load_log().await?;
        if entries.last().is_some_and(|e| e.index < snapshot.index) {
            // only trailing entries below a newer snapshot survived
            storage.truncate_log(0).await?;
            entries.clear();
        }
        if !snapshot.id.is_nil() {
            state_machine.load_snapshot(snapshot.id).await?;
        }

        let log = Log::new(snapshot.clone(), entries);
        info!(
            id = %id,
            term,
            snapshot_index = snapshot.index,
            last_index = log.last_index(),
            "starting raft server"
        );
        let members = peer_members(id, log.configuration());
        for (peer, info) in &members {
            transport.add_node(*peer, info.clone());
        }
        let persisted_last = log.last_index();
        let fsm = Fsm::new(id, term, vote, log, &config);

        let (abort, abort_rx) = watch::channel(false);
        let (apply_tx, apply_rx) = mpsc::channel(config.apply_queue_capacity);
        let waiters = Waiters {
            commit_notified: snapshot.index,
            apply_notified: snapshot.index,
            ..Default::default()
        };
        let inner = Arc::new(ServerInner {
            id,
            config,
            fsm: Mutex::new(fsm),
            fsm_changed: Notify::new(),
            transport,
            storage,
            waiters: Mutex::new(waiters),
            snapshot_application: Mutex::new(None),
            snapshot_transfers: Mutex::new(Vec::new()),
            abort,
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(None),
        });

        let io_state = IoState {
            persisted_last,
            snapshot_id: snapshot.id,
            members,
            was_leader: false,
        };
        let tasks = vec![
            tokio::spawn(inner.clone().run_ticker(abort_rx.clone())),
            tokio::spawn(inner.clone().run_io(io_state, apply_tx, abort_rx.clone())),
            tokio::spawn(inner.clone().run_applier(state_machine, apply_rx, snapshot.index, abort_rx)),
        ];
        *inner.tasks.lock() = Some(tasks);

        Ok(Self { inner })
    }

    /// Stop the server. Outstanding proposals fail with `Stopped`. Safe to
    /// call more than once and from several clones.
    pub async fn stop(&self) {
        let Some(tasks) = self.inner.tasks.lock().take() else {
            return;
        };
        info!(id = %self.inner.id, "stopping raft server");
        self.inner.shut_down();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(id = %self.inner.id, error = %e, "server task ended abnormally");
            }
        }
        let transfers = std::mem::take(&mut *self.inner.snapshot_transfers.lock());
        join_all(transfers).await;
        self.inner.transport.abort().await;
        self.inner.storage.abort().await;
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    // ---- client API ---------------------------------------------------------

    /// Append a command to the log. Fails right away with `NotLeader` on a
    /// follower; the returned proposal resolves later.
    pub fn propose(&self, command: Bytes, wait: WaitType) -> Result<Proposal, RaftError> {
        self.inner.check_running()?;
        let proposal = {
            let mut fsm = self.inner.fsm.lock();
            let entry = fsm.propose(command)?;
            self.inner.register(&fsm, wait, entry.index, entry.term)
        };
        self.inner.fsm_changed.notify_one();
        Ok(proposal)
    }

    /// Propose a command and wait for it
    pub async fn add_entry(&self, command: Bytes, wait: WaitType) -> Result<(), RaftError> {
        self.propose(command, wait)?.wait().await
    }

    /// Move the cluster to `members`. Returns once the final configuration
    /// is committed.
    pub async fn propose_config_change(&self, members: BTreeMap<NodeId, Bytes>) -> Result<(), RaftError> {
        self.inner.check_running()?;
        let joint = {
            let mut fsm = self.inner.fsm.lock();
            let entry = fsm.propose_config_change(members)?;
            self.inner.register(&fsm, WaitType::Committed, entry.index, entry.term)
        };
        self.inner.fsm_changed.notify_one();
        let joint_index = joint.index;
        joint.wait().await?;

        // the leader appended the final configuration when the joint one committed
        let last = {
            let fsm = self.inner.fsm.lock();
            let index = fsm.log().last_conf_index();
            if index <= joint_index {
                // compacted into a snapshot, or never appended by us
                return if fsm.log().configuration().is_joint() {
                    Err(RaftError::CommitStatusUnknown)
                } else {
                    Ok(())
                };
            }
            let Some(term) = fsm.log().term_for(index) else {
                return Err(RaftError::CommitStatusUnknown);
            };
            self.inner.register(&fsm, WaitType::Committed, index, term)
        };
        last.wait().await
    }

    /// Add `id` to the configuration, doing nothing if it is already a
    /// member. Fails with `CommitStatusUnknown` if the change does not
    /// complete within `timeout`.
    pub async fn add_server(&self, id: NodeId, info: Bytes, timeout: Duration) -> Result<(), RaftError> {
        let mut members = self.leader_configuration()?.current;
        if members.contains_key(&id) {
            return Ok(());
        }
        members.insert(id, info);
        self.change_membership(members, timeout).await
    }

    /// Remove `id` from the configuration, doing nothing if it is not a
    /// member
    pub async fn remove_server(&self, id: NodeId, timeout: Duration) -> Result<(), RaftError> {
        let mut members = self.leader_configuration()?.current;
        if members.remove(&id).is_none() {
            return Ok(());
        }
        self.change_membership(members, timeout).await
    }

    fn leader_configuration(&self) -> Result<Configuration, RaftError> {
        self.inner.check_running()?;
        let fsm = self.inner.fsm.lock();
        if !fsm.is_leader() {
            return Err(RaftError::NotLeader {
                leader: fsm.current_leader(),
            });
        }
        Ok(fsm.configuration().clone())
    }

    async fn change_membership(&self, members: BTreeMap<NodeId, Bytes>, timeout: Duration) -> Result<(), RaftError> {
        tokio::time::timeout(timeout, self.propose_config_change(members))
            .await
            .map_err(|_| RaftError::CommitStatusUnknown)?
    }

    /// Wait until everything committed before the call is applied locally.
    /// Only a leader can serve it.
    pub async fn read_barrier(&self) -> Result<(), RaftError> {
        self.inner.check_running()?;
        let barrier = {
            let mut fsm = self.inner.fsm.lock();
            let entry = fsm.propose_dummy()?;
            self.inner.register(&fsm, WaitType::Applied, entry.index, entry.term)
        };
        self.inner.fsm_changed.notify_one();
        barrier.wait().await
    }

    /// Advance the logical clock by one tick, in addition to the ticker
    pub fn tick(&self) -> Result<(), RaftError> {
        self.inner.with_fsm(|fsm| fsm.tick())
    }

    /// Campaign with the leadership transfer flag until this node leads
    pub async fn elect_me_leader(&self) -> Result<(), RaftError> {
        let patience = 2 * self.inner.config.election_timeout;
        loop {
            {
                let fsm = self.inner.fsm.lock();
                if fsm.is_leader() {
                    return Ok(());
                }
                if !fsm.configuration().contains(&self.inner.id) {
                    return Err(RaftError::NotLeader {
                        leader: fsm.current_leader(),
                    });
                }
            }
            self.inner.with_fsm(|fsm| fsm.campaign(true))?;
            for _ in 0..patience {
                sleep(self.inner.config.tick_interval).await;
                self.inner.check_running()?;
                if self.is_leader() {
                    return Ok(());
                }
            }
            debug!(id = %self.inner.id, "election did not finish, campaigning again");
        }
    }

    // ---- incoming messages --------------------------------------------------

    /// Feed any message received from `from`
    pub fn step(&self, from: NodeId, message: Message) -> Result<(), RaftError> {
        self.inner.with_fsm(|fsm| fsm.step(from, message))
    }

    pub fn append_entries(&self, from: NodeId, request: AppendRequest) -> Result<(), RaftError> {
        self.step(from, Message::AppendRequest(request))
    }

    pub fn append_entries_reply(&self, from: NodeId, reply: AppendReply) -> Result<(), RaftError> {
        self.step(from, Message::AppendReply(reply))
    }

    pub fn request_vote(&self, from: NodeId, request: VoteRequest) -> Result<(), RaftError> {
        self.step(from, Message::VoteRequest(request))
    }

    pub fn request_vote_reply(&self, from: NodeId, reply: VoteReply) -> Result<(), RaftError> {
        self.step(from, Message::VoteReply(reply))
    }

    pub fn keepalive(&self, from: NodeId, keepalive: KeepAlive) -> Result<(), RaftError> {
        self.inner.with_fsm(|fsm| fsm.keepalive(from, keepalive))
    }

    /// Install a snapshot sent by the leader. Resolves once the snapshot is
    /// persisted and loaded into the state machine.
    pub async fn apply_snapshot(&self, from: NodeId, request: InstallSnapshot) -> Result<SnapshotReply, RaftError> {
        self.inner.check_running()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = self.inner.snapshot_application.lock();
            if pending.is_some() {
                return Err(RaftError::SnapshotInProgress);
            }
            *pending = Some((from, reply_tx));
        }
        if let Err(e) = self.step(from, Message::InstallSnapshot(request)) {
            self.inner.snapshot_application.lock().take();
            return Err(e);
        }
        reply_rx.await.map_err(|_| RaftError::Stopped)
    }

    // ---- state --------------------------------------------------------------

    pub fn is_leader(&self) -> bool {
        self.inner.fsm.lock().is_leader()
    }

    pub fn role(&self) -> Role {
        self.inner.fsm.lock().role()
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.inner.fsm.lock().current_leader()
    }

    pub fn current_term(&self) -> Term {
        self.inner.fsm.lock().current_term()
    }

    pub fn commit_index(&self) -> Index {
        self.inner.fsm.lock().commit_index()
    }

    pub fn last_log_index(&self) -> Index {
        self.inner.fsm.lock().log().last_index()
    }

    pub fn log_start_index(&self) -> Index {
        self.inner.fsm.lock().log().start_index()
    }

    pub fn snapshot_index(&self) -> Index {
        self.inner.fsm.lock().log().snapshot().index
    }

    /// Index of the entry that holds the current configuration
    pub fn last_conf_index(&self) -> Index {
        self.inner.fsm.lock().log().last_conf_index()
    }

    /// Effective configuration, possibly not committed yet
    pub fn configuration(&self) -> Configuration {
        self.inner.fsm.lock().configuration().clone()
    }

    /// Index of the last entry handed to the state machine
    pub fn applied_index(&self) -> Index {
        self.inner.waiters.lock().apply_notified
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

impl ServerInner {
    fn check_running(&self) -> Result<(), RaftError> {
        if self.stopped.load(Ordering::Acquire) {
            Err(RaftError::Stopped)
        } else {
            Ok(())
        }
    }

    fn with_fsm<R>(&self, f: impl FnOnce(&mut Fsm) -> R) -> Result<R, RaftError> {
        self.check_running()?;
        let result = {
            let mut fsm = self.fsm.lock();
            f(&mut *fsm)
        };
        self.fsm_changed.notify_one();
        Ok(result)
    }

    /// Register a waiter while holding the FSM lock, so the entry cannot be
    /// polled before the waiter exists
    fn register(&self, fsm: &Fsm, wait: WaitType, index: Index, term: Term) -> Proposal {
        let (done, rx) = oneshot::channel();
        let proposal = Proposal { term, index, done: rx };
        let mut waiters = self.waiters.lock();
        if waiters.stopped {
            let _ = done.send(Err(RaftError::Stopped));
        } else if index <= waiters.notified(wait) {
            let result = match fsm.log().term_for(index) {
                Some(t) if t == term => Ok(()),
                Some(_) => Err(RaftError::DroppedEntry),
                None => Err(RaftError::CommitStatusUnknown),
            };
            let _ = done.send(result);
        } else {
            waiters.registry(wait).insert(index, OpStatus { term, done });
        }
        proposal
    }

    /// Stop accepting inputs, end the background loops and fail waiters
    fn shut_down(&self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.abort.send(true);
        self.waiters.lock().stop();
        // dropping the reply channel fails the pending install
        self.snapshot_application.lock().take();
    }

    async fn run_ticker(self: Arc<Self>, mut abort: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = abort.changed() => break,
                _ = ticker.tick() => {
                    let Ok(keepalive) = self.with_fsm(|fsm| {
                        fsm.tick();
                        leader_keepalive(fsm)
                    }) else {
                        break;
                    };
                    if let Some((keepalive, peers)) = keepalive {
                        self.send_keepalives(keepalive, peers).await;
                    }
                }
            }
        }
    }

    async fn send_keepalives(&self, keepalive: KeepAlive, peers: BTreeSet<NodeId>) {
        let sends = peers
            .into_iter()
            .map(|to| self.transport.send_keepalive(to, keepalive.clone()));
        for result in join_all(sends).await {
            if let Err(e) = result {
                trace!(id = %self.id, error = %e, "keepalive not sent");
            }
        }
    }

    // ---- I/O loop -----------------------------------------------------------

    async fn run_io(
        self: Arc<Self>,
        mut state: IoState,
        apply_tx: mpsc::Sender<ApplyMessage>,
        mut abort: watch::Receiver<bool>,
    ) {
        loop {
            if *abort.borrow() {
                break;
            }
            let output = {
                let mut fsm = self.fsm.lock();
                fsm.has_output().then(|| fsm.poll_output())
            };
            let Some(output) = output else {
                tokio::select! {
                    _ = abort.changed() => {}
                    _ = self.fsm_changed.notified() => {}
                }
                continue;
            };
            if let Err(e) = self.process_output(output, &mut state, &apply_tx).await {
                error!(id = %self.id, error = %e, "I/O loop failed, stopping the server");
                self.shut_down();
                break;
            }
        }
        trace!(id = %self.id, "I/O loop finished");
    }

    async fn process_output(
        self: &Arc<Self>,
        output: FsmOutput,
        state: &mut IoState,
        apply_tx: &mpsc::Sender<ApplyMessage>,
    ) -> Result<(), RaftError> {
        if let Some((term, vote)) = output.term_and_vote {
            self.storage.store_term_and_vote(term, vote).await?;
        }

        if let Some(snapshot) = output.snapshot {
            self.persist_snapshot(snapshot, state, apply_tx).await?;
        }

        if let (Some(first), Some(last)) = (output.log_entries.first(), output.log_entries.last()) {
            if first.index <= state.persisted_last {
                debug!(id = %self.id, from = first.index, "truncating persisted log");
                self.storage.truncate_log(first.index).await?;
            }
            self.storage.store_log_entries(&output.log_entries).await?;
            state.persisted_last = last.index;
            self.fsm.lock().mark_stable(last.term, last.index);
        }

        if let Some(config) = output.configuration {
            self.update_members(&config, state);
        }

        if !output.messages.is_empty() {
            join_all(
                output
                    .messages
                    .into_iter()
                    .map(|(to, message)| self.send_message(to, message)),
            )
            .await;
        }

        if !output.committed.is_empty() {
            self.waiters.lock().notify(WaitType::Committed, &output.committed);
            apply_tx
                .send(ApplyMessage::Entries(output.committed))
                .await
                .map_err(|_| RaftError::Stopped)?;
        }

        let (is_leader, commit_index) = {
            let fsm = self.fsm.lock();
            (fsm.is_leader(), fsm.commit_index())
        };
        if state.was_leader && !is_leader {
            debug!(id = %self.id, commit_index, "lost leadership, failing uncommitted proposals");
            self.waiters.lock().fail_uncommitted(commit_index);
            self.cancel_snapshot_transfers();
        }
        state.was_leader = is_leader;
        Ok(())
    }

    async fn persist_snapshot(
        &self,
        output: SnapshotOutput,
        state: &mut IoState,
        apply_tx: &mpsc::Sender<ApplyMessage>,
    ) -> Result<(), RaftError> {
        let snapshot = output.snapshot;
        self.storage
            .store_snapshot(&snapshot, output.preserve_log_entries)
            .await?;
        if output.log_discarded {
            self.storage.truncate_log(snapshot.index + 1).await?;
            state.persisted_last = snapshot.index;
        }

        if !output.local {
            let (done, loaded) = oneshot::channel();
            apply_tx
                .send(ApplyMessage::LoadSnapshot {
                    snapshot: snapshot.clone(),
                    done,
                })
                .await
                .map_err(|_| RaftError::Stopped)?;
            loaded.await.map_err(|_| RaftError::Stopped)??;
            self.waiters.lock().skip_through(WaitType::Committed, snapshot.index);
        }

        let previous = std::mem::replace(&mut state.snapshot_id, snapshot.id);
        if !previous.is_nil() && previous != snapshot.id {
            apply_tx
                .send(ApplyMessage::DropSnapshot(previous))
                .await
                .map_err(|_| RaftError::Stopped)?;
        }
        debug!(id = %self.id, index = snapshot.index, local = output.local, "persisted snapshot");
        Ok(())
    }

    fn update_members(&self, config: &Configuration, state: &mut IoState) {
        let members = peer_members(self.id, config);
        for id in state.members.keys() {
            if !members.contains_key(id) {
                self.transport.remove_node(*id);
            }
        }
        for (id, info) in &members {
            if state.members.get(id) != Some(info) {
                self.transport.add_node(*id, info.clone());
            }
        }
        state.members = members;
    }

    async fn send_message(self: &Arc<Self>, to: NodeId, message: Message) {
        let result = match message {
            Message::AppendRequest(request) => self.transport.send_append_request(to, request).await,
            Message::AppendReply(reply) => self.transport.send_append_reply(to, reply).await,
            Message::VoteRequest(request) => self.transport.send_vote_request(to, request).await,
            Message::VoteReply(reply) => self.transport.send_vote_reply(to, reply).await,
            Message::InstallSnapshot(request) => {
                self.spawn_snapshot_transfer(to, request);
                Ok(())
            }
            Message::SnapshotReply(reply) => {
                self.answer_snapshot(to, reply);
                Ok(())
            }
        };
        if let Err(e) = result {
            debug!(id = %self.id, to = %to, error = %e, "failed to send message");
        }
    }

    fn spawn_snapshot_transfer(self: &Arc<Self>, to: NodeId, request: InstallSnapshot) {
        let inner = self.clone();
        let (index, term) = (request.snapshot.index, request.current_term);
        info!(id = %self.id, to = %to, index, term, "sending snapshot");
        let handle = tokio::spawn(async move {
            let result = inner.transport.send_snapshot(to, request).await;
            if inner.check_running().is_err() {
                return;
            }
            {
                let mut fsm = inner.fsm.lock();
                match result {
                    Ok(reply) => {
                        let success = reply.success;
                        let reply_term = reply.current_term;
                        fsm.step(to, Message::SnapshotReply(reply));
                        if reply_term == fsm.current_term() {
                            fsm.snapshot_status(to, index, term, success);
                        }
                    }
                    Err(e) => {
                        debug!(id = %inner.id, to = %to, index, error = %e, "snapshot transfer failed");
                        fsm.snapshot_status(to, index, term, false);
                    }
                }
            }
            inner.fsm_changed.notify_one();
        });
        let mut transfers = self.snapshot_transfers.lock();
        transfers.retain(|transfer| !transfer.is_finished());
        transfers.push(handle);
    }

    /// Abort outbound transfers, their results mean nothing to a follower
    fn cancel_snapshot_transfers(&self) {
        for transfer in self.snapshot_transfers.lock().drain(..) {
            transfer.abort();
        }
    }

    /// The FSM answered an install request, hand the reply to its caller
    fn answer_snapshot(&self, to: NodeId, reply: SnapshotReply) {
        let mut pending = self.snapshot_application.lock();
        match pending.take() {
            Some((from, reply_tx)) if from == to => {
                let _ = reply_tx.send(reply);
            }
            other => {
                trace!(id = %self.id, to = %to, "no install request waiting for this reply");
                *pending = other;
            }
        }
    }

    // ---- applier ------------------------------------------------------------

    async fn run_applier(
        self: Arc<Self>,
        mut state_machine: Box<dyn StateMachine>,
        mut apply_rx: mpsc::Receiver<ApplyMessage>,
        mut applied: Index,
        mut abort: watch::Receiver<bool>,
    ) {
        let mut last_snapshot = applied;
        loop {
            if *abort.borrow() {
                break;
            }
            // queued batches are dropped once the server stops
            let message = tokio::select! {
                biased;
                _ = abort.changed() => break,
                message = apply_rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            let result = match message {
                ApplyMessage::Entries(entries) => {
                    self.apply_entries(&mut *state_machine, entries, &mut applied, &mut last_snapshot)
                        .await
                }
                ApplyMessage::LoadSnapshot { snapshot, done } => {
                    let result = state_machine.load_snapshot(snapshot.id).await;
                    if result.is_ok() {
                        info!(id = %self.id, index = snapshot.index, "loaded snapshot into the state machine");
                        applied = snapshot.index;
                        last_snapshot = snapshot.index;
                        self.waiters.lock().skip_through(WaitType::Applied, snapshot.index);
                    }
                    let _ = done.send(result.clone());
                    result
                }
                ApplyMessage::DropSnapshot(id) => {
                    state_machine.drop_snapshot(id);
                    Ok(())
                }
            };
            if let Err(e) = result {
                error!(id = %self.id, error = %e, "state machine failed, stopping the server");
                self.shut_down();
                break;
            }
        }
        state_machine.abort().await;
        trace!(id = %self.id, "applier finished");
    }

    async fn apply_entries(
        &self,
        state_machine: &mut dyn StateMachine,
        entries: Vec<LogEntryPtr>,
        applied: &mut Index,
        last_snapshot: &mut Index,
    ) -> Result<(), StateMachineError> {
        let Some(last) = entries.last().map(|e| e.index) else {
            return Ok(());
        };
        let commands: Vec<Bytes> = entries
            .iter()
            .filter_map(|entry| match &entry.payload {
                EntryPayload::Command(command) => Some(command.clone()),
                _ => None,
            })
            .collect();
        if !commands.is_empty() {
            state_machine.apply(commands).await?;
        }
        *applied = last;
        self.waiters.lock().notify(WaitType::Applied, &entries);

        let threshold = self.config.snapshot_threshold;
        if threshold > 0 && *applied - *last_snapshot >= threshold {
            let id = state_machine.take_snapshot().await?;
            let snapshot = self
                .fsm
                .lock()
                .apply_local_snapshot(*applied, id, self.config.snapshot_trailing);
            match snapshot {
                Some(snapshot) => {
                    info!(id = %self.id, index = snapshot.index, "took local snapshot");
                    self.fsm_changed.notify_one();
                }
                None => {
                    debug!(id = %self.id, index = *applied, "snapshot is obsolete, dropping it");
                    state_machine.drop_snapshot(id);
                }
            }
            *last_snapshot = *applied;
        }
        Ok(())
    }
}

/// Keepalive a leader sends to every other member after a tick
fn leader_keepalive(fsm: &Fsm) -> Option<(KeepAlive, BTreeSet<NodeId>)> {
    if !fsm.is_leader() {
        return None;
    }
    let mut peers = fsm.configuration().members();
    peers.remove(&fsm.id());
    let keepalive = KeepAlive {
        current_term: fsm.current_term(),
        leader_id: fsm.id(),
    };
    Some((keepalive, peers))
}

/// Members of `config` other than `id`, with their transport info
fn peer_members(id: NodeId, config: &Configuration) -> BTreeMap<NodeId, Bytes> {
    config
        .previous
        .iter()
        .chain(config.current.iter())
        .filter(|(member, _)| **member != id)
        .map(|(member, info)| (*member, info.clone()))
        .collect()
}
