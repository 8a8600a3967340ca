//! The concurrent Raft node: role controller, timers, and peer fan-out.
//!
//! A [`RaftNode`] is driven from three directions at once: two timer worker threads
//! (election and heartbeat), inbound RPCs arriving on transport threads, and client
//! requests on caller threads. All of them funnel into the [`NodeState`] behind a single
//! mutex; elections and replication passes snapshot what they need under the lock, fan
//! out to peers on short-lived worker threads with the lock released, and take the lock
//! back per reply. The lock is never held across a call into the [`Cluster`] transport.
//!
//! [`run`](RaftNode::run) is the single reconfiguration point for the timers: it arms
//! exactly the schedules the current role needs and is called again on every transition
//! that crosses them.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use log::{debug, warn};

use crate::cluster::Cluster;
use crate::core::{quorum_size, NodeState, ReplicationState, Role};
use crate::error::{Cancelled, RequestError};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, LogEntry, NodeId, VoteRequest, VoteResponse,
};
use crate::state_machine::StateMachine;
use crate::storage::StableStore;
use crate::timer::Timer;

/// How often a waiting client re-checks whether a leader became known.
const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A Raft consensus node.
///
/// Constructing a node configures it as a follower of the given cluster; nothing happens
/// until [`run`](Self::run) arms its timers. Peer RPCs enter through
/// [`handle_append_entries`](Self::handle_append_entries) and
/// [`handle_request_vote`](Self::handle_request_vote), client commands through
/// [`client_request`](Self::client_request). Cloning the handle is cheap and every clone
/// drives the same node.
pub struct RaftNode<C, M, S> {
    inner: Arc<Inner<C, M, S>>,
}

impl<C, M, S> Clone for RaftNode<C, M, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C, M, S> {
    id: NodeId,
    cluster: Arc<C>,
    election_timeout: Duration,
    heartbeat_interval: Duration,
    state: Mutex<NodeState<M, S>>,
    /// Signalled whenever the known leader or the lifecycle changes.
    leader_change: Condvar,
    election_timer: Timer,
    heartbeat_timer: Timer,
}

/// How a client command was taken in.
pub enum RequestOutcome {
    /// The local node is leader and appended the command; the handle resolves once the
    /// entry commits and is applied.
    Accepted(CommitHandle),

    /// The command was forwarded to another node.
    Forwarded(NodeId),
}

/// A waiter for the commit of one accepted command.
#[must_use = "dropping the handle loses the command's result"]
pub struct CommitHandle {
    index: u64,
    waiter: Receiver<Result<Bytes, Cancelled>>,
}

impl CommitHandle {
    /// The log index the command was appended at.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Blocks until the command is applied or its entry is replaced.
    pub fn wait(&self) -> Result<Bytes, Cancelled> {
        match self.waiter.recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(Cancelled { index: self.index }),
        }
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`. `None` means the entry is
    /// still in flight.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Bytes, Cancelled>> {
        match self.waiter.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(Cancelled { index: self.index })),
        }
    }
}

impl<C, M, S> RaftNode<C, M, S>
where
    C: Cluster,
    M: StateMachine,
    S: StableStore,
{
    /// Creates a node configured for `cluster`, recovering whatever persistent state
    /// `stable` holds. The node starts as a follower with both timers disarmed.
    pub fn new(id: NodeId, cluster: C, machine: M, stable: S) -> Self {
        let cluster = Arc::new(cluster);
        let election_timeout = cluster.election_timeout();
        let inner = Arc::new_cyclic(|weak: &Weak<Inner<C, M, S>>| {
            let on_election = {
                let weak = weak.clone();
                move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.start_election();
                    }
                }
            };
            let on_heartbeat = {
                let weak = weak.clone();
                move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.replication_pass();
                    }
                }
            };
            Inner {
                id,
                cluster,
                election_timeout,
                heartbeat_interval: election_timeout / 2,
                state: Mutex::new(NodeState::new(id, machine, stable)),
                leader_change: Condvar::new(),
                election_timer: Timer::spawn("election", on_election),
                heartbeat_timer: Timer::spawn("heartbeat", on_heartbeat),
            }
        });
        Self { inner }
    }

    //
    // lifecycle
    //

    /// Arms exactly the timers the current role needs.
    pub fn run(&self) {
        self.inner.run();
    }

    /// Disarms both timers and stops answering; the node's state is kept.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Returns a stopped node to follower and re-arms its timers.
    pub fn restart(&self) {
        self.inner.restart();
    }

    //
    // manual triggers
    //

    /// Opens an election right now, exactly as an election timeout would.
    pub fn campaign(&self) {
        self.inner.start_election();
    }

    /// Runs one replication pass right now, exactly as a heartbeat tick would.
    pub fn send_heartbeats(&self) {
        self.inner.replication_pass();
    }

    //
    // inbound RPCs
    //

    pub fn handle_append_entries(&self, request: &AppendEntriesRequest) -> AppendEntriesResponse {
        self.inner.handle_append_entries(request)
    }

    pub fn handle_request_vote(&self, request: &VoteRequest) -> VoteResponse {
        self.inner.handle_request_vote(request)
    }

    //
    // client requests
    //

    /// Takes in a client command.
    ///
    /// On the leader the command is appended locally and an [`RequestOutcome::Accepted`]
    /// handle is returned; replication happens on the next heartbeat pass. On any other
    /// live node the call blocks until a leader is known, then forwards the command and
    /// returns [`RequestOutcome::Forwarded`]. The node buffers nothing.
    pub fn client_request(&self, command: Bytes) -> Result<RequestOutcome, RequestError> {
        self.inner.client_request(command)
    }

    //
    // inspection
    //

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.lock_state().role
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn current_term(&self) -> u64 {
        self.inner.lock_state().current_term
    }

    /// The node this one believes leads the latest known term, with that term.
    pub fn leader(&self) -> (Option<NodeId>, u64) {
        let state = self.inner.lock_state();
        (state.leader_id, state.current_term)
    }

    pub fn commit_index(&self) -> Option<u64> {
        self.inner.lock_state().commit_index
    }

    pub fn last_applied(&self) -> Option<u64> {
        self.inner.lock_state().last_applied
    }

    /// A snapshot of the log.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.lock_state().log.entries().to_vec()
    }

    /// Replication progress towards `peer`, while leader.
    pub fn replication_state(&self, peer: NodeId) -> Option<ReplicationState> {
        self.inner.lock_state().replication.get(&peer).copied()
    }

    /// Probes the attached state machine. Diagnostic only.
    pub fn ping_state_machine(&self) -> bool {
        self.inner.lock_state().ping_state_machine()
    }
}

impl<C, M, S> Inner<C, M, S>
where
    C: Cluster,
    M: StateMachine,
    S: StableStore,
{
    /// Takes the state lock, recovering the guard when a prior holder panicked
    /// mid-update (a fallible `apply` or `persist` must not wedge the node).
    fn lock_state(&self) -> MutexGuard<'_, NodeState<M, S>> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn run(&self) {
        let peers = self.cluster.peers();
        let campaign = {
            let mut state = self.lock_state();
            match state.role {
                Role::Follower | Role::Candidate => {
                    self.heartbeat_timer.disarm();
                    self.election_timer
                        .arm(self.election_timeout, self.election_timeout);
                    // a candidate does not wait for the timer to expire again
                    state.role == Role::Candidate
                }
                Role::Leader => {
                    self.election_timer.disarm();
                    state.reset_replication(&peers);
                    self.heartbeat_timer.arm(Duration::ZERO, self.heartbeat_interval);
                    false
                }
                Role::Stopped => {
                    self.election_timer.disarm();
                    self.heartbeat_timer.disarm();
                    false
                }
            }
        };
        if campaign {
            self.start_election();
        }
    }

    fn stop(&self) {
        {
            let mut state = self.lock_state();
            state.stop();
            self.election_timer.disarm();
            self.heartbeat_timer.disarm();
        }
        // wake waiting clients so they observe the stop
        self.leader_change.notify_all();
    }

    fn restart(&self) {
        self.lock_state().restart();
        self.run();
    }

    /// One complete candidacy: term bump and self-vote under the lock, then a parallel
    /// vote solicitation whose replies are tallied as they arrive, until a majority, a
    /// step-down, or the deadline.
    fn start_election(&self) {
        let request = {
            let mut state = self.lock_state();
            match state.begin_election() {
                Some(request) => request,
                None => return,
            }
        };
        let election_term = request.term;
        let quorum = quorum_size(self.cluster.size());
        let peers = self.cluster.peers();

        // a single-node cluster wins on its own vote
        let mut promoted = {
            let mut state = self.lock_state();
            state.try_promote(quorum)
        };

        if !promoted {
            let (replies, tally) = bounded(peers.len());
            for peer in peers {
                let cluster = Arc::clone(&self.cluster);
                let request = request.clone();
                let replies = replies.clone();
                thread::spawn(move || {
                    let _ = replies.send(cluster.request_vote(peer, request));
                });
            }
            drop(replies);

            let deadline = Instant::now() + self.election_timeout;
            while let Ok(reply) = tally.recv_deadline(deadline) {
                let reply = match reply {
                    Ok(reply) => reply,
                    Err(err) => {
                        warn!("node {} got no vote reply: {}", self.id, err);
                        continue;
                    }
                };
                let mut state = self.lock_state();
                if state.record_vote(election_term, &reply, quorum) {
                    promoted = true;
                    break;
                }
            }
        }

        if promoted {
            self.run();
            self.leader_change.notify_all();
        }
    }

    /// One replication pass: builds every peer's batch under the lock, fans the sends
    /// out in parallel, digests replies as they arrive, then advances the commit index.
    fn replication_pass(&self) {
        let peers = self.cluster.peers();
        let (pass_term, batches) = {
            let state = self.lock_state();
            if state.role != Role::Leader {
                return;
            }
            let batches: Vec<(NodeId, AppendEntriesRequest)> = peers
                .iter()
                .filter_map(|&peer| {
                    state
                        .append_request_for(peer)
                        .map(|request| (peer, request))
                })
                .collect();
            (state.current_term, batches)
        };

        let (replies, outcomes) = bounded(batches.len());
        for (peer, request) in batches {
            let cluster = Arc::clone(&self.cluster);
            let replies = replies.clone();
            thread::spawn(move || {
                let sent_entries = request.entries.len();
                let reply = cluster.append_entries(peer, request);
                let _ = replies.send((peer, sent_entries, reply));
            });
        }
        drop(replies);

        let deadline = Instant::now() + self.heartbeat_interval;
        while let Ok((peer, sent_entries, reply)) = outcomes.recv_deadline(deadline) {
            let reply = match reply {
                Ok(reply) => reply,
                Err(err) => {
                    debug!("node {} got no append reply: {}", self.id, err);
                    continue;
                }
            };
            let mut state = self.lock_state();
            if !state.record_append_reply(peer, pass_term, sent_entries, &reply) {
                // deposed mid-pass; progress state is no longer ours to touch
                return;
            }
        }

        self.lock_state().advance_commit(self.cluster.size());
    }

    fn handle_append_entries(&self, request: &AppendEntriesRequest) -> AppendEntriesResponse {
        let leader_contact;
        let reply = {
            let mut state = self.lock_state();
            let (reply, contact) = state.handle_append_entries(request);
            if contact {
                self.heartbeat_timer.disarm();
                self.election_timer
                    .arm(self.election_timeout, self.election_timeout);
            }
            leader_contact = contact;
            reply
        };
        if leader_contact {
            self.leader_change.notify_all();
        }
        reply
    }

    fn handle_request_vote(&self, request: &VoteRequest) -> VoteResponse {
        let mut state = self.lock_state();
        let (reply, current) = state.handle_request_vote(request);
        if current {
            self.heartbeat_timer.disarm();
            self.election_timer
                .arm(self.election_timeout, self.election_timeout);
        }
        reply
    }

    fn client_request(&self, command: Bytes) -> Result<RequestOutcome, RequestError> {
        let mut state = self.lock_state();
        loop {
            match state.role {
                Role::Stopped => return Err(RequestError::Stopped),
                Role::Leader => {
                    let (index, waiter) = state.accept_command(command);
                    return Ok(RequestOutcome::Accepted(CommitHandle { index, waiter }));
                }
                Role::Follower | Role::Candidate => {
                    let target = match state.leader_id {
                        // a stale pointer at ourselves: any other member will do
                        Some(leader) if leader == self.id => {
                            self.cluster.peers().into_iter().next()
                        }
                        Some(leader) => Some(leader),
                        None => None,
                    };
                    if let Some(target) = target {
                        drop(state);
                        self.cluster.redirect(target, command)?;
                        debug!("node {} forwarded client request to {}", self.id, target);
                        return Ok(RequestOutcome::Forwarded(target));
                    }
                    state = match self.leader_change.wait_timeout(state, LEADER_POLL_INTERVAL) {
                        Ok((woken, _)) => woken,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            }
        }
    }
}
