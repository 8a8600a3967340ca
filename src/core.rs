//! Low-level state of a Raft node: role, term, log, and the acceptance rules.
//!
//! [`NodeState`] is pure bookkeeping. It owns every field that peer RPCs and timer
//! callbacks mutate, plus the attached state machine and stable store, but runs no
//! threads and no timers of its own; the concurrent shell in [`node`](crate::node) keeps
//! one instance behind a mutex and calls in with the lock held. The term, the vote, the
//! known leader, and the role only ever change together through
//! [`observe_term`](NodeState::observe_term), the single privileged term-update
//! primitive; the one exception is the deliberate self-bump at the start of an election.

use std::collections::HashMap;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};

use crate::error::Cancelled;
use crate::log::RaftLog;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, NodeId, VoteRequest, VoteResponse,
};
use crate::state_machine::StateMachine;
use crate::storage::StableStore;

/// The roles a node moves through.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Stopped,
}

/// Replication progress towards one peer, reset on every promotion to leader.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReplicationState {
    /// Index of the next log entry to send to the peer.
    pub next_index: u64,

    /// Highest index known replicated on the peer, or `None` before the first
    /// acknowledged batch.
    pub match_index: Option<u64>,
}

/// The smallest majority of a cluster with `cluster_size` total nodes.
pub fn quorum_size(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

/// A client waiting for its entry to commit. The recorded term tells a conflicting
/// rewrite of the slot apart from a benign redelivery of the same entry.
struct PendingRequest {
    term: u64,
    completion: Sender<Result<Bytes, Cancelled>>,
}

pub(crate) struct NodeState<M, S> {
    pub id: NodeId,
    pub role: Role,
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub vote_count: usize,
    pub log: RaftLog,
    pub commit_index: Option<u64>,
    pub last_applied: Option<u64>,
    pub replication: HashMap<NodeId, ReplicationState>,
    pending: HashMap<u64, PendingRequest>,
    machine: M,
    stable: S,
}

impl<M, S> NodeState<M, S>
where
    M: StateMachine,
    S: StableStore,
{
    /// Builds the state of a freshly configured follower, recovering any persistent
    /// fields `stable` holds from a previous run.
    pub fn new(id: NodeId, machine: M, mut stable: S) -> Self {
        let (current_term, voted_for, log) = match stable.load() {
            Some(hard) => {
                info!(
                    "node {} recovered term {} and {} log entries",
                    id,
                    hard.current_term,
                    hard.entries.len()
                );
                (hard.current_term, hard.voted_for, RaftLog::restore(hard.entries))
            }
            None => (0, None, RaftLog::new()),
        };
        Self {
            id,
            role: Role::Follower,
            current_term,
            voted_for,
            leader_id: None,
            vote_count: 0,
            log,
            commit_index: None,
            last_applied: None,
            replication: HashMap::new(),
            pending: HashMap::new(),
            machine,
            stable,
        }
    }

    //
    // term and role transitions
    //

    /// The privileged term-update primitive. Adopting a larger term clears the vote,
    /// the known leader, and the tally, and demotes the node to follower, all in one
    /// step; smaller or equal terms have no effect. Returns whether the term advanced.
    pub fn observe_term(&mut self, term: u64) -> bool {
        if self.role == Role::Stopped || term <= self.current_term {
            return false;
        }
        info!(
            "node {} became follower at term {} (from {})",
            self.id, term, self.current_term
        );
        self.current_term = term;
        self.voted_for = None;
        self.leader_id = None;
        self.vote_count = 0;
        self.role = Role::Follower;
        true
    }

    /// Opens a candidacy: term bump, self-vote, and the vote request to broadcast.
    /// Returns `None` when the role does not allow an election.
    pub fn begin_election(&mut self) -> Option<VoteRequest> {
        if !matches!(self.role, Role::Follower | Role::Candidate) {
            return None;
        }
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.vote_count = 1;
        self.leader_id = None;
        info!("node {} became candidate at term {}", self.id, self.current_term);
        self.persist();
        Some(VoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        })
    }

    /// Tallies one reply to the election opened at `election_term`. Replies are always
    /// inspected for a higher term; the vote itself only counts while the node is still
    /// the candidate of that same term. Returns whether this reply won the election.
    pub fn record_vote(&mut self, election_term: u64, reply: &VoteResponse, quorum: usize) -> bool {
        self.observe_term(reply.term);
        if !reply.vote_granted || self.role != Role::Candidate || self.current_term != election_term
        {
            return false;
        }
        self.vote_count += 1;
        self.try_promote(quorum)
    }

    /// Promotes a candidate holding a majority. Replication progress is reset by the
    /// role controller when it arms the leader's timers.
    pub fn try_promote(&mut self, quorum: usize) -> bool {
        if self.role != Role::Candidate || self.vote_count < quorum {
            return false;
        }
        info!(
            "node {} became leader at term {} with {} votes",
            self.id, self.current_term, self.vote_count
        );
        self.role = Role::Leader;
        self.leader_id = Some(self.id);
        true
    }

    /// Reinitialises per-peer replication progress to the end of the local log.
    pub fn reset_replication(&mut self, peers: &[NodeId]) {
        let next_index = self.log.len();
        self.replication = peers
            .iter()
            .map(|&peer| {
                (
                    peer,
                    ReplicationState {
                        next_index,
                        match_index: None,
                    },
                )
            })
            .collect();
    }

    pub fn stop(&mut self) {
        if self.role != Role::Stopped {
            info!("node {} stopped", self.id);
            self.role = Role::Stopped;
        }
    }

    pub fn restart(&mut self) {
        if self.role == Role::Stopped {
            info!("node {} restarted as follower", self.id);
            self.role = Role::Follower;
        }
    }

    //
    // leader-side replication
    //

    /// Builds the append-entries batch for `peer` from its replication progress; a pure
    /// heartbeat when the peer is believed caught up.
    pub fn append_request_for(&self, peer: NodeId) -> Option<AppendEntriesRequest> {
        if self.role != Role::Leader {
            return None;
        }
        let progress = self.replication.get(&peer)?;
        let prev_log_index = progress.next_index.saturating_sub(1);
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        Some(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries: self.log.entries_from(progress.next_index).to_vec(),
            leader_commit: self.commit_index,
        })
    }

    /// Digests one replication reply from `peer` for a batch of `sent_entries` entries
    /// sent in `sent_term`. Returns `false` when leadership or the term changed and the
    /// rest of the pass must stop touching progress state.
    pub fn record_append_reply(
        &mut self,
        peer: NodeId,
        sent_term: u64,
        sent_entries: usize,
        reply: &AppendEntriesResponse,
    ) -> bool {
        self.observe_term(reply.term);
        if self.role != Role::Leader || self.current_term != sent_term {
            return false;
        }
        let progress = match self.replication.get_mut(&peer) {
            Some(progress) => progress,
            None => return true,
        };
        if reply.success {
            if sent_entries > 0 {
                progress.next_index = self.log.len();
                progress.match_index = self.log.last_index();
            }
        } else if progress.next_index > 0 {
            debug!(
                "node {} backing off replication to {} below index {}",
                self.id, peer, progress.next_index
            );
            progress.next_index -= 1;
        }
        true
    }

    /// Leader-side commit advancement. Walks the uncommitted indexes in ascending order
    /// and commits every entry a majority holds, counting the local copy. Only an entry
    /// from the current term may cross the threshold; older entries underneath it commit
    /// transitively in the same step.
    pub fn advance_commit(&mut self, cluster_size: usize) {
        if self.role != Role::Leader {
            return;
        }
        let quorum = quorum_size(cluster_size);
        let start = self.commit_index.map_or(0, |committed| committed + 1);
        for index in start..self.log.len() {
            if self.log.term_at(index) != Some(self.current_term) {
                continue;
            }
            let replicas = 1 + self
                .replication
                .values()
                .filter(|progress| progress.match_index >= Some(index))
                .count();
            if replicas < quorum {
                // coverage only shrinks at higher indexes
                break;
            }
            self.commit_index = Some(index);
        }
        self.apply_committed();
    }

    //
    // RPC receivers
    //

    /// Follower-side append-entries receiver. Returns the reply and whether the sender
    /// proved to be a live leader for this term, in which case the caller re-arms the
    /// election timer.
    pub fn handle_append_entries(
        &mut self,
        request: &AppendEntriesRequest,
    ) -> (AppendEntriesResponse, bool) {
        if self.role == Role::Stopped {
            return (self.reject(), false);
        }
        if request.term < self.current_term {
            info!(
                "node {} ignored append with stale term: {}",
                self.id, request
            );
            return (self.reject(), false);
        }

        let term_changed = self.observe_term(request.term);

        // Conflict check, skipped for pure heartbeats so a lagging follower still learns
        // of the leader and advances commits within its existing log.
        if !request.is_heartbeat() {
            let first = &request.entries[0];
            let attached = if first.index > self.log.len() {
                false
            } else if first.index == 0 {
                true
            } else {
                self.log.term_at(request.prev_log_index) == Some(request.prev_log_term)
            };
            if !attached {
                warn!(
                    "node {} rejected append, log has {:?} at index {}: {}",
                    self.id,
                    self.log.term_at(request.prev_log_index),
                    request.prev_log_index,
                    request
                );
                if term_changed {
                    self.persist();
                }
                return (self.reject(), false);
            }
        }

        // the sender is a valid leader for this term
        if self.role != Role::Follower {
            info!(
                "node {} became follower of {} at term {}",
                self.id, request.leader_id, self.current_term
            );
        }
        self.role = Role::Follower;
        self.leader_id = Some(request.leader_id);

        let mut log_changed = false;
        if !request.is_heartbeat() {
            let first = request.entries[0].index;
            let removed = self.log.truncate_from(first);
            if removed > 0 {
                info!(
                    "node {} discarded {} entries from index {}",
                    self.id, removed, first
                );
            }
            for entry in &request.entries {
                self.log.push(entry.clone());
            }
            self.reconcile_pending();
            log_changed = true;
        }

        if let Some(leader_commit) = request.leader_commit {
            if Some(leader_commit) > self.commit_index {
                if let Some(last_index) = self.log.last_index() {
                    self.commit_index = Some(leader_commit.min(last_index));
                    self.apply_committed();
                }
            }
        }

        if term_changed || log_changed {
            self.persist();
        }
        (
            AppendEntriesResponse {
                term: self.current_term,
                success: true,
            },
            true,
        )
    }

    /// Vote receiver. Returns the reply and whether the election timer must be re-armed
    /// (any request from the current term or newer).
    pub fn handle_request_vote(&mut self, request: &VoteRequest) -> (VoteResponse, bool) {
        if self.role == Role::Stopped {
            return (self.deny(), false);
        }
        if request.term < self.current_term {
            info!("node {} ignored vote request with stale term: {}", self.id, request);
            return (self.deny(), false);
        }

        let term_changed = self.observe_term(request.term);

        let free_to_vote = match self.voted_for {
            None => true,
            Some(vote) => vote == request.candidate_id,
        };
        let log_current = request.last_log_index >= self.log.last_index()
            && request.last_log_term >= self.log.last_term();
        let granted = free_to_vote && log_current;

        let mut vote_changed = false;
        if granted {
            vote_changed = self.voted_for != Some(request.candidate_id);
            self.voted_for = Some(request.candidate_id);
            info!(
                "node {} granted vote to {} at term {}",
                self.id, request.candidate_id, self.current_term
            );
        } else {
            info!(
                "node {} rejected vote at term {}, voted for {:?}: {}",
                self.id, self.current_term, self.voted_for, request
            );
        }
        if term_changed || vote_changed {
            self.persist();
        }
        (
            VoteResponse {
                term: self.current_term,
                vote_granted: granted,
            },
            true,
        )
    }

    //
    // client requests and apply
    //

    /// Appends a client command on the leader and registers a completion waiter for it.
    /// Callers must have checked the role.
    pub fn accept_command(&mut self, command: Bytes) -> (u64, Receiver<Result<Bytes, Cancelled>>) {
        debug_assert_eq!(self.role, Role::Leader);
        let term = self.current_term;
        let entry = self.log.append_command(term, command);
        let index = entry.index;
        debug!("node {} accepted command at index {} term {}", self.id, index, term);
        let (completion, waiter) = bounded(1);
        self.pending.insert(index, PendingRequest { term, completion });
        self.persist();
        (index, waiter)
    }

    /// Applies every committed-but-unapplied entry to the state machine in index order,
    /// resolving client waiters along the way.
    fn apply_committed(&mut self) {
        let target = match self.commit_index {
            Some(index) => index,
            None => return,
        };
        let mut next = self.last_applied.map_or(0, |applied| applied + 1);
        while next <= target {
            let command = match self.log.entry(next) {
                Some(entry) => entry.command.clone(),
                None => {
                    warn!("node {} missing committed entry {}", self.id, next);
                    return;
                }
            };
            let result = self.machine.apply(&command);
            debug!("node {} applied entry {}", self.id, next);
            self.last_applied = Some(next);
            if let Some(request) = self.pending.remove(&next) {
                let _ = request.completion.send(Ok(result));
            }
            next += 1;
        }
    }

    /// Cancels waiters whose log slot no longer holds the entry they were registered
    /// for, after a rewrite of the log tail.
    fn reconcile_pending(&mut self) {
        let log = &self.log;
        let stale: Vec<u64> = self
            .pending
            .iter()
            .filter(|(index, request)| log.term_at(**index) != Some(request.term))
            .map(|(index, _)| *index)
            .collect();
        for index in stale {
            if let Some(request) = self.pending.remove(&index) {
                let _ = request.completion.send(Err(Cancelled { index }));
            }
        }
    }

    pub fn ping_state_machine(&mut self) -> bool {
        self.machine.test_connection()
    }

    //
    // helpers
    //

    fn persist(&mut self) {
        self.stable
            .persist(self.current_term, self.voted_for, self.log.entries());
    }

    fn reject(&self) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success: false,
        }
    }

    fn deny(&self) -> VoteResponse {
        VoteResponse {
            term: self.current_term,
            vote_granted: false,
        }
    }
}
