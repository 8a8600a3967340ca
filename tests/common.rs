#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use raft::{
    AppendEntriesRequest, AppendEntriesResponse, Cluster, HardState, LogEntry, NodeId, RaftNode,
    StableStore, StateMachine, TransportError, VoteRequest, VoteResponse,
};

/// Election timeout long enough that armed timers stay quiet while a test drives nodes
/// by hand through the manual triggers and RPC handlers.
pub const QUIET: Duration = Duration::from_secs(3600);

/// How long [`TestRaftGroup::wait_until`] polls before failing the test.
pub const WAIT_LIMIT: Duration = Duration::from_secs(10);

pub type TestNode = RaftNode<LabCluster, RecordingMachine, RecordingStable>;

/// An in-process multi-node cluster. RPCs are dispatched by calling the destination
/// node's handlers directly on the sender's worker threads, so the concurrency shape
/// matches a real transport while staying deterministic.
pub struct TestRaftGroup {
    pub registry: Arc<Registry>,
    pub nodes: Vec<TestNode>,
    pub machines: Vec<RecordingMachine>,
    pub stables: Vec<RecordingStable>,
    watermarks: Mutex<HashMap<NodeId, (u64, Option<u64>, Option<u64>)>>,
}

#[derive(Default)]
pub struct Registry {
    nodes: Mutex<HashMap<NodeId, TestNode>>,
    drops: Mutex<HashSet<(NodeId, NodeId)>>,
}

impl Registry {
    fn node(&self, id: NodeId) -> Option<TestNode> {
        self.nodes.lock().unwrap().get(&id).cloned()
    }

    fn dropped(&self, from: NodeId, to: NodeId) -> bool {
        self.drops.lock().unwrap().contains(&(from, to))
    }
}

/// The [`Cluster`] collaborator of one test node.
pub struct LabCluster {
    id: NodeId,
    members: Vec<NodeId>,
    timeout: Duration,
    registry: Arc<Registry>,
}

/// A [`LabCluster`] for a node constructed outside a [`TestRaftGroup`], sharing an
/// existing registry.
pub fn lab_cluster(id: NodeId, members: Vec<NodeId>, registry: Arc<Registry>) -> LabCluster {
    LabCluster {
        id,
        members,
        timeout: QUIET,
        registry,
    }
}

impl LabCluster {
    fn reach(&self, peer: NodeId) -> Result<TestNode, TransportError> {
        if self.registry.dropped(self.id, peer) {
            return Err(TransportError::new(peer, "link down"));
        }
        self.registry
            .node(peer)
            .ok_or_else(|| TransportError::new(peer, "no such node"))
    }
}

impl Cluster for LabCluster {
    fn size(&self) -> usize {
        self.members.len()
    }

    fn peers(&self) -> Vec<NodeId> {
        self.members
            .iter()
            .copied()
            .filter(|&member| member != self.id)
            .collect()
    }

    fn election_timeout(&self) -> Duration {
        self.timeout
    }

    fn request_vote(
        &self,
        peer: NodeId,
        request: VoteRequest,
    ) -> Result<VoteResponse, TransportError> {
        Ok(self.reach(peer)?.handle_request_vote(&request))
    }

    fn append_entries(
        &self,
        peer: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        Ok(self.reach(peer)?.handle_append_entries(&request))
    }

    fn redirect(&self, peer: NodeId, command: Bytes) -> Result<(), TransportError> {
        let node = self.reach(peer)?;
        let _ = node
            .client_request(command)
            .map_err(|err| TransportError::new(peer, err.to_string()))?;
        Ok(())
    }
}

/// A state machine that records every applied command and echoes it as the result.
#[derive(Clone, Default)]
pub struct RecordingMachine {
    applied: Arc<Mutex<Vec<Bytes>>>,
}

impl RecordingMachine {
    pub fn applied(&self) -> Vec<Bytes> {
        self.applied.lock().unwrap().clone()
    }
}

impl StateMachine for RecordingMachine {
    fn apply(&mut self, command: &Bytes) -> Bytes {
        self.applied.lock().unwrap().push(command.clone());
        command.clone()
    }

    fn test_connection(&mut self) -> bool {
        true
    }
}

/// A stable store that keeps the persisted state inspectable from the test.
#[derive(Clone, Default)]
pub struct RecordingStable {
    inner: Arc<Mutex<StableState>>,
}

#[derive(Default)]
struct StableState {
    state: Option<HardState>,
    persist_count: usize,
}

impl RecordingStable {
    pub fn persist_count(&self) -> usize {
        self.inner.lock().unwrap().persist_count
    }

    pub fn hard_state(&self) -> Option<HardState> {
        self.inner.lock().unwrap().state.clone()
    }
}

impl StableStore for RecordingStable {
    fn persist(&mut self, current_term: u64, voted_for: Option<NodeId>, entries: &[LogEntry]) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = Some(HardState {
            current_term,
            voted_for,
            entries: entries.to_vec(),
        });
        inner.persist_count += 1;
    }

    fn load(&mut self) -> Option<HardState> {
        self.inner.lock().unwrap().state.clone()
    }
}

impl TestRaftGroup {
    /// A group of `size` nodes with quiet timers, ids `1..=size`.
    pub fn new(size: u64) -> Self {
        Self::with_timeouts(&vec![QUIET; size as usize])
    }

    /// A group with one node per timeout, for tests that let real timers drive.
    pub fn with_timeouts(timeouts: &[Duration]) -> Self {
        init_logger();
        let registry = Arc::new(Registry::default());
        let members: Vec<NodeId> = (1..=timeouts.len() as u64).collect();
        let mut nodes = Vec::new();
        let mut machines = Vec::new();
        let mut stables = Vec::new();
        for (slot, &timeout) in timeouts.iter().enumerate() {
            let id = members[slot];
            let machine = RecordingMachine::default();
            let stable = RecordingStable::default();
            let cluster = LabCluster {
                id,
                members: members.clone(),
                timeout,
                registry: Arc::clone(&registry),
            };
            let node = RaftNode::new(id, cluster, machine.clone(), stable.clone());
            registry.nodes.lock().unwrap().insert(id, node.clone());
            nodes.push(node);
            machines.push(machine);
            stables.push(stable);
        }
        Self {
            registry,
            nodes,
            machines,
            stables,
            watermarks: Mutex::default(),
        }
    }

    pub fn node(&self, id: NodeId) -> &TestNode {
        &self.nodes[(id - 1) as usize]
    }

    pub fn machine(&self, id: NodeId) -> &RecordingMachine {
        &self.machines[(id - 1) as usize]
    }

    pub fn stable(&self, id: NodeId) -> &RecordingStable {
        &self.stables[(id - 1) as usize]
    }

    /// Makes `id` the leader through a manual campaign and waits for the initial
    /// heartbeat to reach every member it can talk to.
    pub fn elect(&self, id: NodeId) {
        self.node(id).campaign();
        assert!(self.node(id).is_leader(), "node {} failed its campaign", id);
        let term = self.node(id).current_term();
        self.wait_until("followers to learn the leader", || {
            self.nodes.iter().all(|node| {
                node.id() == id
                    || self.registry.dropped(id, node.id())
                    || node.leader() == (Some(id), term)
            })
        });
    }

    /// Cuts the link between `a` and `b` in both directions.
    pub fn drop_between(&self, a: NodeId, b: NodeId) {
        let mut drops = self.registry.drops.lock().unwrap();
        drops.insert((a, b));
        drops.insert((b, a));
    }

    /// Cuts every link to and from `id`.
    pub fn isolate(&self, id: NodeId) {
        let mut drops = self.registry.drops.lock().unwrap();
        for node in &self.nodes {
            if node.id() != id {
                drops.insert((id, node.id()));
                drops.insert((node.id(), id));
            }
        }
    }

    /// Restores every link.
    pub fn heal(&self) {
        self.registry.drops.lock().unwrap().clear();
    }

    pub fn has_leader(&self) -> bool {
        self.nodes.iter().any(|node| node.is_leader())
    }

    /// Polls `pred` until it holds or [`WAIT_LIMIT`] elapses.
    pub fn wait_until(&self, what: &str, pred: impl Fn() -> bool) {
        let deadline = Instant::now() + WAIT_LIMIT;
        while !pred() {
            if Instant::now() > deadline {
                panic!("timed out waiting for {}", what);
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Checks the safety conditions that must hold at every quiescent point: cursor
    /// bounds, per-node monotonicity since the last check, agreement of committed
    /// prefixes, and at most one leader per term.
    pub fn assert_invariants(&self) {
        let mut watermarks = self.watermarks.lock().unwrap();
        for node in &self.nodes {
            let term = node.current_term();
            let commit = node.commit_index();
            let applied = node.last_applied();
            let len = node.entries().len() as u64;
            assert!(
                cursor(applied) <= cursor(commit) && cursor(commit) <= len,
                "node {} cursors out of bounds: applied {:?} commit {:?} len {}",
                node.id(),
                applied,
                commit,
                len,
            );
            let mark = watermarks.entry(node.id()).or_insert((0, None, None));
            assert!(term >= mark.0, "node {} term went backwards", node.id());
            assert!(commit >= mark.1, "node {} commit went backwards", node.id());
            assert!(applied >= mark.2, "node {} applied went backwards", node.id());
            *mark = (term, commit, applied);
        }

        for a in &self.nodes {
            for b in &self.nodes {
                let shared = cursor(a.commit_index()).min(cursor(b.commit_index())) as usize;
                assert_eq!(
                    &a.entries()[..shared],
                    &b.entries()[..shared],
                    "nodes {} and {} disagree on a committed prefix",
                    a.id(),
                    b.id(),
                );
            }
        }

        let mut leaders: HashMap<u64, NodeId> = HashMap::new();
        for node in &self.nodes {
            if node.is_leader() {
                if let Some(other) = leaders.insert(node.current_term(), node.id()) {
                    panic!(
                        "nodes {} and {} both lead term {}",
                        other,
                        node.id(),
                        node.current_term()
                    );
                }
            }
        }
    }
}

/// Number of entries a cursor covers, treating `None` as none.
fn cursor(index: Option<u64>) -> u64 {
    index.map_or(0, |i| i + 1)
}

pub fn entry(index: u64, term: u64, command: &'static str) -> LogEntry {
    LogEntry::new(index, term, Bytes::from_static(command.as_bytes()))
}

/// Builds an append-entries request as a (possibly fictitious) leader would send it.
pub fn append(
    term: u64,
    leader_id: NodeId,
    prev_log_index: u64,
    prev_log_term: u64,
    entries: Vec<LogEntry>,
    leader_commit: Option<u64>,
) -> AppendEntriesRequest {
    AppendEntriesRequest {
        term,
        leader_id,
        prev_log_index,
        prev_log_term,
        entries,
        leader_commit,
    }
}

pub fn vote(
    term: u64,
    candidate_id: NodeId,
    last_log_index: Option<u64>,
    last_log_term: u64,
) -> VoteRequest {
    VoteRequest {
        term,
        candidate_id,
        last_log_index,
        last_log_term,
    }
}

//
// TestLogger impls
//

struct TestLogger;

static LOGGER: TestLogger = TestLogger;

pub fn init_logger() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Debug);
}

impl log::Log for TestLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        eprintln!("{:<5} {}", record.level(), record.args());
    }

    fn flush(&self) {}
}
