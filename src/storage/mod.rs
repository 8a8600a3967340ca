//! Durable storage for Raft's persistent state.
//!
//! Raft's safety argument depends on `currentTerm`, `votedFor`, and the log surviving a
//! crash: a node that forgets its vote can hand two leaders the same term, and a node
//! that forgets log entries can un-commit them. The [`StableStore`] hook is invoked
//! before any RPC reply that depends on an update to those fields, and before a new
//! candidate solicits votes; [`StableStore::load`] is consulted once, at construction,
//! to recover them.

pub mod memory;

use crate::message::{LogEntry, NodeId};

/// The fields a node must persist before answering RPCs that changed them.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub entries: Vec<LogEntry>,
}

/// Stable storage for a node's persistent state.
pub trait StableStore: Send + 'static {
    /// Atomically persists the given fields.
    fn persist(&mut self, current_term: u64, voted_for: Option<NodeId>, entries: &[LogEntry]);

    /// Recovers previously persisted fields, or `None` for a fresh node.
    fn load(&mut self) -> Option<HardState>;
}
