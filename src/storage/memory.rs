//! A naive in-memory implementation of [`StableStore`], primarily for testing.

use crate::message::{LogEntry, NodeId};

use super::{HardState, StableStore};

/// Keeps the persistent fields in memory.
///
/// Survives a node being rebuilt in the same process, not a real crash; production
/// deployments supply their own [`StableStore`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryStableStore {
    state: Option<HardState>,
}

impl InMemoryStableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StableStore for InMemoryStableStore {
    fn persist(&mut self, current_term: u64, voted_for: Option<NodeId>, entries: &[LogEntry]) {
        self.state = Some(HardState {
            current_term,
            voted_for,
            entries: entries.to_vec(),
        });
    }

    fn load(&mut self) -> Option<HardState> {
        self.state.clone()
    }
}
