//! The cluster membership collaborator.

use std::time::Duration;

use bytes::Bytes;
use rand::Rng;

use crate::error::TransportError;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, NodeId, VoteRequest, VoteResponse,
};

/// What a node knows about its cluster, and how it reaches the other members.
///
/// Implementations own the transport. The RPC calls are synchronous and must return
/// within a bounded time; an unreachable peer or an overrun is reported as
/// [`TransportError`] and treated by the core as a missing reply.
pub trait Cluster: Send + Sync + 'static {
    /// Total number of nodes in the cluster, including the local node.
    fn size(&self) -> usize;

    /// Every member's id except the local node's.
    fn peers(&self) -> Vec<NodeId>;

    /// Derives the local node's randomized election timeout.
    fn election_timeout(&self) -> Duration;

    /// Solicits `peer`'s vote for the local candidate.
    fn request_vote(
        &self,
        peer: NodeId,
        request: VoteRequest,
    ) -> Result<VoteResponse, TransportError>;

    /// Sends one append-entries batch (or heartbeat) to `peer`.
    fn append_entries(
        &self,
        peer: NodeId,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;

    /// Forwards a client command to `peer` for submission there.
    fn redirect(&self, peer: NodeId, command: Bytes) -> Result<(), TransportError>;
}

/// Election timing for a Raft cluster, in milliseconds.
///
/// Every member must be configured with the same range; each node samples its own
/// timeout from it. Heartbeats run at half the sampled timeout.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftConfig {
    /// Lower bound of the election timeout, inclusive.
    pub election_timeout_min: u64,

    /// Upper bound of the election timeout, inclusive.
    pub election_timeout_max: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
        }
    }
}

impl RaftConfig {
    /// Samples a randomized election timeout from the configured range.
    pub fn randomize(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.election_timeout_min..=self.election_timeout_max);
        Duration::from_millis(ms)
    }
}
