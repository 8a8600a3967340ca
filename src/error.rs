//! Error types surfaced by the consensus core.
//!
//! Everything internal to the protocol is recovered locally and turned into a Raft-legal
//! reply; the types here cover the edges where the core meets its callers: the transport,
//! the client request intake, and commit completion.

use thiserror::Error;

use crate::message::NodeId;

/// A peer could not be reached, or its reply was malformed.
///
/// The core treats this as a missing reply: an election or replication pass simply
/// proceeds with the responses it did receive.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("peer {peer} unreachable: {reason}")]
pub struct TransportError {
    pub peer: NodeId,
    pub reason: String,
}

impl TransportError {
    pub fn new(peer: NodeId, reason: impl Into<String>) -> Self {
        Self {
            peer,
            reason: reason.into(),
        }
    }
}

/// Why a client request could not be taken in.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The node is stopped and takes no requests.
    #[error("node is stopped")]
    Stopped,

    /// Forwarding the command towards the leader failed.
    #[error(transparent)]
    Redirect(#[from] TransportError),
}

/// The log entry backing an accepted request was replaced before it committed.
///
/// The command was not applied here and should be resubmitted to the current leader.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[error("log entry {index} was replaced before commit")]
pub struct Cancelled {
    pub index: u64,
}
