//! The replicated state machine collaborator.

use bytes::Bytes;

/// A deterministic state machine fed committed log commands.
///
/// The core applies each committed index exactly once, in strictly increasing index
/// order, so identical logs produce identical machines on every node. `apply` is assumed
/// infallible; an implementation that can fail mid-command must define its own recovery.
pub trait StateMachine: Send + 'static {
    /// Executes a committed command and returns its result for the submitting client.
    fn apply(&mut self, command: &Bytes) -> Bytes;

    /// Diagnostic connectivity probe. May fail; never called on the hot path.
    fn test_connection(&mut self) -> bool;
}
