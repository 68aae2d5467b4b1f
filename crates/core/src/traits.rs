//! State machine traits.

use crate::{Action, Event};

/// A synchronous, deterministic state machine driven by a runner.
///
/// `handle` must not perform I/O; everything with a side effect is expressed
/// as a returned [`Action`]. An `Err` return is fatal, meaning a safety
/// rule was violated, and the runner halts the replica rather than continue
/// past it.
pub trait StateMachine {
    /// The fatal error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Process one event, returning the actions to execute.
    fn handle(&mut self, event: Event) -> Result<Vec<Action>, Self::Error>;
}
