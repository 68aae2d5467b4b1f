//! Core types for the trellis deterministic state machine.
//!
//! This crate provides the contract between the consensus state machine and
//! its runners:
//!
//! - [`Event`]: All possible inputs to the state machine
//! - [`Action`]: All possible outputs from the state machine
//! - [`EventPriority`]: Ordering priority for events at the same timestamp
//! - [`StateMachine`]: The trait runners drive
//!
//! # Architecture
//!
//! The core is built on a simple event-driven model:
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: No async, no .await
//! - **Deterministic**: Same state + event = same actions
//! - **Pure-ish**: Mutates self, but performs no I/O
//!
//! All I/O is handled by the runner (simulation or production) which:
//! 1. Delivers events to the state machine
//! 2. Executes the returned actions
//! 3. Converts delegated-work results back into events
//!
//! A fatal return from [`StateMachine::handle`] (a safety violation) halts
//! the replica; the runner never continues past one.

mod action;
mod event;
mod message;
mod traits;

pub use action::Action;
pub use event::{Event, EventPriority};
pub use message::OutboundMessage;
pub use traits::StateMachine;

use trellis_types::BlockHeight;

/// Identifies a one-shot timer slot.
///
/// Commit timers are keyed per candidate height; the remaining slots are
/// singletons. Re-arming a slot cancels the previous timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Optimistic-commit timer for the block voted at this height.
    Commit(BlockHeight),
    /// Fires when the current leader fails to make progress.
    Blame,
    /// Bounds the wait for a new-view quorum.
    ViewTransition,
    /// Periodic liveness and state broadcast.
    Status,
}

/// Correlates a submitted command with its eventual decision callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);
