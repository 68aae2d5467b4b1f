//! Replica state machine.
//!
//! [`NodeStateMachine`] composes the consensus chain, the fetch/deliver
//! pipeline, the view-change state, and the command pool into one
//! deterministic state machine, and acts as the message dispatcher: inbound
//! frames are body-parsed here (second stage of the two-stage parse),
//! referenced blocks are routed through delivery, signatures through the
//! verification actions, and only fully delivered, verified messages reach
//! the chain.

mod pacemaker;
mod state;

pub use pacemaker::{Pacemaker, RoundRobinPacemaker};
pub use state::NodeStateMachine;
