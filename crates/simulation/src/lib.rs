//! Deterministic simulation for the trellis replication engine.
//!
//! Runs a full replica set in one thread with simulated time: a global
//! event queue ordered by `(time, priority, sequence)`, a simulated network
//! with latency, jitter, packet loss, and partitions, and inline execution
//! of the delegated crypto work. Given the same seed, a simulation produces
//! identical results every run, which is the property the integration tests and
//! replay debugging rest on.

mod event_queue;
mod network;
mod runner;

pub use event_queue::EventKey;
pub use network::{NetworkConfig, SimulatedNetwork};
pub use runner::{SimConfig, SimulationRunner, SimulationStats};

/// Index of a node within the simulation, used for routing.
pub type NodeIndex = u32;
