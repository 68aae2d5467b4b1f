//! Production runner with async I/O.
//!
//! This crate wraps the deterministic replica state machine with real I/O:
//!
//! - Network frames over a TCP mesh between the configured replicas
//! - Timers as tokio tasks
//! - Signature verification on a dedicated rayon thread pool
//! - Committed blocks and checkpoints persisted to RocksDB
//!
//! # Architecture
//!
//! Uses the event aggregator pattern: a single task owns the state machine
//! and receives events via an mpsc channel. This avoids mutex contention.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Production Replica                        │
//! │                                                                  │
//! │  State machine task:                                             │
//! │    loop { event = recv(); actions = node.handle(event); }        │
//! │                         │                                        │
//! │     ┌───────────────────┼──────────────────────┐                 │
//! │     ▼                   ▼                      ▼                 │
//! │  Crypto pool (rayon)  I/O (tokio)         Storage (RocksDB)      │
//! │  - QC verification    - TCP mesh          - committed blocks     │
//! │  - vote signatures    - timers            - (bexec, hqc)         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Workers never call into the state machine; verification results return
//! to the event channel and are processed on the state machine task.

pub mod metrics;
pub mod network;
mod runner;
mod storage;
mod telemetry;
mod thread_pools;
mod timers;

pub use network::TcpMesh;
pub use runner::{NodeHandle, ProductionRunner, RunnerError, ShutdownHandle};
pub use storage::{Checkpoint, RocksDbStorage, StorageError};
pub use telemetry::{init_telemetry, serve_metrics};
pub use thread_pools::{ThreadPoolConfig, ThreadPoolError, ThreadPoolManager};
pub use timers::TimerManager;
