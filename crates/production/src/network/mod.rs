//! TCP mesh networking between the configured replicas.
//!
//! Replicas hold point-to-point TCP connections: every replica dials every
//! peer for sending and accepts connections for receiving, so each
//! direction of each pair has its own stream and per-source ordering is the
//! stream order. Frames travel as `opcode:1 | length:4_LE | body`; only the
//! header is parsed here (first stage of the two-stage parse); bodies are
//! parsed by the node dispatcher.

mod adapter;
mod codec;

pub use adapter::TcpMesh;
pub use codec::{read_frame, write_frame, NetError};
