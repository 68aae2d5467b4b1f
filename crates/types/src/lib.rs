//! Core types for the trellis replication engine.
//!
//! This crate provides the foundational types used throughout the
//! implementation:
//!
//! - **Primitives**: [`Hash`], keys and signatures
//! - **Identifiers**: [`ReplicaId`], [`BlockHeight`]
//! - **Consensus types**: [`Block`], [`PartialCert`], [`QuorumCert`],
//!   [`Finality`]
//! - **Configuration**: [`ReplicaConfig`], the static replica set and quorum
//!   threshold
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod block;
mod certificate;
mod crypto;
mod hash;
mod identity;

pub use block::Block;
pub use certificate::{PartialCert, QuorumCert};
pub use crypto::{KeyPair, PublicKey, Signature};
pub use hash::{Hash, HexError};
pub use identity::{BlockHeight, ConfigError, Finality, ReplicaConfig, ReplicaId, ReplicaInfo};
