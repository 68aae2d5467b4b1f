//! Consensus core for the trellis replication engine.
//!
//! This crate provides a synchronous consensus implementation that can be
//! used for both simulation and production:
//!
//! - [`store`]: the content-addressed, reference-counted block arena
//! - [`chain`]: the chain state machine: voting safety rule, three-chain
//!   commit kernel, high-QC tracking, pruning
//! - [`delivery`]: the fetch/deliver pipeline that materializes and verifies
//!   a block's transitive ancestor closure before the chain acts on it
//! - [`view`]: the blame/status/new-view hooks for view changes
//!
//! # Terminology
//!
//! - **Height**: position in the chain; genesis is height 0 and every block
//!   sits one above its primary parent.
//!
//! - **QC (Quorum Certificate)**: signatures from `nmajority` replicas over
//!   one block hash, proving a quorum voted for it. Carried by a later block
//!   as its `qc` field.
//!
//! - **Three-chain commit**: a block commits once three consecutive blocks
//!   each carry a QC over their immediate primary parent; the oldest of the
//!   three is then final.
//!
//! - **Delivered**: a block whose ancestors are all present and delivered
//!   and whose carried certificate passed verification. The chain only ever
//!   acts on delivered blocks.
//!
//! # Safety
//!
//! - **Monotone vote height**: a replica never votes at or below the height
//!   it last voted at (`vheight`).
//!
//! - **Branch rule**: a replica votes for a block only if it extends the
//!   branch of the highest QC it has seen.
//!
//! - **Commit walk**: the commit kernel walks primary parents from the new
//!   committed tip down to the previous one; failing to land on it is a
//!   safety violation and halts the replica.

pub mod chain;
pub mod delivery;
pub mod store;
pub mod view;

mod config;

pub use chain::{ChainState, ChainStats};
pub use config::ConsensusConfig;
pub use delivery::{Delivered, DeliveryState, DeliveryStats, Parked};
pub use store::{BlockId, BlockStore, Decision, StoredBlock};
pub use view::ViewState;

use thiserror::Error;
use trellis_types::{Hash, QuorumCert, ReplicaConfig};

/// Verify the certificate a block carries, as the worker pool does.
///
/// A missing certificate is trivially valid (the block simply carries
/// none), and a certificate over the genesis hash is exempt: genesis is
/// ratified by construction and its synthetic QC holds no signatures.
pub fn verify_carried_qc(qc: Option<&QuorumCert>, genesis: &Hash, config: &ReplicaConfig) -> bool {
    match qc {
        None => true,
        Some(qc) if qc.block_hash == *genesis => true,
        Some(qc) => qc.verify(config),
    }
}

/// Fatal consensus errors.
///
/// Every variant indicates a bug or Byzantine divergence beyond tolerance;
/// runners halt the replica on any of them. Recoverable conditions (invalid
/// signatures, duplicate votes, malformed messages) never surface here;
/// they are logged and dropped inside the handlers.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("safety violated: commit walk from {from:?} did not reach committed tip {bexec:?}")]
    SafetyViolation {
        /// The block the walk started from.
        from: Hash,
        /// The committed tip the walk was expected to land on.
        bexec: Hash,
    },

    #[error("proposed block {block:?} at height {height} is not above vote height {vheight}")]
    ProposalBelowVoteHeight {
        /// The offending proposal.
        block: Hash,
        /// Its height.
        height: u64,
        /// The height of the replica's most recent vote.
        vheight: u64,
    },

    #[error("block {0:?} referenced by a certificate is absent from storage")]
    QcRefMissing(Hash),

    #[error("proposal carries no parents")]
    EmptyParents,

    #[error("block {0:?} is not delivered")]
    NotDelivered(Hash),

    #[error("block {0:?} is absent from storage")]
    MissingBlock(Hash),
}
