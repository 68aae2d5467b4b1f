//! Action types for the deterministic state machine.

use crate::{Event, OutboundMessage, RequestId, TimerId};
use std::time::Duration;
use trellis_messages::{Blame, BlameNotify, Notify, Status, Vote};
use trellis_types::{Block, BlockHeight, Finality, Hash, PublicKey, QuorumCert, ReplicaId};

/// Actions the state machine wants to perform.
///
/// Actions are **commands** - they describe something to do.
/// The runner executes actions and may convert results back into events.
#[derive(Debug, Clone)]
pub enum Action {
    // ═══════════════════════════════════════════════════════════════════════
    // Network
    // ═══════════════════════════════════════════════════════════════════════
    /// Broadcast a message to every other replica.
    Broadcast {
        /// The message.
        message: OutboundMessage,
    },

    /// Send a message to one replica.
    Send {
        /// The destination replica.
        to: ReplicaId,
        /// The message.
        message: OutboundMessage,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Timers
    // ═══════════════════════════════════════════════════════════════════════
    /// Arm a one-shot timer. Re-arming an active slot replaces it.
    SetTimer {
        /// The timer slot.
        id: TimerId,
        /// Time until it fires.
        duration: Duration,
    },

    /// Cancel a timer. No-op if the slot is idle.
    CancelTimer {
        /// The timer slot.
        id: TimerId,
    },

    /// Cancel every armed commit timer (used on view transition).
    CancelCommitTimers,

    // ═══════════════════════════════════════════════════════════════════════
    // Internal
    // ═══════════════════════════════════════════════════════════════════════
    /// Enqueue an internal event for immediate processing.
    ///
    /// Internal events are processed at the same timestamp with higher
    /// priority than external events, preserving causality.
    EnqueueInternal {
        /// The event to feed back.
        event: Event,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Delegated work (worker pool in production, inline in simulation)
    // ═══════════════════════════════════════════════════════════════════════
    /// Verify a block's carried quorum certificate against the replica set.
    ///
    /// Returns [`Event::BlockVerified`].
    VerifyBlock {
        /// The block under verification.
        block_hash: Hash,
        /// Its carried certificate, if any. Absent certificates verify
        /// trivially (the block simply carries no QC).
        qc: Option<QuorumCert>,
    },

    /// Verify a vote's partial certificate.
    ///
    /// Returns [`Event::VoteVerified`].
    VerifyVote {
        /// The vote.
        vote: Vote,
        /// Public key of the voter (pre-resolved by the dispatcher).
        public_key: PublicKey,
    },

    /// Verify a status signature.
    ///
    /// Returns [`Event::StatusVerified`].
    VerifyStatus {
        /// The status.
        status: Status,
        /// The peer it came from.
        from: ReplicaId,
        /// Public key of the reporting replica.
        public_key: PublicKey,
    },

    /// Verify a blame signature.
    ///
    /// Returns [`Event::BlameVerified`].
    VerifyBlame {
        /// The blame.
        blame: Blame,
        /// Public key of the complaining replica.
        public_key: PublicKey,
    },

    /// Verify every blame inside a blame-notify.
    ///
    /// Returns [`Event::BlameNotifyVerified`].
    VerifyBlameNotify {
        /// The notify.
        notify: BlameNotify,
    },

    /// Verify a notify's quorum certificate.
    ///
    /// Returns [`Event::NotifyVerified`].
    VerifyNotify {
        /// The notify.
        notify: Notify,
        /// The peer it came from.
        from: ReplicaId,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // External notifications
    // ═══════════════════════════════════════════════════════════════════════
    /// Deliver a decision to the application, in commit order.
    EmitFinality {
        /// The decision record.
        finality: Finality,
    },

    /// Resolve the submitter waiting on this command.
    RespondCommand {
        /// The submitter's request.
        request_id: RequestId,
        /// The decision record.
        finality: Finality,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Storage
    // ═══════════════════════════════════════════════════════════════════════
    /// Persist a committed block.
    PersistBlock {
        /// The committed height.
        height: BlockHeight,
        /// The block.
        block: Block,
    },

    /// Persist the `(bexec, hqc)` checkpoint for crash recovery.
    PersistCheckpoint {
        /// Height of the committed tip.
        bexec_height: BlockHeight,
        /// Hash of the committed tip.
        bexec_hash: Hash,
        /// The highest quorum certificate.
        hqc: QuorumCert,
    },
}

impl Action {
    /// Check if this action is delegated work (runs on the worker pool,
    /// returns a callback event).
    pub fn is_delegated(&self) -> bool {
        matches!(
            self,
            Action::VerifyBlock { .. }
                | Action::VerifyVote { .. }
                | Action::VerifyStatus { .. }
                | Action::VerifyBlame { .. }
                | Action::VerifyBlameNotify { .. }
                | Action::VerifyNotify { .. }
        )
    }

    /// Check if this is a storage write action.
    pub fn is_storage_write(&self) -> bool {
        matches!(
            self,
            Action::PersistBlock { .. } | Action::PersistCheckpoint { .. }
        )
    }

    /// Get the action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::Send { .. } => "Send",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::CancelCommitTimers => "CancelCommitTimers",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::VerifyBlock { .. } => "VerifyBlock",
            Action::VerifyVote { .. } => "VerifyVote",
            Action::VerifyStatus { .. } => "VerifyStatus",
            Action::VerifyBlame { .. } => "VerifyBlame",
            Action::VerifyBlameNotify { .. } => "VerifyBlameNotify",
            Action::VerifyNotify { .. } => "VerifyNotify",
            Action::EmitFinality { .. } => "EmitFinality",
            Action::RespondCommand { .. } => "RespondCommand",
            Action::PersistBlock { .. } => "PersistBlock",
            Action::PersistCheckpoint { .. } => "PersistCheckpoint",
        }
    }
}
