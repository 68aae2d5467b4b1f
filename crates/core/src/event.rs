//! Event types for the deterministic state machine.

use crate::RequestId;
use trellis_messages::{Blame, BlameNotify, Notify, RawFrame, Status, Vote};
use trellis_types::{BlockHeight, Finality, Hash, ReplicaId};

/// Priority levels for event ordering within the same timestamp.
///
/// Events at the same simulation time are processed in priority order.
/// Lower values = higher priority (processed first).
///
/// This ensures causality is preserved: internal events (consequences of
/// processing an event) are handled before new external inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EventPriority {
    /// Internal events: consequences of prior event processing.
    Internal = 0,

    /// Timer events: scheduled by the node itself.
    Timer = 1,

    /// Network events: external inputs from other replicas.
    Network = 2,

    /// Client events: external inputs from users.
    Client = 3,
}

/// All possible events a replica can receive.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Timers (priority: Timer)
    // ═══════════════════════════════════════════════════════════════════════
    /// The optimistic-commit timer for `height` expired.
    CommitTimeout {
        /// Height of the commit candidate.
        height: BlockHeight,
    },

    /// The current leader failed to make progress in time.
    BlameTimeout,

    /// The wait for a new-view quorum expired.
    ViewTransitionTimeout,

    /// Time to broadcast our status.
    StatusTimeout,

    // ═══════════════════════════════════════════════════════════════════════
    // Network (priority: Network)
    // ═══════════════════════════════════════════════════════════════════════
    /// A frame arrived from a peer. Only the header has been parsed; the
    /// dispatcher performs the typed body parse (two-stage parse).
    FrameReceived {
        /// The sending replica.
        from: ReplicaId,
        /// The frame, body unparsed.
        frame: RawFrame,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Client (priority: Client)
    // ═══════════════════════════════════════════════════════════════════════
    /// A client submitted a command for replication.
    SubmitCommand {
        /// Hash of the command, opaque to the protocol.
        cmd_hash: Hash,
        /// Correlates the eventual decision with the submitter.
        request_id: RequestId,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal (priority: Internal)
    // These replace the promise observers of the event-loop formulation
    // ═══════════════════════════════════════════════════════════════════════
    /// A quorum certificate finished forming for this block.
    QcFinalized {
        /// The certified block.
        block_hash: Hash,
    },

    /// The highest known quorum certificate advanced.
    HighQcUpdated {
        /// Block the new high QC attests to.
        block_hash: Hash,
    },

    /// The local replica proposed a block.
    Proposed {
        /// The proposed block.
        block_hash: Hash,
    },

    /// The command buffer reached the batch size; ask the pacemaker whether
    /// to propose.
    Beat,

    /// A command was committed.
    Finalized {
        /// The decision record.
        finality: Finality,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // Delegated-work callbacks (priority: Internal)
    // Results from the crypto worker pool
    // ═══════════════════════════════════════════════════════════════════════
    /// Block certificate verification completed.
    BlockVerified {
        /// The block whose certificate was checked.
        block_hash: Hash,
        /// Whether the certificate is valid.
        valid: bool,
    },

    /// Vote signature verification completed.
    VoteVerified {
        /// The verified vote.
        vote: Vote,
        /// Whether the signature is valid.
        valid: bool,
    },

    /// Status signature verification completed.
    StatusVerified {
        /// The verified status.
        status: Status,
        /// The peer it came from.
        from: ReplicaId,
        /// Whether the signature is valid.
        valid: bool,
    },

    /// Blame signature verification completed.
    BlameVerified {
        /// The verified blame.
        blame: Blame,
        /// Whether the signature is valid.
        valid: bool,
    },

    /// Blame-notify verification completed (all carried blames checked).
    BlameNotifyVerified {
        /// The verified notify.
        notify: BlameNotify,
        /// Whether every blame is valid and the quorum holds.
        valid: bool,
    },

    /// Notify certificate verification completed.
    NotifyVerified {
        /// The verified notify.
        notify: Notify,
        /// The peer it came from.
        from: ReplicaId,
        /// Whether the certificate is valid.
        valid: bool,
    },
}

impl Event {
    /// Get the priority for this event type.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::QcFinalized { .. }
            | Event::HighQcUpdated { .. }
            | Event::Proposed { .. }
            | Event::Beat
            | Event::Finalized { .. }
            | Event::BlockVerified { .. }
            | Event::VoteVerified { .. }
            | Event::StatusVerified { .. }
            | Event::BlameVerified { .. }
            | Event::BlameNotifyVerified { .. }
            | Event::NotifyVerified { .. } => EventPriority::Internal,

            Event::CommitTimeout { .. }
            | Event::BlameTimeout
            | Event::ViewTransitionTimeout
            | Event::StatusTimeout => EventPriority::Timer,

            Event::FrameReceived { .. } => EventPriority::Network,

            Event::SubmitCommand { .. } => EventPriority::Client,
        }
    }

    /// Check if this is an internal event (consequence of prior processing).
    pub fn is_internal(&self) -> bool {
        self.priority() == EventPriority::Internal
    }

    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::CommitTimeout { .. } => "CommitTimeout",
            Event::BlameTimeout => "BlameTimeout",
            Event::ViewTransitionTimeout => "ViewTransitionTimeout",
            Event::StatusTimeout => "StatusTimeout",
            Event::FrameReceived { .. } => "FrameReceived",
            Event::SubmitCommand { .. } => "SubmitCommand",
            Event::QcFinalized { .. } => "QcFinalized",
            Event::HighQcUpdated { .. } => "HighQcUpdated",
            Event::Proposed { .. } => "Proposed",
            Event::Beat => "Beat",
            Event::Finalized { .. } => "Finalized",
            Event::BlockVerified { .. } => "BlockVerified",
            Event::VoteVerified { .. } => "VoteVerified",
            Event::StatusVerified { .. } => "StatusVerified",
            Event::BlameVerified { .. } => "BlameVerified",
            Event::BlameNotifyVerified { .. } => "BlameNotifyVerified",
            Event::NotifyVerified { .. } => "NotifyVerified",
        }
    }
}
