//! Outbound message types for network communication.

use trellis_messages::{
    Blame, BlameNotify, NewView, Notify, Proposal, ReqBlock, RespBlock, Status, Vote, WireMessage,
};

/// Outbound network messages.
///
/// These are the messages a replica can send to other replicas.
/// The runner handles the actual network I/O.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Block proposal.
    Proposal(Proposal),

    /// Vote on a proposed block.
    Vote(Vote),

    /// Request for blocks by hash.
    ReqBlock(ReqBlock),

    /// Response carrying full blocks.
    RespBlock(RespBlock),

    /// Periodic highest-QC report.
    Status(Status),

    /// View-transition announcement (Status payload).
    NewView(NewView),

    /// Complaint about the current leader.
    Blame(Blame),

    /// Quorum of blames justifying a view change.
    BlameNotify(BlameNotify),

    /// Certified-block notification.
    Notify(Notify),
}

impl OutboundMessage {
    /// Encode into a complete wire frame.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            OutboundMessage::Proposal(m) => m.to_frame(),
            OutboundMessage::Vote(m) => m.to_frame(),
            OutboundMessage::ReqBlock(m) => m.to_frame(),
            OutboundMessage::RespBlock(m) => m.to_frame(),
            OutboundMessage::Status(m) => m.to_frame(),
            OutboundMessage::NewView(m) => m.to_frame(),
            OutboundMessage::Blame(m) => m.to_frame(),
            OutboundMessage::BlameNotify(m) => m.to_frame(),
            OutboundMessage::Notify(m) => m.to_frame(),
        }
    }

    /// Get a human-readable name for this message type.
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundMessage::Proposal(_) => "Proposal",
            OutboundMessage::Vote(_) => "Vote",
            OutboundMessage::ReqBlock(_) => "ReqBlock",
            OutboundMessage::RespBlock(_) => "RespBlock",
            OutboundMessage::Status(_) => "Status",
            OutboundMessage::NewView(_) => "NewView",
            OutboundMessage::Blame(_) => "Blame",
            OutboundMessage::BlameNotify(_) => "BlameNotify",
            OutboundMessage::Notify(_) => "Notify",
        }
    }

    /// Check if this message carries full block bytes.
    pub fn carries_blocks(&self) -> bool {
        matches!(
            self,
            OutboundMessage::Proposal(_) | OutboundMessage::RespBlock(_)
        )
    }
}
