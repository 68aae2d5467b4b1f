//! Network messages for the replication protocol.
//!
//! Every message travels in a frame of `opcode:1 | length:4_LE | body`, with
//! the body Borsh-encoded (little-endian length-prefixed vectors, one-byte
//! option tags, fixed 32-byte hashes).
//!
//! Parsing is two-stage: the transport peels only the frame header off the
//! stream and hands a [`RawFrame`] upward; the node dispatcher performs the
//! typed body parse once the consensus core, and therefore the canonical
//! block store, is at hand. Block-bearing bodies are canonicalized through
//! the store immediately after the second stage.

mod frame;

pub use frame::{CodecError, Opcode, RawFrame, MAX_FRAME_LEN};

use borsh::{BorshDeserialize, BorshSerialize};
use trellis_types::{Block, Hash, PartialCert, QuorumCert, ReplicaId, Signature};

/// A message type with a fixed opcode and a Borsh body.
pub trait WireMessage: BorshSerialize + BorshDeserialize {
    /// The opcode identifying this message on the wire.
    const OPCODE: Opcode;

    /// Encode into a complete frame, header included.
    fn to_frame(&self) -> Vec<u8> {
        let body = borsh::to_vec(self).expect("message serialization is infallible");
        frame::encode_frame(Self::OPCODE, &body)
    }
}

/// A block proposal, broadcast by the proposer to all replicas.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Proposal {
    /// The proposing replica.
    pub proposer: ReplicaId,
    /// The proposed block, bytes included.
    pub block: Block,
}

impl WireMessage for Proposal {
    const OPCODE: Opcode = Opcode::Propose;
}

/// A vote for a block, sent to the block's proposer.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Vote {
    /// The voting replica.
    pub voter: ReplicaId,
    /// Hash of the block voted for.
    pub block_hash: Hash,
    /// The voter's partial certificate over the hash.
    pub cert: PartialCert,
}

impl WireMessage for Vote {
    const OPCODE: Opcode = Opcode::Vote;
}

/// Request for blocks by hash.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ReqBlock {
    /// The wanted block hashes.
    pub block_hashes: Vec<Hash>,
}

impl WireMessage for ReqBlock {
    const OPCODE: Opcode = Opcode::ReqBlock;
}

/// Response carrying full blocks.
///
/// Hashes the responder does not have locally are skipped, so the response
/// may carry fewer blocks than were requested.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RespBlock {
    /// The blocks.
    pub blocks: Vec<Block>,
}

impl WireMessage for RespBlock {
    const OPCODE: Opcode = Opcode::RespBlock;
}

/// A replica's signed view of its highest quorum certificate.
///
/// Sent periodically (status timer) and as the payload of `NewView` during
/// view transitions.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Status {
    /// The reporting replica.
    pub replica: ReplicaId,
    /// The view this status was produced in.
    pub view: u64,
    /// The replica's highest quorum certificate.
    pub hqc: QuorumCert,
    /// Signature over [`Status::signing_bytes`].
    pub signature: Signature,
}

impl Status {
    /// The bytes a status signature covers: view, then the hqc block hash.
    pub fn signing_bytes(view: u64, hqc_hash: Hash) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + 32);
        bytes.extend_from_slice(&view.to_le_bytes());
        bytes.extend_from_slice(hqc_hash.as_bytes());
        bytes
    }

    /// Hash of the block the carried certificate attests to.
    pub fn hqc_hash(&self) -> Hash {
        self.hqc.block_hash
    }
}

impl WireMessage for Status {
    const OPCODE: Opcode = Opcode::Status;
}

/// `NewView` shares the `Status` payload under its own opcode.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct NewView(pub Status);

impl WireMessage for NewView {
    const OPCODE: Opcode = Opcode::NewView;
}

/// A signed complaint that the current view's leader is not making progress.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Blame {
    /// The complaining replica.
    pub replica: ReplicaId,
    /// The view being blamed.
    pub view: u64,
    /// Signature over [`Blame::signing_bytes`].
    pub signature: Signature,
}

impl Blame {
    /// The bytes a blame signature covers.
    pub fn signing_bytes(view: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(6 + 8);
        bytes.extend_from_slice(b"blame:");
        bytes.extend_from_slice(&view.to_le_bytes());
        bytes
    }
}

impl WireMessage for Blame {
    const OPCODE: Opcode = Opcode::Blame;
}

/// A quorum of blames for one view, proving the view change is justified.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlameNotify {
    /// The blamed view.
    pub view: u64,
    /// The collected blames.
    pub blames: Vec<Blame>,
}

impl WireMessage for BlameNotify {
    const OPCODE: Opcode = Opcode::BlameNotify;
}

/// Notification of a certified block, used during view transition.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Notify {
    /// Hash of the certified block.
    pub block_hash: Hash,
    /// The certificate over it.
    pub qc: QuorumCert,
}

impl WireMessage for Notify {
    const OPCODE: Opcode = Opcode::Notify;
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_types::KeyPair;

    fn sample_block() -> Block {
        Block::new(
            vec![Hash::digest(b"parent")],
            vec![Hash::digest(b"cmd")],
            None,
            Vec::new(),
        )
    }

    #[test]
    fn proposal_frame_round_trip() {
        let prop = Proposal {
            proposer: ReplicaId(2),
            block: sample_block(),
        };
        let bytes = prop.to_frame();
        let (frame, consumed) = RawFrame::decode(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(frame.opcode, Opcode::Propose);
        let back: Proposal = frame.parse().unwrap();
        assert_eq!(back, prop);
        assert_eq!(back.block.hash(), prop.block.hash());
    }

    #[test]
    fn vote_frame_round_trip() {
        let key = KeyPair::from_seed(&[3u8; 32]);
        let hash = sample_block().hash();
        let vote = Vote {
            voter: ReplicaId(1),
            block_hash: hash,
            cert: PartialCert::new(&key, ReplicaId(1), hash),
        };
        let bytes = vote.to_frame();
        let (frame, _) = RawFrame::decode(&bytes).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Vote);
        let back: Vote = frame.parse().unwrap();
        assert_eq!(back, vote);
    }

    #[test]
    fn req_block_frame_layout() {
        // opcode:1 | length:4_LE | hashes_len:4_LE | hashes
        let req = ReqBlock {
            block_hashes: vec![Hash::digest(b"a"), Hash::digest(b"b")],
        };
        let bytes = req.to_frame();
        assert_eq!(bytes[0], Opcode::ReqBlock as u8);
        let body_len = u32::from_le_bytes(bytes[1..5].try_into().unwrap()) as usize;
        assert_eq!(body_len, bytes.len() - 5);
        assert_eq!(&bytes[5..9], &2u32.to_le_bytes());
    }

    #[test]
    fn status_signature_covers_view_and_hqc() {
        let key = KeyPair::from_seed(&[9u8; 32]);
        let hqc_hash = Hash::digest(b"hqc");
        let signature = key.sign(&Status::signing_bytes(4, hqc_hash));
        let status = Status {
            replica: ReplicaId(0),
            view: 4,
            hqc: QuorumCert::genesis(hqc_hash),
            signature,
        };
        assert!(key
            .public_key()
            .verify(&Status::signing_bytes(status.view, status.hqc_hash()), &status.signature));
    }
}
