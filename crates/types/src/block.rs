//! The block: the only persisted entity of the protocol.

use crate::{Hash, QuorumCert};
use borsh::{BorshDeserialize, BorshSerialize};

/// A proposed block as it travels on the wire.
///
/// The Borsh encoding of this struct is the canonical wire layout: each
/// vector is a `u32` little-endian length followed by its elements, the
/// certificate is a one-byte presence tag followed by its payload, and
/// hashes are fixed 32-byte arrays.
///
/// Runtime state (height, resolved parents, vote bookkeeping, decision) is
/// tracked by the consensus block store, not serialized here.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Block {
    /// Parent block hashes; index 0 is the primary parent. Non-empty for
    /// every block except genesis. Entries past the first are uncles and
    /// carry no safety meaning.
    pub parent_hashes: Vec<Hash>,
    /// Ordered command hashes, opaque to the protocol.
    pub cmds: Vec<Hash>,
    /// Certificate over some ancestor, if the proposer had one.
    pub qc: Option<QuorumCert>,
    /// Opaque proposer annotations.
    pub extra: Vec<u8>,
}

impl Block {
    /// Create a block.
    pub fn new(
        parent_hashes: Vec<Hash>,
        cmds: Vec<Hash>,
        qc: Option<QuorumCert>,
        extra: Vec<u8>,
    ) -> Self {
        Self {
            parent_hashes,
            cmds,
            qc,
            extra,
        }
    }

    /// The genesis block: no parents, no commands, no certificate.
    pub fn genesis() -> Self {
        Self {
            parent_hashes: Vec::new(),
            cmds: Vec::new(),
            qc: None,
            extra: Vec::new(),
        }
    }

    /// Deterministic digest of the serialized block.
    pub fn hash(&self) -> Hash {
        let bytes = borsh::to_vec(self).expect("block serialization is infallible");
        Hash::digest(&bytes)
    }

    /// The primary parent hash, absent only on genesis.
    pub fn primary_parent(&self) -> Option<Hash> {
        self.parent_hashes.first().copied()
    }

    /// The hash the carried certificate attests to, if any.
    pub fn qc_ref_hash(&self) -> Option<Hash> {
        self.qc.as_ref().map(|qc| qc.block_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        let parent = Hash::digest(b"parent");
        let mut qc = QuorumCert::new(parent);
        qc.compute();
        Block::new(
            vec![parent, Hash::digest(b"uncle")],
            vec![Hash::digest(b"cmd-1"), Hash::digest(b"cmd-2")],
            Some(qc),
            b"annotation".to_vec(),
        )
    }

    #[test]
    fn serialize_round_trip_preserves_hash() {
        let block = sample_block();
        let bytes = borsh::to_vec(&block).unwrap();
        let back: Block = borsh::from_slice(&bytes).unwrap();
        assert_eq!(back, block);
        assert_eq!(back.hash(), block.hash());
    }

    #[test]
    fn wire_layout_matches_framing_rules() {
        // parent_hashes_len:4_LE | hashes | cmds_len:4_LE | cmds | qc_present:1 | ...
        let block = Block::new(vec![Hash::digest(b"p")], vec![], None, vec![0xAB]);
        let bytes = borsh::to_vec(&block).unwrap();
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..36], block.parent_hashes[0].as_bytes());
        assert_eq!(&bytes[36..40], &0u32.to_le_bytes());
        assert_eq!(bytes[40], 0); // qc absent
        assert_eq!(&bytes[41..45], &1u32.to_le_bytes());
        assert_eq!(bytes[45], 0xAB);
    }

    #[test]
    fn hash_changes_with_content() {
        let a = sample_block();
        let mut b = a.clone();
        b.cmds.push(Hash::digest(b"cmd-3"));
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn genesis_has_no_parent() {
        let genesis = Block::genesis();
        assert!(genesis.primary_parent().is_none());
        assert!(genesis.qc_ref_hash().is_none());
    }
}
