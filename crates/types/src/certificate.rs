//! Partial and quorum certificates.
//!
//! A [`PartialCert`] is one replica's signed contribution toward a quorum.
//! A [`QuorumCert`] collects `nmajority` partial signatures over a single
//! block hash and, once finalized with [`QuorumCert::compute`], attests that
//! a quorum of replicas voted for that block.

use crate::{Hash, KeyPair, PublicKey, ReplicaConfig, ReplicaId, Signature};
use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeMap;

/// One replica's signed vote contribution for a block hash.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PartialCert {
    /// The contributing replica.
    pub replica: ReplicaId,
    /// The block hash being attested.
    pub block_hash: Hash,
    /// Signature over the block hash.
    pub signature: Signature,
}

impl PartialCert {
    /// Sign `block_hash` with this replica's key.
    pub fn new(key: &KeyPair, replica: ReplicaId, block_hash: Hash) -> Self {
        Self {
            replica,
            block_hash,
            signature: key.sign(block_hash.as_bytes()),
        }
    }

    /// Verify the contribution against the signer's public key.
    pub fn verify(&self, public_key: &PublicKey) -> bool {
        public_key.verify(self.block_hash.as_bytes(), &self.signature)
    }
}

/// A certificate accumulating partial signatures over one block hash.
///
/// The certificate starts empty; the proposer adds parts as votes arrive and
/// calls [`compute`](Self::compute) once `nmajority` distinct signers have
/// contributed. After that point the certificate is immutable: `add_part`
/// becomes a no-op and `compute` is idempotent.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct QuorumCert {
    /// The block hash this certificate attests to.
    pub block_hash: Hash,
    parts: BTreeMap<ReplicaId, Signature>,
    complete: bool,
}

impl QuorumCert {
    /// Start an empty certificate over `block_hash`.
    pub fn new(block_hash: Hash) -> Self {
        Self {
            block_hash,
            parts: BTreeMap::new(),
            complete: false,
        }
    }

    /// Synthetic, already-complete certificate for the genesis block.
    ///
    /// Never verified: genesis is delivered at initialization and implicitly
    /// ratified by every configured replica.
    pub fn genesis(block_hash: Hash) -> Self {
        Self {
            block_hash,
            parts: BTreeMap::new(),
            complete: true,
        }
    }

    /// Add one replica's contribution. Ignored once the certificate is
    /// finalized; re-adding the same signer overwrites nothing observable.
    pub fn add_part(&mut self, replica: ReplicaId, signature: Signature) {
        if self.complete {
            return;
        }
        self.parts.entry(replica).or_insert(signature);
    }

    /// Finalize the certificate. Idempotent.
    pub fn compute(&mut self) {
        self.complete = true;
    }

    /// Whether [`compute`](Self::compute) has run.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Number of distinct signers collected so far.
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// The replicas that signed.
    pub fn signers(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.parts.keys().copied()
    }

    /// Verify the certificate against the configured replica set.
    ///
    /// Requires `nmajority` distinct, known signers with valid signatures
    /// over the attested block hash.
    pub fn verify(&self, config: &ReplicaConfig) -> bool {
        let mut valid = 0usize;
        for (replica, signature) in &self.parts {
            let Some(key) = config.public_key(*replica) else {
                continue;
            };
            if key.verify(self.block_hash.as_bytes(), signature) {
                valid += 1;
            }
        }
        valid >= config.nmajority
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReplicaInfo;

    fn setup(n: u64, nfaulty: usize) -> (ReplicaConfig, Vec<KeyPair>) {
        let mut config = ReplicaConfig::new(nfaulty);
        let mut keys = Vec::new();
        for i in 0..n {
            let key = KeyPair::from_seed(&[i as u8 + 1; 32]);
            config
                .add_replica(ReplicaInfo {
                    id: ReplicaId(i),
                    peer_addr: format!("127.0.0.1:{}", 9000 + i).parse().unwrap(),
                    public_key: key.public_key(),
                })
                .unwrap();
            keys.push(key);
        }
        (config, keys)
    }

    #[test]
    fn quorum_of_valid_parts_verifies() {
        let (config, keys) = setup(4, 1);
        let hash = Hash::digest(b"block");
        let mut qc = QuorumCert::new(hash);
        for (i, key) in keys.iter().enumerate().take(3) {
            let part = PartialCert::new(key, ReplicaId(i as u64), hash);
            assert!(part.verify(config.public_key(part.replica).unwrap()));
            qc.add_part(part.replica, part.signature);
        }
        qc.compute();
        assert!(qc.verify(&config));
    }

    #[test]
    fn too_few_parts_fail_verification() {
        let (config, keys) = setup(4, 1);
        let hash = Hash::digest(b"block");
        let mut qc = QuorumCert::new(hash);
        for (i, key) in keys.iter().enumerate().take(2) {
            qc.add_part(ReplicaId(i as u64), key.sign(hash.as_bytes()));
        }
        qc.compute();
        assert!(!qc.verify(&config));
    }

    #[test]
    fn invalid_signatures_do_not_count() {
        let (config, keys) = setup(4, 1);
        let hash = Hash::digest(b"block");
        let mut qc = QuorumCert::new(hash);
        qc.add_part(ReplicaId(0), keys[0].sign(hash.as_bytes()));
        qc.add_part(ReplicaId(1), keys[1].sign(hash.as_bytes()));
        // Signature by the wrong key.
        qc.add_part(ReplicaId(2), keys[3].sign(hash.as_bytes()));
        qc.compute();
        assert!(!qc.verify(&config));
    }

    #[test]
    fn unknown_signers_do_not_count() {
        let (config, keys) = setup(4, 1);
        let hash = Hash::digest(b"block");
        let mut qc = QuorumCert::new(hash);
        qc.add_part(ReplicaId(0), keys[0].sign(hash.as_bytes()));
        qc.add_part(ReplicaId(1), keys[1].sign(hash.as_bytes()));
        qc.add_part(ReplicaId(99), keys[2].sign(hash.as_bytes()));
        qc.compute();
        assert!(!qc.verify(&config));
    }

    #[test]
    fn finalized_certificate_is_immutable() {
        let (_, keys) = setup(4, 1);
        let hash = Hash::digest(b"block");
        let mut qc = QuorumCert::new(hash);
        qc.add_part(ReplicaId(0), keys[0].sign(hash.as_bytes()));
        qc.compute();
        qc.compute();
        qc.add_part(ReplicaId(1), keys[1].sign(hash.as_bytes()));
        assert_eq!(qc.part_count(), 1);
        assert!(qc.is_complete());
    }

    #[test]
    fn duplicate_part_not_double_counted() {
        let (_, keys) = setup(4, 1);
        let hash = Hash::digest(b"block");
        let mut qc = QuorumCert::new(hash);
        qc.add_part(ReplicaId(0), keys[0].sign(hash.as_bytes()));
        qc.add_part(ReplicaId(0), keys[0].sign(hash.as_bytes()));
        assert_eq!(qc.part_count(), 1);
    }
}
