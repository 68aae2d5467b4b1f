//! Replica identity, configuration, and commit notifications.

use crate::{Hash, PublicKey};
use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use thiserror::Error;

/// Identifier of a replica in the fixed replica set.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
)]
pub struct ReplicaId(pub u64);

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Position of a block in the chain. Genesis is height 0.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    BorshSerialize,
    BorshDeserialize,
)]
pub struct BlockHeight(pub u64);

impl std::fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Static information about one replica.
#[derive(Debug, Clone)]
pub struct ReplicaInfo {
    /// The replica's identifier.
    pub id: ReplicaId,
    /// Address the replica listens on.
    pub peer_addr: SocketAddr,
    /// Key the replica signs votes and certificates with.
    pub public_key: PublicKey,
}

/// Errors from building a [`ReplicaConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate replica id {0}")]
    DuplicateReplica(ReplicaId),

    #[error("replica set of {replicas} cannot reach quorum {nmajority}")]
    QuorumUnreachable { replicas: usize, nmajority: usize },
}

/// The fixed replica set and quorum threshold.
///
/// `nmajority = 2f + 1` is explicit configuration; it is never derived from
/// the peer count. For the synchronous variant implemented here the system
/// needs `N >= 2f + 1` replicas to tolerate `f` Byzantine faults.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    replicas: BTreeMap<ReplicaId, ReplicaInfo>,
    /// Number of votes required to form a quorum certificate.
    pub nmajority: usize,
}

impl ReplicaConfig {
    /// Create a configuration tolerating `nfaulty` Byzantine replicas.
    pub fn new(nfaulty: usize) -> Self {
        Self {
            replicas: BTreeMap::new(),
            nmajority: 2 * nfaulty + 1,
        }
    }

    /// Register a replica. Fails on duplicate ids.
    pub fn add_replica(&mut self, info: ReplicaInfo) -> Result<(), ConfigError> {
        if self.replicas.contains_key(&info.id) {
            return Err(ConfigError::DuplicateReplica(info.id));
        }
        self.replicas.insert(info.id, info);
        Ok(())
    }

    /// Check the replica set can reach quorum at all.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replicas.len() < self.nmajority {
            return Err(ConfigError::QuorumUnreachable {
                replicas: self.replicas.len(),
                nmajority: self.nmajority,
            });
        }
        Ok(())
    }

    /// Look up a replica by id.
    pub fn replica(&self, id: ReplicaId) -> Option<&ReplicaInfo> {
        self.replicas.get(&id)
    }

    /// Public key of a replica, if known.
    pub fn public_key(&self, id: ReplicaId) -> Option<&PublicKey> {
        self.replicas.get(&id).map(|r| &r.public_key)
    }

    /// Listen address of a replica, if known.
    pub fn addr(&self, id: ReplicaId) -> Option<SocketAddr> {
        self.replicas.get(&id).map(|r| r.peer_addr)
    }

    /// All replica ids, in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.replicas.keys().copied()
    }

    /// All replicas.
    pub fn iter(&self) -> impl Iterator<Item = &ReplicaInfo> {
        self.replicas.values()
    }

    /// Number of replicas in the set.
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    /// Whether the replica set is empty.
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}

/// Notification that a command reached a decision.
///
/// Delivered to the application once per command, in commit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finality {
    /// The replica that reached the decision.
    pub replica: ReplicaId,
    /// Height of the committed block.
    pub height: BlockHeight,
    /// Index of the command within the block.
    pub cmd_idx: u32,
    /// The command hash.
    pub cmd_hash: Hash,
    /// Hash of the committed block.
    pub block_hash: Hash,
}
