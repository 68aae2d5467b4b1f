//! The pacemaker boundary: leader selection and parent choice.
//!
//! Leader rotation policy is deliberately behind this trait; the node only
//! asks who proposes in a view and which parents a proposal should extend.

use trellis_consensus::ChainState;
use trellis_types::{Hash, ReplicaId};

/// Leader election and proposal-parent selection.
pub trait Pacemaker: Send {
    /// The proposer of `view`.
    fn proposer(&self, view: u64) -> ReplicaId;

    /// Resolve a beat: who should propose now.
    fn beat(&mut self, view: u64) -> ReplicaId {
        self.proposer(view)
    }

    /// The parent chain the next proposal should extend.
    fn parents(&self, chain: &ChainState) -> Vec<Hash>;
}

/// Rotates the proposer across the replica set by view number.
///
/// Within one view the proposer is fixed; the view advances through the
/// blame path when the leader stalls.
pub struct RoundRobinPacemaker {
    replicas: Vec<ReplicaId>,
}

impl RoundRobinPacemaker {
    /// Create a pacemaker over the given replica set.
    pub fn new(mut replicas: Vec<ReplicaId>) -> Self {
        replicas.sort_unstable();
        Self { replicas }
    }
}

impl Pacemaker for RoundRobinPacemaker {
    fn proposer(&self, view: u64) -> ReplicaId {
        self.replicas[(view % self.replicas.len() as u64) as usize]
    }

    fn parents(&self, chain: &ChainState) -> Vec<Hash> {
        chain.proposal_parents()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_by_view() {
        let pm = RoundRobinPacemaker::new(vec![ReplicaId(2), ReplicaId(0), ReplicaId(1)]);
        assert_eq!(pm.proposer(0), ReplicaId(0));
        assert_eq!(pm.proposer(1), ReplicaId(1));
        assert_eq!(pm.proposer(2), ReplicaId(2));
        assert_eq!(pm.proposer(3), ReplicaId(0));
    }
}
