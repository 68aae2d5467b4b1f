//! Consensus configuration.

use std::time::Duration;

/// Tunable parameters of the consensus core.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// How many blocks below the committed tip stay reachable in storage.
    /// Older ancestors are pruned after each commit. Zero disables pruning.
    pub staleness: u32,

    /// Optimistic-commit wait after voting for a block. The commit timer is
    /// cancelled when the three-chain rule commits the block first.
    pub commit_timeout: Duration,

    /// How long the current leader may stall before this replica blames it.
    pub blame_timeout: Duration,

    /// Bound on the wait for a new-view quorum after a blame quorum formed.
    pub view_transition_timeout: Duration,

    /// Interval of the periodic status broadcast.
    pub status_interval: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            staleness: 100,
            commit_timeout: Duration::from_secs(1),
            blame_timeout: Duration::from_secs(3),
            view_transition_timeout: Duration::from_secs(5),
            status_interval: Duration::from_secs(2),
        }
    }
}
