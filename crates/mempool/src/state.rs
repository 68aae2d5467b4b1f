//! Command pool state.

use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};
use trellis_core::{Action, Event, RequestId};
use trellis_types::{Finality, Hash};

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MempoolStats {
    /// Commands accepted.
    pub submitted: u64,
    /// Duplicate submissions observed while a command was still pending.
    pub duplicates: u64,
    /// Commands resolved by a commit.
    pub decided: u64,
}

/// Buffers client commands and triggers proposal beats.
///
/// `decision_waiting` is keyed by command hash, so duplicate submissions of
/// the same command collide: the first registered submitter wins the
/// callback. This is a deliberate, known limitation.
pub struct CommandPool {
    blk_size: usize,
    buffer: VecDeque<Hash>,
    decision_waiting: HashMap<Hash, RequestId>,
    stats: MempoolStats,
}

impl CommandPool {
    /// Create a pool that beats every `blk_size` commands.
    pub fn new(blk_size: usize) -> Self {
        Self {
            blk_size: blk_size.max(1),
            buffer: VecDeque::new(),
            decision_waiting: HashMap::new(),
            stats: MempoolStats::default(),
        }
    }

    /// Number of buffered commands.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether a full batch is waiting.
    pub fn batch_ready(&self) -> bool {
        self.buffer.len() >= self.blk_size
    }

    /// Pool statistics.
    pub fn stats(&self) -> MempoolStats {
        self.stats
    }

    /// Accept a command submission.
    ///
    /// Buffers the hash, registers the submitter for the eventual decision,
    /// and emits a beat once a full batch is waiting.
    pub fn on_submit(&mut self, cmd_hash: Hash, request_id: RequestId) -> Vec<Action> {
        use std::collections::hash_map::Entry;
        match self.decision_waiting.entry(cmd_hash) {
            Entry::Occupied(_) => {
                // Duplicate command hashes collide; first submitter wins.
                self.stats.duplicates += 1;
                debug!(cmd = ?cmd_hash, "duplicate command submission");
                return Vec::new();
            }
            Entry::Vacant(slot) => {
                slot.insert(request_id);
            }
        }
        self.buffer.push_back(cmd_hash);
        self.stats.submitted += 1;
        trace!(cmd = ?cmd_hash, buffered = self.buffer.len(), "command buffered");

        if self.batch_ready() {
            vec![Action::EnqueueInternal { event: Event::Beat }]
        } else {
            Vec::new()
        }
    }

    /// Take one batch for proposing, if a full one is waiting.
    ///
    /// The batch leaves the buffer; commands of a leader that loses its turn
    /// stay buffered for re-submission on the next beat.
    pub fn take_batch(&mut self) -> Option<Vec<Hash>> {
        if !self.batch_ready() {
            return None;
        }
        Some(self.buffer.drain(..self.blk_size).collect())
    }

    /// Resolve a committed command: notify the application and the
    /// registered submitter.
    pub fn on_finality(&mut self, finality: Finality) -> Vec<Action> {
        self.stats.decided += 1;
        let mut actions = vec![Action::EmitFinality {
            finality: finality.clone(),
        }];
        if let Some(request_id) = self.decision_waiting.remove(&finality.cmd_hash) {
            actions.push(Action::RespondCommand {
                request_id,
                finality,
            });
        }
        actions
    }
}

impl std::fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPool")
            .field("blk_size", &self.blk_size)
            .field("buffered", &self.buffer.len())
            .field("waiting", &self.decision_waiting.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(i: u8) -> Hash {
        Hash::digest(&[i])
    }

    fn finality(cmd_hash: Hash) -> Finality {
        Finality {
            replica: trellis_types::ReplicaId(0),
            height: trellis_types::BlockHeight(1),
            cmd_idx: 0,
            cmd_hash,
            block_hash: Hash::digest(b"block"),
        }
    }

    #[test]
    fn beat_fires_at_batch_size() {
        let mut pool = CommandPool::new(3);
        assert!(pool.on_submit(cmd(1), RequestId(1)).is_empty());
        assert!(pool.on_submit(cmd(2), RequestId(2)).is_empty());
        let actions = pool.on_submit(cmd(3), RequestId(3));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::EnqueueInternal { event: Event::Beat })));
    }

    #[test]
    fn take_batch_preserves_submission_order() {
        let mut pool = CommandPool::new(2);
        pool.on_submit(cmd(1), RequestId(1));
        pool.on_submit(cmd(2), RequestId(2));
        pool.on_submit(cmd(3), RequestId(3));
        let batch = pool.take_batch().unwrap();
        assert_eq!(batch, vec![cmd(1), cmd(2)]);
        assert_eq!(pool.len(), 1);
        assert!(pool.take_batch().is_none(), "no full batch left");
    }

    #[test]
    fn duplicate_submission_collides_silently() {
        let mut pool = CommandPool::new(2);
        pool.on_submit(cmd(1), RequestId(1));
        pool.on_submit(cmd(1), RequestId(2));
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.stats().duplicates, 1);

        // The first submitter receives the decision.
        let actions = pool.on_finality(finality(cmd(1)));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::RespondCommand {
                request_id: RequestId(1),
                ..
            }
        )));
    }

    #[test]
    fn finality_without_waiter_still_reaches_application() {
        let mut pool = CommandPool::new(1);
        let actions = pool.on_finality(finality(cmd(9)));
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], Action::EmitFinality { .. }));
    }

    #[test]
    fn decision_resolves_submitter_once() {
        let mut pool = CommandPool::new(1);
        pool.on_submit(cmd(1), RequestId(7));
        let first = pool.on_finality(finality(cmd(1)));
        assert_eq!(first.len(), 2);
        let second = pool.on_finality(finality(cmd(1)));
        assert_eq!(second.len(), 1, "waiter already resolved");
    }
}
