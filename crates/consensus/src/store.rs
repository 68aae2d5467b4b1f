//! Reference-counted, content-addressed block storage.
//!
//! Blocks live in an arena of slots addressed by stable [`BlockId`]s, with a
//! `hash → id` index on top. Parent and QC references between stored blocks
//! are ids, not hashes, so walking the DAG never re-hashes; each edge holds
//! one reference on its target. Pruning severs the downward edges of a cut
//! point so the reference counts of older ancestors drop to zero and their
//! slots are freed.

use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace};
use trellis_types::{Block, BlockHeight, Hash, QuorumCert, ReplicaId};

/// Stable index of a block slot in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(u32);

/// Commit state of a stored block. Never reverts once committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Decision {
    /// Not yet decided.
    #[default]
    Undecided,
    /// Committed; terminal.
    Committed,
}

/// A block plus the runtime state the protocol tracks for it.
#[derive(Debug)]
pub struct StoredBlock {
    /// The wire block.
    pub block: Block,
    /// Cached hash of the wire block.
    pub hash: Hash,
    /// `parents[0].height + 1`; meaningful once delivered. Genesis is 0.
    pub height: BlockHeight,
    /// Resolved parent references; populated at delivery time.
    pub parents: Vec<BlockId>,
    /// Resolved reference to the block the carried QC attests to.
    pub qc_ref: Option<BlockId>,
    /// True once ancestors are resolved and signatures verified.
    pub delivered: bool,
    /// Commit state.
    pub decision: Decision,
    /// Partial QC accumulated from votes on this block; populated only on
    /// the proposer.
    pub self_qc: Option<QuorumCert>,
    /// Replicas whose vote on this block has been counted.
    pub voted: BTreeSet<ReplicaId>,
    /// Incoming edge count: how many stored blocks reference this one as a
    /// parent or QC target.
    refs: u32,
}

/// Storage statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreStats {
    /// Blocks ever added.
    pub added: u64,
    /// Blocks released by pruning.
    pub released: u64,
}

/// The block arena.
pub struct BlockStore {
    slots: Vec<Option<StoredBlock>>,
    free: Vec<u32>,
    by_hash: HashMap<Hash, BlockId>,
    cmd_cache: HashMap<Hash, u32>,
    stats: StoreStats,
}

impl BlockStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_hash: HashMap::new(),
            cmd_cache: HashMap::new(),
            stats: StoreStats::default(),
        }
    }

    /// Add a block, returning the canonical id.
    ///
    /// Idempotent: re-adding a known block returns the existing slot and
    /// changes nothing.
    pub fn add_blk(&mut self, block: Block) -> BlockId {
        let hash = block.hash();
        if let Some(&id) = self.by_hash.get(&hash) {
            trace!(block = ?hash, "re-add of known block");
            return id;
        }
        for cmd in &block.cmds {
            *self.cmd_cache.entry(*cmd).or_insert(0) += 1;
        }
        let stored = StoredBlock {
            block,
            hash,
            height: BlockHeight(0),
            parents: Vec::new(),
            qc_ref: None,
            delivered: false,
            decision: Decision::Undecided,
            self_qc: None,
            voted: BTreeSet::new(),
            refs: 0,
        };
        let id = match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(stored);
                BlockId(idx)
            }
            None => {
                self.slots.push(Some(stored));
                BlockId(self.slots.len() as u32 - 1)
            }
        };
        self.by_hash.insert(hash, id);
        self.stats.added += 1;
        id
    }

    /// Look up a block id by hash.
    pub fn find(&self, hash: &Hash) -> Option<BlockId> {
        self.by_hash.get(hash).copied()
    }

    /// Whether the block bytes are present locally.
    pub fn is_fetched(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Whether the block is present and delivered.
    pub fn is_delivered(&self, hash: &Hash) -> bool {
        self.find(hash)
            .and_then(|id| self.get(id))
            .map(|b| b.delivered)
            .unwrap_or(false)
    }

    /// Access a slot, if the id is live.
    pub fn get(&self, id: BlockId) -> Option<&StoredBlock> {
        self.slots.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    /// Mutable access to a slot, if the id is live.
    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut StoredBlock> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }

    /// Record an edge from a child onto `target` (parent or QC reference).
    pub(crate) fn add_ref(&mut self, target: BlockId) {
        if let Some(b) = self.get_mut(target) {
            b.refs += 1;
        }
    }

    /// Number of live blocks.
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Number of distinct commands seen in stored blocks.
    pub fn cmd_cache_len(&self) -> usize {
        self.cmd_cache.len()
    }

    /// Storage statistics.
    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    /// Sever the downward edges of `cut` and release every ancestor whose
    /// reference count drops to zero, except ids in `pins`.
    ///
    /// `cut` itself is retained; blocks strictly below it become unreachable
    /// unless something above still references them (uncle edges). Returns
    /// the number of released blocks. Released hashes disappear from the
    /// index, so a later reference triggers a re-fetch instead of dangling.
    pub fn prune(&mut self, cut: BlockId, pins: &BTreeSet<BlockId>) -> usize {
        let mut released = 0usize;
        let mut stack = vec![cut];
        while let Some(id) = stack.pop() {
            let (parents, qc_ref) = match self.get_mut(id) {
                Some(b) => (std::mem::take(&mut b.parents), b.qc_ref.take()),
                None => continue,
            };
            for target in parents.into_iter().chain(qc_ref) {
                let orphaned = match self.get_mut(target) {
                    Some(b) => {
                        b.refs = b.refs.saturating_sub(1);
                        b.refs == 0
                    }
                    None => false,
                };
                if orphaned && !pins.contains(&target) {
                    stack.push(target);
                }
            }
            if id != cut && !pins.contains(&id) {
                self.release(id);
                released += 1;
            }
        }
        if released > 0 {
            debug!(released, live = self.len(), "pruned block storage");
        }
        released
    }

    fn release(&mut self, id: BlockId) {
        let Some(stored) = self.slots.get_mut(id.0 as usize).and_then(Option::take) else {
            return;
        };
        self.by_hash.remove(&stored.hash);
        for cmd in &stored.block.cmds {
            if let Some(count) = self.cmd_cache.get_mut(cmd) {
                *count -= 1;
                if *count == 0 {
                    self.cmd_cache.remove(cmd);
                }
            }
        }
        self.free.push(id.0);
        self.stats.released += 1;
    }
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Index<BlockId> for BlockStore {
    type Output = StoredBlock;

    fn index(&self, id: BlockId) -> &StoredBlock {
        self.get(id).expect("stale block id")
    }
}

impl std::ops::IndexMut<BlockId> for BlockStore {
    fn index_mut(&mut self, id: BlockId) -> &mut StoredBlock {
        self.get_mut(id).expect("stale block id")
    }
}

impl std::fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockStore")
            .field("blocks", &self.len())
            .field("cmds", &self.cmd_cache.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_with_parent(parent: Hash, tag: u8) -> Block {
        Block::new(vec![parent], vec![Hash::digest(&[tag])], None, Vec::new())
    }

    /// Build a linear delivered chain of `n` blocks above genesis, returning
    /// the ids from genesis upward.
    fn linear_chain(store: &mut BlockStore, n: u64) -> Vec<BlockId> {
        let genesis = Block::genesis();
        let mut prev_hash = genesis.hash();
        let mut ids = vec![store.add_blk(genesis)];
        store[ids[0]].delivered = true;
        for i in 0..n {
            let block = block_with_parent(prev_hash, i as u8);
            prev_hash = block.hash();
            let id = store.add_blk(block);
            let parent = *ids.last().unwrap();
            store[id].parents = vec![parent];
            store[id].height = BlockHeight(i + 1);
            store[id].delivered = true;
            store.add_ref(parent);
            ids.push(id);
        }
        ids
    }

    #[test]
    fn add_is_idempotent() {
        let mut store = BlockStore::new();
        let block = Block::genesis();
        let a = store.add_blk(block.clone());
        let b = store.add_blk(block);
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().added, 1);
    }

    #[test]
    fn fetched_and_delivered_are_distinct() {
        let mut store = BlockStore::new();
        let block = Block::genesis();
        let hash = block.hash();
        assert!(!store.is_fetched(&hash));
        let id = store.add_blk(block);
        assert!(store.is_fetched(&hash));
        assert!(!store.is_delivered(&hash));
        store[id].delivered = true;
        assert!(store.is_delivered(&hash));
    }

    #[test]
    fn prune_releases_old_ancestors() {
        let mut store = BlockStore::new();
        let ids = linear_chain(&mut store, 10);
        let hashes: Vec<Hash> = ids.iter().map(|&id| store[id].hash).collect();

        // Keep the top of the chain; cut at height 8 and pin genesis.
        let pins: BTreeSet<BlockId> = [ids[0]].into_iter().collect();
        let released = store.prune(ids[8], &pins);

        // Heights 1..=7 released; genesis pinned; 8..=10 retained.
        assert_eq!(released, 7);
        for h in 1..8 {
            assert!(!store.is_fetched(&hashes[h]), "height {h} should be gone");
        }
        for h in 8..=10 {
            assert!(store.is_fetched(&hashes[h]), "height {h} should remain");
        }
        assert!(store.is_fetched(&hashes[0]), "genesis is pinned");
    }

    #[test]
    fn pruned_hash_refetches_as_new_block() {
        let mut store = BlockStore::new();
        let ids = linear_chain(&mut store, 4);
        let old_hash = store[ids[1]].hash;
        let old_block = store[ids[1]].block.clone();
        let pins = BTreeSet::new();
        store.prune(ids[3], &pins);
        assert!(!store.is_fetched(&old_hash));

        // Re-adding after eviction yields a fresh, undelivered entry.
        let id = store.add_blk(old_block);
        assert!(store.is_fetched(&old_hash));
        assert!(!store[id].delivered);
    }

    #[test]
    fn uncle_edge_keeps_block_alive() {
        let mut store = BlockStore::new();
        let ids = linear_chain(&mut store, 5);
        // An extra child referencing height 2 as an uncle.
        let uncle_child = store.add_blk(block_with_parent(store[ids[5]].hash, 0xEE));
        store[uncle_child].parents = vec![ids[5], ids[2]];
        store.add_ref(ids[5]);
        store.add_ref(ids[2]);

        let pins = BTreeSet::new();
        let h2 = store[ids[2]].hash;
        store.prune(ids[4], &pins);
        // Height 2 still referenced by the uncle edge.
        assert!(store.is_fetched(&h2));
    }

    #[test]
    fn cmd_cache_follows_block_lifetime() {
        let mut store = BlockStore::new();
        let cmd = Hash::digest(b"cmd");
        let block = Block::new(vec![Hash::digest(b"p")], vec![cmd], None, Vec::new());
        let id = store.add_blk(block);
        assert_eq!(store.cmd_cache_len(), 1);
        store.release(id);
        assert_eq!(store.cmd_cache_len(), 0);
    }

    #[test]
    fn released_slots_are_reused() {
        let mut store = BlockStore::new();
        let ids = linear_chain(&mut store, 3);
        let pins = BTreeSet::new();
        let released = store.prune(ids[3], &pins);
        assert!(released > 0);
        let live_before = store.len();
        store.add_blk(block_with_parent(Hash::digest(b"x"), 0x77));
        assert_eq!(store.len(), live_before + 1);
        assert_eq!(store.slots.iter().flatten().count(), store.len());
    }
}
