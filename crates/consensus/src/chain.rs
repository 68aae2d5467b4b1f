//! The chain state machine: voting safety rule, three-chain commit kernel,
//! high-QC tracking, and pruning.
//!
//! # State Machine Flow
//!
//! 1. **Propose** → attach the parent's finalized QC, self-vote, broadcast
//! 2. **Proposal received** → run the commit kernel, vote if the safety rule
//!    allows
//! 3. **Vote received** → accumulate parts; at `nmajority`, finalize the QC
//!    and raise the high QC
//! 4. **Commit kernel** → a block whose QC points at its direct primary
//!    parent commits everything from that parent down to the previous tip
//!
//! All I/O is performed by the runner via returned `Action`s. A fatal return
//! means a safety rule was violated and the replica must halt.

use crate::store::{BlockId, BlockStore, Decision};
use crate::{ConsensusConfig, ConsensusError};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, trace, warn};
use trellis_core::{Action, Event, OutboundMessage, TimerId};
use trellis_messages::{Notify, Proposal, Status, Vote};
use trellis_types::{
    Block, BlockHeight, Finality, Hash, KeyPair, PartialCert, QuorumCert, ReplicaConfig, ReplicaId,
};

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainStats {
    /// Blocks proposed locally.
    pub proposed: u64,
    /// Proposals received and processed.
    pub proposals_received: u64,
    /// Votes cast.
    pub votes_cast: u64,
    /// Votes received and counted.
    pub votes_counted: u64,
    /// Duplicate votes dropped.
    pub duplicate_votes: u64,
    /// Votes dropped because the block was not proposed here.
    pub votes_unsolicited: u64,
    /// Blocks committed.
    pub committed: u64,
}

/// The per-replica chain state.
///
/// Owns the block store and the four monotone quantities safety rests on:
/// the committed tip `bexec`, the last-voted height `vheight`, the highest
/// QC `hqc`, and the genesis anchor `b0`.
pub struct ChainState {
    id: ReplicaId,
    key: KeyPair,
    replicas: ReplicaConfig,
    config: ConsensusConfig,
    store: BlockStore,
    b0: BlockId,
    bexec: BlockId,
    vheight: u64,
    hqc: (BlockId, QuorumCert),
    tails: BTreeSet<BlockId>,
    /// Blocks we voted for, by height, awaiting either the three-chain rule
    /// or the optimistic commit timer.
    commit_waiting: HashMap<u64, BlockId>,
    stats: ChainStats,
}

impl ChainState {
    /// Initialize a replica with the genesis block in place.
    ///
    /// Genesis is delivered and committed from the start, carries a
    /// synthetic complete QC over its own hash, and counts every configured
    /// replica as having voted for it.
    pub fn new(
        id: ReplicaId,
        key: KeyPair,
        replicas: ReplicaConfig,
        config: ConsensusConfig,
    ) -> Self {
        let genesis = Block::genesis();
        let genesis_hash = genesis.hash();
        let mut store = BlockStore::new();
        let b0 = store.add_blk(genesis);
        {
            let entry = &mut store[b0];
            entry.delivered = true;
            entry.height = BlockHeight(0);
            entry.decision = Decision::Committed;
            entry.self_qc = Some(QuorumCert::genesis(genesis_hash));
            entry.voted = replicas.ids().collect();
        }
        debug!(replica = %id, genesis = ?genesis_hash, "chain initialized");
        Self {
            id,
            key,
            replicas,
            config,
            store,
            b0,
            bexec: b0,
            vheight: 0,
            hqc: (b0, QuorumCert::genesis(genesis_hash)),
            tails: [b0].into_iter().collect(),
            commit_waiting: HashMap::new(),
            stats: ChainStats::default(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    /// This replica's id.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// The replica set and quorum threshold.
    pub fn replicas(&self) -> &ReplicaConfig {
        &self.replicas
    }

    /// The consensus configuration.
    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// The block store.
    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut BlockStore {
        &mut self.store
    }

    /// Hash of the genesis block.
    pub fn genesis_hash(&self) -> Hash {
        self.store[self.b0].hash
    }

    /// Height of the replica's most recent vote.
    pub fn vheight(&self) -> u64 {
        self.vheight
    }

    /// Height of the committed tip.
    pub fn bexec_height(&self) -> BlockHeight {
        self.store[self.bexec].height
    }

    /// Hash of the committed tip.
    pub fn bexec_hash(&self) -> Hash {
        self.store[self.bexec].hash
    }

    /// Height of the highest observed QC's block.
    pub fn hqc_height(&self) -> BlockHeight {
        self.store[self.hqc.0].height
    }

    /// Hash of the highest observed QC's block.
    pub fn hqc_hash(&self) -> Hash {
        self.store[self.hqc.0].hash
    }

    /// The highest observed QC.
    pub fn hqc(&self) -> &QuorumCert {
        &self.hqc.1
    }

    /// Diagnostics counters.
    pub fn stats(&self) -> ChainStats {
        self.stats
    }

    /// The parent chain the pacemaker should extend: the highest tail on the
    /// high-QC branch, or the high-QC block itself when no tail extends it.
    pub fn proposal_parents(&self) -> Vec<Hash> {
        let pref = self.hqc.0;
        let pref_height = self.store[pref].height;
        let mut best: Option<BlockId> = None;
        for &tail in &self.tails {
            if self.store[tail].height < pref_height {
                continue;
            }
            if self.ancestor_at(tail, pref_height) != Some(pref) {
                continue;
            }
            let better = match best {
                Some(b) => self.store[tail].height > self.store[b].height,
                None => true,
            };
            if better {
                best = Some(tail);
            }
        }
        vec![self.store[best.unwrap_or(pref)].hash]
    }

    /// Whether `parent` has gathered enough votes for the next proposal to
    /// carry a finalized QC. The pacemaker defers its beat until this holds.
    pub fn parent_ready(&self, parent: &Hash) -> bool {
        self.store
            .find(parent)
            .and_then(|id| self.store.get(id))
            .map(|b| b.voted.len() >= self.replicas.nmajority)
            .unwrap_or(false)
    }

    fn delivered_id(&self, hash: &Hash) -> Result<BlockId, ConsensusError> {
        let id = self
            .store
            .find(hash)
            .ok_or(ConsensusError::MissingBlock(*hash))?;
        if !self.store[id].delivered {
            return Err(ConsensusError::NotDelivered(*hash));
        }
        Ok(id)
    }

    /// Walk primary parents of `from` down to `height`.
    ///
    /// Heights decrease by exactly one per step on the primary chain, so the
    /// walk lands exactly on `height`; `None` if a parent link is missing.
    fn ancestor_at(&self, from: BlockId, height: BlockHeight) -> Option<BlockId> {
        let mut b = from;
        while self.store[b].height > height {
            b = *self.store[b].parents.first()?;
        }
        Some(b)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Delivery hook
    // ═══════════════════════════════════════════════════════════════════════

    /// Wire up a fetched block whose ancestors are all delivered: resolve
    /// parent and QC references, derive the height, and adjust the tails.
    ///
    /// Returns `false` on a duplicate delivery. A missing parent is an
    /// internal error (the delivery pipeline orders ancestors first); a
    /// missing QC target after fetch is fatal.
    pub fn on_deliver_blk(&mut self, hash: &Hash) -> Result<bool, ConsensusError> {
        let id = self
            .store
            .find(hash)
            .ok_or(ConsensusError::MissingBlock(*hash))?;
        if self.store[id].delivered {
            warn!(block = ?hash, "attempt to deliver a block twice");
            return Ok(false);
        }

        let parent_hashes = self.store[id].block.parent_hashes.clone();
        if parent_hashes.is_empty() {
            return Err(ConsensusError::EmptyParents);
        }
        let mut parents = Vec::with_capacity(parent_hashes.len());
        for parent_hash in &parent_hashes {
            parents.push(self.delivered_id(parent_hash)?);
        }
        let height = BlockHeight(self.store[parents[0]].height.0 + 1);

        let qc_ref = match self.store[id].block.qc_ref_hash() {
            Some(target) => Some(
                self.store
                    .find(&target)
                    .ok_or(ConsensusError::QcRefMissing(target))?,
            ),
            None => None,
        };

        for &parent in &parents {
            self.store.add_ref(parent);
            self.tails.remove(&parent);
        }
        if let Some(target) = qc_ref {
            self.store.add_ref(target);
        }
        self.tails.insert(id);

        let entry = &mut self.store[id];
        entry.parents = parents;
        entry.height = height;
        entry.qc_ref = qc_ref;
        entry.delivered = true;
        debug!(block = ?hash, height = height.0, "delivered");
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Protocol entry points
    // ═══════════════════════════════════════════════════════════════════════

    /// Propose a block extending `parents[0]` with the given commands.
    ///
    /// If the primary parent has gathered `nmajority` votes, its finalized
    /// certificate rides along as the new block's QC. The proposer delivers
    /// the block locally, runs the commit kernel, casts a self-vote, and
    /// broadcasts the proposal.
    pub fn on_propose(
        &mut self,
        cmds: Vec<Hash>,
        parent_hashes: Vec<Hash>,
        extra: Vec<u8>,
    ) -> Result<Vec<Action>, ConsensusError> {
        if parent_hashes.is_empty() {
            return Err(ConsensusError::EmptyParents);
        }
        let mut parent_ids = Vec::with_capacity(parent_hashes.len());
        for hash in &parent_hashes {
            parent_ids.push(self.delivered_id(hash)?);
        }
        let p = parent_ids[0];

        // A block can optionally carry a QC.
        let qc = if self.store[p].voted.len() >= self.replicas.nmajority {
            self.store[p].self_qc.clone().filter(|qc| qc.is_complete())
        } else {
            None
        };

        let block = Block::new(parent_hashes, cmds, qc, extra);
        let block_hash = block.hash();
        let id = self.store.add_blk(block.clone());
        self.store[id].self_qc = Some(QuorumCert::new(block_hash));
        self.on_deliver_blk(&block_hash)?;

        let mut actions = Vec::new();
        self.update(id, &mut actions)?;

        let height = self.store[id].height;
        if height.0 <= self.vheight {
            return Err(ConsensusError::ProposalBelowVoteHeight {
                block: block_hash,
                height: height.0,
                vheight: self.vheight,
            });
        }
        self.vheight = height.0;
        self.stats.proposed += 1;
        info!(replica = %self.id, block = ?block_hash, height = height.0, "propose");

        // Self-vote before the proposal goes out.
        let vote = Vote {
            voter: self.id,
            block_hash,
            cert: PartialCert::new(&self.key, self.id, block_hash),
        };
        actions.extend(self.on_receive_vote(&vote)?);
        self.arm_commit_timer(id, height, &mut actions);

        actions.push(Action::EnqueueInternal {
            event: Event::Proposed { block_hash },
        });
        actions.push(Action::Broadcast {
            message: OutboundMessage::Proposal(Proposal {
                proposer: self.id,
                block,
            }),
        });
        Ok(actions)
    }

    /// Process a delivered proposal: run the commit kernel, then vote iff
    /// the block is above our last-voted height and extends the high-QC
    /// branch.
    pub fn on_receive_proposal(&mut self, prop: &Proposal) -> Result<Vec<Action>, ConsensusError> {
        let block_hash = prop.block.hash();
        let id = self.delivered_id(&block_hash)?;
        self.stats.proposals_received += 1;
        trace!(replica = %self.id, block = ?block_hash, proposer = %prop.proposer, "got proposal");

        let mut actions = Vec::new();
        self.update(id, &mut actions)?;

        let height = self.store[id].height;
        let mut opinion = false;
        if height.0 > self.vheight {
            let pref = self.hqc.0;
            // Vote only for blocks extending the branch of the highest QC.
            if self.ancestor_at(id, self.store[pref].height) == Some(pref) {
                opinion = true;
                self.vheight = height.0;
            }
        }
        debug!(
            replica = %self.id,
            block = ?block_hash,
            height = height.0,
            opinion,
            vheight = self.vheight,
            hqc_height = self.hqc_height().0,
            "proposal processed"
        );

        if let Some(qc_ref) = self.store[id].qc_ref {
            actions.push(Action::EnqueueInternal {
                event: Event::QcFinalized {
                    block_hash: self.store[qc_ref].hash,
                },
            });
        }

        if opinion {
            self.stats.votes_cast += 1;
            self.arm_commit_timer(id, height, &mut actions);
            let vote = Vote {
                voter: self.id,
                block_hash,
                cert: PartialCert::new(&self.key, self.id, block_hash),
            };
            actions.push(Action::Send {
                to: prop.proposer,
                message: OutboundMessage::Vote(vote),
            });
        }
        Ok(actions)
    }

    /// Count a verified vote toward the block's quorum certificate.
    ///
    /// Exactly at `nmajority` counted votes the certificate is finalized,
    /// observers are signalled, and the high QC may advance. Later votes and
    /// duplicates are dropped.
    pub fn on_receive_vote(&mut self, vote: &Vote) -> Result<Vec<Action>, ConsensusError> {
        let id = self.delivered_id(&vote.block_hash)?;
        let nmajority = self.replicas.nmajority;
        trace!(replica = %self.id, voter = %vote.voter, block = ?vote.block_hash, "got vote");

        if vote.cert.block_hash != vote.block_hash {
            warn!(voter = %vote.voter, "vote certificate attests a different block");
            return Ok(Vec::new());
        }

        let entry = &mut self.store[id];
        if entry.voted.len() >= nmajority {
            trace!(block = ?vote.block_hash, "quorum already formed");
            return Ok(Vec::new());
        }
        if entry.self_qc.is_none() {
            warn!(voter = %vote.voter, block = ?vote.block_hash, "vote for block not proposed here");
            self.stats.votes_unsolicited += 1;
            return Ok(Vec::new());
        }
        if !entry.voted.insert(vote.voter) {
            warn!(voter = %vote.voter, block = ?vote.block_hash, "duplicate vote");
            self.stats.duplicate_votes += 1;
            return Ok(Vec::new());
        }
        let reached = entry.voted.len();
        if let Some(qc) = entry.self_qc.as_mut() {
            qc.add_part(vote.voter, vote.cert.signature);
        }
        self.stats.votes_counted += 1;

        let mut actions = Vec::new();
        if reached == nmajority {
            let qc = {
                let entry = &mut self.store[id];
                let qc = entry.self_qc.as_mut().expect("checked above");
                qc.compute();
                qc.clone()
            };
            info!(replica = %self.id, block = ?vote.block_hash, "quorum certificate formed");
            actions.push(Action::EnqueueInternal {
                event: Event::QcFinalized {
                    block_hash: vote.block_hash,
                },
            });
            self.update_hqc(id, &qc, &mut actions);
        }
        Ok(actions)
    }

    /// Feed a delivered, verified status into the high-QC tracker.
    pub fn on_receive_status(&mut self, status: &Status) -> Result<Vec<Action>, ConsensusError> {
        let id = self.delivered_id(&status.hqc_hash())?;
        let mut actions = Vec::new();
        self.update_hqc(id, &status.hqc, &mut actions);
        Ok(actions)
    }

    /// Feed a delivered, verified notify into the high-QC tracker.
    pub fn on_receive_notify(&mut self, notify: &Notify) -> Result<Vec<Action>, ConsensusError> {
        let id = self.delivered_id(&notify.block_hash)?;
        let mut actions = Vec::new();
        self.update_hqc(id, &notify.qc, &mut actions);
        Ok(actions)
    }

    /// Optimistic commit: the timer for a voted block expired without the
    /// three-chain rule superseding it.
    pub fn on_commit_timeout(&mut self, height: BlockHeight) -> Result<Vec<Action>, ConsensusError> {
        let Some(id) = self.commit_waiting.remove(&height.0) else {
            return Ok(Vec::new());
        };
        if self.store[id].decision == Decision::Committed
            || self.store[id].height <= self.bexec_height()
        {
            return Ok(Vec::new());
        }
        debug!(replica = %self.id, height = height.0, "commit timer expired, committing optimistically");
        let mut actions = Vec::new();
        self.commit_chain(id, &mut actions)?;
        Ok(actions)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Commit kernel
    // ═══════════════════════════════════════════════════════════════════════

    /// The commit kernel, invoked on every delivered incoming or outgoing
    /// block. Raises the high QC, then commits `nblk`'s grandparent chain
    /// when the three-chain rule holds: the QC-referenced block's own QC
    /// must point at its direct primary parent.
    fn update(&mut self, nblk: BlockId, actions: &mut Vec<Action>) -> Result<(), ConsensusError> {
        let Some(blk) = self.store[nblk].qc_ref else {
            return Ok(());
        };
        let qc = self.store[nblk]
            .block
            .qc
            .clone()
            .expect("qc_ref implies a carried certificate");
        self.update_hqc(blk, &qc, actions);

        if self.store[blk].qc_ref.is_none() {
            return Ok(());
        }
        // The decided block could be incomplete due to pruning.
        if self.store[blk].decision == Decision::Committed {
            return Ok(());
        }
        let p = *self.store[blk]
            .parents
            .first()
            .expect("delivered non-genesis block has parents");
        if self.store[p].decision == Decision::Committed {
            return Ok(());
        }
        // Commit requires a direct parent link.
        if self.store[blk].qc_ref != Some(p) {
            return Ok(());
        }
        self.commit_chain(p, actions)
    }

    /// Replace the high QC if `blk` sits higher than the current one.
    fn update_hqc(&mut self, blk: BlockId, qc: &QuorumCert, actions: &mut Vec<Action>) {
        if self.store[blk].height > self.store[self.hqc.0].height {
            let block_hash = self.store[blk].hash;
            trace!(replica = %self.id, block = ?block_hash, height = self.store[blk].height.0, "hqc raised");
            self.hqc = (blk, qc.clone());
            actions.push(Action::EnqueueInternal {
                event: Event::HighQcUpdated { block_hash },
            });
        }
    }

    /// Commit everything from `p` down to (not including) the current tip,
    /// oldest first, then advance the tip to `p`.
    ///
    /// The walk terminating anywhere but the current tip is a safety
    /// violation and fatal.
    fn commit_chain(&mut self, p: BlockId, actions: &mut Vec<Action>) -> Result<(), ConsensusError> {
        let bexec_height = self.bexec_height();
        let mut queue = Vec::new();
        let mut b = p;
        while self.store[b].height > bexec_height {
            queue.push(b);
            b = *self.store[b]
                .parents
                .first()
                .ok_or(ConsensusError::SafetyViolation {
                    from: self.store[p].hash,
                    bexec: self.bexec_hash(),
                })?;
        }
        if b != self.bexec {
            return Err(ConsensusError::SafetyViolation {
                from: self.store[p].hash,
                bexec: self.bexec_hash(),
            });
        }

        for &id in queue.iter().rev() {
            let (hash, height, block) = {
                let entry = &mut self.store[id];
                entry.decision = Decision::Committed;
                (entry.hash, entry.height, entry.block.clone())
            };
            self.commit_waiting.remove(&height.0);
            actions.push(Action::CancelTimer {
                id: TimerId::Commit(height),
            });
            info!(replica = %self.id, block = ?hash, height = height.0, "commit");
            for (idx, cmd_hash) in block.cmds.iter().enumerate() {
                actions.push(Action::EnqueueInternal {
                    event: Event::Finalized {
                        finality: Finality {
                            replica: self.id,
                            height,
                            cmd_idx: idx as u32,
                            cmd_hash: *cmd_hash,
                            block_hash: hash,
                        },
                    },
                });
            }
            actions.push(Action::PersistBlock { height, block });
            self.stats.committed += 1;
        }
        self.bexec = p;
        actions.push(Action::PersistCheckpoint {
            bexec_height: self.bexec_height(),
            bexec_hash: self.bexec_hash(),
            hqc: self.hqc.1.clone(),
        });
        if self.config.staleness > 0 {
            self.prune(self.config.staleness);
        }
        Ok(())
    }

    fn arm_commit_timer(&mut self, id: BlockId, height: BlockHeight, actions: &mut Vec<Action>) {
        self.commit_waiting.insert(height.0, id);
        actions.push(Action::SetTimer {
            id: TimerId::Commit(height),
            duration: self.config.commit_timeout,
        });
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Pruning
    // ═══════════════════════════════════════════════════════════════════════

    /// Keep the last `staleness` blocks at or below the committed tip
    /// reachable and release everything older.
    pub fn prune(&mut self, staleness: u32) {
        if staleness == 0 {
            return;
        }
        // Walk down to the oldest block we keep.
        let mut cut = self.bexec;
        for _ in 1..staleness {
            match self.store[cut].parents.first() {
                Some(&parent) => cut = parent,
                None => return,
            }
        }
        if self.store[cut].parents.is_empty() {
            return;
        }
        let pins: BTreeSet<BlockId> = [self.b0, self.bexec, self.hqc.0].into_iter().collect();
        self.store.prune(cut, &pins);
    }
}

impl std::fmt::Debug for ChainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainState")
            .field("replica", &self.id)
            .field("vheight", &self.vheight)
            .field("bexec_height", &self.bexec_height().0)
            .field("hqc_height", &self.hqc_height().0)
            .field("tails", &self.tails.len())
            .field("blocks", &self.store.len())
            .finish()
    }
}
