//! The fetch/deliver pipeline.
//!
//! Every message that references a block by hash parks here until the block
//! is **delivered**: its bytes and those of its transitive ancestors are in
//! storage, its QC target is present, and its carried certificate passed
//! verification on the worker pool. Only then does the dispatcher hand the
//! parked message to the chain.
//!
//! Bookkeeping mirrors the per-hash waiting tables of the event-loop
//! formulation:
//!
//! - `fetch_waiting`: at most one outstanding fetch per block hash. The
//!   first reference sends a `ReqBlock` to the source hint; later callers
//!   attach to the same entry.
//! - `delivery_waiting`: at most one delivery entry per block hash, holding
//!   the unresolved parents, the pending QC-target fetch, the verification
//!   state, the dependent children, and the parked messages.
//!
//! Completion propagates upward through the `children` sets; failure
//! (an invalid certificate) propagates the same way, dropping every parked
//! message attached to the failed subtree.

use crate::chain::ChainState;
use crate::ConsensusError;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, trace, warn};
use trellis_core::{Action, OutboundMessage};
use trellis_messages::{Notify, Proposal, ReqBlock, Status, Vote};
use trellis_types::{Block, Hash, ReplicaId};

/// A message waiting for a block to be delivered.
#[derive(Debug, Clone)]
pub enum Parked {
    /// A proposal for the block.
    Proposal(Proposal),
    /// A vote referencing the block.
    Vote(Vote),
    /// A status whose hqc references the block.
    Status {
        /// The status.
        status: Status,
        /// The peer it came from.
        from: ReplicaId,
    },
    /// A notify referencing the block.
    Notify {
        /// The notify.
        notify: Notify,
        /// The peer it came from.
        from: ReplicaId,
    },
}

/// A block that completed delivery, with the messages parked on it.
#[derive(Debug)]
pub struct Delivered {
    /// The delivered block.
    pub block_hash: Hash,
    /// Messages to dispatch now.
    pub parked: Vec<Parked>,
}

/// Pipeline statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeliveryStats {
    /// Block fetches resolved.
    pub fetched: u64,
    /// Blocks fully delivered through the pipeline.
    pub delivered: u64,
    /// Deliveries rejected by verification.
    pub failed: u64,
    /// Parked messages dropped by failed deliveries.
    pub parked_dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitingBytes,
    Expanded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verify {
    Pending,
    Passed,
}

#[derive(Debug)]
struct DeliveryEntry {
    stage: Stage,
    /// Source hint for recursive fetches.
    source: ReplicaId,
    pending_parents: BTreeSet<Hash>,
    awaiting_qc_fetch: Option<Hash>,
    verify: Verify,
    children: BTreeSet<Hash>,
    parked: Vec<Parked>,
}

#[derive(Debug, Default)]
struct FetchEntry {
    sources: Vec<ReplicaId>,
    /// Delivery entries waiting on these bytes: the block's own delivery
    /// and/or deliveries whose QC target this is.
    waiters: BTreeSet<Hash>,
}

enum Work {
    Drive(Hash),
    TryComplete(Hash),
}

/// The pipeline state machine.
#[derive(Debug, Default)]
pub struct DeliveryState {
    fetch_waiting: HashMap<Hash, FetchEntry>,
    delivery_waiting: HashMap<Hash, DeliveryEntry>,
    stats: DeliveryStats,
}

impl DeliveryState {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pipeline statistics.
    pub fn stats(&self) -> DeliveryStats {
        self.stats
    }

    /// Number of outstanding fetches.
    pub fn fetches_outstanding(&self) -> usize {
        self.fetch_waiting.len()
    }

    /// Number of outstanding deliveries.
    pub fn deliveries_outstanding(&self) -> usize {
        self.delivery_waiting.len()
    }

    /// Park a message until `block_hash` is delivered.
    ///
    /// If the block is already delivered the message comes straight back in
    /// the result. Otherwise the pipeline attaches to (or registers) the
    /// delivery entry and drives fetching.
    pub fn deliver_then(
        &mut self,
        chain: &mut ChainState,
        block_hash: Hash,
        source: ReplicaId,
        parked: Parked,
    ) -> Result<(Vec<Action>, Vec<Delivered>), ConsensusError> {
        if chain.store().is_delivered(&block_hash) {
            return Ok((
                Vec::new(),
                vec![Delivered {
                    block_hash,
                    parked: vec![parked],
                }],
            ));
        }
        match self.delivery_waiting.get_mut(&block_hash) {
            Some(entry) => {
                entry.parked.push(parked);
                Ok((Vec::new(), Vec::new()))
            }
            None => {
                self.delivery_waiting.insert(
                    block_hash,
                    DeliveryEntry {
                        stage: Stage::AwaitingBytes,
                        source,
                        pending_parents: BTreeSet::new(),
                        awaiting_qc_fetch: None,
                        verify: Verify::Pending,
                        children: BTreeSet::new(),
                        parked: vec![parked],
                    },
                );
                self.run(chain, Work::Drive(block_hash))
            }
        }
    }

    /// Record fetched block bytes (a `RespBlock` entry or the block carried
    /// by a proposal) and advance everything waiting on them.
    pub fn on_block_fetched(
        &mut self,
        chain: &mut ChainState,
        block: Block,
        from: ReplicaId,
    ) -> Result<(Vec<Action>, Vec<Delivered>), ConsensusError> {
        let block_hash = block.hash();
        chain.store_mut().add_blk(block);

        let Some(fetch) = self.fetch_waiting.remove(&block_hash) else {
            // Nothing was waiting; the bytes are now cached for later use.
            trace!(block = ?block_hash, peer = %from, "unsolicited block");
            return Ok((Vec::new(), Vec::new()));
        };
        self.stats.fetched += 1;
        debug!(block = ?block_hash, peer = %from, waiters = fetch.waiters.len(), "fetched");

        let mut actions = Vec::new();
        let mut delivered = Vec::new();
        for waiter in fetch.waiters {
            let work = if waiter == block_hash {
                Work::Drive(waiter)
            } else {
                // A delivery was waiting on this hash as its QC target.
                if let Some(entry) = self.delivery_waiting.get_mut(&waiter) {
                    if entry.awaiting_qc_fetch == Some(block_hash) {
                        entry.awaiting_qc_fetch = None;
                    }
                }
                Work::TryComplete(waiter)
            };
            let (a, d) = self.run(chain, work)?;
            actions.extend(a);
            delivered.extend(d);
        }
        Ok((actions, delivered))
    }

    /// Feed back a verification result from the worker pool.
    pub fn on_block_verified(
        &mut self,
        chain: &mut ChainState,
        block_hash: Hash,
        valid: bool,
    ) -> Result<(Vec<Action>, Vec<Delivered>), ConsensusError> {
        if !valid {
            self.fail(block_hash);
            return Ok((Vec::new(), Vec::new()));
        }
        let Some(entry) = self.delivery_waiting.get_mut(&block_hash) else {
            return Ok((Vec::new(), Vec::new()));
        };
        entry.verify = Verify::Passed;
        self.run(chain, Work::TryComplete(block_hash))
    }

    /// Collect the locally fetched blocks out of a request, in request
    /// order. Unknown hashes are skipped.
    pub fn serve_blocks(&self, chain: &ChainState, req: &ReqBlock) -> Vec<Block> {
        req.block_hashes
            .iter()
            .filter_map(|hash| {
                let id = chain.store().find(hash)?;
                Some(chain.store()[id].block.clone())
            })
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Internals
    // ═══════════════════════════════════════════════════════════════════════

    fn run(
        &mut self,
        chain: &mut ChainState,
        start: Work,
    ) -> Result<(Vec<Action>, Vec<Delivered>), ConsensusError> {
        let mut actions = Vec::new();
        let mut delivered = Vec::new();
        let mut work = VecDeque::from([start]);
        while let Some(item) = work.pop_front() {
            match item {
                Work::Drive(hash) => self.drive(chain, hash, &mut actions, &mut work),
                Work::TryComplete(hash) => {
                    self.try_complete(chain, hash, &mut delivered, &mut work)?
                }
            }
        }
        Ok((actions, delivered))
    }

    /// Move a delivery entry forward: fetch its bytes, or expand it once
    /// the bytes are present.
    fn drive(
        &mut self,
        chain: &mut ChainState,
        block_hash: Hash,
        actions: &mut Vec<Action>,
        work: &mut VecDeque<Work>,
    ) {
        let Some(entry) = self.delivery_waiting.get(&block_hash) else {
            return;
        };
        if entry.stage == Stage::Expanded {
            return;
        }
        let source = entry.source;
        if !chain.store().is_fetched(&block_hash) {
            self.ensure_fetch(block_hash, source, block_hash, actions);
            return;
        }

        // Bytes are present: resolve what this block needs.
        let id = chain.store().find(&block_hash).expect("fetched above");
        let parent_hashes = chain.store()[id].block.parent_hashes.clone();
        let qc_target = chain.store()[id].block.qc_ref_hash();
        let qc = chain.store()[id].block.qc.clone();

        let mut pending_parents = BTreeSet::new();
        for parent in &parent_hashes {
            if !chain.store().is_delivered(parent) {
                pending_parents.insert(*parent);
            }
        }
        let awaiting_qc_fetch = match qc_target {
            Some(target) if !chain.store().is_fetched(&target) => {
                self.ensure_fetch(target, source, block_hash, actions);
                Some(target)
            }
            _ => None,
        };

        {
            let entry = self
                .delivery_waiting
                .get_mut(&block_hash)
                .expect("checked above");
            entry.stage = Stage::Expanded;
            entry.pending_parents = pending_parents.clone();
            entry.awaiting_qc_fetch = awaiting_qc_fetch;
            entry.verify = Verify::Pending;
        }

        // Recursively deliver unresolved parents, registering this block as
        // their dependent child.
        for parent in pending_parents {
            match self.delivery_waiting.get_mut(&parent) {
                Some(parent_entry) => {
                    parent_entry.children.insert(block_hash);
                }
                None => {
                    self.delivery_waiting.insert(
                        parent,
                        DeliveryEntry {
                            stage: Stage::AwaitingBytes,
                            source,
                            pending_parents: BTreeSet::new(),
                            awaiting_qc_fetch: None,
                            verify: Verify::Pending,
                            children: [block_hash].into_iter().collect(),
                            parked: Vec::new(),
                        },
                    );
                    work.push_back(Work::Drive(parent));
                }
            }
        }

        // Certificate verification on the worker pool; the callback
        // completes the delivery.
        actions.push(Action::VerifyBlock { block_hash, qc });
    }

    /// Register interest in a block's bytes, requesting them from `source`
    /// if this is the first reference.
    fn ensure_fetch(
        &mut self,
        block_hash: Hash,
        source: ReplicaId,
        waiter: Hash,
        actions: &mut Vec<Action>,
    ) {
        match self.fetch_waiting.get_mut(&block_hash) {
            Some(entry) => {
                entry.waiters.insert(waiter);
                if !entry.sources.contains(&source) {
                    entry.sources.push(source);
                }
            }
            None => {
                self.fetch_waiting.insert(
                    block_hash,
                    FetchEntry {
                        sources: vec![source],
                        waiters: [waiter].into_iter().collect(),
                    },
                );
                trace!(block = ?block_hash, peer = %source, "requesting block");
                actions.push(Action::Send {
                    to: source,
                    message: OutboundMessage::ReqBlock(ReqBlock {
                        block_hashes: vec![block_hash],
                    }),
                });
            }
        }
    }

    /// Complete a delivery whose prerequisites are all satisfied, then
    /// propagate to dependent children.
    fn try_complete(
        &mut self,
        chain: &mut ChainState,
        block_hash: Hash,
        delivered: &mut Vec<Delivered>,
        work: &mut VecDeque<Work>,
    ) -> Result<(), ConsensusError> {
        let ready = match self.delivery_waiting.get(&block_hash) {
            Some(entry) => {
                entry.stage == Stage::Expanded
                    && entry.pending_parents.is_empty()
                    && entry.awaiting_qc_fetch.is_none()
                    && entry.verify == Verify::Passed
            }
            None => false,
        };
        if !ready {
            return Ok(());
        }

        chain.on_deliver_blk(&block_hash)?;
        let entry = self
            .delivery_waiting
            .remove(&block_hash)
            .expect("checked above");
        self.stats.delivered += 1;
        delivered.push(Delivered {
            block_hash,
            parked: entry.parked,
        });

        for child in entry.children {
            if let Some(child_entry) = self.delivery_waiting.get_mut(&child) {
                child_entry.pending_parents.remove(&block_hash);
                work.push_back(Work::TryComplete(child));
            }
        }
        Ok(())
    }

    /// Reject a delivery and everything stacked on top of it.
    fn fail(&mut self, block_hash: Hash) {
        let mut stack = vec![block_hash];
        while let Some(hash) = stack.pop() {
            let Some(entry) = self.delivery_waiting.remove(&hash) else {
                continue;
            };
            self.stats.failed += 1;
            self.stats.parked_dropped += entry.parked.len() as u64;
            warn!(
                block = ?hash,
                parked = entry.parked.len(),
                children = entry.children.len(),
                "delivery rejected, dropping dependents"
            );
            // Dependent children can never complete.
            stack.extend(entry.children);
            // Detach from any fetch this entry was waiting on.
            if let Some(target) = entry.awaiting_qc_fetch {
                self.detach_fetch_waiter(target, hash);
            }
            self.detach_fetch_waiter(hash, hash);
        }
    }

    fn detach_fetch_waiter(&mut self, fetched: Hash, waiter: Hash) {
        if let Some(entry) = self.fetch_waiting.get_mut(&fetched) {
            entry.waiters.remove(&waiter);
            if entry.waiters.is_empty() {
                self.fetch_waiting.remove(&fetched);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConsensusConfig;
    use trellis_types::{KeyPair, ReplicaConfig, ReplicaInfo};

    fn new_chain() -> ChainState {
        let mut config = ReplicaConfig::new(1);
        let mut key0 = None;
        for i in 0..4u64 {
            let key = KeyPair::from_seed(&[i as u8 + 1; 32]);
            if i == 0 {
                key0 = Some(key.clone());
            }
            config
                .add_replica(ReplicaInfo {
                    id: ReplicaId(i),
                    peer_addr: format!("127.0.0.1:{}", 9200 + i).parse().unwrap(),
                    public_key: key.public_key(),
                })
                .unwrap();
        }
        ChainState::new(
            ReplicaId(0),
            key0.unwrap(),
            config,
            ConsensusConfig::default(),
        )
    }

    fn chain_of(chain: &ChainState, n: u8) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut parent = chain.genesis_hash();
        for i in 0..n {
            let block = Block::new(vec![parent], vec![Hash::digest(&[i])], None, Vec::new());
            parent = block.hash();
            blocks.push(block);
        }
        blocks
    }

    fn proposal(block: &Block) -> Parked {
        Parked::Proposal(Proposal {
            proposer: ReplicaId(1),
            block: block.clone(),
        })
    }

    #[test]
    fn delivered_block_resolves_immediately() {
        let mut chain = new_chain();
        let mut pipeline = DeliveryState::new();
        let genesis = chain.genesis_hash();
        let vote = Parked::Vote(Vote {
            voter: ReplicaId(1),
            block_hash: genesis,
            cert: trellis_types::PartialCert::new(
                &KeyPair::from_seed(&[2u8; 32]),
                ReplicaId(1),
                genesis,
            ),
        });
        let (actions, delivered) = pipeline
            .deliver_then(&mut chain, genesis, ReplicaId(1), vote)
            .unwrap();
        assert!(actions.is_empty());
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].parked.len(), 1);
    }

    #[test]
    fn missing_block_is_fetched_once() {
        let mut chain = new_chain();
        let mut pipeline = DeliveryState::new();
        let blocks = chain_of(&chain, 1);
        let hash = blocks[0].hash();

        let vote = |voter: u64| {
            Parked::Vote(Vote {
                voter: ReplicaId(voter),
                block_hash: hash,
                cert: trellis_types::PartialCert::new(
                    &KeyPair::from_seed(&[voter as u8 + 1; 32]),
                    ReplicaId(voter),
                    hash,
                ),
            })
        };

        let (actions, _) = pipeline
            .deliver_then(&mut chain, hash, ReplicaId(1), vote(1))
            .unwrap();
        let req_count = actions
            .iter()
            .filter(|a| matches!(a, Action::Send { .. }))
            .count();
        assert_eq!(req_count, 1, "first reference requests the block");

        // A second caller attaches to the same entry; no new request.
        let (actions, _) = pipeline
            .deliver_then(&mut chain, hash, ReplicaId(2), vote(2))
            .unwrap();
        assert!(actions.is_empty());
        assert_eq!(pipeline.fetches_outstanding(), 1);
        assert_eq!(pipeline.deliveries_outstanding(), 1);
    }

    #[test]
    fn out_of_order_ancestors_deliver_in_topological_order() {
        let mut chain = new_chain();
        let mut pipeline = DeliveryState::new();
        let blocks = chain_of(&chain, 3);
        let b3_hash = blocks[2].hash();

        // B3 arrives first (e.g. inside a proposal); B1 and B2 are unknown.
        let (actions, delivered) = pipeline
            .on_block_fetched(&mut chain, blocks[2].clone(), ReplicaId(1))
            .unwrap();
        assert!(actions.is_empty() && delivered.is_empty());
        let (actions, delivered) = pipeline
            .deliver_then(&mut chain, b3_hash, ReplicaId(1), proposal(&blocks[2]))
            .unwrap();
        assert!(delivered.is_empty());
        // B3 expanded: fetch of B2 requested, B3's certificate queued.
        assert!(actions.iter().any(|a| matches!(a, Action::Send { .. })));

        // B2 arrives; it needs B1.
        let (actions, delivered) = pipeline
            .on_block_fetched(&mut chain, blocks[1].clone(), ReplicaId(1))
            .unwrap();
        assert!(delivered.is_empty());
        assert!(actions.iter().any(|a| matches!(a, Action::Send { .. })));

        // B1 arrives and verifies; then B2, then B3, bottom-up.
        let (_, delivered) = pipeline
            .on_block_fetched(&mut chain, blocks[0].clone(), ReplicaId(1))
            .unwrap();
        assert!(delivered.is_empty(), "verification still pending");

        let (_, d1) = pipeline
            .on_block_verified(&mut chain, blocks[0].hash(), true)
            .unwrap();
        assert_eq!(d1.len(), 1);
        assert_eq!(d1[0].block_hash, blocks[0].hash());

        let (_, d2) = pipeline
            .on_block_verified(&mut chain, blocks[1].hash(), true)
            .unwrap();
        assert_eq!(d2.len(), 1);

        let (_, d3) = pipeline
            .on_block_verified(&mut chain, b3_hash, true)
            .unwrap();
        assert_eq!(d3.len(), 1);
        assert_eq!(d3[0].parked.len(), 1, "the proposal comes back");
        assert!(chain.store().is_delivered(&b3_hash));
        assert_eq!(pipeline.deliveries_outstanding(), 0);
        assert_eq!(pipeline.fetches_outstanding(), 0);
    }

    #[test]
    fn failed_verification_drops_dependents() {
        let mut chain = new_chain();
        let mut pipeline = DeliveryState::new();
        let blocks = chain_of(&chain, 2);

        pipeline
            .on_block_fetched(&mut chain, blocks[1].clone(), ReplicaId(1))
            .unwrap();
        pipeline
            .deliver_then(
                &mut chain,
                blocks[1].hash(),
                ReplicaId(1),
                proposal(&blocks[1]),
            )
            .unwrap();
        pipeline
            .on_block_fetched(&mut chain, blocks[0].clone(), ReplicaId(1))
            .unwrap();

        // The parent's certificate is rejected: both deliveries die.
        let (_, delivered) = pipeline
            .on_block_verified(&mut chain, blocks[0].hash(), false)
            .unwrap();
        assert!(delivered.is_empty());
        assert_eq!(pipeline.deliveries_outstanding(), 0);
        assert_eq!(pipeline.stats().failed, 2);
        assert_eq!(pipeline.stats().parked_dropped, 1);
        assert!(!chain.store().is_delivered(&blocks[1].hash()));
    }

    #[test]
    fn serve_blocks_skips_unknown_hashes() {
        let mut chain = new_chain();
        let mut pipeline = DeliveryState::new();
        let blocks = chain_of(&chain, 1);
        pipeline
            .on_block_fetched(&mut chain, blocks[0].clone(), ReplicaId(1))
            .unwrap();

        let req = ReqBlock {
            block_hashes: vec![blocks[0].hash(), Hash::digest(b"unknown")],
        };
        let served = pipeline.serve_blocks(&chain, &req);
        assert_eq!(served.len(), 1);
        assert_eq!(served[0].hash(), blocks[0].hash());
    }

    #[test]
    fn qc_target_is_fetched_before_delivery() {
        let mut chain = new_chain();
        let mut pipeline = DeliveryState::new();
        let blocks = chain_of(&chain, 1);
        let b1 = &blocks[0];
        let b1_hash = b1.hash();

        // B2 carries a QC over B1 and also descends from it.
        let mut qc = trellis_types::QuorumCert::new(b1_hash);
        qc.compute();
        let b2 = Block::new(vec![b1_hash], vec![], Some(qc), Vec::new());
        let b2_hash = b2.hash();

        pipeline
            .on_block_fetched(&mut chain, b2.clone(), ReplicaId(2))
            .unwrap();
        let (actions, _) = pipeline
            .deliver_then(&mut chain, b2_hash, ReplicaId(2), proposal(&b2))
            .unwrap();
        // One fetch serves both the parent delivery and the QC target.
        let reqs: Vec<_> = actions
            .iter()
            .filter(|a| matches!(a, Action::Send { .. }))
            .collect();
        assert_eq!(reqs.len(), 1);
        assert_eq!(pipeline.fetches_outstanding(), 1);

        pipeline
            .on_block_fetched(&mut chain, b1.clone(), ReplicaId(2))
            .unwrap();
        pipeline.on_block_verified(&mut chain, b1_hash, true).unwrap();
        let (_, delivered) = pipeline.on_block_verified(&mut chain, b2_hash, true).unwrap();
        assert_eq!(delivered.len(), 1);
        assert!(chain.store().is_delivered(&b2_hash));
    }
}
