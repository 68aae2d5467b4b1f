//! The composed replica state machine and message dispatcher.

use crate::Pacemaker;
use tracing::{debug, trace, warn};
use trellis_consensus::{
    ChainState, ConsensusConfig, ConsensusError, Decision, Delivered, DeliveryState, Parked,
    ViewState,
};
use trellis_core::{Action, Event, OutboundMessage, StateMachine};
use trellis_mempool::CommandPool;
use trellis_messages::{
    Blame, BlameNotify, NewView, Notify, Opcode, Proposal, RawFrame, ReqBlock, RespBlock, Status,
    Vote,
};
use trellis_types::{KeyPair, ReplicaConfig, ReplicaId};

/// A full replica: chain + delivery + view change + command pool, driven by
/// events and a pacemaker.
pub struct NodeStateMachine {
    id: ReplicaId,
    chain: ChainState,
    delivery: DeliveryState,
    view: ViewState,
    mempool: CommandPool,
    pacemaker: Box<dyn Pacemaker>,
    /// A beat arrived while the proposal parent had no QC yet; retry when
    /// the next certificate finalizes.
    pending_beat: bool,
}

impl NodeStateMachine {
    /// Assemble a replica.
    pub fn new(
        id: ReplicaId,
        key: KeyPair,
        replicas: ReplicaConfig,
        config: ConsensusConfig,
        blk_size: usize,
        pacemaker: Box<dyn Pacemaker>,
    ) -> Self {
        let view = ViewState::new(id, key.clone(), replicas.nmajority, config.clone());
        let chain = ChainState::new(id, key, replicas, config);
        Self {
            id,
            chain,
            delivery: DeliveryState::new(),
            view,
            mempool: CommandPool::new(blk_size),
            pacemaker,
            pending_beat: false,
        }
    }

    /// This replica's id.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// The chain state.
    pub fn chain(&self) -> &ChainState {
        &self.chain
    }

    /// The delivery pipeline.
    pub fn delivery(&self) -> &DeliveryState {
        &self.delivery
    }

    /// The view-change state.
    pub fn view(&self) -> &ViewState {
        &self.view
    }

    /// The command pool.
    pub fn mempool(&self) -> &CommandPool {
        &self.mempool
    }

    /// Timers to arm when the replica starts.
    pub fn startup_actions(&self) -> Vec<Action> {
        self.view.startup_actions()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Dispatcher
    // ═══════════════════════════════════════════════════════════════════════

    /// Second-stage parse and routing of an inbound frame.
    fn on_frame(
        &mut self,
        from: ReplicaId,
        frame: RawFrame,
    ) -> Result<Vec<Action>, ConsensusError> {
        if self.chain.replicas().replica(from).is_none() {
            warn!(peer = %from, "frame from unknown peer");
            return Ok(Vec::new());
        }

        macro_rules! parse {
            ($ty:ty) => {
                match frame.parse::<$ty>() {
                    Ok(message) => message,
                    Err(error) => {
                        warn!(peer = %from, %error, "malformed message");
                        return Ok(Vec::new());
                    }
                }
            };
        }

        match frame.opcode {
            Opcode::Propose => {
                let prop = parse!(Proposal);
                let block_hash = prop.block.hash();
                trace!(peer = %from, block = ?block_hash, "proposal frame");
                // The proposal carries the block bytes; they may also settle
                // an outstanding fetch.
                let (mut actions, delivered) =
                    self.delivery
                        .on_block_fetched(&mut self.chain, prop.block.clone(), from)?;
                actions.extend(self.dispatch_delivered(delivered)?);
                let (more, delivered) = self.delivery.deliver_then(
                    &mut self.chain,
                    block_hash,
                    from,
                    Parked::Proposal(prop),
                )?;
                actions.extend(more);
                actions.extend(self.dispatch_delivered(delivered)?);
                Ok(actions)
            }
            Opcode::Vote => {
                let vote = parse!(Vote);
                let (mut actions, delivered) = self.delivery.deliver_then(
                    &mut self.chain,
                    vote.block_hash,
                    from,
                    Parked::Vote(vote),
                )?;
                actions.extend(self.dispatch_delivered(delivered)?);
                Ok(actions)
            }
            Opcode::ReqBlock => {
                let req = parse!(ReqBlock);
                let blocks = self.delivery.serve_blocks(&self.chain, &req);
                debug!(peer = %from, requested = req.block_hashes.len(), served = blocks.len(), "serving blocks");
                if blocks.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![Action::Send {
                    to: from,
                    message: OutboundMessage::RespBlock(RespBlock { blocks }),
                }])
            }
            Opcode::RespBlock => {
                let resp = parse!(RespBlock);
                let mut actions = Vec::new();
                for block in resp.blocks {
                    let (more, delivered) =
                        self.delivery.on_block_fetched(&mut self.chain, block, from)?;
                    actions.extend(more);
                    actions.extend(self.dispatch_delivered(delivered)?);
                }
                Ok(actions)
            }
            Opcode::Status => {
                let status = parse!(Status);
                self.park_status(status, from)
            }
            Opcode::NewView => {
                let new_view = parse!(NewView);
                self.park_status(new_view.0, from)
            }
            Opcode::Blame => {
                let blame = parse!(Blame);
                let Some(&public_key) = self.chain.replicas().public_key(blame.replica) else {
                    warn!(replica = %blame.replica, "blame from unknown replica");
                    return Ok(Vec::new());
                };
                Ok(vec![Action::VerifyBlame { blame, public_key }])
            }
            Opcode::BlameNotify => {
                let notify = parse!(BlameNotify);
                Ok(vec![Action::VerifyBlameNotify { notify }])
            }
            Opcode::Notify => {
                let notify = parse!(Notify);
                let (mut actions, delivered) = self.delivery.deliver_then(
                    &mut self.chain,
                    notify.block_hash,
                    from,
                    Parked::Notify { notify, from },
                )?;
                actions.extend(self.dispatch_delivered(delivered)?);
                Ok(actions)
            }
        }
    }

    fn park_status(
        &mut self,
        status: Status,
        from: ReplicaId,
    ) -> Result<Vec<Action>, ConsensusError> {
        let (mut actions, delivered) = self.delivery.deliver_then(
            &mut self.chain,
            status.hqc_hash(),
            from,
            Parked::Status { status, from },
        )?;
        actions.extend(self.dispatch_delivered(delivered)?);
        Ok(actions)
    }

    /// Route messages whose referenced block finished delivery.
    fn dispatch_delivered(
        &mut self,
        delivered: Vec<Delivered>,
    ) -> Result<Vec<Action>, ConsensusError> {
        let mut actions = Vec::new();
        for batch in delivered {
            for parked in batch.parked {
                match parked {
                    Parked::Proposal(prop) => {
                        // The block's certificate was verified during
                        // delivery; the chain can act on it directly.
                        actions.extend(self.chain.on_receive_proposal(&prop)?);
                    }
                    Parked::Vote(vote) => {
                        let Some(&public_key) = self.chain.replicas().public_key(vote.voter)
                        else {
                            warn!(voter = %vote.voter, "vote from unknown replica");
                            continue;
                        };
                        actions.push(Action::VerifyVote { vote, public_key });
                    }
                    Parked::Status { status, from } => {
                        let Some(&public_key) =
                            self.chain.replicas().public_key(status.replica)
                        else {
                            warn!(replica = %status.replica, "status from unknown replica");
                            continue;
                        };
                        actions.push(Action::VerifyStatus {
                            status,
                            from,
                            public_key,
                        });
                    }
                    Parked::Notify { notify, from } => {
                        // A notify for an already-committed block needs no
                        // certificate check.
                        let committed = self
                            .chain
                            .store()
                            .find(&notify.block_hash)
                            .map(|id| self.chain.store()[id].decision == Decision::Committed)
                            .unwrap_or(false);
                        if committed {
                            actions.extend(self.chain.on_receive_notify(&notify)?);
                        } else {
                            actions.push(Action::VerifyNotify { notify, from });
                        }
                    }
                }
            }
        }
        Ok(actions)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Beats
    // ═══════════════════════════════════════════════════════════════════════

    /// Resolve a beat: propose if we lead the current view and the parent
    /// has a finalized certificate.
    fn on_beat(&mut self) -> Result<Vec<Action>, ConsensusError> {
        let view = self.view.view();
        let proposer = self.pacemaker.beat(view);
        if proposer != self.id {
            trace!(replica = %self.id, view, leader = %proposer, "not the proposer");
            return Ok(Vec::new());
        }
        let parents = self.pacemaker.parents(&self.chain);
        if !self.chain.parent_ready(&parents[0]) {
            // Wait for the parent's QC; QcFinalized retries the beat.
            self.pending_beat = true;
            trace!(replica = %self.id, parent = ?parents[0], "beat deferred until parent certifies");
            return Ok(Vec::new());
        }
        let Some(batch) = self.mempool.take_batch() else {
            return Ok(Vec::new());
        };
        self.pending_beat = false;
        self.chain.on_propose(batch, parents, Vec::new())
    }
}

impl StateMachine for NodeStateMachine {
    type Error = ConsensusError;

    fn handle(&mut self, event: Event) -> Result<Vec<Action>, ConsensusError> {
        match event {
            Event::FrameReceived { from, frame } => self.on_frame(from, frame),

            Event::SubmitCommand {
                cmd_hash,
                request_id,
            } => Ok(self.mempool.on_submit(cmd_hash, request_id)),

            Event::Beat => self.on_beat(),

            Event::QcFinalized { block_hash } => {
                trace!(replica = %self.id, block = ?block_hash, "qc finalized");
                if self.pending_beat || self.mempool.batch_ready() {
                    self.pending_beat = false;
                    Ok(vec![Action::EnqueueInternal { event: Event::Beat }])
                } else {
                    Ok(Vec::new())
                }
            }

            Event::HighQcUpdated { .. } | Event::Proposed { .. } => Ok(self.view.on_progress()),

            Event::Finalized { finality } => Ok(self.mempool.on_finality(finality)),

            Event::CommitTimeout { height } => self.chain.on_commit_timeout(height),

            Event::BlameTimeout => Ok(self.view.on_blame_timeout()),

            Event::ViewTransitionTimeout => {
                let next_leader = self.pacemaker.proposer(self.view.view() + 1);
                Ok(self.view.on_view_transition_timeout(&self.chain, next_leader))
            }

            Event::StatusTimeout => {
                let proposer = self.pacemaker.proposer(self.view.view());
                Ok(self.view.on_status_timeout(&self.chain, proposer))
            }

            Event::BlockVerified { block_hash, valid } => {
                let (mut actions, delivered) =
                    self.delivery
                        .on_block_verified(&mut self.chain, block_hash, valid)?;
                actions.extend(self.dispatch_delivered(delivered)?);
                Ok(actions)
            }

            Event::VoteVerified { vote, valid } => {
                if !valid {
                    warn!(voter = %vote.voter, block = ?vote.block_hash, "invalid vote signature");
                    return Ok(Vec::new());
                }
                self.chain.on_receive_vote(&vote)
            }

            Event::StatusVerified {
                status,
                from,
                valid,
            } => {
                if !valid {
                    warn!(peer = %from, "invalid status signature");
                    return Ok(Vec::new());
                }
                self.chain.on_receive_status(&status)
            }

            Event::BlameVerified { blame, valid } => {
                if !valid {
                    warn!(replica = %blame.replica, "invalid blame signature");
                    return Ok(Vec::new());
                }
                Ok(self.view.on_blame(&blame))
            }

            Event::BlameNotifyVerified { notify, valid } => {
                if !valid {
                    warn!(view = notify.view, "invalid blame notify");
                    return Ok(Vec::new());
                }
                Ok(self.view.on_blame_notify(&notify))
            }

            Event::NotifyVerified {
                notify,
                from,
                valid,
            } => {
                if !valid {
                    warn!(peer = %from, "invalid notify certificate");
                    return Ok(Vec::new());
                }
                self.chain.on_receive_notify(&notify)
            }
        }
    }
}

impl std::fmt::Debug for NodeStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStateMachine")
            .field("replica", &self.id)
            .field("chain", &self.chain)
            .field("view", &self.view)
            .field("mempool", &self.mempool)
            .finish()
    }
}
