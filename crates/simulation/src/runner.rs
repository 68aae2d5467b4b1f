//! Deterministic simulation runner.
//!
//! One thread owns every replica. Events are processed in
//! `(time, priority, sequence)` order; actions execute immediately: network
//! sends become future `FrameReceived` events (subject to the simulated
//! network), timers become future timer events, and delegated crypto work
//! runs inline (still deterministic) with its callback scheduled as an
//! internal event at the current instant.

use crate::event_queue::EventKey;
use crate::network::{NetworkConfig, SimulatedNetwork};
use crate::NodeIndex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, trace};
use trellis_consensus::{verify_carried_qc, ConsensusConfig};
use trellis_core::{Action, Event, RequestId, StateMachine, TimerId};
use trellis_messages::{Blame, RawFrame, Status};
use trellis_node::{NodeStateMachine, RoundRobinPacemaker};
use trellis_types::{
    Block, BlockHeight, Finality, Hash, KeyPair, ReplicaConfig, ReplicaId, ReplicaInfo,
};

/// Configuration for one simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Number of replicas.
    pub num_replicas: u32,
    /// Byzantine faults to tolerate; the quorum is `2 * nfaulty + 1`.
    pub nfaulty: usize,
    /// Commands per proposed block.
    pub blk_size: usize,
    /// Network behavior.
    pub network: NetworkConfig,
    /// Consensus parameters.
    pub consensus: ConsensusConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            num_replicas: 4,
            nfaulty: 1,
            blk_size: 1,
            network: NetworkConfig::default(),
            consensus: ConsensusConfig::default(),
        }
    }
}

/// Statistics collected during simulation.
#[derive(Debug, Default, Clone)]
pub struct SimulationStats {
    /// Total events processed.
    pub events_processed: u64,
    /// Total actions generated.
    pub actions_generated: u64,
    /// Messages scheduled for delivery.
    pub messages_sent: u64,
    /// Messages dropped due to a partition.
    pub messages_dropped_partition: u64,
    /// Messages dropped due to packet loss.
    pub messages_dropped_loss: u64,
    /// Timers set.
    pub timers_set: u64,
    /// Timers cancelled.
    pub timers_cancelled: u64,
}

impl SimulationStats {
    /// Total messages dropped (partition + packet loss).
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped_partition + self.messages_dropped_loss
    }
}

/// Deterministic simulation runner.
///
/// Given the same configuration and seed, produces identical results every
/// run.
pub struct SimulationRunner {
    nodes: Vec<NodeStateMachine>,
    queue: BTreeMap<EventKey, (NodeIndex, Event)>,
    seq: u64,
    now: Duration,
    network: SimulatedNetwork,
    rng: ChaCha8Rng,
    /// Armed timers, for cancellation: (node, timer) -> queued event key.
    timers: HashMap<(NodeIndex, TimerId), EventKey>,
    replica_config: ReplicaConfig,
    genesis_hash: Hash,
    next_request: u64,
    /// Per-node committed decisions, in commit order.
    commits: Vec<Vec<Finality>>,
    /// Per-node resolved submissions.
    responses: Vec<Vec<(RequestId, Finality)>>,
    /// Per-node persisted blocks, by height.
    persisted: Vec<BTreeMap<u64, Block>>,
    /// Per-node last persisted checkpoint.
    checkpoints: Vec<Option<(BlockHeight, Hash)>>,
    stats: SimulationStats,
}

impl SimulationRunner {
    /// Create a simulation with `config.num_replicas` fresh replicas.
    pub fn new(config: SimConfig, seed: u64) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(seed);
        let network = SimulatedNetwork::new(config.network.clone());

        // Deterministic replica identities derived from the seed.
        let keys: Vec<KeyPair> = (0..config.num_replicas)
            .map(|i| {
                let mut seed_bytes = [0u8; 32];
                let key_seed = seed.wrapping_add(i as u64).wrapping_mul(0x517c_c1b7_2722_0a95);
                seed_bytes[..8].copy_from_slice(&key_seed.to_le_bytes());
                seed_bytes[8..16].copy_from_slice(&(i as u64).to_le_bytes());
                KeyPair::from_seed(&seed_bytes)
            })
            .collect();

        let mut replica_config = ReplicaConfig::new(config.nfaulty);
        for (i, key) in keys.iter().enumerate() {
            replica_config
                .add_replica(ReplicaInfo {
                    id: ReplicaId(i as u64),
                    peer_addr: format!("127.0.0.1:{}", 7000 + i).parse().expect("valid addr"),
                    public_key: key.public_key(),
                })
                .expect("unique replica ids");
        }
        replica_config.validate().expect("replica set reaches quorum");

        let nodes: Vec<NodeStateMachine> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let pacemaker = RoundRobinPacemaker::new(replica_config.ids().collect());
                NodeStateMachine::new(
                    ReplicaId(i as u64),
                    key.clone(),
                    replica_config.clone(),
                    config.consensus.clone(),
                    config.blk_size,
                    Box::new(pacemaker),
                )
            })
            .collect();

        let genesis_hash = Block::genesis().hash();
        let n = nodes.len();
        let mut runner = Self {
            nodes,
            queue: BTreeMap::new(),
            seq: 0,
            now: Duration::ZERO,
            network,
            rng,
            timers: HashMap::new(),
            replica_config,
            genesis_hash,
            next_request: 0,
            commits: vec![Vec::new(); n],
            responses: vec![Vec::new(); n],
            persisted: vec![BTreeMap::new(); n],
            checkpoints: vec![None; n],
            stats: SimulationStats::default(),
        };

        // Arm each replica's startup timers.
        for node in 0..n as NodeIndex {
            let actions = runner.nodes[node as usize].startup_actions();
            runner.execute(node, actions);
        }
        info!(replicas = n, seed, "created simulation runner");
        runner
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inspection
    // ═══════════════════════════════════════════════════════════════════════

    /// A node, by index.
    pub fn node(&self, index: NodeIndex) -> Option<&NodeStateMachine> {
        self.nodes.get(index as usize)
    }

    /// The committed decisions of a node, in commit order.
    pub fn commits(&self, index: NodeIndex) -> &[Finality] {
        &self.commits[index as usize]
    }

    /// Resolved submissions of a node.
    pub fn responses(&self, index: NodeIndex) -> &[(RequestId, Finality)] {
        &self.responses[index as usize]
    }

    /// Blocks a node persisted, by height.
    pub fn persisted(&self, index: NodeIndex) -> &BTreeMap<u64, Block> {
        &self.persisted[index as usize]
    }

    /// The last checkpoint a node persisted.
    pub fn checkpoint(&self, index: NodeIndex) -> Option<(BlockHeight, Hash)> {
        self.checkpoints[index as usize]
    }

    /// Current simulated time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Simulation statistics.
    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    /// The network, for partition control.
    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Driving
    // ═══════════════════════════════════════════════════════════════════════

    /// Schedule an event for a node at `now + delay`.
    pub fn schedule_initial_event(&mut self, node: NodeIndex, delay: Duration, event: Event) {
        self.schedule(node, self.now + delay, event);
    }

    /// Submit a client command to a node at the current instant.
    pub fn submit_command(&mut self, node: NodeIndex, cmd_hash: Hash) -> RequestId {
        let request_id = RequestId(self.next_request);
        self.next_request += 1;
        self.schedule(
            node,
            self.now,
            Event::SubmitCommand {
                cmd_hash,
                request_id,
            },
        );
        request_id
    }

    /// Process events until the queue is empty or simulated time passes
    /// `until`.
    pub fn run_until(&mut self, until: Duration) {
        while let Some((&key, _)) = self.queue.first_key_value() {
            if key.time > until {
                break;
            }
            let (key, (node, event)) = self.queue.pop_first().expect("peeked above");
            self.now = key.time;
            self.forget_fired_timer(node, &event, key);
            trace!(node, time = ?self.now, event = event.type_name(), "processing");
            self.stats.events_processed += 1;

            let actions = match self.nodes[node as usize].handle(event) {
                Ok(actions) => actions,
                // Fatal by contract: a safety violation must halt the replica.
                Err(error) => panic!("replica {node} halted: {error}"),
            };
            self.execute(node, actions);
        }
        self.now = self.now.max(until);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Action execution
    // ═══════════════════════════════════════════════════════════════════════

    fn execute(&mut self, node: NodeIndex, actions: Vec<Action>) {
        self.stats.actions_generated += actions.len() as u64;
        for action in actions {
            match action {
                Action::Broadcast { message } => {
                    let frame = decode_own_frame(&message.encode());
                    for dest in 0..self.nodes.len() as NodeIndex {
                        if dest == node {
                            continue;
                        }
                        self.send_frame(node, dest, frame.clone());
                    }
                }
                Action::Send { to, message } => {
                    let frame = decode_own_frame(&message.encode());
                    self.send_frame(node, to.0 as NodeIndex, frame);
                }
                Action::SetTimer { id, duration } => {
                    self.cancel_timer(node, id);
                    let time = self.now + duration;
                    let key = self.schedule(node, time, timer_event(id));
                    self.timers.insert((node, id), key);
                    self.stats.timers_set += 1;
                }
                Action::CancelTimer { id } => {
                    self.cancel_timer(node, id);
                }
                Action::CancelCommitTimers => {
                    let armed: Vec<TimerId> = self
                        .timers
                        .keys()
                        .filter(|(n, id)| *n == node && matches!(id, TimerId::Commit(_)))
                        .map(|(_, id)| *id)
                        .collect();
                    for id in armed {
                        self.cancel_timer(node, id);
                    }
                }
                Action::EnqueueInternal { event } => {
                    self.schedule(node, self.now, event);
                }
                Action::VerifyBlock { block_hash, qc } => {
                    let valid =
                        verify_carried_qc(qc.as_ref(), &self.genesis_hash, &self.replica_config);
                    self.schedule(node, self.now, Event::BlockVerified { block_hash, valid });
                }
                Action::VerifyVote { vote, public_key } => {
                    let valid = vote.cert.replica == vote.voter && vote.cert.verify(&public_key);
                    self.schedule(node, self.now, Event::VoteVerified { vote, valid });
                }
                Action::VerifyStatus {
                    status,
                    from,
                    public_key,
                } => {
                    let valid = self.verify_status(&status, &public_key);
                    self.schedule(
                        node,
                        self.now,
                        Event::StatusVerified {
                            status,
                            from,
                            valid,
                        },
                    );
                }
                Action::VerifyBlame { blame, public_key } => {
                    let valid =
                        public_key.verify(&Blame::signing_bytes(blame.view), &blame.signature);
                    self.schedule(node, self.now, Event::BlameVerified { blame, valid });
                }
                Action::VerifyBlameNotify { notify } => {
                    let valid = self.verify_blame_notify(&notify);
                    self.schedule(node, self.now, Event::BlameNotifyVerified { notify, valid });
                }
                Action::VerifyNotify { notify, from } => {
                    let valid = notify.qc.block_hash == notify.block_hash
                        && verify_carried_qc(
                            Some(&notify.qc),
                            &self.genesis_hash,
                            &self.replica_config,
                        );
                    self.schedule(
                        node,
                        self.now,
                        Event::NotifyVerified {
                            notify,
                            from,
                            valid,
                        },
                    );
                }
                Action::EmitFinality { finality } => {
                    debug!(node, cmd = ?finality.cmd_hash, height = finality.height.0, "decided");
                    self.commits[node as usize].push(finality);
                }
                Action::RespondCommand {
                    request_id,
                    finality,
                } => {
                    self.responses[node as usize].push((request_id, finality));
                }
                Action::PersistBlock { height, block } => {
                    self.persisted[node as usize].insert(height.0, block);
                }
                Action::PersistCheckpoint {
                    bexec_height,
                    bexec_hash,
                    ..
                } => {
                    self.checkpoints[node as usize] = Some((bexec_height, bexec_hash));
                }
            }
        }
    }

    fn send_frame(&mut self, from: NodeIndex, to: NodeIndex, frame: RawFrame) {
        if to as usize >= self.nodes.len() {
            return;
        }
        if self.network.is_partitioned(from, to) {
            self.stats.messages_dropped_partition += 1;
            return;
        }
        if self.network.should_drop(&mut self.rng) {
            self.stats.messages_dropped_loss += 1;
            return;
        }
        let delay = self.network.delay(&mut self.rng);
        self.stats.messages_sent += 1;
        self.schedule(
            to,
            self.now + delay,
            Event::FrameReceived {
                from: ReplicaId(from as u64),
                frame,
            },
        );
    }

    fn schedule(&mut self, node: NodeIndex, time: Duration, event: Event) -> EventKey {
        let key = EventKey {
            time,
            priority: event.priority(),
            seq: self.seq,
        };
        self.seq += 1;
        self.queue.insert(key, (node, event));
        key
    }

    fn cancel_timer(&mut self, node: NodeIndex, id: TimerId) {
        if let Some(key) = self.timers.remove(&(node, id)) {
            if self.queue.remove(&key).is_some() {
                self.stats.timers_cancelled += 1;
            }
        }
    }

    /// Drop the bookkeeping entry of a timer that just fired.
    fn forget_fired_timer(&mut self, node: NodeIndex, event: &Event, key: EventKey) {
        let id = match event {
            Event::CommitTimeout { height } => TimerId::Commit(*height),
            Event::BlameTimeout => TimerId::Blame,
            Event::ViewTransitionTimeout => TimerId::ViewTransition,
            Event::StatusTimeout => TimerId::Status,
            _ => return,
        };
        if self.timers.get(&(node, id)) == Some(&key) {
            self.timers.remove(&(node, id));
        }
    }

    fn verify_status(&self, status: &Status, public_key: &trellis_types::PublicKey) -> bool {
        public_key.verify(
            &Status::signing_bytes(status.view, status.hqc_hash()),
            &status.signature,
        ) && verify_carried_qc(Some(&status.hqc), &self.genesis_hash, &self.replica_config)
    }

    fn verify_blame_notify(&self, notify: &trellis_messages::BlameNotify) -> bool {
        let mut signers = std::collections::BTreeSet::new();
        for blame in &notify.blames {
            if blame.view != notify.view {
                return false;
            }
            let Some(key) = self.replica_config.public_key(blame.replica) else {
                return false;
            };
            if !key.verify(&Blame::signing_bytes(blame.view), &blame.signature) {
                return false;
            }
            signers.insert(blame.replica);
        }
        signers.len() >= self.replica_config.nmajority
    }
}

fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::Commit(height) => Event::CommitTimeout { height },
        TimerId::Blame => Event::BlameTimeout,
        TimerId::ViewTransition => Event::ViewTransitionTimeout,
        TimerId::Status => Event::StatusTimeout,
    }
}

fn decode_own_frame(bytes: &[u8]) -> RawFrame {
    let (frame, _) = RawFrame::decode(bytes)
        .expect("self-encoded frame is well-formed")
        .expect("self-encoded frame is complete");
    frame
}
