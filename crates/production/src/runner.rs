//! The production event loop.

use crate::metrics;
use crate::network::TcpMesh;
use crate::storage::RocksDbStorage;
use crate::thread_pools::ThreadPoolManager;
use crate::timers::TimerManager;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, trace, warn};
use trellis_consensus::{verify_carried_qc, ConsensusError};
use trellis_core::{Action, Event, RequestId, StateMachine};
use trellis_messages::{Blame, Status};
use trellis_node::NodeStateMachine;
use trellis_types::{Block, Finality, Hash, ReplicaConfig};

/// Errors that stop the runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// A safety rule was violated; the replica must not continue.
    #[error("consensus halted: {0}")]
    Consensus(#[from] ConsensusError),

    /// Persistence failed.
    #[error("storage failed: {0}")]
    Storage(#[from] crate::storage::StorageError),

    /// The submitter's channel closed before a decision arrived.
    #[error("replica shut down before the command was decided")]
    ShutDown,
}

/// Client-facing handle: submit commands and await their decisions.
#[derive(Clone)]
pub struct NodeHandle {
    event_tx: mpsc::Sender<Event>,
    next_request: Arc<AtomicU64>,
    pending: Arc<Mutex<HashMap<RequestId, oneshot::Sender<Finality>>>>,
}

impl NodeHandle {
    /// Submit a command hash and wait for its commit decision.
    pub async fn submit(&self, cmd_hash: Hash) -> Result<Finality, RunnerError> {
        let request_id = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);
        if self
            .event_tx
            .send(Event::SubmitCommand {
                cmd_hash,
                request_id,
            })
            .await
            .is_err()
        {
            self.pending.lock().remove(&request_id);
            return Err(RunnerError::ShutDown);
        }
        rx.await.map_err(|_| RunnerError::ShutDown)
    }

    /// Inject an event (timers and frames come from the runner's own
    /// plumbing; this is for tests and tooling).
    pub async fn inject(&self, event: Event) -> Result<(), RunnerError> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| RunnerError::ShutDown)
    }
}

/// Stops a running [`ProductionRunner`].
pub struct ShutdownHandle(oneshot::Sender<()>);

impl ShutdownHandle {
    /// Request shutdown. The runner drains its current event and stops.
    pub fn shutdown(self) {
        let _ = self.0.send(());
    }
}

/// Owns the state machine and executes its actions against real I/O.
pub struct ProductionRunner {
    node: NodeStateMachine,
    mesh: TcpMesh,
    timers: TimerManager,
    pools: Arc<ThreadPoolManager>,
    storage: Option<Arc<RocksDbStorage>>,
    replicas: Arc<ReplicaConfig>,
    genesis_hash: Hash,
    event_tx: mpsc::Sender<Event>,
    event_rx: mpsc::Receiver<Event>,
    /// Events fed back by `Action::EnqueueInternal`; drained before the
    /// channel so internal consequences stay ordered ahead of new input.
    internal: VecDeque<Event>,
    shutdown_rx: oneshot::Receiver<()>,
    commit_tx: mpsc::Sender<Finality>,
    pending: Arc<Mutex<HashMap<RequestId, oneshot::Sender<Finality>>>>,
}

impl ProductionRunner {
    /// Assemble a runner around a node and its mesh.
    ///
    /// Returns the runner, the client handle, the shutdown handle, and the
    /// stream of committed decisions.
    pub fn new(
        node: NodeStateMachine,
        mesh: TcpMesh,
        pools: Arc<ThreadPoolManager>,
        storage: Option<Arc<RocksDbStorage>>,
        replicas: ReplicaConfig,
        event_tx: mpsc::Sender<Event>,
        event_rx: mpsc::Receiver<Event>,
    ) -> (Self, NodeHandle, ShutdownHandle, mpsc::Receiver<Finality>) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (commit_tx, commit_rx) = mpsc::channel(1024);
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let handle = NodeHandle {
            event_tx: event_tx.clone(),
            next_request: Arc::new(AtomicU64::new(0)),
            pending: Arc::clone(&pending),
        };
        let timers = TimerManager::new(event_tx.clone());
        let runner = Self {
            node,
            mesh,
            timers,
            pools,
            storage,
            replicas: Arc::new(replicas),
            genesis_hash: Block::genesis().hash(),
            event_tx,
            event_rx,
            internal: VecDeque::new(),
            shutdown_rx,
            commit_tx,
            pending,
        };
        (runner, handle, ShutdownHandle(shutdown_tx), commit_rx)
    }

    /// Run until shutdown or a fatal error.
    pub async fn run(mut self) -> Result<(), RunnerError> {
        info!(replica = %self.mesh.local(), "replica running");
        if let Some(storage) = &self.storage {
            if let Ok(Some(checkpoint)) = storage.checkpoint() {
                info!(
                    height = checkpoint.bexec_height.0,
                    tip = ?checkpoint.bexec_hash,
                    "previous checkpoint on disk"
                );
            }
        }
        let startup = self.node.startup_actions();
        self.execute(startup)?;

        loop {
            // Internal consequences first, then external input.
            if let Some(event) = self.internal.pop_front() {
                self.step(event)?;
                continue;
            }
            tokio::select! {
                _ = &mut self.shutdown_rx => {
                    info!(replica = %self.mesh.local(), "shutting down");
                    self.timers.cancel_all();
                    return Ok(());
                }
                event = self.event_rx.recv() => {
                    let Some(event) = event else { return Ok(()) };
                    self.step(event)?;
                }
            }
        }
    }

    fn step(&mut self, event: Event) -> Result<(), RunnerError> {
        trace!(replica = %self.mesh.local(), event = event.type_name(), "processing");
        metrics::record_event(event.type_name());
        let actions = match self.node.handle(event) {
            Ok(actions) => actions,
            Err(consensus_error) => {
                // Fatal by contract; never continue past a safety violation.
                error!(replica = %self.mesh.local(), error = %consensus_error, "consensus halted");
                return Err(consensus_error.into());
            }
        };
        self.execute(actions)
    }

    fn execute(&mut self, actions: Vec<Action>) -> Result<(), RunnerError> {
        for action in actions {
            match action {
                Action::Broadcast { message } => {
                    self.mesh.broadcast(&message.encode());
                }
                Action::Send { to, message } => {
                    self.mesh.send(to, message.encode());
                }
                Action::SetTimer { id, duration } => {
                    self.timers.set_timer(id, duration);
                }
                Action::CancelTimer { id } => {
                    self.timers.cancel_timer(id);
                }
                Action::CancelCommitTimers => {
                    self.timers.cancel_commit_timers();
                }
                Action::EnqueueInternal { event } => {
                    self.internal.push_back(event);
                }
                Action::VerifyBlock { block_hash, qc } => {
                    let replicas = Arc::clone(&self.replicas);
                    let genesis = self.genesis_hash;
                    self.spawn_verification(move || {
                        let valid = verify_carried_qc(qc.as_ref(), &genesis, &replicas);
                        Event::BlockVerified { block_hash, valid }
                    });
                }
                Action::VerifyVote { vote, public_key } => {
                    self.spawn_verification(move || {
                        let valid =
                            vote.cert.replica == vote.voter && vote.cert.verify(&public_key);
                        Event::VoteVerified { vote, valid }
                    });
                }
                Action::VerifyStatus {
                    status,
                    from,
                    public_key,
                } => {
                    let replicas = Arc::clone(&self.replicas);
                    let genesis = self.genesis_hash;
                    self.spawn_verification(move || {
                        let valid = public_key.verify(
                            &Status::signing_bytes(status.view, status.hqc_hash()),
                            &status.signature,
                        ) && verify_carried_qc(Some(&status.hqc), &genesis, &replicas);
                        Event::StatusVerified {
                            status,
                            from,
                            valid,
                        }
                    });
                }
                Action::VerifyBlame { blame, public_key } => {
                    self.spawn_verification(move || {
                        let valid = public_key
                            .verify(&Blame::signing_bytes(blame.view), &blame.signature);
                        Event::BlameVerified { blame, valid }
                    });
                }
                Action::VerifyBlameNotify { notify } => {
                    let replicas = Arc::clone(&self.replicas);
                    self.spawn_verification(move || {
                        let valid = verify_blame_notify(&notify, &replicas);
                        Event::BlameNotifyVerified { notify, valid }
                    });
                }
                Action::VerifyNotify { notify, from } => {
                    let replicas = Arc::clone(&self.replicas);
                    let genesis = self.genesis_hash;
                    self.spawn_verification(move || {
                        let valid = notify.qc.block_hash == notify.block_hash
                            && verify_carried_qc(Some(&notify.qc), &genesis, &replicas);
                        Event::NotifyVerified {
                            notify,
                            from,
                            valid,
                        }
                    });
                }
                Action::EmitFinality { finality } => {
                    metrics::record_commit(finality.height.0);
                    if self.commit_tx.try_send(finality).is_err() {
                        warn!("commit stream full or closed, dropping notification");
                    }
                }
                Action::RespondCommand {
                    request_id,
                    finality,
                } => {
                    if let Some(tx) = self.pending.lock().remove(&request_id) {
                        let _ = tx.send(finality);
                    }
                }
                Action::PersistBlock { height, block } => {
                    if let Some(storage) = &self.storage {
                        storage.put_block(height, &block)?;
                    }
                }
                Action::PersistCheckpoint {
                    bexec_height,
                    bexec_hash,
                    hqc,
                } => {
                    if let Some(storage) = &self.storage {
                        storage.put_checkpoint(bexec_height, bexec_hash, &hqc)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Run a verification closure on the crypto pool; its result event
    /// returns through the event channel, never touching the state machine
    /// from the worker thread.
    fn spawn_verification<F>(&self, verify: F)
    where
        F: FnOnce() -> Event + Send + 'static,
    {
        let event_tx = self.event_tx.clone();
        self.pools.crypto().spawn(move || {
            let event = verify();
            if let Event::BlockVerified { valid, .. }
            | Event::VoteVerified { valid, .. }
            | Event::StatusVerified { valid, .. }
            | Event::BlameVerified { valid, .. }
            | Event::BlameNotifyVerified { valid, .. }
            | Event::NotifyVerified { valid, .. } = &event
            {
                metrics::record_verification(*valid);
            }
            if event_tx.blocking_send(event).is_err() {
                // Runner already gone; nothing to deliver to.
            }
        });
    }
}

fn verify_blame_notify(notify: &trellis_messages::BlameNotify, replicas: &ReplicaConfig) -> bool {
    let mut signers = std::collections::BTreeSet::new();
    for blame in &notify.blames {
        if blame.view != notify.view {
            return false;
        }
        let Some(key) = replicas.public_key(blame.replica) else {
            return false;
        };
        if !key.verify(&Blame::signing_bytes(blame.view), &blame.signature) {
            return false;
        }
        signers.insert(blame.replica);
    }
    signers.len() >= replicas.nmajority
}
