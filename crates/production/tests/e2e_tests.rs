//! End-to-end test over real TCP on localhost.
//!
//! Spins up a full replica set in one process, each with its own mesh,
//! timers, and crypto pool, submits commands to the leader, and waits for
//! the three-chain commit to land on every replica.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use trellis_consensus::ConsensusConfig;
use trellis_node::{NodeStateMachine, RoundRobinPacemaker};
use trellis_production::{
    NodeHandle, ProductionRunner, ShutdownHandle, TcpMesh, ThreadPoolConfig, ThreadPoolManager,
};
use trellis_types::{Finality, Hash, KeyPair, ReplicaConfig, ReplicaId, ReplicaInfo};

struct TestReplica {
    handle: NodeHandle,
    shutdown: ShutdownHandle,
    commit_rx: mpsc::Receiver<Finality>,
    task: tokio::task::JoinHandle<Result<(), trellis_production::RunnerError>>,
}

/// Bind ephemeral listeners first so the replica set can be configured with
/// the resolved addresses, then start every replica.
async fn start_cluster(n: u64) -> Vec<TestReplica> {
    let keys: Vec<KeyPair> = (0..n).map(|i| KeyPair::from_seed(&[i as u8 + 1; 32])).collect();

    let mut listeners = Vec::new();
    for _ in 0..n {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listeners.push(listener);
    }

    let nfaulty = ((n as usize) - 1) / 2;
    let mut replica_config = ReplicaConfig::new(nfaulty);
    for (i, (key, listener)) in keys.iter().zip(&listeners).enumerate() {
        replica_config
            .add_replica(ReplicaInfo {
                id: ReplicaId(i as u64),
                peer_addr: listener.local_addr().expect("local addr"),
                public_key: key.public_key(),
            })
            .expect("unique ids");
    }
    replica_config.validate().expect("quorum reachable");

    let consensus = ConsensusConfig {
        commit_timeout: Duration::from_secs(30),
        blame_timeout: Duration::from_secs(60),
        view_transition_timeout: Duration::from_secs(60),
        status_interval: Duration::from_secs(60),
        ..ConsensusConfig::default()
    };

    let mut replicas = Vec::new();
    for (i, (key, listener)) in keys.iter().zip(listeners).enumerate() {
        let id = ReplicaId(i as u64);
        let pacemaker = RoundRobinPacemaker::new(replica_config.ids().collect());
        let node = NodeStateMachine::new(
            id,
            key.clone(),
            replica_config.clone(),
            consensus.clone(),
            1,
            Box::new(pacemaker),
        );
        let (event_tx, event_rx) = mpsc::channel(4096);
        let mesh = TcpMesh::start(id, &replica_config, listener, event_tx.clone());
        let pools =
            Arc::new(ThreadPoolManager::new(ThreadPoolConfig { crypto_threads: 1 }).unwrap());
        let (runner, handle, shutdown, commit_rx) = ProductionRunner::new(
            node,
            mesh,
            pools,
            None,
            replica_config.clone(),
            event_tx,
            event_rx,
        );
        let task = tokio::spawn(runner.run());
        replicas.push(TestReplica {
            handle,
            shutdown,
            commit_rx,
            task,
        });
    }
    replicas
}

fn cmd(i: u8) -> Hash {
    Hash::digest(&[0xE0, i])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commands_commit_across_a_real_cluster() {
    let mut replicas = start_cluster(4).await;

    // Give the mesh a moment to establish its links.
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Three commands to the view-0 leader drive the three-chain; only the
    // first can decide (its block commits once the third is proposed), so
    // the later submissions are fired without awaiting their decisions.
    let leader = replicas[0].handle.clone();
    let first = tokio::spawn({
        let leader = leader.clone();
        async move { leader.submit(cmd(1)).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    for i in [2u8, 3] {
        let leader = leader.clone();
        tokio::spawn(async move {
            let _ = leader.submit(cmd(i)).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let finality = tokio::time::timeout(Duration::from_secs(20), first)
        .await
        .expect("commit within the deadline")
        .expect("submit task")
        .expect("first command decides");
    assert_eq!(finality.cmd_hash, cmd(1));
    assert_eq!(finality.height.0, 1);

    // Every replica reports the same first commit.
    let mut first_commits = Vec::new();
    for replica in &mut replicas {
        let finality = tokio::time::timeout(Duration::from_secs(20), replica.commit_rx.recv())
            .await
            .expect("commit notification within the deadline")
            .expect("stream open");
        first_commits.push(finality);
    }
    let reference = &first_commits[0];
    assert_eq!(reference.cmd_hash, cmd(1));
    for finality in &first_commits[1..] {
        assert_eq!(finality.block_hash, reference.block_hash);
        assert_eq!(finality.height, reference.height);
    }

    for replica in replicas {
        replica.shutdown.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(5), replica.task).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn submissions_to_a_follower_stay_pending() {
    let mut replicas = start_cluster(4).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // A follower buffers the command; with no leader submission the command
    // never decides within the window.
    let follower = replicas[1].handle.clone();
    let pending = tokio::time::timeout(
        Duration::from_secs(2),
        tokio::spawn(async move { follower.submit(cmd(9)).await }),
    )
    .await;
    assert!(pending.is_err(), "follower submissions wait for leadership");

    for replica in replicas.drain(..) {
        replica.shutdown.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(5), replica.task).await;
    }
}
