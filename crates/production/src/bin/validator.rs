//! Trellis validator node.
//!
//! Production binary for running one replica of the replication engine.
//!
//! # Usage
//!
//! ```bash
//! # Generate a signing key
//! trellis-validator keygen --out replica0.seed
//!
//! # Run with a configuration file
//! trellis-validator run --config validator.toml
//! ```
//!
//! # Configuration
//!
//! ```toml
//! [node]
//! replica_id = 0
//! key_file = "replica0.seed"
//! data_dir = "./data"
//!
//! [consensus]
//! blk_size = 1
//! staleness = 100
//! commit_timeout_ms = 1000
//! blame_timeout_ms = 3000
//! view_transition_timeout_ms = 5000
//! status_interval_ms = 2000
//!
//! [[replicas]]
//! id = 0
//! addr = "127.0.0.1:7000"
//! public_key = "<hex>"
//!
//! [metrics]
//! enabled = true
//! listen_addr = "127.0.0.1:9100"
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::RngCore;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::info;
use trellis_consensus::ConsensusConfig;
use trellis_node::{NodeStateMachine, RoundRobinPacemaker};
use trellis_production::{
    init_telemetry, serve_metrics, ProductionRunner, RocksDbStorage, TcpMesh, ThreadPoolConfig,
    ThreadPoolManager,
};
use trellis_types::{KeyPair, PublicKey, ReplicaConfig, ReplicaId, ReplicaInfo};

/// Trellis validator node.
#[derive(Parser, Debug)]
#[command(name = "trellis-validator")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a replica.
    Run {
        /// Path to configuration file (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Data directory for storage (overrides config)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Generate a signing key seed and print its public key.
    Keygen {
        /// Where to write the hex-encoded seed
        #[arg(long)]
        out: PathBuf,
    },
}

/// Top-level validator configuration.
#[derive(Debug, Deserialize)]
struct ValidatorConfig {
    node: NodeSection,
    #[serde(default)]
    consensus: ConsensusSection,
    replicas: Vec<ReplicaSection>,
    #[serde(default)]
    metrics: MetricsSection,
}

#[derive(Debug, Deserialize)]
struct NodeSection {
    replica_id: u64,
    key_file: PathBuf,
    data_dir: Option<PathBuf>,
    #[serde(default = "default_blk_queue")]
    event_queue: usize,
}

fn default_blk_queue() -> usize {
    4096
}

#[derive(Debug, Deserialize)]
struct ConsensusSection {
    #[serde(default = "default_blk_size")]
    blk_size: usize,
    #[serde(default = "default_staleness")]
    staleness: u32,
    #[serde(default = "default_commit_timeout")]
    commit_timeout_ms: u64,
    #[serde(default = "default_blame_timeout")]
    blame_timeout_ms: u64,
    #[serde(default = "default_view_transition_timeout")]
    view_transition_timeout_ms: u64,
    #[serde(default = "default_status_interval")]
    status_interval_ms: u64,
}

fn default_blk_size() -> usize {
    1
}
fn default_staleness() -> u32 {
    100
}
fn default_commit_timeout() -> u64 {
    1000
}
fn default_blame_timeout() -> u64 {
    3000
}
fn default_view_transition_timeout() -> u64 {
    5000
}
fn default_status_interval() -> u64 {
    2000
}

impl Default for ConsensusSection {
    fn default() -> Self {
        Self {
            blk_size: default_blk_size(),
            staleness: default_staleness(),
            commit_timeout_ms: default_commit_timeout(),
            blame_timeout_ms: default_blame_timeout(),
            view_transition_timeout_ms: default_view_transition_timeout(),
            status_interval_ms: default_status_interval(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReplicaSection {
    id: u64,
    addr: SocketAddr,
    public_key: String,
}

#[derive(Debug, Default, Deserialize)]
struct MetricsSection {
    #[serde(default)]
    enabled: bool,
    listen_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli.log_level);

    match cli.command {
        Command::Keygen { out } => keygen(&out),
        Command::Run { config, data_dir } => run(&config, data_dir).await,
    }
}

fn keygen(out: &PathBuf) -> Result<()> {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    let key = KeyPair::from_seed(&seed);
    std::fs::write(out, hex::encode(seed)).context("writing seed file")?;
    println!("public_key = \"{}\"", hex::encode(key.public_key().as_bytes()));
    info!(path = %out.display(), "seed written");
    Ok(())
}

async fn run(config_path: &PathBuf, data_dir_override: Option<PathBuf>) -> Result<()> {
    let raw = std::fs::read_to_string(config_path)
        .with_context(|| format!("reading {}", config_path.display()))?;
    let config: ValidatorConfig = toml::from_str(&raw).context("parsing configuration")?;

    let local_id = ReplicaId(config.node.replica_id);
    let key = load_key(&config.node.key_file)?;

    // The replica set; nfaulty follows from N = 2f + 1.
    if config.replicas.len() < 3 {
        bail!("at least 3 replicas required, got {}", config.replicas.len());
    }
    let nfaulty = (config.replicas.len() - 1) / 2;
    let mut replica_config = ReplicaConfig::new(nfaulty);
    for replica in &config.replicas {
        let key_bytes = hex::decode(&replica.public_key)
            .with_context(|| format!("public key of replica {}", replica.id))?;
        let key_arr: [u8; 32] = key_bytes
            .try_into()
            .ok()
            .with_context(|| format!("public key of replica {} must be 32 bytes", replica.id))?;
        replica_config.add_replica(ReplicaInfo {
            id: ReplicaId(replica.id),
            peer_addr: replica.addr,
            public_key: PublicKey::from_bytes(key_arr),
        })?;
    }
    replica_config.validate()?;
    let Some(listen_addr) = replica_config.addr(local_id) else {
        bail!("replica {} is not in the configured replica set", local_id);
    };
    if replica_config.public_key(local_id) != Some(&key.public_key()) {
        bail!("signing key does not match the configured public key of {local_id}");
    }

    let consensus = ConsensusConfig {
        staleness: config.consensus.staleness,
        commit_timeout: Duration::from_millis(config.consensus.commit_timeout_ms),
        blame_timeout: Duration::from_millis(config.consensus.blame_timeout_ms),
        view_transition_timeout: Duration::from_millis(
            config.consensus.view_transition_timeout_ms,
        ),
        status_interval: Duration::from_millis(config.consensus.status_interval_ms),
    };

    let storage = match data_dir_override.or(config.node.data_dir.clone()) {
        Some(dir) => Some(Arc::new(
            RocksDbStorage::open(&dir)
                .with_context(|| format!("opening storage at {}", dir.display()))?,
        )),
        None => None,
    };

    if config.metrics.enabled {
        let addr = config
            .metrics
            .listen_addr
            .unwrap_or_else(|| "127.0.0.1:9100".parse().expect("valid addr"));
        serve_metrics(addr);
    }

    let pacemaker = RoundRobinPacemaker::new(replica_config.ids().collect());
    let node = NodeStateMachine::new(
        local_id,
        key,
        replica_config.clone(),
        consensus,
        config.consensus.blk_size,
        Box::new(pacemaker),
    );

    let (event_tx, event_rx) = mpsc::channel(config.node.event_queue);
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    let mesh = TcpMesh::start(local_id, &replica_config, listener, event_tx.clone());
    let pools = Arc::new(ThreadPoolManager::new(ThreadPoolConfig::default())?);

    let (runner, _handle, shutdown, mut commit_rx) = ProductionRunner::new(
        node,
        mesh,
        pools,
        storage,
        replica_config,
        event_tx,
        event_rx,
    );

    // Log commits as they land.
    tokio::spawn(async move {
        while let Some(finality) = commit_rx.recv().await {
            info!(
                height = finality.height.0,
                cmd = ?finality.cmd_hash,
                block = ?finality.block_hash,
                "committed"
            );
        }
    });

    let runner_task = tokio::spawn(runner.run());
    info!(replica = %local_id, %listen_addr, "validator started");

    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    shutdown.shutdown();
    runner_task.await.context("joining runner")??;
    Ok(())
}

fn load_key(path: &PathBuf) -> Result<KeyPair> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading key file {}", path.display()))?;
    let bytes = hex::decode(raw.trim()).context("key file must hold a hex seed")?;
    let seed: [u8; 32] = bytes
        .try_into()
        .ok()
        .context("key seed must be 32 bytes")?;
    Ok(KeyPair::from_seed(&seed))
}
