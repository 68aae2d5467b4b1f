//! The TCP mesh adapter.

use super::codec::{read_frame, write_frame};
use crate::metrics;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use trellis_core::Event;
use trellis_types::{ReplicaConfig, ReplicaId};

/// Outbound queue depth per peer. Messages beyond it are dropped; the
/// protocol re-fetches anything that mattered.
const OUTBOUND_QUEUE: usize = 1024;

/// Reconnect backoff for outbound connections.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Point-to-point mesh over the configured replica set.
///
/// Dials every peer for sending; accepts connections for receiving. Each
/// accepted connection starts with an 8-byte little-endian handshake naming
/// the sender, which must be a configured replica. Anything else is
/// dropped.
pub struct TcpMesh {
    local: ReplicaId,
    outbound: HashMap<ReplicaId, mpsc::Sender<Vec<u8>>>,
    accept_task: JoinHandle<()>,
}

impl TcpMesh {
    /// Start the mesh on an already-bound listener.
    ///
    /// Binding is the caller's job so tests can use ephemeral ports and
    /// configure the replica set with the resolved addresses.
    pub fn start(
        local: ReplicaId,
        replicas: &ReplicaConfig,
        listener: TcpListener,
        event_tx: mpsc::Sender<Event>,
    ) -> Self {
        let mut outbound = HashMap::new();
        for info in replicas.iter().filter(|info| info.id != local) {
            let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
            tokio::spawn(outbound_task(local, info.id, info.peer_addr, rx));
            outbound.insert(info.id, tx);
        }

        let known: Vec<ReplicaId> = replicas.ids().collect();
        let accept_task = tokio::spawn(accept_task(local, known, listener, event_tx));
        Self {
            local,
            outbound,
            accept_task,
        }
    }

    /// Queue frame bytes for one peer. Drops with a warning when the peer's
    /// queue is full or closed.
    pub fn send(&self, to: ReplicaId, bytes: Vec<u8>) {
        let Some(tx) = self.outbound.get(&to) else {
            warn!(peer = %to, "send to unknown peer");
            return;
        };
        if tx.try_send(bytes).is_err() {
            warn!(peer = %to, "outbound queue full, dropping frame");
            metrics::record_frame_dropped();
        }
    }

    /// Queue frame bytes for every peer.
    pub fn broadcast(&self, bytes: &[u8]) {
        for (peer, tx) in &self.outbound {
            if tx.try_send(bytes.to_vec()).is_err() {
                warn!(peer = %peer, "outbound queue full, dropping frame");
                metrics::record_frame_dropped();
            }
        }
    }

    /// This replica's id.
    pub fn local(&self) -> ReplicaId {
        self.local
    }
}

impl Drop for TcpMesh {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Owns the sending side of one peer link: connect, handshake, drain the
/// queue; reconnect with backoff on failure. Ends when the queue closes.
async fn outbound_task(
    local: ReplicaId,
    peer: ReplicaId,
    addr: SocketAddr,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    loop {
        let mut stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(error) => {
                trace!(peer = %peer, %error, "connect failed, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        if write_frame_handshake(&mut stream, local).await.is_err() {
            tokio::time::sleep(RECONNECT_DELAY).await;
            continue;
        }
        debug!(peer = %peer, %addr, "outbound link up");

        loop {
            let Some(bytes) = rx.recv().await else {
                return; // Mesh dropped.
            };
            if let Err(error) = write_frame(&mut stream, &bytes).await {
                warn!(peer = %peer, %error, "outbound link lost");
                metrics::record_frame_dropped();
                break;
            }
            metrics::record_frame_sent();
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn write_frame_handshake(
    stream: &mut TcpStream,
    local: ReplicaId,
) -> Result<(), std::io::Error> {
    use tokio::io::AsyncWriteExt;
    stream.write_all(&local.0.to_le_bytes()).await
}

/// Accept inbound links, check the handshake against the replica set, and
/// pump frames into the event channel.
async fn accept_task(
    local: ReplicaId,
    known: Vec<ReplicaId>,
    listener: TcpListener,
    event_tx: mpsc::Sender<Event>,
) {
    info!(replica = %local, addr = ?listener.local_addr().ok(), "listening");
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(%error, "accept failed");
                continue;
            }
        };
        let known = known.clone();
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            if let Err(error) = inbound_link(stream, remote, known, event_tx).await {
                trace!(%remote, %error, "inbound link closed");
            }
        });
    }
}

async fn inbound_link(
    mut stream: TcpStream,
    remote: SocketAddr,
    known: Vec<ReplicaId>,
    event_tx: mpsc::Sender<Event>,
) -> Result<(), super::NetError> {
    use tokio::io::AsyncReadExt;
    let mut id_bytes = [0u8; 8];
    stream.read_exact(&mut id_bytes).await?;
    let from = ReplicaId(u64::from_le_bytes(id_bytes));
    if !known.contains(&from) {
        warn!(%remote, claimed = %from, "connection from unknown replica");
        return Ok(());
    }
    debug!(peer = %from, %remote, "inbound link up");

    loop {
        let frame = read_frame(&mut stream).await?;
        metrics::record_frame_received(frame.opcode.name());
        if event_tx
            .send(Event::FrameReceived { from, frame })
            .await
            .is_err()
        {
            return Ok(()); // Runner shut down.
        }
    }
}
