//! Peer discovery (part of C8). Modeled as a task-nursery: each configured
//! `PeerSource` runs as its own task feeding a bounded channel of
//! `PeerCandidate`s that the caller drains (design note §9: "coroutine
//! fan-out for peer discovery" becomes "N discovery tasks feed a bounded
//! channel").
//!
//! The spec deliberately does not commit the engine to a specific wire
//! format or discovery implementation ("composes an existing swarm
//! library's DHT and peer-exchange features behind a stable interface").
//! `LocalPeerSource` is a real, if modest, implementation (a LAN broadcast
//! probe); `DhtPeerSource`/`PexPeerSource` are the seams a production build
//! would fill by embedding a mature swarm crate such as `librqbit` — they
//! compile and run, they just have nothing to announce to yet.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;

use crate::ids::ContentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
    Dht,
    PeerExchange,
    Local,
}

#[derive(Debug, Clone, Copy)]
pub struct PeerCandidate {
    pub addr: SocketAddr,
    pub source: DiscoverySource,
}

#[async_trait]
pub trait PeerSource: Send + Sync {
    async fn discover(&self, content_id: &ContentId, tx: mpsc::Sender<PeerCandidate>);
}

/// LAN discovery: broadcasts a small UDP probe containing the content id
/// and listens briefly for replies from peers already sharing it.
pub struct LocalPeerSource {
    pub broadcast_port: u16,
    pub listen_duration: Duration,
}

#[async_trait]
impl PeerSource for LocalPeerSource {
    async fn discover(&self, content_id: &ContentId, tx: mpsc::Sender<PeerCandidate>) {
        let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
            Ok(s) => s,
            Err(err) => {
                debug!(%err, "local discovery socket bind failed");
                return;
            }
        };
        if let Err(err) = socket.set_broadcast(true) {
            debug!(%err, "local discovery broadcast enable failed");
            return;
        }
        let probe = format!("DCC-DISCOVER {content_id}");
        let broadcast_addr: SocketAddr = ([255, 255, 255, 255], self.broadcast_port).into();
        if socket.send_to(probe.as_bytes(), broadcast_addr).await.is_err() {
            return;
        }

        let mut buf = [0u8; 256];
        let deadline = tokio::time::Instant::now() + self.listen_duration;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok((n, from))) if n > 0 => {
                    let _ = tx
                        .send(PeerCandidate {
                            addr: from,
                            source: DiscoverySource::Local,
                        })
                        .await;
                }
                _ => break,
            }
        }
    }
}

/// Seam for DHT-based discovery. A production deployment embeds a mature
/// DHT implementation here; the DCC itself never implements one from
/// scratch (spec non-goal).
pub struct DhtPeerSource;

#[async_trait]
impl PeerSource for DhtPeerSource {
    async fn discover(&self, content_id: &ContentId, _tx: mpsc::Sender<PeerCandidate>) {
        debug!(%content_id, "dht discovery not embedded in this build");
    }
}

/// Seam for peer-exchange (PEX) discovery, populated once at least one peer
/// connection exists to exchange addresses with.
pub struct PexPeerSource;

#[async_trait]
impl PeerSource for PexPeerSource {
    async fn discover(&self, content_id: &ContentId, _tx: mpsc::Sender<PeerCandidate>) {
        debug!(%content_id, "peer exchange has no seed connection yet");
    }
}

/// Fan out to every configured source concurrently, collecting whatever
/// candidates arrive before `timeout` elapses.
pub async fn discover_peers(
    sources: &[Box<dyn PeerSource>],
    content_id: &ContentId,
    timeout: Duration,
) -> Vec<PeerCandidate> {
    let (tx, mut rx) = mpsc::channel(64);
    let mut nursery = Vec::new();
    for source in sources {
        let tx = tx.clone();
        let content_id = content_id.clone();
        nursery.push(async move { source.discover(&content_id, tx).await });
    }
    drop(tx);

    let collect = async {
        let mut found = Vec::new();
        while let Some(candidate) = rx.recv().await {
            found.push(candidate);
        }
        found
    };

    match tokio::time::timeout(timeout, futures::future::join(futures::future::join_all(nursery), collect)).await {
        Ok((_, found)) => found,
        Err(_) => Vec::new(),
    }
}
