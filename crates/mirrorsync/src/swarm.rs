//! Topic-scoped peer swarm over iroh.
//!
//! Peers sharing a [`TopicKey`] find each other (local-network discovery
//! plus any explicitly configured addresses) and hold one QUIC connection
//! each, with a single bidirectional stream carrying length-prefixed frames
//! in both directions. The session ALPN is derived from the topic key, so a
//! node holding a different topic is rejected during the QUIC handshake and
//! never reaches the engine.
//!
//! The swarm is transport only: every accepted frame is forwarded untouched
//! to the engine's event channel, which owns all protocol state.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use iroh::{Endpoint, NodeAddr, NodeId, RelayMode, SecretKey, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{read_frame, write_frame};

/// Minimum pause between dial attempts to the same discovered node.
const REDIAL_INTERVAL: Duration = Duration::from_secs(30);

/// Shared identifier peers use to find one another and scope a session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicKey([u8; 32]);

impl TopicKey {
    /// Generate a fresh random topic key
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        Self(bytes)
    }

    /// Hex form, as shown to users and passed between processes
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The session ALPN derived from this topic
    #[must_use]
    pub fn alpn(&self) -> Vec<u8> {
        format!("/mirrorsync/1/{}", self.to_hex()).into_bytes()
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicKey({})", self.to_hex())
    }
}

impl FromStr for TopicKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| Error::init(format!("topic key is not valid hex: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::init("topic key must be 32 bytes of hex"))?;
        Ok(Self(bytes))
    }
}

/// Outbound half of a live peer connection.
///
/// Held by the engine; dropping it stops the connection's writer task.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    /// Process-local connection id
    pub id: u64,
    /// The remote's node id
    pub node_id: NodeId,
    outbound: mpsc::UnboundedSender<Bytes>,
}

impl PeerHandle {
    /// Queue a frame for this peer. Errors are surfaced as a disconnect
    /// event by the connection tasks, not here.
    pub fn send(&self, frame: Bytes) {
        let _ = self.outbound.send(frame);
    }

    /// A handle backed by a bare channel, for driving the engine in tests
    /// without a transport.
    #[cfg(test)]
    pub(crate) fn new_for_tests(id: u64) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let node_id = SecretKey::generate(rand::thread_rng()).public();
        (Self { id, node_id, outbound }, rx)
    }
}

/// Transport events forwarded to the engine.
#[derive(Debug)]
pub enum SwarmEvent {
    /// A connection reached frame exchange
    PeerConnected(PeerHandle),
    /// A connection ended (cleanly or not)
    PeerDisconnected {
        /// Id previously announced via [`SwarmEvent::PeerConnected`]
        peer_id: u64,
    },
    /// One frame arrived from a peer
    FrameReceived {
        /// Id previously announced via [`SwarmEvent::PeerConnected`]
        peer_id: u64,
        /// Raw frame payload; classification is the engine's job
        payload: Bytes,
    },
}

/// Topic-scoped swarm: one endpoint, an accept loop, and a discovery-driven
/// dial loop.
pub struct Swarm {
    endpoint: Endpoint,
    topic: TopicKey,
    discovery_enabled: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl Swarm {
    /// Bind an endpoint for `topic`.
    ///
    /// With `relay_enabled` false the endpoint also skips discovery services
    /// entirely and reaches only explicitly dialed peers; tests use this to
    /// stay off the network.
    pub async fn bind(topic: TopicKey, relay_enabled: bool) -> Result<Self> {
        let secret_key = SecretKey::generate(rand::thread_rng());
        let mut builder = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![topic.alpn()]);
        if relay_enabled {
            builder = builder.discovery_n0().discovery_local_network();
        } else {
            builder = builder.relay_mode(RelayMode::Disabled);
        }
        let endpoint = builder
            .bind()
            .await
            .map_err(|e| Error::init(format!("failed to bind swarm endpoint: {e}")))?;

        debug!(node_id = %endpoint.node_id(), topic = %topic, "Swarm endpoint bound");
        Ok(Self { endpoint, topic, discovery_enabled: relay_enabled, tasks: Vec::new() })
    }

    /// This peer's identity on the swarm
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.endpoint.node_id()
    }

    /// This peer's full dialable address
    pub async fn node_addr(&self) -> NodeAddr {
        self.endpoint.node_addr().initialized().await.expect("node address watcher disconnected")
    }

    /// The topic this swarm is scoped to
    #[must_use]
    pub fn topic(&self) -> &TopicKey {
        &self.topic
    }

    /// Start the accept and dial loops, delivering events to `events`.
    pub fn start(&mut self, events: mpsc::UnboundedSender<SwarmEvent>, static_peers: Vec<NodeAddr>) {
        let next_id = Arc::new(AtomicU64::new(0));

        // Accept loop
        let endpoint = self.endpoint.clone();
        let accept_events = events.clone();
        let accept_ids = next_id.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                let incoming = match endpoint.accept().await {
                    Some(incoming) => incoming,
                    None => {
                        debug!("Endpoint closed, stopping accept loop");
                        break;
                    }
                };
                let conn = match incoming.await {
                    Ok(conn) => conn,
                    Err(e) => {
                        debug!(error = %e, "Failed to accept incoming connection");
                        continue;
                    }
                };
                let events = accept_events.clone();
                let ids = accept_ids.clone();
                tokio::spawn(async move {
                    run_connection(conn, events, ids, true).await;
                });
            }
        }));

        // Dial explicitly configured peers
        for addr in static_peers {
            let endpoint = self.endpoint.clone();
            let alpn = self.topic.alpn();
            let events = events.clone();
            let ids = next_id.clone();
            self.tasks.push(tokio::spawn(async move {
                dial(endpoint, addr, alpn, events, ids).await;
            }));
        }

        // Dial peers surfaced by discovery. Only the side with the larger
        // node id dials, so a mutual discovery yields one connection.
        if self.discovery_enabled {
            let endpoint = self.endpoint.clone();
            let alpn = self.topic.alpn();
            let our_id = self.endpoint.node_id();
            self.tasks.push(tokio::spawn(async move {
                let mut last_dial: HashMap<NodeId, Instant> = HashMap::new();
                let mut stream = endpoint.discovery_stream();
                while let Some(item) = stream.next().await {
                    let item = match item {
                        Ok(item) => item,
                        Err(_) => continue, // lagged; later items still arrive
                    };
                    let node_id = item.node_id();
                    if node_id == our_id || our_id.as_bytes() <= node_id.as_bytes() {
                        continue;
                    }
                    let now = Instant::now();
                    if let Some(at) = last_dial.get(&node_id) {
                        if now.duration_since(*at) < REDIAL_INTERVAL {
                            continue;
                        }
                    }
                    last_dial.insert(node_id, now);

                    let endpoint = endpoint.clone();
                    let alpn = alpn.clone();
                    let events = events.clone();
                    let ids = next_id.clone();
                    tokio::spawn(async move {
                        dial(endpoint, NodeAddr::new(node_id), alpn, events, ids).await;
                    });
                }
            }));
        }
    }

    /// Stop all loops and close the endpoint.
    pub async fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.endpoint.close().await;
        info!("Swarm closed");
    }
}

/// Connect to `addr` and hand the connection over to frame exchange.
async fn dial(
    endpoint: Endpoint,
    addr: NodeAddr,
    alpn: Vec<u8>,
    events: mpsc::UnboundedSender<SwarmEvent>,
    next_id: Arc<AtomicU64>,
) {
    let node_id = addr.node_id;
    match endpoint.connect(addr, &alpn).await {
        Ok(conn) => run_connection(conn, events, next_id, false).await,
        Err(e) => {
            debug!(peer = %node_id, error = %e, "Dial failed");
        }
    }
}

/// Drive one peer connection: announce it, pump outbound frames from the
/// engine, and forward inbound frames until the stream ends.
async fn run_connection(
    conn: iroh::endpoint::Connection,
    events: mpsc::UnboundedSender<SwarmEvent>,
    next_id: Arc<AtomicU64>,
    accepted: bool,
) {
    let node_id = match conn.remote_node_id() {
        Ok(id) => id,
        Err(e) => {
            debug!(error = %e, "Connection has no remote node id");
            return;
        }
    };

    let streams = if accepted { conn.accept_bi().await } else { conn.open_bi().await };
    let (mut send, mut recv) = match streams {
        Ok(streams) => streams,
        Err(e) => {
            debug!(peer = %node_id, error = %e, "Failed to establish peer stream");
            return;
        }
    };

    // The dialer's stream only becomes visible to the acceptor once bytes
    // flow, so it leads with an empty frame. Empty frames are skipped on
    // receive.
    if !accepted {
        if let Err(e) = write_frame(&mut send, &[]).await {
            debug!(peer = %node_id, error = %e, "Failed to send opening frame");
            return;
        }
    }

    let peer_id = next_id.fetch_add(1, Ordering::Relaxed);
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
    info!(peer = %node_id, peer_id, "Peer connected");

    if events
        .send(SwarmEvent::PeerConnected(PeerHandle {
            id: peer_id,
            node_id,
            outbound: outbound_tx,
        }))
        .is_err()
    {
        return; // engine gone
    }

    // Writer: engine -> peer
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = write_frame(&mut send, &frame).await {
                debug!(error = %e, "Peer write failed");
                break;
            }
        }
        let _ = send.finish();
    });

    // Reader: peer -> engine
    loop {
        match read_frame(&mut recv).await {
            Ok(Some(payload)) => {
                if payload.is_empty() {
                    continue; // opening frame
                }
                if events
                    .send(SwarmEvent::FrameReceived { peer_id, payload })
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => {
                debug!(peer = %node_id, "Peer stream finished");
                break;
            }
            Err(e) => {
                warn!(peer = %node_id, error = %e, "Peer read failed");
                break;
            }
        }
    }

    writer.abort();
    let _ = events.send(SwarmEvent::PeerDisconnected { peer_id });
    info!(peer = %node_id, peer_id, "Peer disconnected");
}
