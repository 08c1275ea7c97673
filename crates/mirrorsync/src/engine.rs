//! The synchronization engine.
//!
//! [`SyncEngine::start`] wires the swarm transport, filesystem watcher,
//! replicated tree document, and snapshot transfer around a single actor
//! task that owns all mutable state. Every
//! external happening (a peer frame, a settled file event, a finished
//! snapshot task) arrives as a message on that task, so watch handling,
//! merging, and the handshake never run concurrently with each other and no
//! state needs a lock.
//!
//! # Lifecycle
//!
//! A peer started without a topic key is authoritative for its tree and
//! begins `Synced`. A peer joining an existing topic begins `Unsynced` and
//! must bootstrap: a synced peer proposes a mirror on connect, the joiner
//! approves (or denies if it is already mid-bootstrap), the proposer
//! publishes a snapshot and sends its locator as a `drive-key`, the joiner
//! pulls and materializes the snapshot, reports `mirror-complete`, and only
//! then merges the update frames it buffered along the way, in arrival
//! order. Merging live updates before holding a complete base snapshot
//! would leave the replica referencing files that were never created.
//!
//! # Echo suppression
//!
//! Every write the engine performs on the tree is recorded in the
//! [`HashLedger`] before the watcher can observe it; when the corresponding
//! watch event surfaces, the matching hash is consumed and the event goes
//! no further. A genuine local edit never matches and flows outward.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use iroh::{NodeAddr, NodeId};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::doc::{DocChange, TreeDoc};
use crate::error::{Error, Result};
use crate::ledger::{sha256_hex, HashLedger};
use crate::protocol::{classify, ControlMessage, Frame};
use crate::snapshot::{fetch_snapshot, publish_snapshot, SnapshotLocator, SnapshotSender};
use crate::swarm::{PeerHandle, Swarm, SwarmEvent, TopicKey};
use crate::watch::WatchBridge;

/// Where the engine is in its bootstrap lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No replica yet; waiting for a synced peer to propose a mirror
    Unsynced,
    /// Bootstrap in flight; inbound updates are buffered
    Syncing,
    /// Holding a full replica; inbound updates merge immediately
    Synced,
}

/// Point-in-time counters for observability and tests.
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Current lifecycle phase
    pub phase: SyncPhase,
    /// Live peer connections
    pub connected_peers: usize,
    /// Update frames held back for post-bootstrap merge
    pub buffered_updates: usize,
    /// Watch events recognized as echoes of the engine's own writes
    pub suppressed_echoes: u64,
    /// Watch events that became outbound document mutations
    pub local_edits: u64,
    /// Remote changes applied to the filesystem
    pub applied_remote_changes: u64,
}

/// Handle to a running engine.
///
/// Cheap to query; all real work happens on the engine's actor task. Call
/// [`SyncEngine::shutdown`] for an orderly stop (it also removes the
/// snapshot scratch directory).
pub struct SyncEngine {
    topic: TopicKey,
    node_id: NodeId,
    node_addr: NodeAddr,
    ctl: mpsc::UnboundedSender<Control>,
    phase_rx: watch::Receiver<SyncPhase>,
}

impl SyncEngine {
    /// Start an engine for `config`.
    ///
    /// Creates the sync root if absent (the only fatal filesystem error),
    /// binds the swarm, starts watching, and spawns the actor.
    pub async fn start(mut config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.root)
            .await
            .map_err(|e| Error::init(format!("failed to create sync root: {e}")))?;
        config.root = tokio::fs::canonicalize(&config.root)
            .await
            .map_err(|e| Error::init(format!("failed to resolve sync root: {e}")))?;

        let started_synced = config.topic.is_none();
        let topic = match config.topic.clone() {
            Some(topic) => {
                info!(topic = %topic, "Joining existing topic");
                topic
            }
            None => {
                let topic = TopicKey::generate();
                info!(topic = %topic, "Created new topic");
                topic
            }
        };

        let mut swarm = Swarm::bind(topic.clone(), config.relay_enabled).await?;
        let node_id = swarm.node_id();
        let scratch = config.scratch_dir(&node_id);

        let (swarm_tx, swarm_rx) = mpsc::unbounded_channel();
        swarm.start(swarm_tx, config.static_peers.clone());
        let node_addr = swarm.node_addr().await;

        let (file_tx, file_rx) = mpsc::unbounded_channel();
        let watch_bridge = WatchBridge::spawn(
            &config.root,
            Duration::from_millis(config.debounce_ms),
            file_tx,
        )?;

        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let initial_phase = if started_synced { SyncPhase::Synced } else { SyncPhase::Unsynced };
        let (phase_tx, phase_rx) = watch::channel(initial_phase);

        let actor = Actor {
            root: config.root.clone(),
            scratch,
            relay_enabled: config.relay_enabled,
            bootstrap_timeout: Duration::from_secs(config.bootstrap_timeout_secs),
            doc: TreeDoc::new(),
            ledger: HashLedger::new(),
            phase: initial_phase,
            buffered: VecDeque::new(),
            serving: None,
            peers: HashMap::new(),
            epoch: 0,
            swarm,
            _watch: watch_bridge,
            ctl: ctl_tx.clone(),
            phase_tx,
            suppressed_echoes: 0,
            local_edits: 0,
            applied_remote_changes: 0,
        };
        tokio::spawn(actor.run(swarm_rx, file_rx, ctl_rx));

        info!(node_id = %node_id, phase = ?initial_phase, "Sync engine started");
        Ok(Self { topic, node_id, node_addr, ctl: ctl_tx, phase_rx })
    }

    /// The topic this engine is synchronizing on
    #[must_use]
    pub fn topic(&self) -> &TopicKey {
        &self.topic
    }

    /// This peer's identity on the swarm
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// This peer's dialable address, for wiring peers explicitly
    #[must_use]
    pub fn node_addr(&self) -> NodeAddr {
        self.node_addr.clone()
    }

    /// Current lifecycle phase
    #[must_use]
    pub fn phase(&self) -> SyncPhase {
        *self.phase_rx.borrow()
    }

    /// Subscribe to phase transitions
    #[must_use]
    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase_rx.clone()
    }

    /// Snapshot of the engine's counters
    pub async fn stats(&self) -> Result<EngineStats> {
        let (tx, rx) = oneshot::channel();
        self.ctl.send(Control::Stats(tx)).map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Stop the engine: close the swarm, release any snapshot session, and
    /// remove the scratch directory. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.ctl.send(Control::Shutdown(tx)).is_err() {
            return Ok(()); // already stopped
        }
        match tokio::time::timeout(Duration::from_secs(10), rx).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!("Engine did not acknowledge shutdown in time");
                Ok(())
            }
        }
    }
}

/// Internal control messages completing spawned work or driving lifecycle.
enum Control {
    PublishDone {
        peer_id: u64,
        epoch: u64,
        result: Result<SnapshotSender>,
    },
    FetchDone {
        peer_id: u64,
        epoch: u64,
        result: Result<Vec<(String, String)>>,
    },
    /// The receiver approved a proposal but no drive key arrived in time
    AwaitDriveKeyTimeout { epoch: u64 },
    /// The sender published but no mirror-complete arrived in time
    ServeTimeout { epoch: u64 },
    Stats(oneshot::Sender<EngineStats>),
    Shutdown(oneshot::Sender<()>),
}

/// Sender-side bootstrap progress.
enum Serving {
    /// Snapshot build in flight
    Publishing { peer_id: u64, epoch: u64 },
    /// Snapshot served; waiting for the receiver's mirror-complete
    Active { session: SnapshotSender, peer_id: u64, epoch: u64 },
}

impl Serving {
    fn epoch(&self) -> u64 {
        match self {
            Self::Publishing { epoch, .. } | Self::Active { epoch, .. } => *epoch,
        }
    }
}

/// The engine actor: sole owner of all mutable sync state.
struct Actor {
    root: PathBuf,
    scratch: PathBuf,
    relay_enabled: bool,
    bootstrap_timeout: Duration,

    doc: TreeDoc,
    ledger: HashLedger,
    phase: SyncPhase,
    buffered: VecDeque<Bytes>,
    serving: Option<Serving>,
    peers: HashMap<u64, PeerHandle>,
    /// Bumped per bootstrap attempt; stale task completions and timers
    /// identify themselves by the epoch they were spawned under
    epoch: u64,

    swarm: Swarm,
    _watch: WatchBridge,
    ctl: mpsc::UnboundedSender<Control>,
    phase_tx: watch::Sender<SyncPhase>,

    suppressed_echoes: u64,
    local_edits: u64,
    applied_remote_changes: u64,
}

impl Actor {
    async fn run(
        mut self,
        mut swarm_rx: mpsc::UnboundedReceiver<SwarmEvent>,
        mut file_rx: mpsc::UnboundedReceiver<String>,
        mut ctl_rx: mpsc::UnboundedReceiver<Control>,
    ) {
        loop {
            tokio::select! {
                Some(event) = swarm_rx.recv() => self.handle_swarm(event).await,
                Some(rel) = file_rx.recv() => self.handle_file(&rel).await,
                Some(ctl) = ctl_rx.recv() => {
                    if self.handle_ctl(ctl).await {
                        break;
                    }
                }
                else => break,
            }
        }
        debug!("Engine actor stopped");
    }

    /// Live means updates merge immediately: synced and not busy serving a
    /// bootstrap (a serving sender buffers too, so its receiver's snapshot
    /// and the live stream cannot interleave).
    fn live(&self) -> bool {
        self.phase == SyncPhase::Synced && self.serving.is_none()
    }

    fn set_phase(&mut self, phase: SyncPhase) {
        if self.phase != phase {
            info!(from = ?self.phase, to = ?phase, "Sync phase changed");
            self.phase = phase;
            let _ = self.phase_tx.send(phase);
        }
    }

    fn abs_path(&self, rel: &str) -> PathBuf {
        self.root.join(rel.trim_start_matches('/'))
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    async fn handle_swarm(&mut self, event: SwarmEvent) {
        match event {
            SwarmEvent::PeerConnected(peer) => {
                let peer_id = peer.id;
                if self.live() {
                    peer.send(ControlMessage::MirrorProposal.encode());
                    debug!(peer_id, "Proposed mirror to new peer");
                }
                self.peers.insert(peer_id, peer);
            }
            SwarmEvent::PeerDisconnected { peer_id } => {
                self.peers.remove(&peer_id);
            }
            SwarmEvent::FrameReceived { peer_id, payload } => match classify(payload) {
                Frame::Control(msg) => self.handle_control_message(peer_id, msg).await,
                Frame::Update(blob) => {
                    if self.live() {
                        self.merge_update(&blob).await;
                    } else {
                        debug!(peer_id, size = blob.len(), "Buffering update until synced");
                        self.buffered.push_back(blob);
                    }
                }
                Frame::Malformed => {
                    warn!(peer_id, "Ignoring malformed control frame");
                }
            },
        }
    }

    async fn handle_control_message(&mut self, peer_id: u64, msg: ControlMessage) {
        debug!(peer_id, ?msg, phase = ?self.phase, "Control message");
        if self.phase == SyncPhase::Synced {
            match msg {
                ControlMessage::MirrorApproval => self.begin_publish(peer_id),
                ControlMessage::MirrorComplete => self.finish_serving().await,
                ControlMessage::MirrorDenial => {
                    debug!(peer_id, "Proposal denied; peer is bootstrapping elsewhere");
                }
                other => {
                    warn!(peer_id, msg = ?other, "Unexpected control message in synced phase");
                }
            }
        } else {
            match msg {
                ControlMessage::MirrorProposal => {
                    if self.phase == SyncPhase::Syncing {
                        self.send_to(peer_id, ControlMessage::MirrorDenial.encode());
                        debug!(peer_id, "Denied proposal; bootstrap already in flight");
                    } else {
                        self.send_to(peer_id, ControlMessage::MirrorApproval.encode());
                        self.set_phase(SyncPhase::Syncing);
                        self.epoch += 1;
                        self.spawn_await_drive_key_timer();
                    }
                }
                ControlMessage::DriveKey { value } => self.begin_fetch(peer_id, &value),
                other => {
                    warn!(peer_id, msg = ?other, "Unexpected control message before synced");
                }
            }
        }
    }

    fn send_to(&self, peer_id: u64, frame: Bytes) {
        if let Some(peer) = self.peers.get(&peer_id) {
            peer.send(frame);
        } else {
            debug!(peer_id, "Dropping frame for departed peer");
        }
    }

    // ------------------------------------------------------------------
    // Sender role
    // ------------------------------------------------------------------

    fn begin_publish(&mut self, peer_id: u64) {
        if self.serving.is_some() {
            warn!(peer_id, "Ignoring mirror-approval while already serving a bootstrap");
            return;
        }
        self.epoch += 1;
        let epoch = self.epoch;
        self.serving = Some(Serving::Publishing { peer_id, epoch });
        info!(peer_id, "Publishing snapshot for new peer");

        let root = self.root.clone();
        let scratch = self.scratch.clone();
        let relay_enabled = self.relay_enabled;
        let ctl = self.ctl.clone();
        tokio::spawn(async move {
            let result = publish_snapshot(&root, scratch, relay_enabled).await;
            let _ = ctl.send(Control::PublishDone { peer_id, epoch, result });
        });

        let ctl = self.ctl.clone();
        let timeout = self.bootstrap_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = ctl.send(Control::ServeTimeout { epoch });
        });
    }

    async fn on_publish_done(&mut self, peer_id: u64, epoch: u64, result: Result<SnapshotSender>) {
        let current = matches!(
            &self.serving,
            Some(Serving::Publishing { epoch: e, .. }) if *e == epoch
        );
        if !current {
            // Superseded by a timeout; release whatever was built
            if let Ok(session) = result {
                spawn_close(session);
            }
            return;
        }

        match result {
            Ok(session) => {
                if self.peers.contains_key(&peer_id) {
                    let key = session.locator().to_string();
                    self.send_to(peer_id, ControlMessage::DriveKey { value: key }.encode());
                    self.serving = Some(Serving::Active { session, peer_id, epoch });
                } else {
                    warn!(peer_id, "Peer left before snapshot was ready");
                    spawn_close(session);
                    self.serving = None;
                    self.drain_buffered().await;
                }
            }
            Err(e) => {
                warn!(error = %e, "Snapshot publish failed");
                self.serving = None;
                self.drain_buffered().await;
            }
        }
    }

    async fn finish_serving(&mut self) {
        match self.serving.take() {
            Some(Serving::Active { session, peer_id, .. }) => {
                info!(peer_id, "Bootstrap complete; releasing snapshot session");
                spawn_close(session);
                self.drain_buffered().await;
            }
            other => {
                self.serving = other;
                warn!("Unexpected mirror-complete with no active snapshot session");
            }
        }
    }

    async fn on_serve_timeout(&mut self, epoch: u64) {
        let stale = !matches!(&self.serving, Some(serving) if serving.epoch() == epoch);
        if stale {
            return;
        }
        warn!("Bootstrap receiver did not complete in time; abandoning snapshot session");
        if let Some(Serving::Active { session, .. }) = self.serving.take() {
            spawn_close(session);
        }
        self.drain_buffered().await;
    }

    // ------------------------------------------------------------------
    // Receiver role
    // ------------------------------------------------------------------

    fn spawn_await_drive_key_timer(&self) {
        let ctl = self.ctl.clone();
        let epoch = self.epoch;
        let timeout = self.bootstrap_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = ctl.send(Control::AwaitDriveKeyTimeout { epoch });
        });
    }

    fn begin_fetch(&mut self, peer_id: u64, locator_hex: &str) {
        let locator: SnapshotLocator = match locator_hex.parse() {
            Ok(locator) => locator,
            Err(e) => {
                warn!(peer_id, error = %e, "Ignoring unusable drive key");
                return;
            }
        };

        self.set_phase(SyncPhase::Syncing);
        self.epoch += 1; // invalidates the drive-key wait timer
        let epoch = self.epoch;
        info!(peer_id, "Fetching snapshot from peer");

        let root = self.root.clone();
        let scratch = self.scratch.clone();
        let relay_enabled = self.relay_enabled;
        let timeout = self.bootstrap_timeout;
        let ctl = self.ctl.clone();
        tokio::spawn(async move {
            let result =
                match tokio::time::timeout(timeout, fetch_snapshot(&locator, &root, scratch, relay_enabled))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::transfer("snapshot fetch timed out")),
                };
            let _ = ctl.send(Control::FetchDone { peer_id, epoch, result });
        });
    }

    async fn on_fetch_done(
        &mut self,
        peer_id: u64,
        epoch: u64,
        result: Result<Vec<(String, String)>>,
    ) {
        if epoch != self.epoch || self.phase != SyncPhase::Syncing {
            debug!("Dropping stale snapshot fetch result");
            return;
        }

        match result {
            Ok(seeds) => {
                info!(files = seeds.len(), "Snapshot materialized");
                for (path, hash) in seeds {
                    self.ledger.record(&path, hash);
                }
                self.send_to(peer_id, ControlMessage::MirrorComplete.encode());
                self.set_phase(SyncPhase::Synced);
                self.drain_buffered().await;
            }
            Err(e) => {
                warn!(error = %e, "Snapshot fetch failed; awaiting a fresh proposal");
                self.set_phase(SyncPhase::Unsynced);
            }
        }
    }

    async fn on_await_drive_key_timeout(&mut self, epoch: u64) {
        if epoch != self.epoch || self.phase != SyncPhase::Syncing {
            return;
        }
        warn!("No drive key received in time; awaiting a fresh proposal");
        self.set_phase(SyncPhase::Unsynced);
    }

    // ------------------------------------------------------------------
    // Document flow
    // ------------------------------------------------------------------

    /// Merge one live update and mirror its changes to the filesystem.
    async fn merge_update(&mut self, blob: &[u8]) {
        match self.doc.apply_update(blob) {
            Ok(changes) => {
                self.apply_changes(changes).await;
                self.broadcast();
            }
            Err(e) => {
                warn!(error = %e, "Dropping corrupt update");
            }
        }
    }

    /// Drain buffered updates in arrival order; a no-op unless live.
    async fn drain_buffered(&mut self) {
        if !self.live() {
            return;
        }
        if self.buffered.is_empty() {
            return;
        }
        info!(count = self.buffered.len(), "Draining buffered updates");
        while let Some(blob) = self.buffered.pop_front() {
            match self.doc.apply_update(&blob) {
                Ok(changes) => self.apply_changes(changes).await,
                Err(e) => warn!(error = %e, "Dropping corrupt buffered update"),
            }
        }
        self.broadcast();
    }

    /// The document-apply bridge: mirror merged changes to disk, arming the
    /// ledger for the watch events those writes are about to produce.
    async fn apply_changes(&mut self, changes: Vec<DocChange>) {
        for change in changes {
            match change {
                DocChange::Upserted { path, record } => {
                    let target = self.abs_path(&path);
                    if let Some(parent) = target.parent() {
                        if let Err(e) = tokio::fs::create_dir_all(parent).await {
                            warn!(path = %path, error = %e, "Failed to create parent directory");
                            continue;
                        }
                    }
                    if let Err(e) = tokio::fs::write(&target, &record.content).await {
                        warn!(path = %path, error = %e, "Failed to write remote change");
                        continue;
                    }
                    debug!(path = %path, size = record.content.len(), "Applied remote write");
                    self.ledger.record(&path, sha256_hex(&record.content));
                    self.applied_remote_changes += 1;
                }
                DocChange::Removed { path } => {
                    let target = self.abs_path(&path);
                    match tokio::fs::remove_file(&target).await {
                        Ok(()) => debug!(path = %path, "Applied remote delete"),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                            debug!(path = %path, "Remote delete for already-absent file");
                        }
                        Err(e) => {
                            warn!(path = %path, error = %e, "Failed to delete file");
                            continue;
                        }
                    }
                    self.ledger.record(&path, sha256_hex(b""));
                    self.applied_remote_changes += 1;
                }
            }
        }
    }

    /// The watch bridge: a settled path is an upsert if it reads and a
    /// deletion if it is gone.
    async fn handle_file(&mut self, rel: &str) {
        if self.phase != SyncPhase::Synced {
            debug!(path = %rel, "Ignoring watch event before synced");
            return;
        }

        let target = self.abs_path(rel);
        match tokio::fs::read(&target).await {
            Ok(content) => {
                let hash = sha256_hex(&content);
                if self.ledger.is_echo(rel, &hash) {
                    self.suppressed_echoes += 1;
                    debug!(path = %rel, "Suppressed echo of engine write");
                    return;
                }
                let mtime = Utc::now().timestamp_millis();
                if let Err(e) = self.doc.set_file(rel, content, mtime) {
                    warn!(path = %rel, error = %e, "Failed to record local change");
                    return;
                }
                self.local_edits += 1;
                info!(path = %rel, "Local change");
                self.broadcast();
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                match self.doc.remove_file(rel) {
                    Ok(true) => {
                        self.local_edits += 1;
                        info!(path = %rel, "Local delete");
                        self.broadcast();
                    }
                    Ok(false) => {}
                    Err(e) => warn!(path = %rel, error = %e, "Failed to record local delete"),
                }
            }
            Err(e) => {
                warn!(path = %rel, error = %e, "Failed to read changed file");
            }
        }
    }

    /// Flush pending document changes to every connected peer.
    fn broadcast(&mut self) {
        if let Some(update) = self.doc.take_update() {
            debug!(size = update.len(), peers = self.peers.len(), "Broadcasting update");
            for peer in self.peers.values() {
                peer.send(update.clone());
            }
        }
    }

    // ------------------------------------------------------------------
    // Control plane
    // ------------------------------------------------------------------

    /// Returns true when the actor should stop.
    async fn handle_ctl(&mut self, ctl: Control) -> bool {
        match ctl {
            Control::PublishDone { peer_id, epoch, result } => {
                self.on_publish_done(peer_id, epoch, result).await;
                false
            }
            Control::FetchDone { peer_id, epoch, result } => {
                self.on_fetch_done(peer_id, epoch, result).await;
                false
            }
            Control::AwaitDriveKeyTimeout { epoch } => {
                self.on_await_drive_key_timeout(epoch).await;
                false
            }
            Control::ServeTimeout { epoch } => {
                self.on_serve_timeout(epoch).await;
                false
            }
            Control::Stats(reply) => {
                let _ = reply.send(EngineStats {
                    phase: self.phase,
                    connected_peers: self.peers.len(),
                    buffered_updates: self.buffered.len(),
                    suppressed_echoes: self.suppressed_echoes,
                    local_edits: self.local_edits,
                    applied_remote_changes: self.applied_remote_changes,
                });
                false
            }
            Control::Shutdown(ack) => {
                info!("Shutting down sync engine");
                if let Some(Serving::Active { mut session, .. }) = self.serving.take() {
                    session.close().await;
                }
                self.swarm.close().await;
                // The scratch directory never survives the process
                if let Err(e) = tokio::fs::remove_dir_all(&self.scratch).await {
                    debug!(error = %e, "Scratch cleanup skipped");
                }
                let _ = ack.send(());
                true
            }
        }
    }
}

/// Release a snapshot session off the actor task.
fn spawn_close(mut session: SnapshotSender) {
    tokio::spawn(async move {
        session.close().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    /// Actor wired to a relay-disabled swarm, plus the control receiver its
    /// spawned tasks report into. The sync root and the scratch directory
    /// are siblings under `workspace`, as in production.
    async fn test_actor(
        workspace: &Path,
        phase: SyncPhase,
    ) -> (Actor, mpsc::UnboundedReceiver<Control>, PathBuf) {
        let root = workspace.join("root");
        tokio::fs::create_dir_all(&root).await.unwrap();
        let swarm = Swarm::bind(TopicKey::generate(), false).await.unwrap();
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (file_tx, _file_rx) = mpsc::unbounded_channel();
        let watch_bridge =
            WatchBridge::spawn(&root, Duration::from_millis(1000), file_tx).unwrap();
        let (phase_tx, _) = watch::channel(phase);
        let actor = Actor {
            root: root.clone(),
            scratch: workspace.join(".scratch"),
            relay_enabled: false,
            bootstrap_timeout: Duration::from_secs(30),
            doc: TreeDoc::new(),
            ledger: HashLedger::new(),
            phase,
            buffered: VecDeque::new(),
            serving: None,
            peers: HashMap::new(),
            epoch: 0,
            swarm,
            _watch: watch_bridge,
            ctl: ctl_tx,
            phase_tx,
            suppressed_echoes: 0,
            local_edits: 0,
            applied_remote_changes: 0,
        };
        (actor, ctl_rx, root)
    }

    fn fake_peer(id: u64) -> (PeerHandle, mpsc::UnboundedReceiver<Bytes>) {
        PeerHandle::new_for_tests(id)
    }

    fn control_from(frame: &Bytes) -> ControlMessage {
        match classify(frame.clone()) {
            Frame::Control(msg) => msg,
            other => panic!("expected control frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_synced_peer_proposes_on_connect() {
        let dir = TempDir::new().unwrap();
        let (mut actor, _ctl, _root) = test_actor(dir.path(), SyncPhase::Synced).await;
        let (peer, mut rx) = fake_peer(1);

        actor.handle_swarm(SwarmEvent::PeerConnected(peer)).await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(control_from(&frame), ControlMessage::MirrorProposal);
    }

    #[tokio::test]
    async fn test_unsynced_peer_stays_quiet_on_connect() {
        let dir = TempDir::new().unwrap();
        let (mut actor, _ctl, _root) = test_actor(dir.path(), SyncPhase::Unsynced).await;
        let (peer, mut rx) = fake_peer(1);

        actor.handle_swarm(SwarmEvent::PeerConnected(peer)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_updates_buffer_until_synced() {
        let dir = TempDir::new().unwrap();
        let (mut actor, _ctl, root) = test_actor(dir.path(), SyncPhase::Unsynced).await;
        let (peer, _rx) = fake_peer(1);
        actor.handle_swarm(SwarmEvent::PeerConnected(peer)).await;

        let mut remote = TreeDoc::new();
        remote.set_file("/f.txt", b"x".to_vec(), 1).unwrap();
        let blob = remote.take_update().unwrap();

        actor
            .handle_swarm(SwarmEvent::FrameReceived { peer_id: 1, payload: blob })
            .await;

        assert_eq!(actor.buffered.len(), 1);
        assert!(actor.doc.get("/f.txt").unwrap().is_none());
        assert!(!root.join("f.txt").exists());
    }

    #[tokio::test]
    async fn test_proposal_approved_then_denied_while_syncing() {
        let dir = TempDir::new().unwrap();
        let (mut actor, _ctl, _root) = test_actor(dir.path(), SyncPhase::Unsynced).await;
        let (first, mut first_rx) = fake_peer(1);
        let (second, mut second_rx) = fake_peer(2);
        actor.handle_swarm(SwarmEvent::PeerConnected(first)).await;
        actor.handle_swarm(SwarmEvent::PeerConnected(second)).await;

        actor
            .handle_swarm(SwarmEvent::FrameReceived {
                peer_id: 1,
                payload: ControlMessage::MirrorProposal.encode(),
            })
            .await;
        assert_eq!(control_from(&first_rx.recv().await.unwrap()), ControlMessage::MirrorApproval);
        assert_eq!(actor.phase, SyncPhase::Syncing);

        actor
            .handle_swarm(SwarmEvent::FrameReceived {
                peer_id: 2,
                payload: ControlMessage::MirrorProposal.encode(),
            })
            .await;
        assert_eq!(control_from(&second_rx.recv().await.unwrap()), ControlMessage::MirrorDenial);
    }

    #[tokio::test]
    async fn test_live_update_applies_and_arms_echo_suppression() {
        let dir = TempDir::new().unwrap();
        let (mut actor, _ctl, root) = test_actor(dir.path(), SyncPhase::Synced).await;
        let (peer, mut rx) = fake_peer(1);
        actor.handle_swarm(SwarmEvent::PeerConnected(peer)).await;
        let _proposal = rx.recv().await.unwrap();

        let mut remote = TreeDoc::new();
        remote.set_file("/notes/a.txt", b"remote content".to_vec(), 1).unwrap();
        let blob = remote.take_update().unwrap();

        actor
            .handle_swarm(SwarmEvent::FrameReceived { peer_id: 1, payload: blob })
            .await;

        // Applied to disk and re-broadcast to connected peers
        let on_disk = tokio::fs::read(root.join("notes/a.txt")).await.unwrap();
        assert_eq!(on_disk, b"remote content");
        assert!(rx.recv().await.is_some());

        // The watcher's view of that write is absorbed
        actor.handle_file("/notes/a.txt").await;
        assert_eq!(actor.suppressed_echoes, 1);
        assert_eq!(actor.local_edits, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_local_edit_broadcasts() {
        let dir = TempDir::new().unwrap();
        let (mut actor, _ctl, root) = test_actor(dir.path(), SyncPhase::Synced).await;
        let (peer, mut rx) = fake_peer(1);
        actor.handle_swarm(SwarmEvent::PeerConnected(peer)).await;
        let _proposal = rx.recv().await.unwrap();

        tokio::fs::write(root.join("mine.txt"), b"local data").await.unwrap();
        actor.handle_file("/mine.txt").await;

        assert_eq!(actor.local_edits, 1);
        let update = rx.recv().await.unwrap();

        let mut observer = TreeDoc::new();
        observer.apply_update(&update).unwrap();
        assert_eq!(observer.get("/mine.txt").unwrap().unwrap().content, b"local data");
    }

    #[tokio::test]
    async fn test_local_delete_broadcasts_and_absent_delete_is_silent() {
        let dir = TempDir::new().unwrap();
        let (mut actor, _ctl, root) = test_actor(dir.path(), SyncPhase::Synced).await;
        let (peer, mut rx) = fake_peer(1);
        actor.handle_swarm(SwarmEvent::PeerConnected(peer)).await;
        let _proposal = rx.recv().await.unwrap();

        tokio::fs::write(root.join("doomed.txt"), b"bye").await.unwrap();
        actor.handle_file("/doomed.txt").await;
        let _update = rx.recv().await.unwrap();

        tokio::fs::remove_file(root.join("doomed.txt")).await.unwrap();
        actor.handle_file("/doomed.txt").await;
        let update = rx.recv().await.unwrap();

        let mut observer = TreeDoc::new();
        observer.apply_update(&update).unwrap();
        assert!(observer.get("/doomed.txt").unwrap().is_none());

        // A delete event for a path the document never held goes nowhere
        actor.handle_file("/never-existed.txt").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_watch_events_ignored_before_synced() {
        let dir = TempDir::new().unwrap();
        let (mut actor, _ctl, root) = test_actor(dir.path(), SyncPhase::Unsynced).await;

        tokio::fs::write(root.join("early.txt"), b"too soon").await.unwrap();
        actor.handle_file("/early.txt").await;

        assert_eq!(actor.local_edits, 0);
        assert!(actor.doc.get("/early.txt").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_buffered_updates_drain_in_order_on_sync() {
        let dir = TempDir::new().unwrap();
        let (mut actor, _ctl, root) = test_actor(dir.path(), SyncPhase::Unsynced).await;

        let mut remote = TreeDoc::new();
        remote.set_file("/f.txt", b"v1".to_vec(), 1).unwrap();
        let blob1 = remote.take_update().unwrap();
        remote.set_file("/f.txt", b"v2".to_vec(), 2).unwrap();
        let blob2 = remote.take_update().unwrap();

        actor
            .handle_swarm(SwarmEvent::FrameReceived { peer_id: 7, payload: blob1 })
            .await;
        actor
            .handle_swarm(SwarmEvent::FrameReceived { peer_id: 7, payload: blob2 })
            .await;
        assert_eq!(actor.buffered.len(), 2);

        actor.set_phase(SyncPhase::Synced);
        actor.drain_buffered().await;

        assert!(actor.buffered.is_empty());
        let on_disk = tokio::fs::read(root.join("f.txt")).await.unwrap();
        assert_eq!(on_disk, b"v2");
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let dir = TempDir::new().unwrap();
        let (mut actor, _ctl, _root) = test_actor(dir.path(), SyncPhase::Synced).await;

        actor
            .handle_swarm(SwarmEvent::FrameReceived {
                peer_id: 1,
                payload: Bytes::from(&br#"{"type":"mirror-hijack"}"#[..]),
            })
            .await;

        assert!(actor.buffered.is_empty());
        assert!(actor.doc.paths().is_empty());
    }

    #[tokio::test]
    async fn test_approval_publishes_and_sends_drive_key() {
        let dir = TempDir::new().unwrap();
        let (mut actor, mut ctl_rx, root) = test_actor(dir.path(), SyncPhase::Synced).await;
        tokio::fs::write(root.join("shared.txt"), b"tree").await.unwrap();
        let (peer, mut rx) = fake_peer(1);
        actor.handle_swarm(SwarmEvent::PeerConnected(peer)).await;
        let _proposal = rx.recv().await.unwrap();

        actor
            .handle_swarm(SwarmEvent::FrameReceived {
                peer_id: 1,
                payload: ControlMessage::MirrorApproval.encode(),
            })
            .await;
        assert!(matches!(actor.serving, Some(Serving::Publishing { .. })));

        // Pump the publish completion through the control channel
        let done = tokio::time::timeout(Duration::from_secs(30), ctl_rx.recv())
            .await
            .expect("publish did not finish")
            .unwrap();
        actor.handle_ctl(done).await;

        let frame = rx.recv().await.unwrap();
        match control_from(&frame) {
            ControlMessage::DriveKey { value } => {
                assert!(value.parse::<SnapshotLocator>().is_ok());
            }
            other => panic!("expected drive-key, got {other:?}"),
        }
        assert!(matches!(actor.serving, Some(Serving::Active { .. })));

        // mirror-complete releases the session and returns to live
        actor
            .handle_swarm(SwarmEvent::FrameReceived {
                peer_id: 1,
                payload: ControlMessage::MirrorComplete.encode(),
            })
            .await;
        assert!(actor.serving.is_none());
        assert!(actor.live());
    }
}
