//! One-shot snapshot transfer for bootstrap.
//!
//! When a peer joins with no replica, a synced peer publishes a
//! content-addressed snapshot of its tree and the joiner pulls it before any
//! live updates are merged. The snapshot lives in an [`FsStore`] under a
//! scratch directory named from the publisher's identity key, is served over
//! a dedicated endpoint on its own ALPN, and is addressed by an opaque hex
//! locator carried in the `drive-key` control message. Everything here is
//! ephemeral: endpoint, store, and scratch directory are torn down when the
//! bootstrap completes or fails.
//!
//! Blob exchange uses a simple request/response per stream:
//!
//! - request: `[0x10][4-byte BE hash length][hash hex]`
//! - response: `[status][8-byte BE data length][data]` where status `0x00`
//!   is success, `0x01` not found, `0x02` error

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bytes::Bytes;
use iroh::{Endpoint, NodeAddr, RelayMode, SecretKey, Watcher};
use iroh_blobs::store::fs::FsStore;
use iroh_blobs::Hash;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ledger::sha256_hex;
use crate::watch::{is_ignored, rel_path_of};

/// ALPN for snapshot transfer sessions
pub const SNAPSHOT_ALPN: &[u8] = b"/mirrorsync/snapshot/1";

/// Current manifest format version
const MANIFEST_VERSION: u32 = 1;

/// Message type for a blob request
const BLOB_REQUEST_TAG: u8 = 0x10;

/// Response status: blob data follows
const RESPONSE_SUCCESS: u8 = 0x00;

/// Response status: blob not found
const RESPONSE_NOT_FOUND: u8 = 0x01;

/// Response status: error processing request
const RESPONSE_ERROR: u8 = 0x02;

/// Maximum blob size accepted over a transfer (1 GB)
const MAX_BLOB_TRANSFER_SIZE: u64 = 1024 * 1024 * 1024;

/// Opaque locator for a published snapshot: the manifest's content hash
/// plus the publisher's transfer address. Travels hex encoded inside the
/// `drive-key` control message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotLocator {
    /// Content hash of the snapshot manifest, hex
    pub manifest: String,
    /// Dialable address of the serving endpoint
    pub addr: NodeAddr,
}

impl fmt::Display for SnapshotLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Serialization of a plain data struct cannot fail
        let json = serde_json::to_vec(self).expect("locator serializes");
        f.write_str(&hex::encode(json))
    }
}

impl FromStr for SnapshotLocator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let json = hex::decode(s.trim())
            .map_err(|e| Error::transfer(format!("locator is not valid hex: {e}")))?;
        serde_json::from_slice(&json)
            .map_err(|e| Error::transfer(format!("locator is not a snapshot address: {e}")))
    }
}

/// Snapshot content listing, stored as a blob and addressed by its hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    files: Vec<ManifestEntry>,
}

/// One file in a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    /// Root-relative path with leading `/`
    path: String,
    /// Blob hash, hex
    hash: String,
    /// File size in bytes
    size: u64,
}

/// Recursively list the files under `root` that belong to the shared tree,
/// as `(relative path, absolute path)` pairs, sorted by relative path.
pub async fn scan_dir(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::filesystem(format!("failed to read {}: {e}", dir.display())))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::filesystem(format!("failed to read {}: {e}", dir.display())))?
        {
            let path = entry.path();
            let Some(rel) = rel_path_of(root, &path) else { continue };
            if is_ignored(&rel) {
                continue;
            }
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| Error::filesystem(format!("failed to stat {}: {e}", path.display())))?;
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                files.push((rel, path));
            }
        }
    }

    files.sort();
    Ok(files)
}

/// A published snapshot being served to one bootstrapping peer.
pub struct SnapshotSender {
    locator: SnapshotLocator,
    endpoint: Endpoint,
    scratch: PathBuf,
    serve_task: JoinHandle<()>,
    closed: bool,
}

impl SnapshotSender {
    /// Where a receiver can pull this snapshot from
    #[must_use]
    pub fn locator(&self) -> &SnapshotLocator {
        &self.locator
    }

    /// Tear down the transfer session: stop serving, close the endpoint,
    /// and remove the scratch directory. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.serve_task.abort();
        self.endpoint.close().await;
        if let Err(e) = tokio::fs::remove_dir_all(&self.scratch).await {
            debug!(path = %self.scratch.display(), error = %e, "Scratch cleanup skipped");
        }
        info!("Snapshot sender closed");
    }
}

/// Build a content-addressed snapshot of `root` and start serving it.
///
/// The snapshot store lives under `scratch`, which is recreated fresh and
/// removed again by [`SnapshotSender::close`].
pub async fn publish_snapshot(
    root: &Path,
    scratch: PathBuf,
    relay_enabled: bool,
) -> Result<SnapshotSender> {
    // A fresh session never reuses a stale cache
    let _ = tokio::fs::remove_dir_all(&scratch).await;
    tokio::fs::create_dir_all(&scratch)
        .await
        .map_err(|e| Error::transfer(format!("failed to create scratch directory: {e}")))?;

    let store = FsStore::load(&scratch)
        .await
        .map_err(|e| Error::transfer(format!("failed to open snapshot store: {e}")))?;

    // Ingest the tree
    let files = scan_dir(root).await?;
    let mut entries = Vec::with_capacity(files.len());
    for (rel, abs) in files {
        let size = tokio::fs::metadata(&abs)
            .await
            .map_err(|e| Error::filesystem(format!("failed to stat {}: {e}", abs.display())))?
            .len();
        let tag = store
            .blobs()
            .add_path(&abs)
            .await
            .map_err(|e| Error::transfer(format!("failed to ingest {}: {e}", abs.display())))?;
        entries.push(ManifestEntry { path: rel, hash: tag.hash.to_string(), size });
    }

    let manifest = Manifest { version: MANIFEST_VERSION, files: entries };
    let manifest_bytes =
        serde_json::to_vec(&manifest).map_err(|e| Error::transfer(format!("manifest encode: {e}")))?;
    let manifest_tag = store
        .blobs()
        .add_bytes(manifest_bytes)
        .await
        .map_err(|e| Error::transfer(format!("failed to store manifest: {e}")))?;

    // Dedicated transfer endpoint with an ephemeral identity
    let secret_key = SecretKey::generate(rand::thread_rng());
    let mut builder = Endpoint::builder()
        .secret_key(secret_key)
        .alpns(vec![SNAPSHOT_ALPN.to_vec()]);
    if relay_enabled {
        builder = builder.discovery_n0();
    } else {
        builder = builder.relay_mode(RelayMode::Disabled);
    }
    let endpoint = builder
        .bind()
        .await
        .map_err(|e| Error::transfer(format!("failed to bind transfer endpoint: {e}")))?;
    let addr = endpoint.node_addr().initialized().await.expect("node address watcher disconnected");

    let locator = SnapshotLocator { manifest: manifest_tag.hash.to_string(), addr };
    info!(
        files = manifest.files.len(),
        manifest = %locator.manifest,
        "Snapshot published"
    );

    // Serve blob requests until closed
    let serve_endpoint = endpoint.clone();
    let serve_task = tokio::spawn(async move {
        loop {
            let incoming = match serve_endpoint.accept().await {
                Some(incoming) => incoming,
                None => break,
            };
            let conn = match incoming.await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(error = %e, "Failed to accept transfer connection");
                    continue;
                }
            };
            let store = store.clone();
            tokio::spawn(async move {
                loop {
                    let (mut send, mut recv) = match conn.accept_bi().await {
                        Ok(streams) => streams,
                        Err(_) => break, // receiver done
                    };
                    if let Err(e) = handle_blob_request(&store, &mut send, &mut recv).await {
                        warn!(error = %e, "Blob request failed");
                    }
                }
            });
        }
    });

    Ok(SnapshotSender { locator, endpoint, scratch, serve_task, closed: false })
}

/// Serve one blob request on an accepted stream.
async fn handle_blob_request(
    store: &FsStore,
    send: &mut iroh::endpoint::SendStream,
    recv: &mut iroh::endpoint::RecvStream,
) -> Result<()> {
    let mut tag = [0u8; 1];
    recv.read_exact(&mut tag)
        .await
        .map_err(|e| Error::transfer(format!("failed to read request tag: {e}")))?;
    if tag[0] != BLOB_REQUEST_TAG {
        let _ = send.write_all(&[RESPONSE_ERROR]).await;
        return Err(Error::transfer(format!("unexpected request tag: {:#04x}", tag[0])));
    }

    let mut len_buf = [0u8; 4];
    recv.read_exact(&mut len_buf)
        .await
        .map_err(|e| Error::transfer(format!("failed to read hash length: {e}")))?;
    let hash_len = u32::from_be_bytes(len_buf) as usize;
    if hash_len > 128 {
        let _ = send.write_all(&[RESPONSE_ERROR]).await;
        return Err(Error::transfer(format!("invalid hash length: {hash_len}")));
    }

    let mut hash_buf = vec![0u8; hash_len];
    recv.read_exact(&mut hash_buf)
        .await
        .map_err(|e| Error::transfer(format!("failed to read hash: {e}")))?;
    let hash_str = String::from_utf8(hash_buf)
        .map_err(|e| Error::transfer(format!("invalid hash encoding: {e}")))?;
    let hash: Hash = hash_str
        .parse()
        .map_err(|e| Error::transfer(format!("invalid hash: {e}")))?;

    let present = store
        .blobs()
        .has(hash)
        .await
        .map_err(|e| Error::transfer(format!("failed to check blob: {e}")))?;
    if !present {
        debug!(hash = %hash_str, "Requested blob not in snapshot");
        send.write_all(&[RESPONSE_NOT_FOUND])
            .await
            .map_err(|e| Error::transfer(format!("failed to send not-found: {e}")))?;
        let _ = send.finish();
        return Ok(());
    }

    let data = store
        .blobs()
        .get_bytes(hash)
        .await
        .map_err(|e| Error::transfer(format!("failed to read blob: {e}")))?;

    send.write_all(&[RESPONSE_SUCCESS])
        .await
        .map_err(|e| Error::transfer(format!("failed to send status: {e}")))?;
    send.write_all(&(data.len() as u64).to_be_bytes())
        .await
        .map_err(|e| Error::transfer(format!("failed to send data length: {e}")))?;
    send.write_all(&data)
        .await
        .map_err(|e| Error::transfer(format!("failed to send data: {e}")))?;
    send.finish()
        .map_err(|e| Error::transfer(format!("failed to finish response: {e}")))?;

    debug!(hash = %hash_str, size = data.len(), "Blob served");
    Ok(())
}

/// Pull the snapshot at `locator` and materialize it into `root`.
///
/// Entries whose on-disk bytes already match are left alone; everything else
/// is fetched, verified, cached in a scratch [`FsStore`], and written out
/// (parent directories created as needed). Returns `(path, sha256)` pairs
/// for every materialized or already-identical entry, which the caller seeds
/// into the hash ledger so the watcher's view of those writes is absorbed.
///
/// All session resources are released on success and failure alike.
pub async fn fetch_snapshot(
    locator: &SnapshotLocator,
    root: &Path,
    scratch: PathBuf,
    relay_enabled: bool,
) -> Result<Vec<(String, String)>> {
    let _ = tokio::fs::remove_dir_all(&scratch).await;
    tokio::fs::create_dir_all(&scratch)
        .await
        .map_err(|e| Error::transfer(format!("failed to create scratch directory: {e}")))?;

    let store = FsStore::load(&scratch)
        .await
        .map_err(|e| Error::transfer(format!("failed to open snapshot cache: {e}")))?;

    let secret_key = SecretKey::generate(rand::thread_rng());
    let mut builder = Endpoint::builder().secret_key(secret_key);
    if relay_enabled {
        builder = builder.discovery_n0();
    } else {
        builder = builder.relay_mode(RelayMode::Disabled);
    }
    let endpoint = builder
        .bind()
        .await
        .map_err(|e| Error::transfer(format!("failed to bind transfer endpoint: {e}")))?;

    let result = fetch_into(&endpoint, &store, locator, root).await;

    // Release the session whether or not the pull succeeded
    endpoint.close().await;
    if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
        debug!(path = %scratch.display(), error = %e, "Scratch cleanup skipped");
    }

    result
}

/// The pull itself, separated so the caller can release resources on every
/// exit path.
async fn fetch_into(
    endpoint: &Endpoint,
    store: &FsStore,
    locator: &SnapshotLocator,
    root: &Path,
) -> Result<Vec<(String, String)>> {
    let conn = endpoint
        .connect(locator.addr.clone(), SNAPSHOT_ALPN)
        .await
        .map_err(|e| Error::transfer(format!("failed to reach snapshot sender: {e}")))?;

    let manifest_bytes = request_blob(&conn, &locator.manifest).await?;
    let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
        .map_err(|e| Error::transfer(format!("invalid manifest: {e}")))?;
    if manifest.version != MANIFEST_VERSION {
        return Err(Error::transfer(format!(
            "unsupported manifest version: {}",
            manifest.version
        )));
    }
    info!(files = manifest.files.len(), "Fetching snapshot");

    let mut seeds = Vec::with_capacity(manifest.files.len());
    for entry in &manifest.files {
        let target = root.join(entry.path.trim_start_matches('/'));

        // Identical content already on disk needs no transfer, only a
        // ledger seed so the rescan of it stays silent
        if let Ok(existing) = tokio::fs::read(&target).await {
            if blake3::hash(&existing).to_hex().to_string() == entry.hash {
                seeds.push((entry.path.clone(), sha256_hex(&existing)));
                continue;
            }
        }

        let data = request_blob(&conn, &entry.hash).await?;
        if blake3::hash(&data).to_hex().to_string() != entry.hash {
            return Err(Error::transfer(format!(
                "hash mismatch for {}: received data does not match manifest",
                entry.path
            )));
        }

        store
            .blobs()
            .add_bytes(data.clone())
            .await
            .map_err(|e| Error::transfer(format!("failed to cache blob: {e}")))?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::filesystem(format!("failed to create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&target, &data)
            .await
            .map_err(|e| Error::filesystem(format!("failed to write {}: {e}", target.display())))?;

        debug!(path = %entry.path, size = data.len(), "Snapshot entry materialized");
        seeds.push((entry.path.clone(), sha256_hex(&data)));
    }

    conn.close(0u32.into(), b"done");
    Ok(seeds)
}

/// Request one blob by hash over a fresh stream on `conn`.
async fn request_blob(conn: &iroh::endpoint::Connection, hash_hex: &str) -> Result<Bytes> {
    let (mut send, mut recv) = conn
        .open_bi()
        .await
        .map_err(|e| Error::transfer(format!("failed to open request stream: {e}")))?;

    send.write_all(&[BLOB_REQUEST_TAG])
        .await
        .map_err(|e| Error::transfer(format!("failed to send request tag: {e}")))?;
    send.write_all(&(hash_hex.len() as u32).to_be_bytes())
        .await
        .map_err(|e| Error::transfer(format!("failed to send hash length: {e}")))?;
    send.write_all(hash_hex.as_bytes())
        .await
        .map_err(|e| Error::transfer(format!("failed to send hash: {e}")))?;
    send.finish()
        .map_err(|e| Error::transfer(format!("failed to finish request: {e}")))?;

    let mut status = [0u8; 1];
    recv.read_exact(&mut status)
        .await
        .map_err(|e| Error::transfer(format!("failed to read response status: {e}")))?;
    match status[0] {
        RESPONSE_SUCCESS => {}
        RESPONSE_NOT_FOUND => {
            return Err(Error::transfer(format!("sender does not have blob {hash_hex}")))
        }
        status => {
            return Err(Error::transfer(format!(
                "sender returned error status {status:#04x} for blob {hash_hex}"
            )))
        }
    }

    let mut len_buf = [0u8; 8];
    recv.read_exact(&mut len_buf)
        .await
        .map_err(|e| Error::transfer(format!("failed to read data length: {e}")))?;
    let data_len = u64::from_be_bytes(len_buf);
    if data_len > MAX_BLOB_TRANSFER_SIZE {
        return Err(Error::transfer(format!(
            "blob too large for transfer: {data_len} bytes (max {MAX_BLOB_TRANSFER_SIZE})"
        )));
    }

    let mut data = vec![0u8; data_len as usize];
    recv.read_exact(&mut data)
        .await
        .map_err(|e| Error::transfer(format!("failed to read data: {e}")))?;
    Ok(Bytes::from(data))
}
