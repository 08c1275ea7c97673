//! Filesystem watch bridge.
//!
//! Watches the sync root recursively and forwards settled, root-relative
//! paths into the engine's event channel. Raw notify events are debounced
//! per path so a path only fires once it has been quiet for the configured
//! window; editors and copies produce bursts of partial writes that must
//! not be observed mid-flight. Whether a settled path is an upsert or a
//! deletion is decided by the engine when it reads the path, so renames and
//! transient files need no special casing here.
//!
//! Only changes after start-up matter; notify performs no initial scan, so
//! pre-existing files stay silent until touched.

use std::collections::HashMap;
use std::path::{Component, Path};
use std::time::{Duration, Instant};

use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Editor swap-file extensions
const SWAP_EXTENSIONS: [&str; 2] = ["swp", "swo"];

/// OS metadata files that never belong to the shared tree
const OS_METADATA_FILES: [&str; 2] = [".DS_Store", "Thumbs.db"];

/// Should this root-relative path be excluded from synchronization?
///
/// Filters reserved metadata directories (a stray snapshot cache placed
/// inside the root) and common editor temp-file conventions: swap files,
/// `~` backups, `.#` lock files, and OS metadata files.
#[must_use]
pub fn is_ignored(rel_path: &str) -> bool {
    for component in rel_path.split('/').filter(|c| !c.is_empty()) {
        if component == ".mirrorsync" || is_scratch_dir_name(component) {
            return true;
        }
        if OS_METADATA_FILES.contains(&component) {
            return true;
        }
        if component.starts_with(".#") || component.starts_with('~') || component.ends_with('~') {
            return true;
        }
        if let Some((_, ext)) = component.rsplit_once('.') {
            if SWAP_EXTENSIONS.contains(&ext) {
                return true;
            }
        }
    }
    false
}

/// A `.`-prefixed directory named by a 64-hex identity key, the naming
/// scheme of snapshot scratch caches.
fn is_scratch_dir_name(component: &str) -> bool {
    component
        .strip_prefix('.')
        .is_some_and(|rest| rest.len() == 64 && rest.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Map an absolute event path to the root-relative, forward-slash form used
/// as a document key (leading `/`). Returns `None` for paths outside the
/// root and for the root itself.
#[must_use]
pub fn rel_path_of(root: &Path, path: &Path) -> Option<String> {
    let stripped = path.strip_prefix(root).ok()?;
    let mut rel = String::new();
    for component in stripped.components() {
        match component {
            Component::Normal(part) => {
                rel.push('/');
                rel.push_str(&part.to_string_lossy());
            }
            _ => return None,
        }
    }
    if rel.is_empty() {
        None
    } else {
        Some(rel)
    }
}

/// Handle to a running watch bridge; dropping it stops watching.
pub struct WatchBridge {
    // Held for its side effect: dropping the watcher unregisters it
    _watcher: notify::RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for WatchBridge {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl WatchBridge {
    /// Watch `root` recursively, emitting each settled root-relative path on
    /// `events` once it has been quiet for `debounce`.
    pub fn spawn(
        root: &Path,
        debounce: Duration,
        events: mpsc::UnboundedSender<String>,
    ) -> Result<Self> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |evt| {
            let _ = raw_tx.send(evt);
        })
        .map_err(|e| Error::init(format!("failed to create filesystem watcher: {e}")))?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| Error::init(format!("failed to watch {}: {e}", root.display())))?;

        let root = root.to_path_buf();
        let task = tokio::spawn(async move {
            let mut pending: HashMap<String, Instant> = HashMap::new();
            let tick = Duration::from_millis((debounce.as_millis() as u64 / 2).max(25));
            let mut interval = tokio::time::interval(tick);

            loop {
                tokio::select! {
                    evt = raw_rx.recv() => {
                        let Some(evt) = evt else { break };
                        let event = match evt {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(error = %e, "Watcher error");
                                continue;
                            }
                        };
                        if !matches!(
                            event.kind,
                            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                        ) {
                            continue;
                        }
                        let now = Instant::now();
                        for path in &event.paths {
                            if let Some(rel) = relevant(&root, path) {
                                pending.insert(rel, now);
                            }
                        }
                    }
                    _ = interval.tick() => {
                        let now = Instant::now();
                        let settled: Vec<String> = pending
                            .iter()
                            .filter(|(_, touched)| now.duration_since(**touched) >= debounce)
                            .map(|(rel, _)| rel.clone())
                            .collect();
                        for rel in settled {
                            pending.remove(&rel);
                            debug!(path = %rel, "Watch event settled");
                            if events.send(rel).is_err() {
                                return; // engine gone
                            }
                        }
                    }
                }
            }
        });

        Ok(Self { _watcher: watcher, task })
    }
}

/// Relative path of an event target, if it belongs to the synced tree.
///
/// Directories themselves never sync (they exist only as parents of files),
/// so events for currently-existing directories are dropped here. A deleted
/// entry no longer reads as a directory and passes through as a candidate
/// deletion.
fn relevant(root: &Path, path: &Path) -> Option<String> {
    if path.is_dir() {
        return None;
    }
    let rel = rel_path_of(root, path)?;
    if is_ignored(&rel) {
        None
    } else {
        Some(rel)
    }
}
