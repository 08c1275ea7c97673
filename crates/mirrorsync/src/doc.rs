//! Replicated directory document.
//!
//! [`TreeDoc`] is a CRDT map from root-relative file path (forward-slash
//! separated, leading `/`) to a `{content, mtime}` record, backed by an
//! Automerge [`AutoCommit`] document. Concurrent edits from any number of
//! peers merge deterministically regardless of arrival order; the last
//! writer by Automerge's causal ordering wins per path.
//!
//! Local mutations go through [`TreeDoc::set_file`] / [`TreeDoc::remove_file`]
//! and are flushed for broadcast with [`TreeDoc::take_update`], which returns
//! the incremental change blob accumulated since the previous flush. Remote
//! blobs are merged with [`TreeDoc::apply_update`], which reports exactly the
//! top-level paths whose winning value changed; the caller mirrors those to
//! the filesystem. Local mutations never come back through that channel, so
//! a write observed on disk can only ever flow outward once.

use automerge::{transaction::Transactable, AutoCommit, ObjType, PatchAction, ReadDoc, ScalarValue};
use bytes::Bytes;

use crate::error::{Error, Result};

/// One file's replicated state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Full file content
    pub content: Vec<u8>,
    /// Wall-clock write time in milliseconds, advisory only (conflict
    /// resolution is by CRDT ordering, not by this value)
    pub mtime: i64,
}

/// A change produced by merging a remote update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocChange {
    /// The path now holds this record
    Upserted {
        /// Root-relative path
        path: String,
        /// Winning record after the merge
        record: FileRecord,
    },
    /// The path was removed from the document
    Removed {
        /// Root-relative path
        path: String,
    },
}

/// CRDT-backed mapping from file path to [`FileRecord`].
pub struct TreeDoc {
    doc: AutoCommit,
}

impl Default for TreeDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeDoc {
    /// Create an empty document with a fresh actor id
    #[must_use]
    pub fn new() -> Self {
        Self { doc: AutoCommit::new() }
    }

    /// Upsert the record for `path`.
    pub fn set_file(&mut self, path: &str, content: Vec<u8>, mtime: i64) -> Result<()> {
        let obj = self
            .doc
            .put_object(automerge::ROOT, path, ObjType::Map)
            .map_err(|e| Error::merge(format!("failed to put file object: {e}")))?;
        self.doc
            .put(&obj, "content", ScalarValue::Bytes(content))
            .map_err(|e| Error::merge(format!("failed to put content: {e}")))?;
        self.doc
            .put(&obj, "mtime", ScalarValue::Timestamp(mtime))
            .map_err(|e| Error::merge(format!("failed to put mtime: {e}")))?;
        Ok(())
    }

    /// Remove `path` from the document.
    ///
    /// Removing an absent path is a no-op and returns `false`, so deletions
    /// are idempotent at the document level.
    pub fn remove_file(&mut self, path: &str) -> Result<bool> {
        let present = self
            .doc
            .get(automerge::ROOT, path)
            .map_err(|e| Error::merge(format!("failed to look up path: {e}")))?
            .is_some();
        if !present {
            return Ok(false);
        }
        self.doc
            .delete(automerge::ROOT, path)
            .map_err(|e| Error::merge(format!("failed to delete path: {e}")))?;
        Ok(true)
    }

    /// Read the record stored under `path`, if any.
    pub fn get(&self, path: &str) -> Result<Option<FileRecord>> {
        let Some((value, obj)) = self
            .doc
            .get(automerge::ROOT, path)
            .map_err(|e| Error::merge(format!("failed to get path: {e}")))?
        else {
            return Ok(None);
        };
        if !matches!(value, automerge::Value::Object(ObjType::Map)) {
            return Ok(None);
        }

        let content = match self
            .doc
            .get(&obj, "content")
            .map_err(|e| Error::merge(format!("failed to get content: {e}")))?
        {
            Some((automerge::Value::Scalar(s), _)) => match s.as_ref() {
                ScalarValue::Bytes(b) => b.clone(),
                _ => return Ok(None),
            },
            _ => return Ok(None),
        };

        let mtime = match self
            .doc
            .get(&obj, "mtime")
            .map_err(|e| Error::merge(format!("failed to get mtime: {e}")))?
        {
            Some((automerge::Value::Scalar(s), _)) => match s.as_ref() {
                ScalarValue::Timestamp(t) | ScalarValue::Int(t) => *t,
                _ => 0,
            },
            _ => 0,
        };

        Ok(Some(FileRecord { content, mtime }))
    }

    /// All paths currently present in the document
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.doc.keys(automerge::ROOT).map(|k| k.to_string()).collect()
    }

    /// Flush local (and freshly merged) changes as an incremental update
    /// blob for broadcast, or `None` when nothing changed since the last
    /// flush.
    pub fn take_update(&mut self) -> Option<Bytes> {
        let bytes = self.doc.save_incremental();
        if bytes.is_empty() {
            None
        } else {
            Some(Bytes::from(bytes))
        }
    }

    /// Merge a remote update blob and report the top-level paths whose
    /// winning value changed.
    ///
    /// Merging is idempotent: applying the same blob twice leaves the
    /// document unchanged and reports no changes the second time. Blobs that
    /// arrive before their causal dependencies are held back internally by
    /// Automerge and surface once the missing changes arrive.
    pub fn apply_update(&mut self, blob: &[u8]) -> Result<Vec<DocChange>> {
        let before = self.doc.get_heads();
        self.doc
            .load_incremental(blob)
            .map_err(|e| Error::merge(format!("failed to apply update: {e}")))?;
        let after = self.doc.get_heads();
        if before == after {
            return Ok(Vec::new());
        }

        let mut touched = Vec::new();
        for patch in self.doc.diff(&before, &after) {
            if patch.obj != automerge::ROOT {
                continue;
            }
            let key = match patch.action {
                PatchAction::PutMap { key, .. } | PatchAction::DeleteMap { key } => key,
                _ => continue,
            };
            if !touched.contains(&key) {
                touched.push(key);
            }
        }

        let mut changes = Vec::with_capacity(touched.len());
        for path in touched {
            match self.get(&path)? {
                Some(record) => changes.push(DocChange::Upserted { path, record }),
                None => changes.push(DocChange::Removed { path }),
            }
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upserts(changes: &[DocChange]) -> Vec<&str> {
        changes
            .iter()
            .filter_map(|c| match c {
                DocChange::Upserted { path, .. } => Some(path.as_str()),
                DocChange::Removed { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_set_and_get_roundtrip() {
        let mut doc = TreeDoc::new();
        doc.set_file("/hello.txt", b"hi".to_vec(), 42).unwrap();

        let record = doc.get("/hello.txt").unwrap().unwrap();
        assert_eq!(record.content, b"hi");
        assert_eq!(record.mtime, 42);
        assert_eq!(doc.paths(), vec!["/hello.txt".to_string()]);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut doc = TreeDoc::new();
        assert!(!doc.remove_file("/ghost").unwrap());
        assert!(doc.take_update().is_none());
    }

    #[test]
    fn test_take_update_flushes_once() {
        let mut doc = TreeDoc::new();
        assert!(doc.take_update().is_none());

        doc.set_file("/a", b"1".to_vec(), 1).unwrap();
        assert!(doc.take_update().is_some());
        assert!(doc.take_update().is_none());
    }

    #[test]
    fn test_apply_update_reports_upsert() {
        let mut a = TreeDoc::new();
        let mut b = TreeDoc::new();

        a.set_file("/f.txt", b"data".to_vec(), 7).unwrap();
        let blob = a.take_update().unwrap();

        let changes = b.apply_update(&blob).unwrap();
        assert_eq!(upserts(&changes), vec!["/f.txt"]);
        assert_eq!(b.get("/f.txt").unwrap().unwrap().content, b"data");
    }

    #[test]
    fn test_apply_update_idempotent() {
        let mut a = TreeDoc::new();
        let mut b = TreeDoc::new();

        a.set_file("/f", b"x".to_vec(), 1).unwrap();
        let blob = a.take_update().unwrap();

        assert!(!b.apply_update(&blob).unwrap().is_empty());
        assert!(b.apply_update(&blob).unwrap().is_empty());
        assert_eq!(b.get("/f").unwrap().unwrap().content, b"x");
    }

    #[test]
    fn test_deletion_propagates() {
        let mut a = TreeDoc::new();
        let mut b = TreeDoc::new();

        a.set_file("/gone.txt", b"bye".to_vec(), 1).unwrap();
        b.apply_update(&a.take_update().unwrap()).unwrap();

        assert!(a.remove_file("/gone.txt").unwrap());
        let changes = b.apply_update(&a.take_update().unwrap()).unwrap();
        assert_eq!(
            changes,
            vec![DocChange::Removed { path: "/gone.txt".to_string() }]
        );
        assert!(b.get("/gone.txt").unwrap().is_none());
    }

    #[test]
    fn test_concurrent_writes_converge() {
        let mut a = TreeDoc::new();
        let mut b = TreeDoc::new();

        a.set_file("/f", b"from-a".to_vec(), 1).unwrap();
        b.set_file("/f", b"from-b".to_vec(), 2).unwrap();

        let blob_a = a.take_update().unwrap();
        let blob_b = b.take_update().unwrap();

        a.apply_update(&blob_b).unwrap();
        b.apply_update(&blob_a).unwrap();

        let final_a = a.get("/f").unwrap().unwrap();
        let final_b = b.get("/f").unwrap().unwrap();
        assert_eq!(final_a, final_b);
        assert!(final_a.content == b"from-a" || final_a.content == b"from-b");
    }

    #[test]
    fn test_out_of_order_blobs_surface_after_gap_fills() {
        let mut a = TreeDoc::new();
        let mut b = TreeDoc::new();

        a.set_file("/f", b"v1".to_vec(), 1).unwrap();
        let blob1 = a.take_update().unwrap();
        a.set_file("/f", b"v2".to_vec(), 2).unwrap();
        let blob2 = a.take_update().unwrap();

        // blob2 depends on blob1; applied alone it stays pending
        b.apply_update(&blob2).unwrap();
        assert!(b.get("/f").unwrap().is_none());

        let changes = b.apply_update(&blob1).unwrap();
        assert_eq!(upserts(&changes), vec!["/f"]);
        assert_eq!(b.get("/f").unwrap().unwrap().content, b"v2");
    }

    #[test]
    fn test_rebroadcast_of_merged_changes() {
        let mut a = TreeDoc::new();
        let mut b = TreeDoc::new();
        let mut c = TreeDoc::new();

        a.set_file("/relay.txt", b"payload".to_vec(), 1).unwrap();
        b.apply_update(&a.take_update().unwrap()).unwrap();

        // After a merge, the merged ops flush as b's next outgoing update
        let relayed = b.take_update().unwrap();
        c.apply_update(&relayed).unwrap();
        assert_eq!(c.get("/relay.txt").unwrap().unwrap().content, b"payload");
    }

    #[test]
    fn test_apply_garbage_fails() {
        let mut doc = TreeDoc::new();
        assert!(doc.apply_update(b"definitely not automerge").is_err());
    }
}
