//! In-memory backend
//!
//! Clones share the same committed image, so a test can drop a
//! `SwingStore` (losing its uncommitted overlay, like a crash) and reopen
//! a new one over the same handle.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::rc::Rc;

use super::{CommitBatch, StorageBackend, TranscriptKey};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct MemoryImage {
    kv: BTreeMap<String, String>,
    transcript: BTreeMap<TranscriptKey, String>,
    blobs: BTreeMap<String, Vec<u8>>,
    commits: u64,
}

/// Shared in-memory committed image.
#[derive(Clone, Debug, Default)]
pub struct MemoryBackend {
    image: Rc<RefCell<MemoryImage>>,
    fail_next_commit: Rc<Cell<bool>>,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `apply` fail without touching the image.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.set(true);
    }

    /// Number of successful commits applied so far.
    pub fn commit_count(&self) -> u64 {
        self.image.borrow().commits
    }

    /// Number of committed kv entries.
    pub fn kv_len(&self) -> usize {
        self.image.borrow().kv.len()
    }
}

impl StorageBackend for MemoryBackend {
    fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.image.borrow().kv.get(key).cloned())
    }

    fn kv_next_key(&self, after: &str) -> Result<Option<String>, StoreError> {
        let image = self.image.borrow();
        Ok(image
            .kv
            .range::<str, _>((Bound::Excluded(after), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone()))
    }

    fn transcript_item(&self, vat_id: &str, position: u64) -> Result<Option<String>, StoreError> {
        Ok(self
            .image
            .borrow()
            .transcript
            .get(&(vat_id.to_string(), position))
            .cloned())
    }

    fn blob_get(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.image.borrow().blobs.get(id).cloned())
    }

    fn apply(&mut self, batch: &CommitBatch) -> Result<(), StoreError> {
        if self.fail_next_commit.replace(false) {
            return Err(StoreError::CommitFailed("injected failure".into()));
        }
        let mut image = self.image.borrow_mut();
        for (key, value) in &batch.kv {
            match value {
                Some(v) => image.kv.insert(key.clone(), v.clone()),
                None => image.kv.remove(key),
            };
        }
        for (key, value) in &batch.transcript {
            match value {
                Some(v) => image.transcript.insert(key.clone(), v.clone()),
                None => image.transcript.remove(key),
            };
        }
        for (key, value) in &batch.blobs {
            match value {
                Some(v) => image.blobs.insert(key.clone(), v.clone()),
                None => image.blobs.remove(key),
            };
        }
        image.commits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_image() {
        let mut a = MemoryBackend::new();
        let b = a.clone();
        let mut batch = CommitBatch::default();
        batch.kv.insert("k".into(), Some("v".into()));
        a.apply(&batch).unwrap();
        assert_eq!(b.kv_get("k").unwrap().as_deref(), Some("v"));
        assert_eq!(b.commit_count(), 1);
    }

    #[test]
    fn test_injected_failure_leaves_image_untouched() {
        let mut backend = MemoryBackend::new();
        backend.fail_next_commit();
        let mut batch = CommitBatch::default();
        batch.kv.insert("k".into(), Some("v".into()));
        assert!(backend.apply(&batch).unwrap_err().is_commit_failure());
        assert_eq!(backend.kv_get("k").unwrap(), None);
        backend.apply(&batch).unwrap();
        assert_eq!(backend.kv_get("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_next_key_is_strict() {
        let mut backend = MemoryBackend::new();
        let mut batch = CommitBatch::default();
        batch.kv.insert("a".into(), Some("1".into()));
        batch.kv.insert("b".into(), Some("2".into()));
        backend.apply(&batch).unwrap();
        assert_eq!(backend.kv_next_key("").unwrap().as_deref(), Some("a"));
        assert_eq!(backend.kv_next_key("a").unwrap().as_deref(), Some("b"));
        assert_eq!(backend.kv_next_key("b").unwrap(), None);
    }
}
