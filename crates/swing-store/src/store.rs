//! The transactional overlay store
//!
//! # Write path
//!
//! ```text
//!   kernel / host writes
//!          │
//!          ▼
//!   ┌──────────────┐   undo log (per crank)   ┌─────────────┐
//!   │   pending    │◀────────────────────────▶│ savepoints  │
//!   │ CommitBatch  │                          └─────────────┘
//!   └──────┬───────┘
//!          │ commit()
//!          ▼
//!   ┌──────────────┐
//!   │   backend    │  (committed image)
//!   └──────────────┘
//! ```
//!
//! Reads consult the pending batch first and fall through to the backend.

use std::ops::Bound;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::backend::{CommitBatch, StorageBackend, TranscriptKey};
use crate::error::StoreError;

/// Key holding the chained hash of all consensus mutations.
pub const ACTIVITY_HASH_KEY: &str = "activityhash";

/// Classification of a kv key by prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyClass {
    /// `local.*`: node-local bookkeeping, never hashed.
    Local,
    /// `host.*`: written only by the host (block manager).
    Host,
    /// Everything else: kernel state shared by every validator.
    Consensus,
}

impl KeyClass {
    /// Classify a key.
    pub fn of(key: &str) -> Self {
        if key.starts_with("local.") {
            KeyClass::Local
        } else if key.starts_with("host.") {
            KeyClass::Host
        } else {
            KeyClass::Consensus
        }
    }
}

/// Result of [`SwingStore::emit_crank_hashes`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrankHashes {
    /// Hash of the consensus mutations made by the crank.
    pub crankhash: String,
    /// Chained hash over every crank so far.
    pub activityhash: String,
}

#[derive(Debug)]
enum Undo {
    Kv(String, Option<Option<String>>),
    Transcript(TranscriptKey, Option<Option<String>>),
    Blob(String, Option<Option<Vec<u8>>>),
}

#[derive(Debug)]
struct Savepoint {
    name: String,
    undo_len: usize,
    hash_len: usize,
}

/// Transactional store with crank savepoints and an atomic commit.
pub struct SwingStore {
    backend: Box<dyn StorageBackend>,
    pending: CommitBatch,
    in_crank: bool,
    undo: Vec<Undo>,
    savepoints: Vec<Savepoint>,
    crank_hash_input: Vec<u8>,
}

impl SwingStore {
    /// Open a store over an existing backend.
    pub fn open(backend: impl StorageBackend + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            pending: CommitBatch::default(),
            in_crank: false,
            undo: Vec::new(),
            savepoints: Vec::new(),
            crank_hash_input: Vec::new(),
        }
    }

    /// Open a store over a fresh in-memory backend.
    pub fn in_memory() -> Self {
        Self::open(crate::backend::MemoryBackend::new())
    }

    // ========================================================================
    // Key-value (kernel facet)
    // ========================================================================

    /// Read a key, seeing uncommitted writes.
    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.pending.kv.get(key) {
            Some(value) => Ok(value.clone()),
            None => self.backend.kv_get(key),
        }
    }

    /// Read a key that must be present.
    pub fn get_required(&self, key: &str) -> Result<String, StoreError> {
        self.get(key)?
            .ok_or_else(|| StoreError::corrupt(key, "missing required key"))
    }

    /// Check whether a key is present.
    pub fn has(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// Write a kernel key. Host keys are refused.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let class = KeyClass::of(key);
        if class == KeyClass::Host {
            return Err(StoreError::KeyClass {
                key: key.to_string(),
                facet: "kernel",
            });
        }
        if class == KeyClass::Consensus {
            self.note_hash(&["add", key, value]);
        }
        self.write_kv(key, Some(value.to_string()));
        Ok(())
    }

    /// Delete a kernel key. Host keys are refused.
    pub fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        let class = KeyClass::of(key);
        if class == KeyClass::Host {
            return Err(StoreError::KeyClass {
                key: key.to_string(),
                facet: "kernel",
            });
        }
        if class == KeyClass::Consensus {
            self.note_hash(&["delete", key]);
        }
        self.write_kv(key, None);
        Ok(())
    }

    /// Write a host key. Only `host.*` keys are accepted.
    pub fn host_set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.require_host_key(key)?;
        self.write_kv(key, Some(value.to_string()));
        Ok(())
    }

    /// Delete a host key. Only `host.*` keys are accepted.
    pub fn host_delete(&mut self, key: &str) -> Result<(), StoreError> {
        self.require_host_key(key)?;
        self.write_kv(key, None);
        Ok(())
    }

    fn require_host_key(&self, key: &str) -> Result<(), StoreError> {
        if KeyClass::of(key) == KeyClass::Host {
            Ok(())
        } else {
            Err(StoreError::KeyClass {
                key: key.to_string(),
                facet: "host",
            })
        }
    }

    /// Smallest live key strictly greater than `after`, merging the
    /// committed image with pending writes.
    pub fn get_next_key(&self, after: &str) -> Result<Option<String>, StoreError> {
        let mut cursor = after.to_string();
        let committed = loop {
            match self.backend.kv_next_key(&cursor)? {
                Some(key) if matches!(self.pending.kv.get(&key), Some(None)) => cursor = key,
                other => break other,
            }
        };
        let pending = self
            .pending
            .kv
            .range::<str, _>((Bound::Excluded(after), Bound::Unbounded))
            .find(|(_, v)| v.is_some())
            .map(|(k, _)| k.clone());
        Ok(match (committed, pending) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        })
    }

    /// All live keys starting with `prefix`, in order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut cursor = prefix.to_string();
        if self.has(prefix)? {
            keys.push(prefix.to_string());
        }
        while let Some(key) = self.get_next_key(&cursor)? {
            if !key.starts_with(prefix) {
                break;
            }
            cursor.clone_from(&key);
            keys.push(key);
        }
        Ok(keys)
    }

    // ========================================================================
    // Overlay primitives
    // ========================================================================

    pub(crate) fn write_kv(&mut self, key: &str, value: Option<String>) {
        if self.in_crank {
            let prev = self.pending.kv.get(key).cloned();
            self.undo.push(Undo::Kv(key.to_string(), prev));
        }
        self.pending.kv.insert(key.to_string(), value);
    }

    pub(crate) fn read_transcript_item(
        &self,
        vat_id: &str,
        position: u64,
    ) -> Result<Option<String>, StoreError> {
        match self.pending.transcript.get(&(vat_id.to_string(), position)) {
            Some(item) => Ok(item.clone()),
            None => self.backend.transcript_item(vat_id, position),
        }
    }

    pub(crate) fn write_transcript_item(&mut self, vat_id: &str, position: u64, item: Option<String>) {
        let key = (vat_id.to_string(), position);
        if self.in_crank {
            let prev = self.pending.transcript.get(&key).cloned();
            self.undo.push(Undo::Transcript(key.clone(), prev));
        }
        self.pending.transcript.insert(key, item);
    }

    pub(crate) fn read_blob(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.pending.blobs.get(id) {
            Some(data) => Ok(data.clone()),
            None => self.backend.blob_get(id),
        }
    }

    pub(crate) fn write_blob(&mut self, id: &str, data: Option<Vec<u8>>) {
        if self.in_crank {
            let prev = self.pending.blobs.get(id).cloned();
            self.undo.push(Undo::Blob(id.to_string(), prev));
        }
        self.pending.blobs.insert(id.to_string(), data);
    }

    fn note_hash(&mut self, parts: &[&str]) {
        if !self.in_crank {
            return;
        }
        for part in parts {
            self.crank_hash_input.extend_from_slice(part.as_bytes());
            self.crank_hash_input.push(b'\n');
        }
    }

    // ========================================================================
    // Crank bracketing
    // ========================================================================

    /// Begin a crank. Writes from here on can be rolled back to a savepoint.
    pub fn start_crank(&mut self) -> Result<(), StoreError> {
        if self.in_crank {
            return Err(StoreError::CrankState {
                operation: "start_crank",
                detail: "already in a crank",
            });
        }
        self.in_crank = true;
        self.undo.clear();
        self.savepoints.clear();
        self.crank_hash_input.clear();
        Ok(())
    }

    /// Check whether a crank is open.
    pub fn in_crank(&self) -> bool {
        self.in_crank
    }

    /// Mark a named point that [`rollback_to`](Self::rollback_to) can return to.
    pub fn establish_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        if !self.in_crank {
            return Err(StoreError::CrankState {
                operation: "establish_savepoint",
                detail: "outside of a crank",
            });
        }
        self.savepoints.push(Savepoint {
            name: name.to_string(),
            undo_len: self.undo.len(),
            hash_len: self.crank_hash_input.len(),
        });
        Ok(())
    }

    /// Undo every write made since the named savepoint.
    ///
    /// The savepoint itself and any earlier ones survive; later ones are
    /// discarded.
    pub fn rollback_to(&mut self, name: &str) -> Result<(), StoreError> {
        if !self.in_crank {
            return Err(StoreError::CrankState {
                operation: "rollback_to",
                detail: "outside of a crank",
            });
        }
        let idx = self
            .savepoints
            .iter()
            .rposition(|sp| sp.name == name)
            .ok_or_else(|| StoreError::NoSuchSavepoint(name.to_string()))?;
        let undo_len = self.savepoints[idx].undo_len;
        let hash_len = self.savepoints[idx].hash_len;
        self.savepoints.truncate(idx + 1);

        let undone = self.undo.len() - undo_len;
        while self.undo.len() > undo_len {
            match self.undo.pop() {
                Some(Undo::Kv(key, prev)) => restore(&mut self.pending.kv, key, prev),
                Some(Undo::Transcript(key, prev)) => {
                    restore(&mut self.pending.transcript, key, prev)
                }
                Some(Undo::Blob(key, prev)) => restore(&mut self.pending.blobs, key, prev),
                None => break,
            }
        }
        self.crank_hash_input.truncate(hash_len);
        debug!(savepoint = name, undone, "rolled back crank");
        Ok(())
    }

    /// Close the crank. Its writes stay pending until [`commit`](Self::commit).
    pub fn end_crank(&mut self) -> Result<(), StoreError> {
        if !self.in_crank {
            return Err(StoreError::CrankState {
                operation: "end_crank",
                detail: "not in a crank",
            });
        }
        self.in_crank = false;
        self.undo.clear();
        self.savepoints.clear();
        Ok(())
    }

    /// Digest this crank's consensus mutations and fold them into the
    /// activity hash.
    pub fn emit_crank_hashes(&mut self) -> Result<CrankHashes, StoreError> {
        let crankhash = hex::encode(Sha256::digest(&self.crank_hash_input));
        self.crank_hash_input.clear();

        let old = self.get(ACTIVITY_HASH_KEY)?.unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(b"activityhash\n");
        hasher.update(old.as_bytes());
        hasher.update(b"\n");
        hasher.update(crankhash.as_bytes());
        hasher.update(b"\n");
        let activityhash = hex::encode(hasher.finalize());
        self.write_kv(ACTIVITY_HASH_KEY, Some(activityhash.clone()));

        Ok(CrankHashes {
            crankhash,
            activityhash,
        })
    }

    /// Current activity hash (empty before the first crank).
    pub fn activity_hash(&self) -> Result<String, StoreError> {
        Ok(self.get(ACTIVITY_HASH_KEY)?.unwrap_or_default())
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Atomically write every pending change to the backend.
    ///
    /// On failure the committed image is unchanged and the pending batch
    /// is kept.
    pub fn commit(&mut self) -> Result<(), StoreError> {
        if self.in_crank {
            return Err(StoreError::CrankState {
                operation: "commit",
                detail: "cannot commit inside a crank",
            });
        }
        let writes = self.pending.len();
        if let Err(e) = self.backend.apply(&self.pending) {
            warn!(error = %e, writes, "store commit failed");
            return Err(e);
        }
        self.pending = CommitBatch::default();
        debug!(writes, "store committed");
        Ok(())
    }

    /// Drop every uncommitted change.
    pub fn discard_pending(&mut self) {
        self.pending = CommitBatch::default();
        self.undo.clear();
        self.savepoints.clear();
        self.crank_hash_input.clear();
        self.in_crank = false;
    }

    /// Check whether there are uncommitted writes.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

fn restore<K: Ord, V>(
    map: &mut std::collections::BTreeMap<K, Option<V>>,
    key: K,
    prev: Option<Option<V>>,
) {
    match prev {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[test]
    fn test_overlay_reads_through_to_backend() {
        let backend = MemoryBackend::new();
        let mut store = SwingStore::open(backend.clone());
        store.set("a", "1").unwrap();
        store.commit().unwrap();

        let mut store = SwingStore::open(backend);
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
    }

    #[test]
    fn test_host_keys_are_segregated() {
        let mut store = SwingStore::in_memory();
        assert!(matches!(
            store.set("host.height", "3"),
            Err(StoreError::KeyClass { facet: "kernel", .. })
        ));
        assert!(matches!(
            store.host_set("ko.nextID", "3"),
            Err(StoreError::KeyClass { facet: "host", .. })
        ));
        store.host_set("host.height", "3").unwrap();
        assert_eq!(store.get("host.height").unwrap().as_deref(), Some("3"));
    }

    #[test]
    fn test_get_next_key_merges_and_skips_deleted() {
        let backend = MemoryBackend::new();
        let mut store = SwingStore::open(backend.clone());
        store.set("k.1", "a").unwrap();
        store.set("k.3", "c").unwrap();
        store.set("k.5", "e").unwrap();
        store.commit().unwrap();

        store.delete("k.3").unwrap();
        store.set("k.4", "d").unwrap();
        assert_eq!(store.get_next_key("k.1").unwrap().as_deref(), Some("k.4"));
        assert_eq!(store.get_next_key("k.4").unwrap().as_deref(), Some("k.5"));
        assert_eq!(
            store.keys_with_prefix("k.").unwrap(),
            vec!["k.1", "k.4", "k.5"]
        );
    }

    #[test]
    fn test_rollback_restores_overlay_state() {
        let mut store = SwingStore::in_memory();
        store.set("keep", "1").unwrap();
        store.start_crank().unwrap();
        store.establish_savepoint("start").unwrap();
        store.set("keep", "2").unwrap();
        store.establish_savepoint("deliver").unwrap();
        store.set("keep", "3").unwrap();
        store.set("gone", "x").unwrap();

        store.rollback_to("deliver").unwrap();
        assert_eq!(store.get("keep").unwrap().as_deref(), Some("2"));
        assert_eq!(store.get("gone").unwrap(), None);

        store.rollback_to("start").unwrap();
        assert_eq!(store.get("keep").unwrap().as_deref(), Some("1"));
        assert!(matches!(
            store.rollback_to("deliver"),
            Err(StoreError::NoSuchSavepoint(_))
        ));
        store.end_crank().unwrap();
    }

    #[test]
    fn test_rolled_back_writes_do_not_affect_crankhash() {
        let mut a = SwingStore::in_memory();
        a.start_crank().unwrap();
        a.establish_savepoint("start").unwrap();
        a.set("x", "1").unwrap();
        a.rollback_to("start").unwrap();
        a.set("y", "2").unwrap();
        let ha = a.emit_crank_hashes().unwrap();
        a.end_crank().unwrap();

        let mut b = SwingStore::in_memory();
        b.start_crank().unwrap();
        b.set("y", "2").unwrap();
        let hb = b.emit_crank_hashes().unwrap();
        b.end_crank().unwrap();

        assert_eq!(ha, hb);
    }

    #[test]
    fn test_local_keys_are_not_hashed() {
        let mut a = SwingStore::in_memory();
        a.start_crank().unwrap();
        a.set("local.note", "anything").unwrap();
        let ha = a.emit_crank_hashes().unwrap();
        a.end_crank().unwrap();

        let mut b = SwingStore::in_memory();
        b.start_crank().unwrap();
        let hb = b.emit_crank_hashes().unwrap();
        b.end_crank().unwrap();

        assert_eq!(ha.crankhash, hb.crankhash);
    }

    #[test]
    fn test_activity_hash_chains() {
        let mut store = SwingStore::in_memory();
        store.start_crank().unwrap();
        store.set("x", "1").unwrap();
        let first = store.emit_crank_hashes().unwrap();
        store.end_crank().unwrap();
        store.start_crank().unwrap();
        let second = store.emit_crank_hashes().unwrap();
        store.end_crank().unwrap();
        assert_ne!(first.activityhash, second.activityhash);
        assert_eq!(store.activity_hash().unwrap(), second.activityhash);
    }

    #[test]
    fn test_commit_inside_crank_is_refused() {
        let mut store = SwingStore::in_memory();
        store.start_crank().unwrap();
        assert!(matches!(
            store.commit(),
            Err(StoreError::CrankState { .. })
        ));
    }

    #[test]
    fn test_failed_commit_keeps_pending_and_image() {
        let backend = MemoryBackend::new();
        let mut store = SwingStore::open(backend.clone());
        store.set("a", "1").unwrap();
        backend.fail_next_commit();
        assert!(store.commit().is_err());
        assert_eq!(backend.kv_len(), 0);
        assert!(store.has_pending());
        store.commit().unwrap();
        assert_eq!(backend.kv_len(), 1);
    }

    #[test]
    fn test_dropping_uncommitted_store_discards_work() {
        let backend = MemoryBackend::new();
        {
            let mut store = SwingStore::open(backend.clone());
            store.set("a", "1").unwrap();
            store.commit().unwrap();
            store.set("b", "2").unwrap();
        }
        let store = SwingStore::open(backend);
        assert!(store.has("a").unwrap());
        assert!(!store.has("b").unwrap());
    }
}
