//! Storage backends
//!
//! A backend holds the *committed* image of the store. Everything the
//! kernel writes during a block lives in the [`SwingStore`](crate::SwingStore)
//! overlay until [`StorageBackend::apply`] writes the whole batch in one
//! atomic step.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryBackend;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

use std::collections::BTreeMap;

use crate::error::StoreError;

/// Transcript items are addressed by (vat ID, position).
pub type TranscriptKey = (String, u64);

/// All writes accumulated since the last commit.
///
/// `None` values are deletions.
#[derive(Clone, Debug, Default)]
pub struct CommitBatch {
    /// Key-value writes.
    pub kv: BTreeMap<String, Option<String>>,
    /// Transcript item writes.
    pub transcript: BTreeMap<TranscriptKey, Option<String>>,
    /// Blob writes (bundles and snapshots).
    pub blobs: BTreeMap<String, Option<Vec<u8>>>,
}

impl CommitBatch {
    /// Check whether the batch carries no writes.
    pub fn is_empty(&self) -> bool {
        self.kv.is_empty() && self.transcript.is_empty() && self.blobs.is_empty()
    }

    /// Total number of writes in the batch.
    pub fn len(&self) -> usize {
        self.kv.len() + self.transcript.len() + self.blobs.len()
    }
}

/// Committed storage behind a [`SwingStore`](crate::SwingStore).
pub trait StorageBackend {
    /// Read a committed key.
    fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// First committed key strictly greater than `after`.
    fn kv_next_key(&self, after: &str) -> Result<Option<String>, StoreError>;

    /// Read a committed transcript item.
    fn transcript_item(&self, vat_id: &str, position: u64) -> Result<Option<String>, StoreError>;

    /// Read a committed blob.
    fn blob_get(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Atomically apply a batch. On error nothing from the batch is visible.
    fn apply(&mut self, batch: &CommitBatch) -> Result<(), StoreError>;
}
