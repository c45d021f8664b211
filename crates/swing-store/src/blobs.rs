//! Content-addressed bundle and heap-snapshot storage

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::store::SwingStore;

/// Content-addressed identifier of a code bundle: `b1-<sha256 hex>`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BundleId(String);

impl BundleId {
    /// Compute the ID of some bundle bytes.
    pub fn for_bytes(bytes: &[u8]) -> Self {
        BundleId(format!("b1-{}", hex::encode(Sha256::digest(bytes))))
    }

    /// The string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BundleId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix("b1-") {
            Some(hash) if hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit()) => {
                Ok(BundleId(s.to_string()))
            }
            _ => Err(format!("invalid bundle ID {s:?}")),
        }
    }
}

impl TryFrom<String> for BundleId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<BundleId> for String {
    fn from(id: BundleId) -> Self {
        id.0
    }
}

/// Metadata of a vat's latest heap snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Transcript position the snapshot was taken at.
    pub end_pos: u64,
    /// SHA-256 of the snapshot bytes.
    pub hash: String,
    /// Size in bytes.
    pub size: u64,
}

fn bundle_blob(id: &BundleId) -> String {
    format!("bundle.{id}")
}

fn snapshot_blob(vat_id: &str, hash: &str) -> String {
    format!("snapshot.{vat_id}.{hash}")
}

fn snapshot_key(vat_id: &str) -> String {
    format!("{vat_id}.snapshot")
}

impl SwingStore {
    // ========================================================================
    // Bundles
    // ========================================================================

    /// Store a bundle, returning its content-addressed ID.
    pub fn add_bundle(&mut self, bytes: &[u8]) -> Result<BundleId, StoreError> {
        let id = BundleId::for_bytes(bytes);
        self.write_blob(&bundle_blob(&id), Some(bytes.to_vec()));
        Ok(id)
    }

    /// Fetch a bundle.
    pub fn get_bundle(&self, id: &BundleId) -> Result<Option<Vec<u8>>, StoreError> {
        self.read_blob(&bundle_blob(id))
    }

    /// Check whether a bundle is stored.
    pub fn has_bundle(&self, id: &BundleId) -> Result<bool, StoreError> {
        Ok(self.get_bundle(id)?.is_some())
    }

    /// Remove a bundle.
    pub fn delete_bundle(&mut self, id: &BundleId) {
        self.write_blob(&bundle_blob(id), None);
    }

    // ========================================================================
    // Heap snapshots
    // ========================================================================

    /// Save a vat's heap snapshot taken at transcript position `end_pos`,
    /// replacing any earlier one.
    pub fn save_snapshot(
        &mut self,
        vat_id: &str,
        end_pos: u64,
        bytes: &[u8],
    ) -> Result<SnapshotInfo, StoreError> {
        self.delete_snapshot(vat_id)?;
        let info = SnapshotInfo {
            end_pos,
            hash: hex::encode(Sha256::digest(bytes)),
            size: bytes.len() as u64,
        };
        self.write_blob(&snapshot_blob(vat_id, &info.hash), Some(bytes.to_vec()));
        self.set(&snapshot_key(vat_id), &serde_json::to_string(&info)?)?;
        Ok(info)
    }

    /// Metadata of a vat's latest snapshot.
    pub fn snapshot_info(&self, vat_id: &str) -> Result<Option<SnapshotInfo>, StoreError> {
        let key = snapshot_key(vat_id);
        match self.get(&key)? {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).map_err(|e| StoreError::corrupt(&key, e))?,
            )),
            None => Ok(None),
        }
    }

    /// Load a vat's latest snapshot.
    pub fn load_snapshot(&self, vat_id: &str) -> Result<Option<(SnapshotInfo, Vec<u8>)>, StoreError> {
        let Some(info) = self.snapshot_info(vat_id)? else {
            return Ok(None);
        };
        let bytes = self
            .read_blob(&snapshot_blob(vat_id, &info.hash))?
            .ok_or_else(|| StoreError::corrupt(&snapshot_key(vat_id), "snapshot blob missing"))?;
        Ok(Some((info, bytes)))
    }

    /// Remove a vat's snapshot, if any.
    pub fn delete_snapshot(&mut self, vat_id: &str) -> Result<(), StoreError> {
        if let Some(info) = self.snapshot_info(vat_id)? {
            self.write_blob(&snapshot_blob(vat_id, &info.hash), None);
            self.delete(&snapshot_key(vat_id))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_ids_are_content_addressed() {
        let mut store = SwingStore::in_memory();
        let a = store.add_bundle(b"vat code").unwrap();
        let b = store.add_bundle(b"vat code").unwrap();
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("b1-"));
        assert_eq!(store.get_bundle(&a).unwrap().as_deref(), Some(&b"vat code"[..]));
        store.delete_bundle(&a);
        assert!(!store.has_bundle(&a).unwrap());
    }

    #[test]
    fn test_bundle_id_parse_rejects_garbage() {
        assert!("b1-xyz".parse::<BundleId>().is_err());
        let id = BundleId::for_bytes(b"x");
        assert_eq!(id.to_string().parse::<BundleId>().unwrap(), id);
    }

    #[test]
    fn test_snapshot_replaces_previous() {
        let mut store = SwingStore::in_memory();
        store.save_snapshot("v1", 5, b"heap-5").unwrap();
        let info = store.save_snapshot("v1", 9, b"heap-9").unwrap();
        let (loaded, bytes) = store.load_snapshot("v1").unwrap().unwrap();
        assert_eq!(loaded, info);
        assert_eq!(loaded.end_pos, 9);
        assert_eq!(bytes, b"heap-9");
        store.delete_snapshot("v1").unwrap();
        assert!(store.load_snapshot("v1").unwrap().is_none());
    }
}
