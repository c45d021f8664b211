//! Kernel objects, devices and refcounting

use swing_vat::VatId;
use tracing::trace;

use super::KernelKeeper;
use crate::error::KeeperError;
use crate::types::{KernelSlot, ObjectRefCount};

/// What kind of holder a refcount change is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefKind {
    /// A holder that can use the ref: queued messages, settlement data,
    /// pins, reachable import entries.
    Reachable,
    /// A holder that can only recognize the ref: an import c-list entry.
    Recognizable,
    /// The exporting vat's own c-list entry. Counts for promises only.
    Export,
}

fn owner_key(kref: KernelSlot) -> String {
    format!("{kref}.owner")
}

fn refcount_key(kref: KernelSlot) -> String {
    format!("{kref}.refCount")
}

impl KernelKeeper {
    // ========================================================================
    // Objects
    // ========================================================================

    /// Allocate a new object owned by `owner`, with zero refcounts.
    pub fn add_kernel_object(&mut self, owner: VatId) -> Result<KernelSlot, KeeperError> {
        let kref = KernelSlot::Object(self.allocate_id("ko.nextID")?);
        self.store.set(&owner_key(kref), &owner.to_string())?;
        self.store
            .set(&refcount_key(kref), &ObjectRefCount::default().to_string())?;
        Ok(kref)
    }

    /// Check whether an object still exists (it may be orphaned).
    pub fn kernel_object_exists(&self, kref: KernelSlot) -> Result<bool, KeeperError> {
        Ok(kref.is_object() && self.store.has(&refcount_key(kref))?)
    }

    /// Owner of an object, or `None` if it was orphaned.
    pub fn owner_of_kernel_object(&self, kref: KernelSlot) -> Result<Option<VatId>, KeeperError> {
        self.get_parsed(&owner_key(kref))
    }

    /// Refcounts of an object.
    pub fn object_ref_count(&self, kref: KernelSlot) -> Result<ObjectRefCount, KeeperError> {
        self.get_parsed(&refcount_key(kref))?
            .ok_or(KeeperError::UnknownKref(kref))
    }

    fn set_object_ref_count(&mut self, kref: KernelSlot, rc: ObjectRefCount) -> Result<(), KeeperError> {
        self.store.set(&refcount_key(kref), &rc.to_string())?;
        Ok(())
    }

    /// Detach an object from its owner. It lives on until unreferenced.
    pub fn orphan_kernel_object(&mut self, kref: KernelSlot) -> Result<(), KeeperError> {
        self.store.delete(&owner_key(kref))?;
        self.maybe_free.insert(kref);
        Ok(())
    }

    /// Every object in the table, in kref order.
    pub fn kernel_objects(&self) -> Result<Vec<KernelSlot>, KeeperError> {
        let mut krefs = Vec::new();
        for k in self.store.keys_with_prefix("ko")? {
            if let Some(id) = k.strip_suffix(".refCount") {
                krefs.push(id.parse().map_err(|e: String| KeeperError::corrupt(&k, e))?);
            }
        }
        krefs.sort();
        Ok(krefs)
    }

    /// Remove an object from the table.
    pub fn delete_kernel_object(&mut self, kref: KernelSlot) -> Result<(), KeeperError> {
        self.store.delete(&owner_key(kref))?;
        self.store.delete(&refcount_key(kref))?;
        trace!(%kref, "deleted kernel object");
        Ok(())
    }

    // ========================================================================
    // Devices
    // ========================================================================

    /// Register a device node under a name.
    pub fn add_kernel_device(&mut self, name: &str) -> Result<KernelSlot, KeeperError> {
        let key = format!("device.name.{name}");
        if let Some(kref) = self.get_parsed::<KernelSlot>(&key)? {
            return Ok(kref);
        }
        let kref = KernelSlot::Device(self.allocate_id("kd.nextID")?);
        self.store.set(&owner_key(kref), name)?;
        self.store.set(&key, &kref.to_string())?;
        Ok(kref)
    }

    /// Device node registered under a name.
    pub fn device_for_name(&self, name: &str) -> Result<Option<KernelSlot>, KeeperError> {
        self.get_parsed(&format!("device.name.{name}"))
    }

    /// Name a device node was registered under.
    pub fn device_name(&self, kref: KernelSlot) -> Result<Option<String>, KeeperError> {
        if !kref.is_device() {
            return Ok(None);
        }
        Ok(self.store.get(&owner_key(kref))?)
    }

    // ========================================================================
    // Refcounts
    // ========================================================================

    /// Record a new holder of `kref`. Devices are not counted.
    pub fn increment_ref_count(&mut self, kref: KernelSlot, kind: RefKind) -> Result<(), KeeperError> {
        match kref {
            KernelSlot::Promise(_) => {
                let count = self.promise_ref_count(kref)? + 1;
                self.set_promise_ref_count(kref, count)?;
            }
            KernelSlot::Object(_) if kind != RefKind::Export => {
                let mut rc = self.object_ref_count(kref)?;
                if kind == RefKind::Reachable {
                    rc.reachable += 1;
                }
                rc.recognizable += 1;
                self.set_object_ref_count(kref, rc)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Drop a holder of `kref`. When a count reaches zero the kref becomes
    /// a candidate for [`process_refcounts`](Self::process_refcounts).
    pub fn decrement_ref_count(&mut self, kref: KernelSlot, kind: RefKind) -> Result<(), KeeperError> {
        match kref {
            KernelSlot::Promise(_) => {
                let count = self
                    .promise_ref_count(kref)?
                    .checked_sub(1)
                    .ok_or(KeeperError::RefcountUnderflow(kref))?;
                self.set_promise_ref_count(kref, count)?;
                if count == 0 {
                    self.maybe_free.insert(kref);
                }
            }
            KernelSlot::Object(_) if kind != RefKind::Export => {
                if !self.kernel_object_exists(kref)? {
                    return Ok(());
                }
                let mut rc = self.object_ref_count(kref)?;
                if kind == RefKind::Reachable {
                    rc.reachable = rc
                        .reachable
                        .checked_sub(1)
                        .ok_or(KeeperError::RefcountUnderflow(kref))?;
                }
                rc.recognizable = rc
                    .recognizable
                    .checked_sub(1)
                    .ok_or(KeeperError::RefcountUnderflow(kref))?;
                if rc.reachable > rc.recognizable {
                    return Err(KeeperError::invariant(format!(
                        "{kref} reachable {} exceeds recognizable {}",
                        rc.reachable, rc.recognizable
                    )));
                }
                if rc.reachable == 0 || rc.recognizable == 0 {
                    self.maybe_free.insert(kref);
                }
                self.set_object_ref_count(kref, rc)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Adjust only the reachable count (an import entry's reachable flag
    /// flipping on or off).
    pub(crate) fn adjust_reachable(&mut self, kref: KernelSlot, up: bool) -> Result<(), KeeperError> {
        let mut rc = self.object_ref_count(kref)?;
        if up {
            rc.reachable += 1;
            if rc.reachable > rc.recognizable {
                return Err(KeeperError::invariant(format!(
                    "{kref} reachable {} exceeds recognizable {}",
                    rc.reachable, rc.recognizable
                )));
            }
        } else {
            rc.reachable = rc
                .reachable
                .checked_sub(1)
                .ok_or(KeeperError::RefcountUnderflow(kref))?;
            if rc.reachable == 0 {
                self.maybe_free.insert(kref);
            }
        }
        self.set_object_ref_count(kref, rc)
    }

    /// Krefs whose counts reached zero since the last
    /// [`process_refcounts`](Self::process_refcounts).
    pub fn maybe_free_krefs(&self) -> impl Iterator<Item = &KernelSlot> {
        self.maybe_free.iter()
    }
}
