//! C-lists: per-vat translation between vrefs and krefs
//!
//! Each entry is stored twice: `<vat>.c.<kref> = "R <vref>"` (or `"_ "`
//! when the vat holds the ref only recognizably) and
//! `<vat>.c.<vref> = <kref>`. Promise entries are always `R`.
//!
//! Refcount contribution of an entry:
//!
//! ```text
//!   object import   recognizable +1, reachable +1 while flagged R
//!   object export   nothing (the owner does not keep its own object alive)
//!   promise         +1 for every entry, exporter included
//!   device          nothing
//! ```

use swing_vat::{SlotType, VatId, VatSlot};
use tracing::trace;

use super::objects::RefKind;
use super::KernelKeeper;
use crate::error::KeeperError;
use crate::types::KernelSlot;

fn kernel_key(vat_id: VatId, kref: KernelSlot) -> String {
    format!("{vat_id}.c.{kref}")
}

fn vat_key(vat_id: VatId, vref: VatSlot) -> String {
    format!("{vat_id}.c.{vref}")
}

/// One c-list entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClistEntry {
    /// Kernel side.
    pub kref: KernelSlot,
    /// Vat side.
    pub vref: VatSlot,
    /// Whether the vat holds the ref reachably.
    pub reachable: bool,
}

impl KernelKeeper {
    fn read_entry(&self, vat_id: VatId, kref: KernelSlot) -> Result<Option<(bool, VatSlot)>, KeeperError> {
        let key = kernel_key(vat_id, kref);
        let Some(raw) = self.store.get(&key)? else {
            return Ok(None);
        };
        let (flag, vref) = raw
            .split_once(' ')
            .ok_or_else(|| KeeperError::corrupt(&key, "missing reachable flag"))?;
        let reachable = match flag {
            "R" => true,
            "_" => false,
            other => return Err(KeeperError::corrupt(&key, other)),
        };
        let vref = vref.parse().map_err(|e: String| KeeperError::corrupt(&key, e))?;
        Ok(Some((reachable, vref)))
    }

    fn write_entry(&mut self, vat_id: VatId, kref: KernelSlot, vref: VatSlot, reachable: bool) -> Result<(), KeeperError> {
        let flag = if reachable { 'R' } else { '_' };
        self.store
            .set(&kernel_key(vat_id, kref), &format!("{flag} {vref}"))?;
        self.store.set(&vat_key(vat_id, vref), &kref.to_string())?;
        Ok(())
    }

    /// Translate a vref presented by a vat.
    ///
    /// An unknown vat-allocated ref (`o+N`, `p+N`) is an export: a new
    /// kernel object owned by the vat, or a new promise the vat decides.
    /// An unknown kernel-allocated ref is a protocol violation. With
    /// `set_reachable`, the entry is flagged reachable; an import must
    /// already be reachable.
    pub fn map_vat_slot_to_kernel_slot(
        &mut self,
        vat_id: VatId,
        vref: VatSlot,
        set_reachable: bool,
    ) -> Result<KernelSlot, KeeperError> {
        let kref = match self.vat_to_kernel_existing(vat_id, vref)? {
            Some(kref) => kref,
            None => {
                if !vref.allocated_by_vat {
                    return Err(KeeperError::UnknownVref { vat_id, vref });
                }
                let kref = match vref.slot_type {
                    SlotType::Object => self.add_kernel_object(vat_id)?,
                    SlotType::Promise => self.add_kernel_promise(Some(vat_id))?,
                    SlotType::Device => {
                        return Err(KeeperError::WrongRefType {
                            vat_id,
                            vref,
                            detail: "vats cannot export devices",
                        })
                    }
                };
                self.increment_ref_count(kref, RefKind::Export)?;
                self.write_entry(vat_id, kref, vref, vref.is_promise())?;
                trace!(vat_id = %vat_id, %vref, %kref, "new export");
                kref
            }
        };

        if set_reachable && vref.is_object() {
            let reachable = self.get_reachable_flag(vat_id, kref)?.unwrap_or(false);
            if !reachable {
                if vref.allocated_by_vat {
                    self.write_entry(vat_id, kref, vref, true)?;
                } else {
                    return Err(KeeperError::UnreachableImport { vat_id, vref });
                }
            }
        }
        Ok(kref)
    }

    /// Translate a kref for delivery to a vat, allocating an import on
    /// first sight. With `set_reachable`, the entry is flagged reachable.
    pub fn map_kernel_slot_to_vat_slot(
        &mut self,
        vat_id: VatId,
        kref: KernelSlot,
        set_reachable: bool,
    ) -> Result<VatSlot, KeeperError> {
        let (reachable, vref) = match self.read_entry(vat_id, kref)? {
            Some(entry) => entry,
            None => {
                let vref = match kref {
                    KernelSlot::Object(_) => {
                        VatSlot::import(self.allocate_vat_import_id(vat_id, SlotType::Object)?)
                    }
                    KernelSlot::Promise(_) => VatSlot::promise_import(
                        self.allocate_vat_import_id(vat_id, SlotType::Promise)?,
                    ),
                    KernelSlot::Device(_) => {
                        VatSlot::device(self.allocate_vat_import_id(vat_id, SlotType::Device)?)
                    }
                };
                self.increment_ref_count(kref, RefKind::Recognizable)?;
                let reachable = !kref.is_object();
                self.write_entry(vat_id, kref, vref, reachable)?;
                trace!(vat_id = %vat_id, %vref, %kref, "new import");
                (reachable, vref)
            }
        };

        if set_reachable && !reachable {
            if vref.is_object_import() {
                self.adjust_reachable(kref, true)?;
            }
            self.write_entry(vat_id, kref, vref, true)?;
        }
        Ok(vref)
    }

    /// Look up a vref without allocating.
    pub fn vat_to_kernel_existing(&self, vat_id: VatId, vref: VatSlot) -> Result<Option<KernelSlot>, KeeperError> {
        self.get_parsed(&vat_key(vat_id, vref))
    }

    /// Look up a kref without allocating.
    pub fn kernel_to_vat_existing(&self, vat_id: VatId, kref: KernelSlot) -> Result<Option<VatSlot>, KeeperError> {
        Ok(self.read_entry(vat_id, kref)?.map(|(_, vref)| vref))
    }

    /// Check whether the vat has an entry for `kref`.
    pub fn has_clist_entry(&self, vat_id: VatId, kref: KernelSlot) -> Result<bool, KeeperError> {
        Ok(self.store.has(&kernel_key(vat_id, kref))?)
    }

    /// Reachable flag of an entry, or `None` if there is no entry.
    pub fn get_reachable_flag(&self, vat_id: VatId, kref: KernelSlot) -> Result<Option<bool>, KeeperError> {
        Ok(self.read_entry(vat_id, kref)?.map(|(reachable, _)| reachable))
    }

    /// Clear the reachable flag. For imports this releases the entry's
    /// reachable count.
    pub fn clear_reachable_flag(&mut self, vat_id: VatId, kref: KernelSlot) -> Result<(), KeeperError> {
        let Some((reachable, vref)) = self.read_entry(vat_id, kref)? else {
            return Ok(());
        };
        if reachable && vref.is_object() {
            if vref.is_object_import() {
                self.adjust_reachable(kref, false)?;
            }
            self.write_entry(vat_id, kref, vref, false)?;
        }
        Ok(())
    }

    /// Remove an entry and the refcounts it contributed.
    pub fn delete_clist_entry(&mut self, vat_id: VatId, kref: KernelSlot) -> Result<(), KeeperError> {
        let Some((reachable, vref)) = self.read_entry(vat_id, kref)? else {
            return Ok(());
        };
        if reachable && vref.is_object_import() {
            self.adjust_reachable(kref, false)?;
        }
        self.store.delete(&kernel_key(vat_id, kref))?;
        self.store.delete(&vat_key(vat_id, vref))?;
        let kind = if vref.allocated_by_vat {
            RefKind::Export
        } else {
            RefKind::Recognizable
        };
        self.decrement_ref_count(kref, kind)?;
        trace!(vat_id = %vat_id, %vref, %kref, "deleted c-list entry");
        Ok(())
    }

    /// Remove whichever of `krefs` the vat has entries for.
    pub fn delete_clist_entries_for_kernel_slots(
        &mut self,
        vat_id: VatId,
        krefs: &[KernelSlot],
    ) -> Result<(), KeeperError> {
        for kref in krefs {
            self.delete_clist_entry(vat_id, *kref)?;
        }
        Ok(())
    }

    /// Every entry of a vat's c-list, in kref order.
    pub fn clist_entries(&self, vat_id: VatId) -> Result<Vec<ClistEntry>, KeeperError> {
        let prefix = format!("{vat_id}.c.k");
        let mut entries = Vec::new();
        for key in self.store.keys_with_prefix(&prefix)? {
            let kref: KernelSlot = key[prefix.len() - 1..]
                .parse()
                .map_err(|e: String| KeeperError::corrupt(&key, e))?;
            if let Some((reachable, vref)) = self.read_entry(vat_id, kref)? {
                entries.push(ClistEntry {
                    kref,
                    vref,
                    reachable,
                });
            }
        }
        Ok(entries)
    }

    /// Live vats that import `kref`.
    pub fn importers_of(&self, kref: KernelSlot) -> Result<Vec<VatId>, KeeperError> {
        let mut importers = Vec::new();
        for vat_id in self.vat_ids()? {
            if let Some((_, vref)) = self.read_entry(vat_id, kref)? {
                if !vref.allocated_by_vat {
                    importers.push(vat_id);
                }
            }
        }
        Ok(importers)
    }

    /// Object exports that do not survive upgrade: everything but durable
    /// exports and the root object.
    pub fn non_durable_exports(&self, vat_id: VatId) -> Result<Vec<ClistEntry>, KeeperError> {
        Ok(self
            .clist_entries(vat_id)?
            .into_iter()
            .filter(|e| e.vref.is_object_export() && !e.vref.durable && e.vref != VatSlot::ROOT)
            .collect())
    }

    /// Detach an export from its vat. The object lives on as an orphan
    /// until nothing references it.
    pub fn abandon_export(&mut self, vat_id: VatId, kref: KernelSlot) -> Result<(), KeeperError> {
        let Some((_, vref)) = self.read_entry(vat_id, kref)? else {
            return Err(KeeperError::UnknownKref(kref));
        };
        if self.owner_of_kernel_object(kref)? != Some(vat_id) {
            return Err(KeeperError::invariant(format!(
                "{kref} is not exported by {vat_id}"
            )));
        }
        self.store.delete(&kernel_key(vat_id, kref))?;
        self.store.delete(&vat_key(vat_id, vref))?;
        self.orphan_kernel_object(kref)
    }
}
