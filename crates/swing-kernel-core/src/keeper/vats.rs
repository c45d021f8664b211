//! Per-vat records: options, source bundle, lifecycle, vatstore, reap
//! dirt, plus the kernel pin table and upgrade outcomes

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use swing_store::BundleId;
use swing_vat::{SlotType, VatId};
use tracing::info;

use super::objects::RefKind;
use super::KernelKeeper;
use crate::error::KeeperError;
use crate::types::{KernelSlot, VatLifecycle, VatOptions};

const NAMES_KEY: &str = "vat.names";
const DYNAMIC_KEY: &str = "vat.dynamicIDs";
const TERMINATED_KEY: &str = "vats.terminated";
const PINS_KEY: &str = "kernel.pins";

/// Result of an upgrade request, queryable by its upgrade ID.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum UpgradeOutcome {
    /// Queued but not yet processed.
    Pending {
        /// Vat being upgraded.
        vat_id: VatId,
    },
    /// The vat now runs the new incarnation.
    Succeeded {
        /// Vat that was upgraded.
        vat_id: VatId,
        /// New incarnation number.
        incarnation: u64,
    },
    /// The upgrade was rolled back; the vat keeps its old incarnation.
    Failed {
        /// Vat that was not upgraded.
        vat_id: VatId,
        /// Why.
        reason: String,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VatSource {
    bundle_id: BundleId,
}

fn vkey(vat_id: VatId, field: &str) -> String {
    format!("{vat_id}.{field}")
}

fn vatstore_prefix(vat_id: VatId) -> String {
    format!("{vat_id}.vs.")
}

impl KernelKeeper {
    // ========================================================================
    // Creation and lookup
    // ========================================================================

    /// Allocate a vat ID and write its records. The vat starts in
    /// [`VatLifecycle::Starting`].
    pub fn create_vat_state(
        &mut self,
        options: &VatOptions,
        bundle_id: &BundleId,
    ) -> Result<VatId, KeeperError> {
        if self.vat_id_for_name(&options.name)?.is_some() {
            return Err(KeeperError::DuplicateVatName(options.name.clone()));
        }
        let vat_id = VatId(u32::try_from(self.allocate_id("vat.nextID")?).map_err(|_| {
            KeeperError::invariant("vat ID space exhausted")
        })?);
        for counter in ["o.nextID", "p.nextID", "d.nextID"] {
            self.store.set(&vkey(vat_id, counter), "1")?;
        }
        self.set_json(&vkey(vat_id, "options"), options)?;
        self.set_json(
            &vkey(vat_id, "source"),
            &VatSource {
                bundle_id: bundle_id.clone(),
            },
        )?;
        self.set_lifecycle(vat_id, VatLifecycle::Starting)?;
        self.store.set(&vkey(vat_id, "reapDirt"), "0")?;
        self.store.init_transcript(&vat_id.to_string())?;

        self.store
            .set(&format!("vat.name.{}", options.name), &vat_id.to_string())?;
        let mut names: Vec<String> = self.get_json(NAMES_KEY)?.unwrap_or_default();
        names.push(options.name.clone());
        self.set_json(NAMES_KEY, &names)?;
        if options.dynamic {
            let mut dynamic: Vec<VatId> = self.get_json(DYNAMIC_KEY)?.unwrap_or_default();
            dynamic.push(vat_id);
            self.set_json(DYNAMIC_KEY, &dynamic)?;
        }
        info!(vat_id = %vat_id, name = %options.name, "created vat state");
        Ok(vat_id)
    }

    /// Vat registered under a name.
    pub fn vat_id_for_name(&self, name: &str) -> Result<Option<VatId>, KeeperError> {
        self.get_parsed(&format!("vat.name.{name}"))
    }

    /// Live vats in creation order.
    pub fn vat_ids(&self) -> Result<Vec<VatId>, KeeperError> {
        let names: Vec<String> = self.get_json(NAMES_KEY)?.unwrap_or_default();
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            if let Some(vat_id) = self.vat_id_for_name(&name)? {
                if self.is_vat_alive(vat_id)? {
                    ids.push(vat_id);
                }
            }
        }
        Ok(ids)
    }

    /// Vats created at runtime.
    pub fn dynamic_vat_ids(&self) -> Result<Vec<VatId>, KeeperError> {
        Ok(self.get_json(DYNAMIC_KEY)?.unwrap_or_default())
    }

    /// Creation options of a vat.
    pub fn vat_options(&self, vat_id: VatId) -> Result<VatOptions, KeeperError> {
        self.get_json(&vkey(vat_id, "options"))?
            .ok_or_else(|| KeeperError::UnknownVat(vat_id.to_string()))
    }

    /// Bundle the vat's current incarnation runs.
    pub fn vat_source(&self, vat_id: VatId) -> Result<BundleId, KeeperError> {
        let source: VatSource = self
            .get_json(&vkey(vat_id, "source"))?
            .ok_or_else(|| KeeperError::UnknownVat(vat_id.to_string()))?;
        Ok(source.bundle_id)
    }

    /// Point the vat at new code (upgrade).
    pub fn set_vat_source(&mut self, vat_id: VatId, bundle_id: &BundleId) -> Result<(), KeeperError> {
        self.set_json(
            &vkey(vat_id, "source"),
            &VatSource {
                bundle_id: bundle_id.clone(),
            },
        )
    }

    /// Current incarnation number.
    pub fn incarnation(&self, vat_id: VatId) -> Result<u64, KeeperError> {
        Ok(self
            .store
            .current_span_bounds(&vat_id.to_string())?
            .incarnation)
    }

    /// Transcript position where the current incarnation began.
    pub fn incarnation_start(&self, vat_id: VatId) -> Result<u64, KeeperError> {
        Ok(self.get_u64(&vkey(vat_id, "incarnationStart"))?.unwrap_or(0))
    }

    /// Roll the vat's transcript over to a new incarnation and drop its
    /// heap snapshot. Returns the new incarnation number.
    pub fn begin_new_incarnation(&mut self, vat_id: VatId) -> Result<u64, KeeperError> {
        let vat = vat_id.to_string();
        let incarnation = self.store.rollover_incarnation(&vat)?;
        let start = self.store.current_span_bounds(&vat)?.start_pos;
        self.store
            .set(&vkey(vat_id, "incarnationStart"), &start.to_string())?;
        self.store.delete_snapshot(&vat)?;
        Ok(incarnation)
    }

    /// Next kernel-assigned import number for `o-N`, `p-N` or `d-N`.
    pub(crate) fn allocate_vat_import_id(
        &mut self,
        vat_id: VatId,
        slot_type: SlotType,
    ) -> Result<u64, KeeperError> {
        let counter = match slot_type {
            SlotType::Object => "o.nextID",
            SlotType::Promise => "p.nextID",
            SlotType::Device => "d.nextID",
        };
        self.allocate_id(&vkey(vat_id, counter))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Lifecycle state of a vat.
    pub fn lifecycle(&self, vat_id: VatId) -> Result<VatLifecycle, KeeperError> {
        self.get_parsed(&vkey(vat_id, "lifecycle"))?
            .ok_or_else(|| KeeperError::UnknownVat(vat_id.to_string()))
    }

    /// Move a vat to a new lifecycle state.
    pub fn set_lifecycle(&mut self, vat_id: VatId, state: VatLifecycle) -> Result<(), KeeperError> {
        self.store.set(&vkey(vat_id, "lifecycle"), state.as_str())?;
        Ok(())
    }

    /// Check whether a vat exists and has not been terminated.
    pub fn is_vat_alive(&self, vat_id: VatId) -> Result<bool, KeeperError> {
        Ok(matches!(
            self.get_parsed::<VatLifecycle>(&vkey(vat_id, "lifecycle"))?,
            Some(state) if state != VatLifecycle::Terminated
        ))
    }

    /// Vats that have been terminated.
    pub fn terminated_vats(&self) -> Result<Vec<VatId>, KeeperError> {
        Ok(self.get_json(TERMINATED_KEY)?.unwrap_or_default())
    }

    /// Record termination. Deliveries to the vat fail fast from now on.
    pub fn mark_vat_terminated(&mut self, vat_id: VatId) -> Result<(), KeeperError> {
        self.set_lifecycle(vat_id, VatLifecycle::Terminated)?;
        let mut terminated = self.terminated_vats()?;
        if !terminated.contains(&vat_id) {
            terminated.push(vat_id);
            self.set_json(TERMINATED_KEY, &terminated)?;
        }
        Ok(())
    }

    /// Remove a terminated vat's records, transcript, snapshot and
    /// vatstore. Its options and lifecycle stay for queries; the name is
    /// released.
    pub fn delete_vat_state(&mut self, vat_id: VatId) -> Result<(), KeeperError> {
        let options = self.vat_options(vat_id)?;
        for field in ["o.nextID", "p.nextID", "d.nextID", "source", "reapDirt", "incarnationStart"] {
            self.store.delete(&vkey(vat_id, field))?;
        }
        for key in self.store.keys_with_prefix(&vatstore_prefix(vat_id))? {
            self.store.delete(&key)?;
        }
        let vat = vat_id.to_string();
        self.store.delete_vat_transcripts(&vat)?;
        self.store.delete_snapshot(&vat)?;

        self.store.delete(&format!("vat.name.{}", options.name))?;
        let mut names: Vec<String> = self.get_json(NAMES_KEY)?.unwrap_or_default();
        names.retain(|n| n != &options.name);
        self.set_json(NAMES_KEY, &names)?;
        Ok(())
    }

    // ========================================================================
    // Vatstore
    // ========================================================================

    /// Read a vatstore key.
    pub fn vatstore_get(&self, vat_id: VatId, key: &str) -> Result<Option<String>, KeeperError> {
        Ok(self.store.get(&format!("{}{key}", vatstore_prefix(vat_id)))?)
    }

    /// Write a vatstore key.
    pub fn vatstore_set(&mut self, vat_id: VatId, key: &str, value: &str) -> Result<(), KeeperError> {
        self.store
            .set(&format!("{}{key}", vatstore_prefix(vat_id)), value)?;
        Ok(())
    }

    /// Delete a vatstore key.
    pub fn vatstore_delete(&mut self, vat_id: VatId, key: &str) -> Result<(), KeeperError> {
        self.store
            .delete(&format!("{}{key}", vatstore_prefix(vat_id)))?;
        Ok(())
    }

    /// First vatstore key strictly after `prior_key`, without the prefix.
    pub fn vatstore_get_next_key(
        &self,
        vat_id: VatId,
        prior_key: &str,
    ) -> Result<Option<String>, KeeperError> {
        let prefix = vatstore_prefix(vat_id);
        let next = self.store.get_next_key(&format!("{prefix}{prior_key}"))?;
        Ok(next.and_then(|k| k.strip_prefix(&prefix).map(str::to_string)))
    }

    // ========================================================================
    // Reaping
    // ========================================================================

    /// Count one delivery against the vat's reap interval and return the
    /// new total.
    pub fn add_reap_dirt(&mut self, vat_id: VatId) -> Result<u64, KeeperError> {
        let key = vkey(vat_id, "reapDirt");
        let dirt = self.get_u64(&key)?.unwrap_or(0) + 1;
        self.store.set(&key, &dirt.to_string())?;
        Ok(dirt)
    }

    /// Reset the counter after `bringOutYourDead`.
    pub fn reset_reap_dirt(&mut self, vat_id: VatId) -> Result<(), KeeperError> {
        self.store.set(&vkey(vat_id, "reapDirt"), "0")?;
        Ok(())
    }

    // ========================================================================
    // Pins
    // ========================================================================

    /// Krefs the kernel itself holds, with hold counts.
    pub fn pinned(&self) -> Result<BTreeMap<KernelSlot, u64>, KeeperError> {
        Ok(self.get_json(PINS_KEY)?.unwrap_or_default())
    }

    /// Hold `kref` on behalf of the kernel or host.
    pub fn pin(&mut self, kref: KernelSlot) -> Result<(), KeeperError> {
        let mut pins = self.pinned()?;
        *pins.entry(kref).or_insert(0) += 1;
        self.set_json(PINS_KEY, &pins)?;
        self.increment_ref_count(kref, RefKind::Reachable)
    }

    /// Release one kernel hold. Unpinning an unpinned kref is a no-op.
    pub fn unpin(&mut self, kref: KernelSlot) -> Result<(), KeeperError> {
        let mut pins = self.pinned()?;
        let Some(count) = pins.get_mut(&kref) else {
            return Ok(());
        };
        *count -= 1;
        if *count == 0 {
            pins.remove(&kref);
        }
        self.set_json(PINS_KEY, &pins)?;
        self.decrement_ref_count(kref, RefKind::Reachable)
    }

    // ========================================================================
    // Upgrades
    // ========================================================================

    /// Allocate an upgrade ID and record it as pending.
    pub fn add_upgrade(&mut self, vat_id: VatId) -> Result<u64, KeeperError> {
        let id = self.allocate_id("upgrade.nextID")?;
        self.set_upgrade_outcome(id, &UpgradeOutcome::Pending { vat_id })?;
        Ok(id)
    }

    /// Record how an upgrade ended.
    pub fn set_upgrade_outcome(&mut self, id: u64, outcome: &UpgradeOutcome) -> Result<(), KeeperError> {
        self.set_json(&format!("upgrade.{id}"), outcome)
    }

    /// Status of an upgrade request.
    pub fn upgrade_outcome(&self, id: u64) -> Result<Option<UpgradeOutcome>, KeeperError> {
        self.get_json(&format!("upgrade.{id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::fresh_keeper;
    use super::*;

    fn bundle() -> BundleId {
        BundleId::for_bytes(b"bundle")
    }

    #[test]
    fn test_create_vat_state() {
        let mut keeper = fresh_keeper();
        let a = keeper
            .create_vat_state(&VatOptions::named("alice"), &bundle())
            .unwrap();
        let b = keeper
            .create_vat_state(&VatOptions::named("bob"), &bundle())
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(keeper.vat_id_for_name("bob").unwrap(), Some(b));
        assert_eq!(keeper.vat_ids().unwrap(), vec![a, b]);
        assert_eq!(keeper.lifecycle(a).unwrap(), VatLifecycle::Starting);
        assert_eq!(keeper.incarnation(a).unwrap(), 0);
        assert_eq!(keeper.vat_source(a).unwrap(), bundle());
    }

    #[test]
    fn test_duplicate_name_is_refused() {
        let mut keeper = fresh_keeper();
        keeper
            .create_vat_state(&VatOptions::named("alice"), &bundle())
            .unwrap();
        assert!(matches!(
            keeper.create_vat_state(&VatOptions::named("alice"), &bundle()),
            Err(KeeperError::DuplicateVatName(_))
        ));
    }

    #[test]
    fn test_terminated_vat_is_not_alive() {
        let mut keeper = fresh_keeper();
        let a = keeper
            .create_vat_state(&VatOptions::named("alice"), &bundle())
            .unwrap();
        keeper.vatstore_set(a, "k", "v").unwrap();
        keeper.mark_vat_terminated(a).unwrap();
        keeper.delete_vat_state(a).unwrap();
        assert!(!keeper.is_vat_alive(a).unwrap());
        assert_eq!(keeper.terminated_vats().unwrap(), vec![a]);
        assert_eq!(keeper.vat_id_for_name("alice").unwrap(), None);
        assert_eq!(keeper.vatstore_get(a, "k").unwrap(), None);
        assert!(keeper.vat_ids().unwrap().is_empty());
    }

    #[test]
    fn test_vatstore_iteration_stays_in_vat() {
        let mut keeper = fresh_keeper();
        let a = keeper
            .create_vat_state(&VatOptions::named("alice"), &bundle())
            .unwrap();
        let b = keeper
            .create_vat_state(&VatOptions::named("bob"), &bundle())
            .unwrap();
        keeper.vatstore_set(a, "x.1", "one").unwrap();
        keeper.vatstore_set(a, "x.2", "two").unwrap();
        keeper.vatstore_set(b, "x.3", "three").unwrap();

        assert_eq!(
            keeper.vatstore_get_next_key(a, "x.1").unwrap().as_deref(),
            Some("x.2")
        );
        assert_eq!(keeper.vatstore_get_next_key(a, "x.2").unwrap(), None);
    }

    #[test]
    fn test_pins_hold_reachable_refcount() {
        let mut keeper = fresh_keeper();
        let ko = keeper.add_kernel_object(VatId(1)).unwrap();
        keeper.pin(ko).unwrap();
        keeper.pin(ko).unwrap();
        assert_eq!(keeper.object_ref_count(ko).unwrap().reachable, 2);
        keeper.unpin(ko).unwrap();
        keeper.unpin(ko).unwrap();
        keeper.unpin(ko).unwrap();
        assert_eq!(keeper.object_ref_count(ko).unwrap().reachable, 0);
        assert!(keeper.pinned().unwrap().is_empty());
    }

    #[test]
    fn test_new_incarnation_starts_after_old_span() {
        let mut keeper = fresh_keeper();
        let a = keeper
            .create_vat_state(&VatOptions::named("alice"), &bundle())
            .unwrap();
        let vat = a.to_string();
        keeper.store_mut().add_transcript_item(&vat, "{}").unwrap();
        keeper.store_mut().add_transcript_item(&vat, "{}").unwrap();
        keeper.store_mut().save_snapshot(&vat, 2, b"heap").unwrap();
        assert_eq!(keeper.incarnation_start(a).unwrap(), 0);

        assert_eq!(keeper.begin_new_incarnation(a).unwrap(), 1);
        assert_eq!(keeper.incarnation(a).unwrap(), 1);
        assert_eq!(keeper.incarnation_start(a).unwrap(), 2);
        assert!(keeper.store().snapshot_info(&vat).unwrap().is_none());
    }

    #[test]
    fn test_upgrade_outcomes() {
        let mut keeper = fresh_keeper();
        let id = keeper.add_upgrade(VatId(4)).unwrap();
        assert_eq!(
            keeper.upgrade_outcome(id).unwrap(),
            Some(UpgradeOutcome::Pending { vat_id: VatId(4) })
        );
        keeper
            .set_upgrade_outcome(
                id,
                &UpgradeOutcome::Succeeded {
                    vat_id: VatId(4),
                    incarnation: 1,
                },
            )
            .unwrap();
        assert!(matches!(
            keeper.upgrade_outcome(id).unwrap(),
            Some(UpgradeOutcome::Succeeded { incarnation: 1, .. })
        ));
    }
}
