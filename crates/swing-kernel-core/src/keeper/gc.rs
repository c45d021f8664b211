//! Garbage collection bookkeeping
//!
//! ```text
//!   refcount hits zero ──► maybe_free ──► process_refcounts() ──► gcActions
//!                                                                    │
//!   run-queue  ◄── dropExports / retireExports / retireImports ◄─────┘
//!                       (next_gc_event, one vat+type group at a time)
//! ```
//!
//! The kernel never retires an object on its own: the exporter is told
//! the object was dropped, and retirement follows only when nothing can
//! even recognize it.

use std::collections::BTreeSet;

use swing_vat::VatId;
use tracing::debug;

use super::objects::RefKind;
use super::KernelKeeper;
use crate::error::KeeperError;
use crate::types::{GcAction, GcActionType, KernelSlot, PromiseState, RunQueueEvent};

const GC_ACTIONS_KEY: &str = "gcActions";
const REAP_QUEUE_KEY: &str = "reapQueue";

impl KernelKeeper {
    // ========================================================================
    // GC action set
    // ========================================================================

    /// Pending GC actions in delivery order.
    pub fn gc_actions(&self) -> Result<BTreeSet<GcAction>, KeeperError> {
        let raw: Vec<String> = self.get_json(GC_ACTIONS_KEY)?.unwrap_or_default();
        raw.iter()
            .map(|s| s.parse().map_err(|e: String| KeeperError::corrupt(GC_ACTIONS_KEY, e)))
            .collect()
    }

    fn set_gc_actions(&mut self, actions: &BTreeSet<GcAction>) -> Result<(), KeeperError> {
        let raw: Vec<String> = actions.iter().map(ToString::to_string).collect();
        self.set_json(GC_ACTIONS_KEY, &raw)
    }

    /// Add actions to the pending set.
    pub fn add_gc_actions(&mut self, new: impl IntoIterator<Item = GcAction>) -> Result<(), KeeperError> {
        let mut actions = self.gc_actions()?;
        actions.extend(new);
        self.set_gc_actions(&actions)
    }

    /// Retire objects: every importer is owed a `retireImport`, and the
    /// object leaves the table.
    pub fn retire_kernel_objects(&mut self, krefs: &[KernelSlot]) -> Result<(), KeeperError> {
        let mut new = Vec::new();
        for &kref in krefs {
            for vat_id in self.importers_of(kref)? {
                new.push(GcAction {
                    vat_id,
                    action_type: GcActionType::RetireImport,
                    kref,
                });
            }
            self.delete_kernel_object(kref)?;
        }
        self.add_gc_actions(new)
    }

    /// Examine every kref whose count reached zero during the crank.
    ///
    /// Unreferenced settled promises are deleted (releasing their
    /// settlement data, which may free more). Unreachable objects with a
    /// live owner earn `dropExport` / `retireExport` actions; orphaned
    /// ones are retired directly.
    pub fn process_refcounts(&mut self) -> Result<(), KeeperError> {
        let mut actions = Vec::new();
        while let Some(kref) = self.maybe_free.pop_first() {
            match kref {
                KernelSlot::Promise(_) => self.collect_promise(kref)?,
                KernelSlot::Object(_) => self.collect_object(kref, &mut actions)?,
                KernelSlot::Device(_) => {}
            }
        }
        if !actions.is_empty() {
            debug!(count = actions.len(), "new GC actions");
            self.add_gc_actions(actions)?;
        }
        Ok(())
    }

    fn collect_promise(&mut self, kpid: KernelSlot) -> Result<(), KeeperError> {
        if !self.has_kernel_promise(kpid)? {
            return Ok(());
        }
        let promise = self.get_kernel_promise(kpid)?;
        if promise.ref_count > 0 {
            return Ok(());
        }
        match promise.state {
            PromiseState::Fulfilled(data) | PromiseState::Rejected(data) => {
                for slot in &data.slots {
                    self.decrement_ref_count(*slot, RefKind::Reachable)?;
                }
            }
            PromiseState::Unresolved { queue, .. } => {
                // queued messages still hold refs; keep the promise for them
                if !queue.is_empty() {
                    return Ok(());
                }
            }
        }
        self.delete_kernel_promise(kpid)
    }

    fn collect_object(&mut self, kref: KernelSlot, actions: &mut Vec<GcAction>) -> Result<(), KeeperError> {
        if !self.kernel_object_exists(kref)? {
            return Ok(());
        }
        let rc = self.object_ref_count(kref)?;
        if rc.reachable > 0 {
            return Ok(());
        }
        let mut owner = self.owner_of_kernel_object(kref)?;
        if let Some(vat_id) = owner {
            if self.is_vat_alive(vat_id)? {
                if self.get_reachable_flag(vat_id, kref)? == Some(true) {
                    actions.push(GcAction {
                        vat_id,
                        action_type: GcActionType::DropExport,
                        kref,
                    });
                }
                if rc.recognizable == 0 {
                    actions.push(GcAction {
                        vat_id,
                        action_type: GcActionType::RetireExport,
                        kref,
                    });
                }
            } else {
                // the owner is gone: finish the abandonment it never did
                if let Some(vref) = self.kernel_to_vat_existing(vat_id, kref)? {
                    self.store.delete(&format!("{vat_id}.c.{kref}"))?;
                    self.store.delete(&format!("{vat_id}.c.{vref}"))?;
                }
                self.store.delete(&format!("{kref}.owner"))?;
                owner = None;
            }
        }
        if owner.is_none() {
            if rc.recognizable > 0 {
                self.retire_kernel_objects(&[kref])?;
            } else {
                self.delete_kernel_object(kref)?;
            }
        }
        Ok(())
    }

    /// Take the next batch of GC work off the action set.
    ///
    /// Actions are grouped by vat and type, in sorted order. Actions that
    /// no longer apply (the object became reachable again, or the vat
    /// already forgot it) are discarded. Returns `None` when nothing
    /// applicable remains.
    pub fn next_gc_event(&mut self) -> Result<Option<RunQueueEvent>, KeeperError> {
        let mut actions = self.gc_actions()?;
        let mut found = None;
        while let Some(first) = actions.first().copied() {
            let group: Vec<GcAction> = actions
                .iter()
                .filter(|a| a.vat_id == first.vat_id && a.action_type == first.action_type)
                .copied()
                .collect();
            for action in &group {
                actions.remove(action);
            }
            let mut krefs = Vec::new();
            for action in group {
                if self.gc_action_applies(&action)? {
                    krefs.push(action.kref);
                }
            }
            if !krefs.is_empty() {
                found = Some(gc_event(first.vat_id, first.action_type, krefs));
                break;
            }
        }
        self.set_gc_actions(&actions)?;
        Ok(found)
    }

    fn gc_action_applies(&self, action: &GcAction) -> Result<bool, KeeperError> {
        let GcAction {
            vat_id,
            action_type,
            kref,
        } = *action;
        if !self.is_vat_alive(vat_id)? {
            return Ok(false);
        }
        let flag = self.get_reachable_flag(vat_id, kref)?;
        Ok(match action_type {
            GcActionType::DropExport => {
                self.kernel_object_exists(kref)?
                    && self.object_ref_count(kref)?.reachable == 0
                    && flag == Some(true)
            }
            GcActionType::RetireExport => {
                if !self.kernel_object_exists(kref)? {
                    false
                } else {
                    let rc = self.object_ref_count(kref)?;
                    rc.reachable == 0 && rc.recognizable == 0 && flag.is_some()
                }
            }
            GcActionType::RetireImport => flag.is_some(),
        })
    }

    // ========================================================================
    // Reap queue
    // ========================================================================

    /// Owe a vat a `bringOutYourDead`.
    pub fn schedule_reap(&mut self, vat_id: VatId) -> Result<(), KeeperError> {
        let mut queue: Vec<VatId> = self.get_json(REAP_QUEUE_KEY)?.unwrap_or_default();
        if !queue.contains(&vat_id) {
            queue.push(vat_id);
            self.set_json(REAP_QUEUE_KEY, &queue)?;
        }
        Ok(())
    }

    /// Next owed `bringOutYourDead`, skipping vats that died meanwhile.
    pub fn next_reap_event(&mut self) -> Result<Option<RunQueueEvent>, KeeperError> {
        let mut queue: Vec<VatId> = self.get_json(REAP_QUEUE_KEY)?.unwrap_or_default();
        if queue.is_empty() {
            return Ok(None);
        }
        let mut found = None;
        while !queue.is_empty() {
            let vat_id = queue.remove(0);
            if self.is_vat_alive(vat_id)? {
                found = Some(RunQueueEvent::BringOutYourDead { vat_id });
                break;
            }
        }
        self.set_json(REAP_QUEUE_KEY, &queue)?;
        Ok(found)
    }
}

fn gc_event(vat_id: VatId, action_type: GcActionType, krefs: Vec<KernelSlot>) -> RunQueueEvent {
    match action_type {
        GcActionType::DropExport => RunQueueEvent::DropExports { vat_id, krefs },
        GcActionType::RetireExport => RunQueueEvent::RetireExports { vat_id, krefs },
        GcActionType::RetireImport => RunQueueEvent::RetireImports { vat_id, krefs },
    }
}
