//! Vat termination and upgrade

use serde_json::json;
use swing_kernel_core::{KernelCapData, UpgradeOutcome, VatLifecycle};
use swing_store::BundleId;
use swing_vat::{CapData, VatDelivery, VatId, VatSlot, WorkerFactory};
use tracing::{info, warn};

use super::crank::{delivery_crank_results, CrankResults};
use super::Kernel;
use crate::error::KernelError;
use crate::syscall::{resolve_promise, NotifyBatch};

impl<F: WorkerFactory> Kernel<F> {
    /// Terminate a vat now.
    ///
    /// Promises it decides are rejected with "vat terminated", its
    /// exports are abandoned to the kernel, its imports are dropped, its
    /// worker is stopped and its records deleted. Terminating a critical
    /// vat panics the kernel. Terminating a dead vat does nothing.
    pub(super) fn perform_termination(
        &mut self,
        vat_id: VatId,
        reject: bool,
        info: &KernelCapData,
    ) -> Result<(), KernelError> {
        if !self.keeper.is_vat_alive(vat_id)? {
            return Ok(());
        }
        let options = self.keeper.vat_options(vat_id)?;
        warn!(vat_id = %vat_id, name = %options.name, reject, info = %info.body, "terminating vat");

        let root = self.keeper.vat_to_kernel_existing(vat_id, VatSlot::ROOT)?;
        let decided = self.keeper.enumerate_promises_by_decider(vat_id)?;
        self.keeper.mark_vat_terminated(vat_id)?;

        let failure = CapData::error("vat terminated");
        let mut notifies = NotifyBatch::default();
        for kpid in &decided {
            resolve_promise(&mut self.keeper, Some(vat_id), *kpid, true, &failure, &mut notifies)?;
        }
        notifies.flush(&mut self.keeper)?;

        for entry in self.keeper.clist_entries(vat_id)? {
            if entry.kref.is_object() && entry.vref.is_object_export() {
                self.keeper.abandon_export(vat_id, entry.kref)?;
            } else {
                self.keeper.delete_clist_entry(vat_id, entry.kref)?;
            }
        }
        if let Some(root) = root {
            self.keeper.unpin(root)?;
        }

        self.warehouse.stop_worker(vat_id);
        self.keeper.delete_vat_state(vat_id)?;
        info!(vat_id = %vat_id, rejected = decided.len(), "vat terminated");

        if options.critical {
            return Err(KernelError::Panicked(format!(
                "critical vat {vat_id} ({}) failed: {}",
                options.name, info.body
            )));
        }
        Ok(())
    }

    /// Move a vat to a new incarnation.
    ///
    /// ```text
    ///   bringOutYourDead (old code)
    ///   reject promises the vat decides ("vatUpgraded"), drop them from its c-list
    ///   abandon non-durable exports
    ///   new incarnation, new source, fresh worker
    ///   startVat (new code)
    /// ```
    ///
    /// If either delivery fails, the whole crank rolls back and the vat
    /// keeps running its old incarnation.
    pub(super) fn process_upgrade_vat(
        &mut self,
        vat_id: VatId,
        upgrade_id: u64,
        bundle_id: &BundleId,
        vat_parameters: &KernelCapData,
        upgrade_message: &str,
    ) -> Result<CrankResults, KernelError> {
        if !self.keeper.is_vat_alive(vat_id)? {
            return Ok(CrankResults {
                upgrade: Some((
                    upgrade_id,
                    UpgradeOutcome::Failed {
                        vat_id,
                        reason: "vat terminated".to_string(),
                    },
                )),
                ..CrankResults::default()
            });
        }
        if !self.keeper.store().has_bundle(bundle_id)? {
            return Ok(CrankResults {
                upgrade: Some((
                    upgrade_id,
                    UpgradeOutcome::Failed {
                        vat_id,
                        reason: format!("bundle {bundle_id} is not installed"),
                    },
                )),
                ..CrankResults::default()
            });
        }
        let old_incarnation = self.keeper.incarnation(vat_id)?;
        self.keeper.set_lifecycle(vat_id, VatLifecycle::Upgrading)?;

        let report = self.deliver(vat_id, &VatDelivery::BringOutYourDead)?;
        let boyd = delivery_crank_results(vat_id, report, false);
        if boyd.terminate.is_some() {
            return Ok(self.abort_upgrade(vat_id, upgrade_id, boyd.computrons, "bringOutYourDead failed"));
        }
        self.keeper.reset_reap_dirt(vat_id)?;

        let disconnection = CapData::plain(&json!({
            "name": "vatUpgraded",
            "upgradeMessage": upgrade_message,
            "incarnationNumber": old_incarnation,
        }));
        let decided = self.keeper.enumerate_promises_by_decider(vat_id)?;
        let mut notifies = NotifyBatch::default();
        for kpid in &decided {
            resolve_promise(&mut self.keeper, Some(vat_id), *kpid, true, &disconnection, &mut notifies)?;
        }
        // the new incarnation never saw these vpids
        self.keeper
            .delete_clist_entries_for_kernel_slots(vat_id, &decided)?;
        notifies.flush(&mut self.keeper)?;

        for entry in self.keeper.non_durable_exports(vat_id)? {
            self.keeper.abandon_export(vat_id, entry.kref)?;
        }

        self.warehouse.stop_worker(vat_id);
        let new_incarnation = self.keeper.begin_new_incarnation(vat_id)?;
        self.keeper.set_vat_source(vat_id, bundle_id)?;

        let keeper = &mut self.keeper;
        let params = vat_parameters.try_map_slots(|k| keeper.map_kernel_slot_to_vat_slot(vat_id, *k, true))?;
        let report = self.deliver(
            vat_id,
            &VatDelivery::StartVat {
                vat_parameters: params,
            },
        )?;
        let start = delivery_crank_results(vat_id, report, false);
        let computrons = sum_computrons(boyd.computrons, start.computrons);
        if start.terminate.is_some() {
            return Ok(self.abort_upgrade(vat_id, upgrade_id, computrons, "startVat failed"));
        }

        self.keeper.set_lifecycle(vat_id, VatLifecycle::Active)?;
        info!(
            vat_id = %vat_id,
            upgrade_id,
            incarnation = new_incarnation,
            rejected = decided.len(),
            "vat upgraded"
        );
        Ok(CrankResults {
            delivered: Some(vat_id),
            computrons,
            upgrade: Some((
                upgrade_id,
                UpgradeOutcome::Succeeded {
                    vat_id,
                    incarnation: new_incarnation,
                },
            )),
            ..CrankResults::default()
        })
    }

    /// Undo the upgrade: the crank rolls back to just after the event was
    /// taken, and the old incarnation comes back by replay on its next
    /// delivery.
    fn abort_upgrade(
        &mut self,
        vat_id: VatId,
        upgrade_id: u64,
        computrons: Option<u64>,
        reason: &str,
    ) -> CrankResults {
        self.warehouse.stop_worker(vat_id);
        warn!(vat_id = %vat_id, upgrade_id, reason, "upgrade failed");
        CrankResults {
            delivered: Some(vat_id),
            computrons,
            abort: true,
            consume_message: true,
            upgrade: Some((
                upgrade_id,
                UpgradeOutcome::Failed {
                    vat_id,
                    reason: reason.to_string(),
                },
            )),
            ..CrankResults::default()
        }
    }
}

fn sum_computrons(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_computrons_add_when_either_is_metered() {
        assert_eq!(sum_computrons(None, None), None);
        assert_eq!(sum_computrons(Some(3), None), Some(3));
        assert_eq!(sum_computrons(Some(3), Some(4)), Some(7));
    }
}
