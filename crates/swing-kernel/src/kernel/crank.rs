//! Crank processing: pick the next event, deliver it, settle the results

use swing_kernel_core::{
    GcActionType, KeeperError, KernelCapData, KernelSlot, PromiseState, RunQueueEvent,
    UpgradeOutcome, VatLifecycle,
};
use swing_vat::{CapData, DeliveryResult, DeliveryStatus, Resolution, VatDelivery, VatId, WorkerFactory};
use tracing::{debug, warn};

use super::Kernel;
use crate::error::KernelError;
use crate::policy::PolicyInput;
use crate::warehouse::DeliveryReport;

/// A vat the crank decided to terminate.
#[derive(Debug)]
pub(super) struct Termination {
    pub vat_id: VatId,
    pub reject: bool,
    pub info: KernelCapData,
}

/// What a processed event asks the crank to do on the way out.
#[derive(Debug, Default)]
pub(super) struct CrankResults {
    /// Vat that received a delivery.
    pub delivered: Option<VatId>,
    pub computrons: Option<u64>,
    /// Roll the crank back.
    pub abort: bool,
    /// With `abort`: keep the event consumed instead of re-attempting it.
    pub consume_message: bool,
    pub terminate: Option<Termination>,
    /// Count the delivery towards the vat's reap interval.
    pub measure_dirt: bool,
    /// Outcome to record for an upgrade request, after any rollback.
    pub upgrade: Option<(u64, UpgradeOutcome)>,
    /// The event created a dynamic vat.
    pub created_vat: bool,
}

/// Fold a delivery report into crank results. An illegal syscall wins
/// over a failed delivery, which wins over a requested exit.
pub(super) fn delivery_crank_results(vat_id: VatId, report: DeliveryReport, measure_dirt: bool) -> CrankResults {
    let mut results = CrankResults {
        delivered: Some(vat_id),
        computrons: report.result.computrons,
        ..CrankResults::default()
    };
    if let Some(err) = report.illegal {
        warn!(vat_id = %vat_id, error = %err, "illegal syscall");
        results.abort = true;
        results.terminate = Some(Termination {
            vat_id,
            reject: true,
            info: CapData::error("syscall translation error: prepare to die"),
        });
    } else if let DeliveryStatus::Error(problem) = &report.result.status {
        warn!(vat_id = %vat_id, %problem, "delivery failed");
        results.abort = true;
        results.terminate = Some(Termination {
            vat_id,
            reject: true,
            info: CapData::error(problem),
        });
    } else if let Some(exit) = report.exit {
        results.abort = exit.failure;
        results.terminate = Some(Termination {
            vat_id,
            reject: exit.failure,
            info: exit.info,
        });
    } else {
        results.measure_dirt = measure_dirt;
    }
    results
}

impl<F: WorkerFactory> Kernel<F> {
    pub(super) fn crank(&mut self) -> Result<PolicyInput, KernelError> {
        self.keeper.start_crank()?;
        self.keeper.establish_savepoint("start")?;

        let Some(event) = self.next_event()? else {
            self.keeper.rollback_to("start")?;
            self.keeper.end_crank()?;
            return Ok(PolicyInput::None);
        };
        let crank_num = self.keeper.crank_number()?;
        debug!(crank = crank_num, kind = event.kind(), "crank start");

        self.keeper.release_event_refs(&event)?;
        self.keeper.establish_savepoint("deliver")?;
        let results = self.process_event(event)?;
        self.finish_crank(results)
    }

    /// GC actions first, then reaps, then ordinary work.
    fn next_event(&mut self) -> Result<Option<RunQueueEvent>, KernelError> {
        if let Some(event) = self.keeper.next_gc_event()? {
            return Ok(Some(event));
        }
        if let Some(event) = self.keeper.next_reap_event()? {
            return Ok(Some(event));
        }
        Ok(self.keeper.pop_run_queue()?)
    }

    fn process_event(&mut self, event: RunQueueEvent) -> Result<CrankResults, KernelError> {
        match event {
            RunQueueEvent::Send { target, msg } => self.process_send(target, msg),
            RunQueueEvent::Notify { vat_id, kpids } => self.process_notify(vat_id, &kpids),
            RunQueueEvent::CreateVat {
                vat_id,
                vat_parameters,
            } => {
                let mut results = self.process_start_vat(vat_id, &vat_parameters)?;
                results.created_vat = results.delivered.is_some();
                Ok(results)
            }
            RunQueueEvent::StartVat {
                vat_id,
                vat_parameters,
            } => self.process_start_vat(vat_id, &vat_parameters),
            RunQueueEvent::UpgradeVat {
                vat_id,
                upgrade_id,
                bundle_id,
                vat_parameters,
                upgrade_message,
            } => self.process_upgrade_vat(vat_id, upgrade_id, &bundle_id, &vat_parameters, &upgrade_message),
            RunQueueEvent::TerminateVat { vat_id, reason } => {
                let mut results = CrankResults::default();
                if self.keeper.is_vat_alive(vat_id)? {
                    results.terminate = Some(Termination {
                        vat_id,
                        reject: true,
                        info: reason,
                    });
                }
                Ok(results)
            }
            RunQueueEvent::BringOutYourDead { vat_id } => self.process_bring_out_your_dead(vat_id),
            RunQueueEvent::DropExports { vat_id, krefs } => {
                self.process_gc(vat_id, GcActionType::DropExport, &krefs)
            }
            RunQueueEvent::RetireExports { vat_id, krefs } => {
                self.process_gc(vat_id, GcActionType::RetireExport, &krefs)
            }
            RunQueueEvent::RetireImports { vat_id, krefs } => {
                self.process_gc(vat_id, GcActionType::RetireImport, &krefs)
            }
        }
    }

    fn finish_crank(&mut self, mut results: CrankResults) -> Result<PolicyInput, KernelError> {
        if results.abort {
            let savepoint = if results.consume_message { "deliver" } else { "start" };
            self.keeper.rollback_to(savepoint)?;
            if let Some(vat_id) = results.delivered {
                // the worker's heap is ahead of the rolled-back transcript
                self.warehouse.stop_worker(vat_id);
            }
            warn!(vat_id = ?results.delivered, savepoint, "crank aborted");
        } else if let Some(vat_id) = results.delivered {
            self.warehouse.maybe_save_snapshot(&mut self.keeper, vat_id)?;
            if results.measure_dirt && results.terminate.is_none() {
                let dirt = self.keeper.add_reap_dirt(vat_id)?;
                let interval = self
                    .keeper
                    .vat_options(vat_id)?
                    .reap_interval
                    .unwrap_or(self.config.default_reap_interval);
                if dirt >= interval {
                    self.keeper.schedule_reap(vat_id)?;
                }
            }
        }

        if let Some((upgrade_id, outcome)) = &results.upgrade {
            self.keeper.set_upgrade_outcome(*upgrade_id, outcome)?;
        }
        if let Some(termination) = results.terminate.take() {
            self.perform_termination(termination.vat_id, termination.reject, &termination.info)?;
        }

        self.keeper.process_refcounts()?;
        let crank_num = self.keeper.increment_crank_number()?;
        let hashes = self.keeper.store_mut().emit_crank_hashes()?;
        debug!(
            crank = crank_num,
            crankhash = %hashes.crankhash,
            activityhash = %hashes.activityhash,
            "crank finish"
        );
        self.keeper.end_crank()?;

        // a rolled-back upgrade leaves the old incarnation running
        Ok(if results.abort && results.upgrade.is_none() {
            PolicyInput::CrankFailed
        } else if results.created_vat {
            PolicyInput::CreateVat {
                computrons: results.computrons,
            }
        } else if results.delivered.is_some() {
            PolicyInput::Crank {
                computrons: results.computrons,
            }
        } else {
            PolicyInput::None
        })
    }

    /// Deliver to a vat. A worker that cannot be started counts as a
    /// failed delivery, which terminates the vat.
    pub(super) fn deliver(&mut self, vat_id: VatId, delivery: &VatDelivery) -> Result<DeliveryReport, KernelError> {
        match self
            .warehouse
            .deliver(&mut self.keeper, &mut self.devices, vat_id, delivery)
        {
            Err(KernelError::Worker { source, .. }) => Ok(DeliveryReport {
                result: DeliveryResult::error(format!("worker failed to start: {source}")),
                illegal: None,
                exit: None,
            }),
            Err(KernelError::UnknownBundle(bundle)) => Ok(DeliveryReport {
                result: DeliveryResult::error(format!("bundle {bundle} is not installed")),
                illegal: None,
                exit: None,
            }),
            other => other,
        }
    }

    // ========================================================================
    // Event handlers
    // ========================================================================

    fn process_notify(&mut self, vat_id: VatId, kpids: &[KernelSlot]) -> Result<CrankResults, KernelError> {
        if !self.keeper.is_vat_alive(vat_id)? {
            return Ok(CrankResults::default());
        }
        let mut targets = Vec::new();
        for kpid in kpids {
            if self.keeper.has_clist_entry(vat_id, *kpid)? {
                self.collect_settled(*kpid, &mut targets)?;
            }
        }
        if targets.is_empty() {
            return Ok(CrankResults::default());
        }

        let mut resolutions = Vec::with_capacity(targets.len());
        for kpid in &targets {
            let (rejected, data) = match self.keeper.get_kernel_promise(*kpid)?.state {
                PromiseState::Fulfilled(data) => (false, data),
                PromiseState::Rejected(data) => (true, data),
                PromiseState::Unresolved { .. } => {
                    return Err(KeeperError::invariant(format!("notify for unresolved {kpid}")).into())
                }
            };
            let promise = self.keeper.map_kernel_slot_to_vat_slot(vat_id, *kpid, true)?;
            let keeper = &mut self.keeper;
            let data = data.try_map_slots(|k| keeper.map_kernel_slot_to_vat_slot(vat_id, *k, true))?;
            resolutions.push(Resolution {
                promise,
                rejected,
                data,
            });
        }
        // a settled promise never comes back, so the vat forgets it
        self.keeper
            .delete_clist_entries_for_kernel_slots(vat_id, &targets)?;

        let report = self.deliver(vat_id, &VatDelivery::Notify { resolutions })?;
        Ok(delivery_crank_results(vat_id, report, true))
    }

    /// A settled promise plus every settled promise reachable through its
    /// data, in discovery order.
    fn collect_settled(&self, kpid: KernelSlot, seen: &mut Vec<KernelSlot>) -> Result<(), KernelError> {
        if seen.contains(&kpid) {
            return Ok(());
        }
        seen.push(kpid);
        let promise = self.keeper.get_kernel_promise(kpid)?;
        if let Some(data) = promise.state.data() {
            for slot in data.slots.iter().filter(|s| s.is_promise()) {
                if self.keeper.get_kernel_promise(*slot)?.state.is_resolved() {
                    self.collect_settled(*slot, seen)?;
                }
            }
        }
        Ok(())
    }

    fn process_gc(
        &mut self,
        vat_id: VatId,
        action: GcActionType,
        krefs: &[KernelSlot],
    ) -> Result<CrankResults, KernelError> {
        if !self.keeper.is_vat_alive(vat_id)? {
            return Ok(CrankResults::default());
        }
        if action == GcActionType::RetireExport {
            for kref in krefs {
                self.keeper.delete_kernel_object(*kref)?;
            }
        }
        let mut vrefs = Vec::with_capacity(krefs.len());
        for kref in krefs {
            let vref = self
                .keeper
                .kernel_to_vat_existing(vat_id, *kref)?
                .ok_or_else(|| KeeperError::invariant(format!("{} for {kref} missing from {vat_id}", action.as_str())))?;
            match action {
                GcActionType::DropExport => self.keeper.clear_reachable_flag(vat_id, *kref)?,
                GcActionType::RetireExport | GcActionType::RetireImport => {
                    self.keeper.delete_clist_entry(vat_id, *kref)?
                }
            }
            vrefs.push(vref);
        }
        let delivery = match action {
            GcActionType::DropExport => VatDelivery::DropExports { vrefs },
            GcActionType::RetireExport => VatDelivery::RetireExports { vrefs },
            GcActionType::RetireImport => VatDelivery::RetireImports { vrefs },
        };
        let report = self.deliver(vat_id, &delivery)?;
        Ok(delivery_crank_results(vat_id, report, true))
    }

    fn process_bring_out_your_dead(&mut self, vat_id: VatId) -> Result<CrankResults, KernelError> {
        if !self.keeper.is_vat_alive(vat_id)? {
            return Ok(CrankResults::default());
        }
        self.keeper.reset_reap_dirt(vat_id)?;
        let report = self.deliver(vat_id, &VatDelivery::BringOutYourDead)?;
        Ok(delivery_crank_results(vat_id, report, false))
    }

    fn process_start_vat(
        &mut self,
        vat_id: VatId,
        vat_parameters: &KernelCapData,
    ) -> Result<CrankResults, KernelError> {
        if !self.keeper.is_vat_alive(vat_id)? {
            return Ok(CrankResults::default());
        }
        let keeper = &mut self.keeper;
        let params = vat_parameters.try_map_slots(|k| keeper.map_kernel_slot_to_vat_slot(vat_id, *k, true))?;
        let report = self.deliver(
            vat_id,
            &VatDelivery::StartVat {
                vat_parameters: params,
            },
        )?;
        let mut results = delivery_crank_results(vat_id, report, true);
        results.consume_message = true;
        if results.terminate.is_none() && self.keeper.lifecycle(vat_id)? == VatLifecycle::Starting {
            self.keeper.set_lifecycle(vat_id, VatLifecycle::Active)?;
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyscallError;
    use crate::syscall::ExitRequest;
    use serde_json::json;

    fn report(result: DeliveryResult) -> DeliveryReport {
        DeliveryReport {
            result,
            illegal: None,
            exit: None,
        }
    }

    #[test]
    fn test_illegal_syscall_outranks_everything() {
        let mut r = report(DeliveryResult::error("boom"));
        r.illegal = Some(SyscallError::AfterIllegal);
        r.exit = Some(ExitRequest {
            failure: false,
            info: CapData::empty(),
        });
        let results = delivery_crank_results(VatId(1), r, true);
        assert!(results.abort);
        assert!(!results.measure_dirt);
        let t = results.terminate.unwrap();
        assert!(t.reject);
        assert!(t.info.body.contains("prepare to die"));
    }

    #[test]
    fn test_clean_exit_terminates_without_abort() {
        let mut r = report(DeliveryResult::ok());
        r.exit = Some(ExitRequest {
            failure: false,
            info: CapData::plain(&json!("done")),
        });
        let results = delivery_crank_results(VatId(2), r, true);
        assert!(!results.abort);
        let t = results.terminate.unwrap();
        assert!(!t.reject);
        assert_eq!(t.info.body, "\"done\"");
    }

    #[test]
    fn test_failed_exit_aborts() {
        let mut r = report(DeliveryResult::ok_metered(7));
        r.exit = Some(ExitRequest {
            failure: true,
            info: CapData::error("bad"),
        });
        let results = delivery_crank_results(VatId(2), r, true);
        assert!(results.abort);
        assert_eq!(results.computrons, Some(7));
    }

    #[test]
    fn test_success_measures_dirt_only_when_asked() {
        assert!(delivery_crank_results(VatId(1), report(DeliveryResult::ok()), true).measure_dirt);
        assert!(!delivery_crank_results(VatId(1), report(DeliveryResult::ok()), false).measure_dirt);
    }
}
