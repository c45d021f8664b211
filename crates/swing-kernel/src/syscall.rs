//! Syscall execution
//!
//! During a delivery the worker's syscalls arrive here in vat refs. Each
//! one is translated through the vat's c-list and executed against the
//! kernel tables immediately; only promise notifications are held back
//! and queued once the delivery returns, one `notify` per subscriber.
//!
//! A refused syscall is recorded and answered with an error. The first
//! refusal marks the crank illegal: the kernel rolls it back and
//! terminates the vat after the delivery returns.

use swing_kernel_core::{KeeperError, KernelCapData, KernelKeeper, KernelSlot, RunQueueEvent};
use swing_vat::{
    CapData, Message, SyscallHandler, SyscallValue, VatId, VatSlot, VatSyscall, VatSyscallResult,
};
use tracing::{trace, warn};

use crate::device::DeviceRegistry;
use crate::error::SyscallError;
use crate::transcript::SyscallRecord;

/// Notifications owed to subscribers, grouped per vat in first-seen
/// order.
#[derive(Debug, Default)]
pub(crate) struct NotifyBatch {
    pending: Vec<(VatId, Vec<KernelSlot>)>,
}

impl NotifyBatch {
    pub(crate) fn add(&mut self, vat_id: VatId, kpid: KernelSlot) {
        match self.pending.iter_mut().find(|(v, _)| *v == vat_id) {
            Some((_, kpids)) => {
                if !kpids.contains(&kpid) {
                    kpids.push(kpid);
                }
            }
            None => self.pending.push((vat_id, vec![kpid])),
        }
    }

    pub(crate) fn flush(self, keeper: &mut KernelKeeper) -> Result<(), KeeperError> {
        for (vat_id, kpids) in self.pending {
            keeper.enqueue(&RunQueueEvent::Notify { vat_id, kpids })?;
        }
        Ok(())
    }
}

/// Settle a promise on behalf of `decider` (`None` for promises whose
/// authority sits with the run-queue or the kernel) and note who needs
/// notifying.
pub(crate) fn resolve_promise(
    keeper: &mut KernelKeeper,
    decider: Option<VatId>,
    kpid: KernelSlot,
    rejected: bool,
    data: &KernelCapData,
    notifies: &mut NotifyBatch,
) -> Result<(), KeeperError> {
    if keeper.get_kernel_promise(kpid)?.state.is_resolved() {
        return Err(KeeperError::AlreadyResolved(kpid));
    }
    let actual = keeper.decider(kpid)?;
    if actual != decider {
        return Err(match decider {
            Some(vat_id) => KeeperError::NotDecider {
                kpid,
                vat_id,
                decider: actual,
            },
            None => KeeperError::invariant(format!("{kpid} is decided by {actual:?}, not the kernel")),
        });
    }
    let settlement = keeper.resolve_kernel_promise(kpid, rejected, data)?;
    for vat_id in settlement.subscribers {
        notifies.add(vat_id, kpid);
    }
    trace!(%kpid, rejected, "resolved promise");
    Ok(())
}

/// A vat asked to be terminated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ExitRequest {
    pub failure: bool,
    pub info: KernelCapData,
}

/// Everything a delivery's syscalls left behind.
#[derive(Debug, Default)]
pub(crate) struct SyscallOutcome {
    pub records: Vec<SyscallRecord>,
    pub illegal: Option<SyscallError>,
    pub exit: Option<ExitRequest>,
    pub notifies: NotifyBatch,
}

/// Executes one vat's syscalls for the duration of a delivery.
pub(crate) struct KernelSyscallHandler<'a> {
    keeper: &'a mut KernelKeeper,
    devices: &'a mut DeviceRegistry,
    vat_id: VatId,
    outcome: SyscallOutcome,
}

impl<'a> KernelSyscallHandler<'a> {
    pub(crate) fn new(keeper: &'a mut KernelKeeper, devices: &'a mut DeviceRegistry, vat_id: VatId) -> Self {
        Self {
            keeper,
            devices,
            vat_id,
            outcome: SyscallOutcome::default(),
        }
    }

    pub(crate) fn finish(self) -> SyscallOutcome {
        self.outcome
    }

    fn to_kernel(&mut self, vref: VatSlot) -> Result<KernelSlot, SyscallError> {
        Ok(self.keeper.map_vat_slot_to_kernel_slot(self.vat_id, vref, true)?)
    }

    fn data_to_kernel(&mut self, data: &CapData<VatSlot>) -> Result<KernelCapData, SyscallError> {
        data.try_map_slots(|vref| self.to_kernel(*vref))
    }

    fn existing(&self, vref: VatSlot) -> Result<KernelSlot, SyscallError> {
        self.keeper
            .vat_to_kernel_existing(self.vat_id, vref)?
            .ok_or(SyscallError::Protocol(KeeperError::UnknownVref {
                vat_id: self.vat_id,
                vref,
            }))
    }

    fn require_promise(&self, vref: VatSlot) -> Result<(), SyscallError> {
        if vref.is_promise() {
            Ok(())
        } else {
            Err(SyscallError::Protocol(KeeperError::WrongRefType {
                vat_id: self.vat_id,
                vref,
                detail: "expected a promise",
            }))
        }
    }

    fn execute(&mut self, call: &VatSyscall) -> Result<SyscallValue, SyscallError> {
        match call {
            VatSyscall::Send { target, msg } => {
                self.do_send(*target, msg)?;
                Ok(SyscallValue::None)
            }
            VatSyscall::Subscribe { promise } => {
                self.require_promise(*promise)?;
                let kpid = self.to_kernel(*promise)?;
                if self.keeper.get_kernel_promise(kpid)?.state.is_resolved() {
                    self.outcome.notifies.add(self.vat_id, kpid);
                } else {
                    self.keeper.add_subscriber(kpid, self.vat_id)?;
                }
                Ok(SyscallValue::None)
            }
            VatSyscall::Resolve { resolutions } => {
                let mut kernel_resolutions = Vec::with_capacity(resolutions.len());
                for resolution in resolutions {
                    self.require_promise(resolution.promise)?;
                    let kpid = self.to_kernel(resolution.promise)?;
                    let data = self.data_to_kernel(&resolution.data)?;
                    kernel_resolutions.push((kpid, resolution.rejected, data));
                }
                let mut resolved = Vec::with_capacity(kernel_resolutions.len());
                for (kpid, rejected, data) in kernel_resolutions {
                    resolve_promise(
                        self.keeper,
                        Some(self.vat_id),
                        kpid,
                        rejected,
                        &data,
                        &mut self.outcome.notifies,
                    )?;
                    resolved.push(kpid);
                }
                // the resolver gives up its c-list entries for what it settled
                self.keeper
                    .delete_clist_entries_for_kernel_slots(self.vat_id, &resolved)?;
                Ok(SyscallValue::None)
            }
            VatSyscall::Exit { failure, info } => {
                let info = self.data_to_kernel(info)?;
                self.outcome.exit = Some(ExitRequest {
                    failure: *failure,
                    info,
                });
                Ok(SyscallValue::None)
            }
            VatSyscall::DropImports { vrefs } => {
                for vref in vrefs {
                    let kref = self.gc_ref(*vref, "dropImports", false)?;
                    self.keeper.clear_reachable_flag(self.vat_id, kref)?;
                }
                Ok(SyscallValue::None)
            }
            VatSyscall::RetireImports { vrefs } => {
                for vref in vrefs {
                    let kref = self.gc_ref(*vref, "retireImports", false)?;
                    if self.keeper.get_reachable_flag(self.vat_id, kref)? == Some(true) {
                        return Err(SyscallError::ImportStillReachable(*vref));
                    }
                    self.keeper.delete_clist_entry(self.vat_id, kref)?;
                }
                Ok(SyscallValue::None)
            }
            VatSyscall::RetireExports { vrefs } => {
                let mut krefs = Vec::with_capacity(vrefs.len());
                for vref in vrefs {
                    let kref = self.gc_ref(*vref, "retireExports", true)?;
                    if self.keeper.object_ref_count(kref)?.reachable > 0 {
                        return Err(SyscallError::Protocol(KeeperError::StillReachable {
                            vat_id: self.vat_id,
                            kref,
                        }));
                    }
                    self.keeper.delete_clist_entry(self.vat_id, kref)?;
                    krefs.push(kref);
                }
                self.keeper.retire_kernel_objects(&krefs)?;
                Ok(SyscallValue::None)
            }
            VatSyscall::AbandonExports { vrefs } => {
                for vref in vrefs {
                    let kref = self.gc_ref(*vref, "abandonExports", true)?;
                    self.keeper.abandon_export(self.vat_id, kref)?;
                }
                Ok(SyscallValue::None)
            }
            VatSyscall::CallNow {
                target,
                method,
                args,
            } => self.do_call_now(*target, method, args),
            VatSyscall::VatstoreGet { key } => Ok(SyscallValue::Text(
                self.keeper.vatstore_get(self.vat_id, key)?,
            )),
            VatSyscall::VatstoreSet { key, value } => {
                self.keeper.vatstore_set(self.vat_id, key, value)?;
                Ok(SyscallValue::None)
            }
            VatSyscall::VatstoreDelete { key } => {
                self.keeper.vatstore_delete(self.vat_id, key)?;
                Ok(SyscallValue::None)
            }
            VatSyscall::VatstoreGetNextKey { prior_key } => Ok(SyscallValue::Text(
                self.keeper.vatstore_get_next_key(self.vat_id, prior_key)?,
            )),
        }
    }

    fn do_send(&mut self, target: VatSlot, msg: &Message<VatSlot>) -> Result<(), SyscallError> {
        let ktarget = self.to_kernel(target)?;
        let args = self.data_to_kernel(&msg.args)?;
        let result = match msg.result {
            Some(vref) => {
                self.require_promise(vref)?;
                let kpid = self.to_kernel(vref)?;
                let promise = self.keeper.get_kernel_promise(kpid)?;
                if promise.state.is_resolved() || self.keeper.decider(kpid)? != Some(self.vat_id) {
                    return Err(SyscallError::BadResultPromise { vref });
                }
                // resolution authority now rides with the message
                self.keeper.set_decider(kpid, None)?;
                Some(kpid)
            }
            None => None,
        };
        let kmsg = Message::new(msg.method.clone(), args, result);
        trace!(vat_id = %self.vat_id, target = %ktarget, method = %kmsg.method, "syscall send");
        self.keeper.enqueue(&RunQueueEvent::Send {
            target: ktarget,
            msg: kmsg,
        })?;
        Ok(())
    }

    /// Look up a vref named by a GC syscall. Objects only, in the given
    /// direction, and already in the c-list.
    fn gc_ref(&self, vref: VatSlot, syscall: &'static str, export: bool) -> Result<KernelSlot, SyscallError> {
        let ok = if export {
            vref.is_object_export()
        } else {
            vref.is_object_import()
        };
        if !ok {
            return Err(SyscallError::WrongDirection {
                syscall,
                vref,
                expected: if export { "export" } else { "import" },
            });
        }
        self.existing(vref)
    }

    fn do_call_now(
        &mut self,
        target: VatSlot,
        method: &str,
        args: &CapData<VatSlot>,
    ) -> Result<SyscallValue, SyscallError> {
        if target.slot_type != swing_vat::SlotType::Device {
            return Err(SyscallError::NotADevice(target));
        }
        let dref = self.existing(target)?;
        if let Some(vref) = args.slots.iter().find(|s| s.is_promise()) {
            return Err(SyscallError::Protocol(KeeperError::WrongRefType {
                vat_id: self.vat_id,
                vref: *vref,
                detail: "callNow arguments cannot carry promises",
            }));
        }
        let kargs = self.data_to_kernel(args)?;
        let name = self
            .keeper
            .device_name(dref)?
            .ok_or(SyscallError::UnknownDevice(dref))?;
        let device = self
            .devices
            .get_mut(&name)
            .ok_or(SyscallError::UnknownDevice(dref))?;
        let retains = device.retains_arguments();
        let kresult = device
            .invoke(method, &kargs)
            .map_err(|reason| SyscallError::Device {
                device: name.clone(),
                reason,
            })?;
        if retains {
            for kref in kargs.slots.iter().filter(|k| k.is_object()) {
                self.keeper.pin(*kref)?;
            }
        }
        let vat_id = self.vat_id;
        let vresult = kresult
            .try_map_slots(|kref| self.keeper.map_kernel_slot_to_vat_slot(vat_id, *kref, true))?;
        Ok(SyscallValue::Data(vresult))
    }
}

impl SyscallHandler for KernelSyscallHandler<'_> {
    fn syscall(&mut self, call: &VatSyscall) -> VatSyscallResult {
        let result = if self.outcome.illegal.is_some() {
            Err(SyscallError::AfterIllegal)
        } else {
            self.execute(call)
        };
        let answer = match result {
            Ok(value) => VatSyscallResult::Ok(value),
            Err(e) => {
                warn!(vat_id = %self.vat_id, syscall = call.kind(), error = %e, "illegal syscall");
                let answer = VatSyscallResult::Error(e.to_string());
                if self.outcome.illegal.is_none() {
                    self.outcome.illegal = Some(e);
                }
                answer
            }
        };
        self.outcome.records.push(SyscallRecord {
            s: call.clone(),
            r: answer.clone(),
        });
        answer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use swing_kernel_core::{PromiseState, VatOptions};
    use swing_store::{BundleId, SwingStore};
    use swing_vat::Resolution;

    fn setup() -> (KernelKeeper, DeviceRegistry, VatId, VatId) {
        let mut keeper = KernelKeeper::new(SwingStore::in_memory());
        keeper.create_kernel_state().unwrap();
        let bundle = BundleId::for_bytes(b"x");
        let a = keeper.create_vat_state(&VatOptions::named("a"), &bundle).unwrap();
        let b = keeper.create_vat_state(&VatOptions::named("b"), &bundle).unwrap();
        (keeper, DeviceRegistry::new(), a, b)
    }

    #[test]
    fn test_send_enqueues_and_hands_over_result_authority() {
        let (mut keeper, mut devices, a, b) = setup();
        let b_root = keeper.map_vat_slot_to_kernel_slot(b, VatSlot::ROOT, true).unwrap();
        let import = keeper.map_kernel_slot_to_vat_slot(a, b_root, true).unwrap();

        let mut handler = KernelSyscallHandler::new(&mut keeper, &mut devices, a);
        let answer = handler.syscall(&VatSyscall::Send {
            target: import,
            msg: Message::new("hi", CapData::plain(&json!([])), Some(VatSlot::promise_export(1))),
        });
        assert_eq!(answer, VatSyscallResult::ok());
        let outcome = handler.finish();
        assert!(outcome.illegal.is_none());
        assert_eq!(outcome.records.len(), 1);

        let Some(RunQueueEvent::Send { target, msg }) = keeper.pop_run_queue().unwrap() else {
            panic!("expected a send");
        };
        assert_eq!(target, b_root);
        let kpid = msg.result.unwrap();
        assert_eq!(keeper.decider(kpid).unwrap(), None);
    }

    #[test]
    fn test_unknown_import_is_illegal_and_sticky() {
        let (mut keeper, mut devices, a, _) = setup();
        let mut handler = KernelSyscallHandler::new(&mut keeper, &mut devices, a);
        let answer = handler.syscall(&VatSyscall::Send {
            target: VatSlot::import(9),
            msg: Message::new("hi", CapData::plain(&json!([])), None),
        });
        assert!(answer.is_error());
        let answer = handler.syscall(&VatSyscall::VatstoreGet { key: "k".into() });
        assert!(answer.is_error());
        let outcome = handler.finish();
        assert!(matches!(outcome.illegal, Some(SyscallError::Protocol(KeeperError::UnknownVref { .. }))));
        assert_eq!(outcome.records.len(), 2);
    }

    #[test]
    fn test_resolve_notifies_subscribers_and_drops_resolver_entry() {
        let (mut keeper, mut devices, a, b) = setup();
        let kpid = keeper
            .map_vat_slot_to_kernel_slot(a, VatSlot::promise_export(1), true)
            .unwrap();
        let in_b = keeper.map_kernel_slot_to_vat_slot(b, kpid, true).unwrap();
        keeper.add_subscriber(kpid, b).unwrap();

        let mut handler = KernelSyscallHandler::new(&mut keeper, &mut devices, a);
        handler.syscall(&VatSyscall::Resolve {
            resolutions: vec![Resolution {
                promise: VatSlot::promise_export(1),
                rejected: false,
                data: CapData::plain(&json!(42)),
            }],
        });
        let outcome = handler.finish();
        assert!(outcome.illegal.is_none());
        outcome.notifies.flush(&mut keeper).unwrap();

        assert!(!keeper.has_clist_entry(a, kpid).unwrap());
        assert_eq!(keeper.vat_to_kernel_existing(b, in_b).unwrap(), Some(kpid));
        assert!(matches!(
            keeper.get_kernel_promise(kpid).unwrap().state,
            PromiseState::Fulfilled(_)
        ));
        assert_eq!(
            keeper.pop_run_queue().unwrap(),
            Some(RunQueueEvent::Notify { vat_id: b, kpids: vec![kpid] })
        );
    }

    #[test]
    fn test_resolving_someone_elses_promise_is_illegal() {
        let (mut keeper, mut devices, a, b) = setup();
        let kpid = keeper
            .map_vat_slot_to_kernel_slot(a, VatSlot::promise_export(1), true)
            .unwrap();
        let in_b = keeper.map_kernel_slot_to_vat_slot(b, kpid, true).unwrap();
        let mut handler = KernelSyscallHandler::new(&mut keeper, &mut devices, b);
        handler.syscall(&VatSyscall::Resolve {
            resolutions: vec![Resolution {
                promise: in_b,
                rejected: true,
                data: CapData::plain(&json!("nope")),
            }],
        });
        assert!(matches!(
            handler.finish().illegal,
            Some(SyscallError::Protocol(KeeperError::NotDecider { .. }))
        ));
    }

    #[test]
    fn test_retire_import_requires_drop_first() {
        let (mut keeper, mut devices, a, b) = setup();
        let ko = keeper
            .map_vat_slot_to_kernel_slot(b, VatSlot::export(1), true)
            .unwrap();
        let vref = keeper.map_kernel_slot_to_vat_slot(a, ko, true).unwrap();

        let mut handler = KernelSyscallHandler::new(&mut keeper, &mut devices, a);
        assert!(handler
            .syscall(&VatSyscall::RetireImports { vrefs: vec![vref] })
            .is_error());
        assert!(matches!(
            handler.finish().illegal,
            Some(SyscallError::ImportStillReachable(_))
        ));

        let mut handler = KernelSyscallHandler::new(&mut keeper, &mut devices, a);
        handler.syscall(&VatSyscall::DropImports { vrefs: vec![vref] });
        handler.syscall(&VatSyscall::RetireImports { vrefs: vec![vref] });
        assert!(handler.finish().illegal.is_none());
        assert!(!keeper.has_clist_entry(a, ko).unwrap());
        assert_eq!(keeper.object_ref_count(ko).unwrap().recognizable, 0);
    }

    #[test]
    fn test_subscribe_to_settled_promise_notifies_at_once() {
        let (mut keeper, mut devices, a, b) = setup();
        let kpid = keeper.add_kernel_promise(None).unwrap();
        let vpid = keeper.map_kernel_slot_to_vat_slot(a, kpid, true).unwrap();
        let mut notifies = NotifyBatch::default();
        resolve_promise(&mut keeper, None, kpid, false, &CapData::empty(), &mut notifies).unwrap();

        let mut handler = KernelSyscallHandler::new(&mut keeper, &mut devices, a);
        handler.syscall(&VatSyscall::Subscribe { promise: vpid });
        let outcome = handler.finish();
        assert!(outcome.illegal.is_none());
        outcome.notifies.flush(&mut keeper).unwrap();
        assert_eq!(
            keeper.pop_run_queue().unwrap(),
            Some(RunQueueEvent::Notify { vat_id: a, kpids: vec![kpid] })
        );
        let _ = b;
    }

    #[test]
    fn test_vatstore_round_trip() {
        let (mut keeper, mut devices, a, _) = setup();
        let mut handler = KernelSyscallHandler::new(&mut keeper, &mut devices, a);
        handler.syscall(&VatSyscall::VatstoreSet {
            key: "k".into(),
            value: "v".into(),
        });
        let got = handler.syscall(&VatSyscall::VatstoreGet { key: "k".into() });
        assert_eq!(got.text(), Some("v"));
        let next = handler.syscall(&VatSyscall::VatstoreGetNextKey { prior_key: "".into() });
        assert_eq!(next.text(), Some("k"));
    }
}
