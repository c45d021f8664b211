//! Message routing
//!
//! Decides where a `send` goes:
//!
//! | target                                 | route                       |
//! |----------------------------------------|-----------------------------|
//! | object, owner alive                    | deliver to the owner        |
//! | object, owner gone                     | splat "vat terminated"      |
//! | promise fulfilled to one object        | route again to that object  |
//! | promise fulfilled to anything else     | splat "data is not callable"|
//! | promise rejected                       | splat with the rejection    |
//! | unresolved, pipelining decider         | deliver to the decider      |
//! | unresolved, otherwise                  | wait on the promise queue   |
//! | device                                 | splat                       |
//!
//! A splat rejects the message's result promise, if it has one.

use swing_kernel_core::{KeeperError, KernelCapData, KernelMessage, KernelSlot, PromiseState};
use swing_vat::{CapData, Message, VatDelivery, VatId, WorkerFactory};
use tracing::debug;

use super::crank::{delivery_crank_results, CrankResults};
use super::Kernel;
use crate::error::KernelError;
use crate::syscall::{resolve_promise, NotifyBatch};

/// Where a message goes.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum Route {
    /// Deliver to a vat, addressed to `target` (an object it owns or a
    /// promise it decides).
    Deliver { vat_id: VatId, target: KernelSlot },
    /// Wait on an unresolved promise.
    Queue(KernelSlot),
    /// Reject the result with this data.
    Splat(KernelCapData),
}

impl<F: WorkerFactory> Kernel<F> {
    pub(super) fn route_send(&self, target: KernelSlot, msg: &KernelMessage) -> Result<Route, KernelError> {
        let mut target = target;
        // at most two passes: a fulfilled promise forwards only to an object
        loop {
            match target {
                KernelSlot::Object(_) => {
                    return Ok(match self.keeper.owner_of_kernel_object(target)? {
                        Some(owner) if self.keeper.is_vat_alive(owner)? => Route::Deliver {
                            vat_id: owner,
                            target,
                        },
                        _ => Route::Splat(CapData::error("vat terminated")),
                    });
                }
                KernelSlot::Device(_) => {
                    return Ok(Route::Splat(CapData::error(&format!(
                        "cannot send {:?} to device {target}",
                        msg.method
                    ))));
                }
                KernelSlot::Promise(_) => match self.keeper.get_kernel_promise(target)?.state {
                    PromiseState::Fulfilled(data) => match data.as_single_slot() {
                        Some(next) if next.is_object() => target = *next,
                        _ => {
                            return Ok(Route::Splat(CapData::error(&format!(
                                "data is not callable, has no method {}",
                                msg.method
                            ))));
                        }
                    },
                    PromiseState::Rejected(data) => return Ok(Route::Splat(data)),
                    PromiseState::Unresolved { decider, .. } => {
                        let Some(decider) = decider else {
                            return Ok(Route::Queue(target));
                        };
                        if !self.keeper.is_vat_alive(decider)? {
                            return Ok(Route::Splat(CapData::error("vat terminated")));
                        }
                        if self.keeper.vat_options(decider)?.enable_pipelining {
                            return Ok(Route::Deliver {
                                vat_id: decider,
                                target,
                            });
                        }
                        return Ok(Route::Queue(target));
                    }
                },
            }
        }
    }

    pub(super) fn process_send(&mut self, target: KernelSlot, msg: KernelMessage) -> Result<CrankResults, KernelError> {
        match self.route_send(target, &msg)? {
            Route::Deliver { vat_id, target } => self.deliver_message(vat_id, target, &msg),
            Route::Queue(kpid) => {
                debug!(%kpid, method = %msg.method, "message waits on promise");
                self.keeper.add_message_to_promise_queue(kpid, &msg)?;
                Ok(CrankResults::default())
            }
            Route::Splat(data) => {
                self.splat(&msg, &data)?;
                Ok(CrankResults::default())
            }
        }
    }

    /// Reject the message's result promise.
    fn splat(&mut self, msg: &KernelMessage, data: &KernelCapData) -> Result<(), KernelError> {
        let Some(result) = msg.result else {
            debug!(method = %msg.method, "splat without result promise");
            return Ok(());
        };
        debug!(method = %msg.method, %result, "splat");
        let mut notifies = NotifyBatch::default();
        resolve_promise(&mut self.keeper, None, result, true, data, &mut notifies)?;
        notifies.flush(&mut self.keeper)?;
        Ok(())
    }

    fn deliver_message(
        &mut self,
        vat_id: VatId,
        target: KernelSlot,
        msg: &KernelMessage,
    ) -> Result<CrankResults, KernelError> {
        let vat_target = self.keeper.map_kernel_slot_to_vat_slot(vat_id, target, true)?;
        if target.is_object() && !vat_target.allocated_by_vat {
            return Err(KeeperError::invariant(format!(
                "message for {target} routed to {vat_id}, which does not own it"
            ))
            .into());
        }
        let keeper = &mut self.keeper;
        let args = msg
            .args
            .try_map_slots(|k| keeper.map_kernel_slot_to_vat_slot(vat_id, *k, true))?;

        let result = match msg.result {
            Some(kpid) => {
                match self.keeper.get_kernel_promise(kpid)?.state {
                    PromiseState::Unresolved { decider: None, .. } => {}
                    _ => {
                        return Err(KeeperError::invariant(format!(
                            "result {kpid} must be unresolved and undecided"
                        ))
                        .into())
                    }
                }
                self.keeper.set_decider(kpid, Some(vat_id))?;
                if self.keeper.vat_options(vat_id)?.enable_pipelining {
                    self.keeper.requeue_kernel_promise(kpid)?;
                }
                Some(self.keeper.map_kernel_slot_to_vat_slot(vat_id, kpid, true)?)
            }
            None => None,
        };

        let delivery = VatDelivery::Message {
            target: vat_target,
            msg: Message::new(msg.method.clone(), args, result),
        };
        let report = self.deliver(vat_id, &delivery)?;
        Ok(delivery_crank_results(vat_id, report, true))
    }
}
