//! Host operations
//!
//! Everything the host does to the kernel between cranks. Each
//! operation runs in its own crank: on error its writes are rolled back,
//! on success they are hashed into the activity hash.

use swing_kernel_core::{KernelCapData, KernelResolution, KernelSlot, PromiseState, RunQueueEvent, VatOptions};
use swing_store::BundleId;
use swing_vat::{CapData, Message, VatId, WorkerFactory};
use tracing::{info, warn};

use super::Kernel;
use crate::error::KernelError;

impl<F: WorkerFactory> Kernel<F> {
    fn host_op<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T, KernelError>) -> Result<T, KernelError> {
        self.check_panic()?;
        self.require_initialized()?;
        self.keeper.start_crank()?;
        self.keeper.establish_savepoint("host")?;
        match op(self) {
            Ok(value) => {
                self.keeper.process_refcounts()?;
                self.keeper.store_mut().emit_crank_hashes()?;
                self.keeper.end_crank()?;
                Ok(value)
            }
            Err(e) => {
                self.keeper.rollback_to("host")?;
                self.keeper.end_crank()?;
                if e.is_fatal() {
                    return Err(self.enter_panic(e));
                }
                Err(e)
            }
        }
    }

    /// Check that the host may name `kref` in a message.
    fn require_usable(&self, kref: KernelSlot) -> Result<(), KernelError> {
        let usable = match kref {
            KernelSlot::Object(_) => self.keeper.kernel_object_exists(kref)?,
            KernelSlot::Promise(_) => self.keeper.has_kernel_promise(kref)?,
            KernelSlot::Device(_) => self.keeper.device_name(kref)?.is_some(),
        };
        if usable {
            Ok(())
        } else {
            Err(KernelError::BadKref {
                kref,
                detail: "not in the kernel tables",
            })
        }
    }

    // ========================================================================
    // Messages
    // ========================================================================

    /// Queue `target~.method(args)`.
    ///
    /// # Returns
    /// The result promise, pinned until
    /// [`take_resolution`](Self::take_resolution).
    pub fn queue_to_kref(
        &mut self,
        target: KernelSlot,
        method: &str,
        args: KernelCapData,
    ) -> Result<KernelSlot, KernelError> {
        self.host_op(|kernel| {
            kernel.check_host_send(target, &args)?;
            let result = kernel.keeper.add_kernel_promise(None)?;
            kernel.keeper.pin(result)?;
            kernel.keeper.enqueue(&RunQueueEvent::Send {
                target,
                msg: Message::new(method, args, Some(result)),
            })?;
            Ok(result)
        })
    }

    /// Queue `target~.method(args)` without a result promise.
    pub fn send_only(&mut self, target: KernelSlot, method: &str, args: KernelCapData) -> Result<(), KernelError> {
        self.host_op(|kernel| {
            kernel.check_host_send(target, &args)?;
            kernel.keeper.enqueue(&RunQueueEvent::Send {
                target,
                msg: Message::new(method, args, None),
            })?;
            Ok(())
        })
    }

    /// Release a hold taken for the host or a device. Unpinning a kref
    /// that is not pinned does nothing.
    pub fn unpin(&mut self, kref: KernelSlot) -> Result<(), KernelError> {
        self.host_op(|kernel| {
            kernel.keeper.unpin(kref)?;
            Ok(())
        })
    }

    fn check_host_send(&self, target: KernelSlot, args: &KernelCapData) -> Result<(), KernelError> {
        if target.is_device() {
            return Err(KernelError::BadKref {
                kref: target,
                detail: "devices cannot receive messages",
            });
        }
        self.require_usable(target)?;
        for slot in &args.slots {
            self.require_usable(*slot)?;
        }
        Ok(())
    }

    /// Queue a message to a vat's root object.
    pub fn queue_to_vat_root(
        &mut self,
        vat_name: &str,
        method: &str,
        args: KernelCapData,
    ) -> Result<KernelSlot, KernelError> {
        let vat_id = self.vat_id(vat_name)?;
        let root = self.vat_root(vat_id)?;
        self.queue_to_kref(root, method, args)
    }

    /// Read a settled host promise and release the host's hold on it.
    pub fn take_resolution(&mut self, kpid: KernelSlot) -> Result<KernelResolution, KernelError> {
        self.host_op(|kernel| {
            kernel.require_usable(kpid)?;
            let (rejected, data) = match kernel.keeper.get_kernel_promise(kpid)?.state {
                PromiseState::Fulfilled(data) => (false, data),
                PromiseState::Rejected(data) => (true, data),
                PromiseState::Unresolved { .. } => {
                    return Err(KernelError::BadKref {
                        kref: kpid,
                        detail: "promise is still pending",
                    })
                }
            };
            kernel.keeper.unpin(kpid)?;
            Ok(KernelResolution {
                promise: kpid,
                rejected,
                data,
            })
        })
    }

    // ========================================================================
    // Vats
    // ========================================================================

    /// Store a code bundle and return its content address.
    pub fn install_bundle(&mut self, bytes: &[u8]) -> Result<BundleId, KernelError> {
        self.host_op(|kernel| Ok(kernel.keeper.store_mut().add_bundle(bytes)?))
    }

    /// Create a vat at runtime. It starts when its `create-vat` event
    /// reaches the head of the run-queue.
    pub fn create_vat(
        &mut self,
        bundle_id: &BundleId,
        options: VatOptions,
        vat_parameters: KernelCapData,
    ) -> Result<VatId, KernelError> {
        self.host_op(|kernel| {
            if !kernel.keeper.store().has_bundle(bundle_id)? {
                return Err(KernelError::UnknownBundle(bundle_id.to_string()));
            }
            if kernel.keeper.vat_id_for_name(&options.name)?.is_some() {
                return Err(KernelError::VatNameTaken(options.name));
            }
            for slot in &vat_parameters.slots {
                kernel.require_usable(*slot)?;
            }
            let options = VatOptions {
                dynamic: true,
                ..options
            };
            let vat_id = kernel.keeper.create_vat_state(&options, bundle_id)?;
            kernel.export_root(vat_id)?;
            kernel.keeper.enqueue(&RunQueueEvent::CreateVat {
                vat_id,
                vat_parameters,
            })?;
            info!(vat_id = %vat_id, name = %options.name, bundle = %bundle_id, "queued dynamic vat");
            Ok(vat_id)
        })
    }

    /// Ask for a vat to be upgraded to new code. The outcome is
    /// available from [`upgrade_status`](Self::upgrade_status) once the
    /// request has been processed.
    pub fn upgrade_vat(
        &mut self,
        vat_id: VatId,
        bundle_id: &BundleId,
        vat_parameters: KernelCapData,
        upgrade_message: &str,
    ) -> Result<u64, KernelError> {
        self.host_op(|kernel| {
            kernel.require_alive(vat_id)?;
            if !kernel.keeper.store().has_bundle(bundle_id)? {
                return Err(KernelError::UnknownBundle(bundle_id.to_string()));
            }
            for slot in &vat_parameters.slots {
                kernel.require_usable(*slot)?;
            }
            let upgrade_id = kernel.keeper.add_upgrade(vat_id)?;
            kernel.keeper.enqueue(&RunQueueEvent::UpgradeVat {
                vat_id,
                upgrade_id,
                bundle_id: bundle_id.clone(),
                vat_parameters,
                upgrade_message: upgrade_message.to_string(),
            })?;
            info!(vat_id = %vat_id, upgrade_id, bundle = %bundle_id, "queued upgrade");
            Ok(upgrade_id)
        })
    }

    /// Queue termination of a vat. Promises it decides will be rejected
    /// with "vat terminated"; `reason` is logged.
    pub fn terminate_vat(&mut self, vat_id: VatId, reason: &str) -> Result<(), KernelError> {
        self.host_op(|kernel| {
            kernel.require_alive(vat_id)?;
            kernel.keeper.enqueue(&RunQueueEvent::TerminateVat {
                vat_id,
                reason: CapData::error(reason),
            })?;
            warn!(vat_id = %vat_id, reason, "queued termination");
            Ok(())
        })
    }

    fn require_alive(&self, vat_id: VatId) -> Result<(), KernelError> {
        if self.keeper.vat_options(vat_id).is_err() {
            return Err(KernelError::UnknownVat(vat_id.to_string()));
        }
        if !self.keeper.is_vat_alive(vat_id)? {
            return Err(KernelError::VatTerminated(vat_id));
        }
        Ok(())
    }
}
