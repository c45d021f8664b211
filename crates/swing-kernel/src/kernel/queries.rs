//! Read-only views of kernel state

use std::io::Write;

use swing_kernel_core::{
    check_all_invariants, ClistEntry, InvariantViolation, KernelCapData, KernelKeeper, KernelSlot,
    PromiseState, UpgradeOutcome, VatLifecycle,
};
use swing_store::SwingStore;
use swing_vat::{VatId, VatSlot, WorkerFactory};

use super::Kernel;
use crate::error::KernelError;
use crate::transcript::export_transcript;

/// State of a kernel promise as seen by the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromiseStatus {
    /// Not settled yet.
    Pending {
        /// Vat that may settle it, if any.
        decider: Option<VatId>,
    },
    /// Fulfilled with this data.
    Fulfilled(KernelCapData),
    /// Rejected with this reason.
    Rejected(KernelCapData),
}

impl<F: WorkerFactory> Kernel<F> {
    /// Current state of a promise.
    pub fn kp_status(&self, kpid: KernelSlot) -> Result<PromiseStatus, KernelError> {
        if !kpid.is_promise() || !self.keeper.has_kernel_promise(kpid)? {
            return Err(KernelError::BadKref {
                kref: kpid,
                detail: "no such promise",
            });
        }
        Ok(match self.keeper.get_kernel_promise(kpid)?.state {
            PromiseState::Unresolved { decider, .. } => PromiseStatus::Pending { decider },
            PromiseState::Fulfilled(data) => PromiseStatus::Fulfilled(data),
            PromiseState::Rejected(data) => PromiseStatus::Rejected(data),
        })
    }

    /// Vat registered under `name`.
    pub fn vat_id(&self, name: &str) -> Result<VatId, KernelError> {
        self.keeper
            .vat_id_for_name(name)?
            .ok_or_else(|| KernelError::UnknownVat(name.to_string()))
    }

    /// Live vats in creation order.
    pub fn vat_ids(&self) -> Result<Vec<VatId>, KernelError> {
        Ok(self.keeper.vat_ids()?)
    }

    /// Kref of a vat's root object.
    pub fn vat_root(&self, vat_id: VatId) -> Result<KernelSlot, KernelError> {
        self.keeper
            .vat_to_kernel_existing(vat_id, VatSlot::ROOT)?
            .ok_or_else(|| KernelError::UnknownVat(vat_id.to_string()))
    }

    /// Lifecycle state of a vat, including terminated ones.
    pub fn lifecycle(&self, vat_id: VatId) -> Result<VatLifecycle, KernelError> {
        Ok(self.keeper.lifecycle(vat_id)?)
    }

    /// Incarnation number of a live vat.
    pub fn incarnation(&self, vat_id: VatId) -> Result<u64, KernelError> {
        Ok(self.keeper.incarnation(vat_id)?)
    }

    /// Every c-list entry of a vat.
    pub fn clist(&self, vat_id: VatId) -> Result<Vec<ClistEntry>, KernelError> {
        Ok(self.keeper.clist_entries(vat_id)?)
    }

    /// Outcome of an upgrade request.
    pub fn upgrade_status(&self, upgrade_id: u64) -> Result<Option<UpgradeOutcome>, KernelError> {
        Ok(self.keeper.upgrade_outcome(upgrade_id)?)
    }

    /// Events waiting on the run-queue.
    pub fn run_queue_length(&self) -> Result<u64, KernelError> {
        Ok(self.keeper.run_queue_length()?)
    }

    /// Cranks completed so far.
    pub fn crank_number(&self) -> Result<u64, KernelError> {
        Ok(self.keeper.crank_number()?)
    }

    /// Chained hash over every crank's consensus writes.
    pub fn activity_hash(&self) -> Result<String, KernelError> {
        Ok(self.keeper.store().activity_hash()?)
    }

    /// Recompute every refcount and report mismatches.
    pub fn check_invariants(&self) -> Result<Vec<InvariantViolation>, KernelError> {
        Ok(check_all_invariants(&self.keeper)?)
    }

    /// Write a vat's current incarnation as an NDJSON transcript.
    pub fn export_transcript(&self, vat_id: VatId, out: &mut dyn Write) -> Result<u64, KernelError> {
        export_transcript(&self.keeper, vat_id, out)
    }

    /// The kernel tables.
    pub fn keeper(&self) -> &KernelKeeper {
        &self.keeper
    }

    /// The store, for reading host state.
    pub fn store(&self) -> &SwingStore {
        self.keeper.store()
    }

    /// The store, for host-owned `host.*` keys and commits outside the
    /// kernel's control.
    pub fn store_mut(&mut self) -> &mut SwingStore {
        self.keeper.store_mut()
    }
}
