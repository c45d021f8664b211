//! Worker traits
//!
//! The kernel drives a vat through a [`VatWorker`]: one blocking
//! `deliver` call per crank, during which the worker may issue any number
//! of syscalls through the supplied [`SyscallHandler`]. Only one call is
//! ever outstanding. A worker backed by a subprocess hides its IPC behind
//! this synchronous contract.

use thiserror::Error;

use crate::protocol::{DeliveryResult, VatDelivery, VatSyscall, VatSyscallResult};
use crate::slot::VatId;

/// Receives syscalls issued by a worker during a delivery.
pub trait SyscallHandler {
    /// Perform (or, during replay, simulate) one syscall.
    fn syscall(&mut self, call: &VatSyscall) -> VatSyscallResult;
}

/// A running vat.
pub trait VatWorker {
    /// Execute one delivery to completion.
    ///
    /// # Arguments
    /// * `delivery` - The delivery, in vat-local refs
    /// * `syscalls` - Channel back to the kernel for the duration of the call
    ///
    /// # Returns
    /// The crank outcome. A worker that crashes or times out reports
    /// [`DeliveryStatus::Error`](crate::DeliveryStatus::Error).
    fn deliver(
        &mut self,
        delivery: &VatDelivery,
        syscalls: &mut dyn SyscallHandler,
    ) -> DeliveryResult;

    /// Serialize the heap, if this worker supports snapshots.
    fn snapshot(&mut self) -> Option<Vec<u8>> {
        None
    }

    /// Release the worker's resources.
    fn shutdown(&mut self) {}
}

/// Starts workers for vats.
pub trait WorkerFactory {
    /// Start a fresh worker from a code bundle, optionally restoring a heap
    /// snapshot taken by an earlier worker of the same bundle.
    fn start_worker(
        &self,
        vat_id: VatId,
        bundle: &[u8],
        snapshot: Option<&[u8]>,
    ) -> Result<Box<dyn VatWorker>, WorkerError>;
}

/// Errors starting a worker.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkerError {
    /// The bundle could not be parsed.
    #[error("invalid bundle: {0}")]
    InvalidBundle(String),

    /// No worker implementation is registered for the bundle.
    #[error("no worker registered for bundle {0:?}")]
    UnknownBundle(String),

    /// A snapshot could not be restored.
    #[error("snapshot restore failed: {0}")]
    SnapshotRestore(String),

    /// The worker process could not be launched.
    #[error("worker launch failed: {0}")]
    Launch(String),
}
