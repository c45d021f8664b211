//! Error types for the kernel runtime
//!
//! Two layers:
//!
//! - [`SyscallError`] is the vat's fault. It fails the crank, the crank is
//!   rolled back and the vat is terminated; the kernel carries on.
//! - [`KernelError`] is the kernel's fault (or the host's). Anything that
//!   means the kernel state can no longer be trusted puts the kernel into
//!   a sticky panicked state.

use swing_kernel_core::{KeeperError, KernelSlot};
use swing_store::StoreError;
use swing_vat::{VatId, VatSlot, WorkerError};
use thiserror::Error;

/// Errors returned by kernel operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    /// Kernel table failure.
    #[error(transparent)]
    Keeper(#[from] KeeperError),

    /// Store failure outside the kernel tables.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A worker could not be started.
    #[error("worker for {vat_id}: {source}")]
    Worker {
        /// Vat being brought online.
        vat_id: VatId,
        /// Why the worker could not start.
        #[source]
        source: WorkerError,
    },

    /// The kernel panicked earlier and refuses further work.
    #[error("kernel panic: {0}")]
    Panicked(String),

    /// Replay of a transcript produced a different syscall than the one
    /// recorded.
    #[error("anachrophobia in {vat_id} at transcript position {position}: {detail}")]
    Anachrophobia {
        /// Vat being replayed.
        vat_id: VatId,
        /// Transcript position of the divergent delivery.
        position: u64,
        /// What differed.
        detail: String,
    },

    /// `initialize` was not called (or the store holds no kernel).
    #[error("kernel state not initialized")]
    NotInitialized,

    /// The store already holds a kernel.
    #[error("kernel state already initialized")]
    AlreadyInitialized,

    /// No vat with this name or ID.
    #[error("unknown vat {0}")]
    UnknownVat(String),

    /// Another vat already has this name.
    #[error("vat name {0:?} is taken")]
    VatNameTaken(String),

    /// A vat exists but has been terminated.
    #[error("{0} has been terminated")]
    VatTerminated(VatId),

    /// A bundle named by the host or configuration is not installed.
    #[error("unknown bundle {0}")]
    UnknownBundle(String),

    /// A device name was not registered with the kernel.
    #[error("unknown device {0:?}")]
    UnknownDevice(String),

    /// A kref handed in by the host does not name a live object or promise.
    #[error("unusable kref {kref}: {detail}")]
    BadKref {
        /// The kref.
        kref: KernelSlot,
        /// Why it cannot be used.
        detail: &'static str,
    },

    /// Configuration could not be read or is inconsistent.
    #[error("configuration: {0}")]
    Config(String),

    /// Transcript file I/O.
    #[error("transcript I/O: {0}")]
    Io(#[from] std::io::Error),

    /// A structured value could not be encoded or decoded.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KernelError {
    /// Create a configuration error.
    pub fn config(detail: impl Into<String>) -> Self {
        KernelError::Config(detail.into())
    }

    /// Check whether this error must put the kernel into the panicked
    /// state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KernelError::Keeper(_)
                | KernelError::Store(_)
                | KernelError::Panicked(_)
                | KernelError::Anachrophobia { .. }
                | KernelError::Serialization(_)
        )
    }
}

/// A syscall the kernel refused. Fatal to the calling vat.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyscallError {
    /// The vat broke a c-list or promise rule.
    #[error(transparent)]
    Protocol(KeeperError),

    /// A `send` named a result promise the vat may not use.
    #[error("result promise {vref} must be unresolved and decided by the sender")]
    BadResultPromise {
        /// The result vref.
        vref: VatSlot,
    },

    /// A GC syscall named a ref of the wrong direction.
    #[error("{syscall}: {vref} is not an object {expected}")]
    WrongDirection {
        /// Which syscall.
        syscall: &'static str,
        /// Offending vref.
        vref: VatSlot,
        /// `"import"` or `"export"`.
        expected: &'static str,
    },

    /// `retireImports` on an import that is still held reachably.
    #[error("retireImports: {0} is still reachable")]
    ImportStillReachable(VatSlot),

    /// `callNow` on something that is not a device.
    #[error("callNow target {0} is not a device")]
    NotADevice(VatSlot),

    /// `callNow` on a device the host never registered.
    #[error("callNow target {0} has no device behind it")]
    UnknownDevice(KernelSlot),

    /// The device refused the call.
    #[error("device {device}: {reason}")]
    Device {
        /// Device name.
        device: String,
        /// Device error.
        reason: String,
    },

    /// The vat kept issuing syscalls after one was refused.
    #[error("syscall after an illegal syscall")]
    AfterIllegal,

    /// The kernel failed while executing the syscall. Not the vat's fault;
    /// the kernel panics after the delivery returns.
    #[error("kernel fault: {0}")]
    Kernel(String),
}

impl From<KeeperError> for SyscallError {
    fn from(e: KeeperError) -> Self {
        if e.is_protocol_violation() {
            SyscallError::Protocol(e)
        } else {
            SyscallError::Kernel(e.to_string())
        }
    }
}

impl SyscallError {
    /// Check whether the kernel, not the vat, is at fault.
    pub fn is_kernel_fault(&self) -> bool {
        matches!(self, SyscallError::Kernel(_))
    }
}
