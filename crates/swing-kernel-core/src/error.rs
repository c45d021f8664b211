//! Error types for kernel table operations

use swing_store::StoreError;
use swing_vat::{VatId, VatSlot};
use thiserror::Error;

use crate::types::KernelSlot;

/// Errors raised by the kernel tables.
///
/// Some of these are *protocol violations* by a vat (see
/// [`KeeperError::is_protocol_violation`]); they fail the offending crank
/// and terminate the vat. The rest indicate corrupt or inconsistent
/// kernel state and are fatal to the kernel.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeeperError {
    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A vat presented a vref that is not in its c-list.
    #[error("{vat_id} used unknown vref {vref}")]
    UnknownVref {
        /// Offending vat.
        vat_id: VatId,
        /// The vref.
        vref: VatSlot,
    },

    /// A vat tried to use an import it had already dropped.
    #[error("{vat_id} used unreachable import {vref}")]
    UnreachableImport {
        /// Offending vat.
        vat_id: VatId,
        /// The vref.
        vref: VatSlot,
    },

    /// A vref of the wrong kind for the operation.
    #[error("{vat_id}: {vref} cannot be used here: {detail}")]
    WrongRefType {
        /// Offending vat.
        vat_id: VatId,
        /// The vref.
        vref: VatSlot,
        /// What was expected.
        detail: &'static str,
    },

    /// A vat tried to resolve (or delegate) a promise it does not decide.
    #[error("{vat_id} is not the decider of {kpid} (decider: {decider:?})")]
    NotDecider {
        /// Promise.
        kpid: KernelSlot,
        /// Offending vat.
        vat_id: VatId,
        /// Actual decider.
        decider: Option<VatId>,
    },

    /// A promise was resolved twice.
    #[error("{0} is already resolved")]
    AlreadyResolved(KernelSlot),

    /// Retiring an export the kernel still holds reachably.
    #[error("{vat_id} retired {kref} while it is still reachable")]
    StillReachable {
        /// Offending vat.
        vat_id: VatId,
        /// Object.
        kref: KernelSlot,
    },

    /// Lookup of a kref that does not exist.
    #[error("unknown kref {0}")]
    UnknownKref(KernelSlot),

    /// Lookup of a vat that does not exist.
    #[error("unknown vat {0}")]
    UnknownVat(String),

    /// A vat name was registered twice.
    #[error("vat name {0:?} already in use")]
    DuplicateVatName(String),

    /// A refcount would go below zero.
    #[error("refcount underflow on {0}")]
    RefcountUnderflow(KernelSlot),

    /// Kernel state contradicts itself.
    #[error("kernel invariant violated: {0}")]
    Invariant(String),

    /// A stored value could not be decoded.
    #[error("corrupt value at {key}: {detail}")]
    Corrupt {
        /// Key.
        key: String,
        /// Decode failure.
        detail: String,
    },
}

impl KeeperError {
    /// Create a corrupt-value error.
    pub fn corrupt(key: &str, detail: impl ToString) -> Self {
        KeeperError::Corrupt {
            key: key.to_string(),
            detail: detail.to_string(),
        }
    }

    /// Create an invariant error.
    pub fn invariant(detail: impl Into<String>) -> Self {
        KeeperError::Invariant(detail.into())
    }

    /// Check if this error is a vat's fault rather than the kernel's.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            KeeperError::UnknownVref { .. }
                | KeeperError::UnreachableImport { .. }
                | KeeperError::WrongRefType { .. }
                | KeeperError::NotDecider { .. }
                | KeeperError::AlreadyResolved(_)
                | KeeperError::StillReachable { .. }
        )
    }
}
