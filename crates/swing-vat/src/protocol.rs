//! Deliveries into a vat and syscalls out of it
//!
//! Every ref in these types is vat-local. The kernel translates through
//! the vat's c-list before building a delivery and after receiving a
//! syscall.

use serde::{Deserialize, Serialize};

use crate::capdata::{CapData, Message, Resolution};
use crate::slot::VatSlot;

/// Vat-side capability data.
pub type VatCapData = CapData<VatSlot>;
/// Vat-side message.
pub type VatMessage = Message<VatSlot>;
/// Vat-side promise settlement.
pub type VatResolution = Resolution<VatSlot>;

/// One unit of work handed to a vat worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatDelivery {
    /// Invoke a method on one of the vat's exports (or a promise it decides).
    Message {
        /// Receiver.
        target: VatSlot,
        /// The invocation.
        msg: VatMessage,
    },
    /// Promises the vat subscribed to have settled.
    Notify {
        /// Settlements, in resolution order.
        resolutions: Vec<VatResolution>,
    },
    /// The kernel no longer holds these exports reachably.
    DropExports {
        /// Exported object refs.
        vrefs: Vec<VatSlot>,
    },
    /// The kernel has forgotten these exports entirely.
    RetireExports {
        /// Exported object refs.
        vrefs: Vec<VatSlot>,
    },
    /// These imports were retired by their exporter.
    RetireImports {
        /// Imported object refs.
        vrefs: Vec<VatSlot>,
    },
    /// Start (or restart after upgrade) the vat with its parameters.
    StartVat {
        /// Creation or upgrade parameters.
        vat_parameters: VatCapData,
    },
    /// Collect garbage and report drops.
    BringOutYourDead,
}

impl VatDelivery {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            VatDelivery::Message { .. } => "message",
            VatDelivery::Notify { .. } => "notify",
            VatDelivery::DropExports { .. } => "dropExports",
            VatDelivery::RetireExports { .. } => "retireExports",
            VatDelivery::RetireImports { .. } => "retireImports",
            VatDelivery::StartVat { .. } => "startVat",
            VatDelivery::BringOutYourDead => "bringOutYourDead",
        }
    }
}

/// A request from a vat to the kernel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatSyscall {
    /// Send a message. If `msg.result` is set the vat must decide it.
    Send {
        /// Receiver.
        target: VatSlot,
        /// The invocation.
        msg: VatMessage,
    },
    /// Ask to be notified when a promise settles.
    Subscribe {
        /// Promise of interest.
        promise: VatSlot,
    },
    /// Settle promises this vat decides.
    Resolve {
        /// Settlements.
        resolutions: Vec<VatResolution>,
    },
    /// Ask to be terminated.
    Exit {
        /// `true` if the vat is exiting with an error.
        failure: bool,
        /// Completion value or failure reason.
        info: VatCapData,
    },
    /// Stop holding imports reachably.
    DropImports {
        /// Imported object refs.
        vrefs: Vec<VatSlot>,
    },
    /// Forget previously dropped imports.
    RetireImports {
        /// Imported object refs.
        vrefs: Vec<VatSlot>,
    },
    /// Forget exports the kernel has already dropped.
    RetireExports {
        /// Exported object refs.
        vrefs: Vec<VatSlot>,
    },
    /// Give up exports; the kernel keeps them as orphans.
    AbandonExports {
        /// Exported object refs.
        vrefs: Vec<VatSlot>,
    },
    /// Invoke a device synchronously.
    CallNow {
        /// Device ref (`d-N`).
        target: VatSlot,
        /// Method name.
        method: String,
        /// Arguments.
        args: VatCapData,
    },
    /// Read from the vat's durable store.
    VatstoreGet {
        /// Key.
        key: String,
    },
    /// Write to the vat's durable store.
    VatstoreSet {
        /// Key.
        key: String,
        /// Value.
        value: String,
    },
    /// Delete from the vat's durable store.
    VatstoreDelete {
        /// Key.
        key: String,
    },
    /// First vatstore key strictly after `prior_key`.
    VatstoreGetNextKey {
        /// Cursor.
        prior_key: String,
    },
}

impl VatSyscall {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            VatSyscall::Send { .. } => "send",
            VatSyscall::Subscribe { .. } => "subscribe",
            VatSyscall::Resolve { .. } => "resolve",
            VatSyscall::Exit { .. } => "exit",
            VatSyscall::DropImports { .. } => "dropImports",
            VatSyscall::RetireImports { .. } => "retireImports",
            VatSyscall::RetireExports { .. } => "retireExports",
            VatSyscall::AbandonExports { .. } => "abandonExports",
            VatSyscall::CallNow { .. } => "callNow",
            VatSyscall::VatstoreGet { .. } => "vatstoreGet",
            VatSyscall::VatstoreSet { .. } => "vatstoreSet",
            VatSyscall::VatstoreDelete { .. } => "vatstoreDelete",
            VatSyscall::VatstoreGetNextKey { .. } => "vatstoreGetNextKey",
        }
    }
}

/// Successful syscall payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum SyscallValue {
    /// Nothing to return.
    None,
    /// A vatstore read.
    Text(Option<String>),
    /// A device call result.
    Data(VatCapData),
}

/// Outcome of a syscall as seen by the vat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "camelCase")]
pub enum VatSyscallResult {
    /// The syscall succeeded.
    Ok(SyscallValue),
    /// The syscall was rejected. The crank will be aborted.
    Error(String),
}

impl VatSyscallResult {
    /// Success with no value.
    pub fn ok() -> Self {
        VatSyscallResult::Ok(SyscallValue::None)
    }

    /// Check whether the syscall failed.
    pub fn is_error(&self) -> bool {
        matches!(self, VatSyscallResult::Error(_))
    }

    /// Text payload of a successful vatstore read.
    pub fn text(&self) -> Option<&str> {
        match self {
            VatSyscallResult::Ok(SyscallValue::Text(t)) => t.as_deref(),
            _ => None,
        }
    }
}

/// How a delivery ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "camelCase")]
pub enum DeliveryStatus {
    /// The crank completed.
    Ok,
    /// The crank failed: the vat threw, crashed or timed out.
    Error(String),
}

/// What a worker reports back after a delivery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    /// Success or failure.
    pub status: DeliveryStatus,
    /// Metered compute used, when the worker meters.
    pub computrons: Option<u64>,
}

impl DeliveryResult {
    /// Successful delivery.
    pub fn ok() -> Self {
        Self {
            status: DeliveryStatus::Ok,
            computrons: None,
        }
    }

    /// Successful delivery with a compute measurement.
    pub fn ok_metered(computrons: u64) -> Self {
        Self {
            status: DeliveryStatus::Ok,
            computrons: Some(computrons),
        }
    }

    /// Failed delivery.
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Error(reason.into()),
            computrons: None,
        }
    }

    /// Check whether the delivery succeeded.
    pub fn is_ok(&self) -> bool {
        self.status == DeliveryStatus::Ok
    }
}
