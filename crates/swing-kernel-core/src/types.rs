//! Core kernel types
//!
//! Kernel refs (krefs) are arena indices rendered `ko<N>` (objects),
//! `kp<N>` (promises) and `kd<N>` (devices). They never cross into a vat.

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use swing_store::BundleId;
use swing_vat::{CapData, Message, Resolution, VatId};

/// A kernel-wide reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum KernelSlot {
    /// `ko<N>`
    Object(u64),
    /// `kp<N>`
    Promise(u64),
    /// `kd<N>`
    Device(u64),
}

impl KernelSlot {
    /// Check whether this is an object ref.
    pub fn is_object(&self) -> bool {
        matches!(self, KernelSlot::Object(_))
    }

    /// Check whether this is a promise ref.
    pub fn is_promise(&self) -> bool {
        matches!(self, KernelSlot::Promise(_))
    }

    /// Check whether this is a device ref.
    pub fn is_device(&self) -> bool {
        matches!(self, KernelSlot::Device(_))
    }
}

impl fmt::Display for KernelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelSlot::Object(n) => write!(f, "ko{n}"),
            KernelSlot::Promise(n) => write!(f, "kp{n}"),
            KernelSlot::Device(n) => write!(f, "kd{n}"),
        }
    }
}

impl FromStr for KernelSlot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || format!("invalid kref {s:?}");
        let (ctor, digits): (fn(u64) -> KernelSlot, &str) = if let Some(d) = s.strip_prefix("ko") {
            (KernelSlot::Object, d)
        } else if let Some(d) = s.strip_prefix("kp") {
            (KernelSlot::Promise, d)
        } else if let Some(d) = s.strip_prefix("kd") {
            (KernelSlot::Device, d)
        } else {
            return Err(bad());
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        digits.parse().map(ctor).map_err(|_| bad())
    }
}

impl TryFrom<String> for KernelSlot {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<KernelSlot> for String {
    fn from(slot: KernelSlot) -> Self {
        slot.to_string()
    }
}

/// Kernel-side capability data.
pub type KernelCapData = CapData<KernelSlot>;
/// Kernel-side message.
pub type KernelMessage = Message<KernelSlot>;
/// Kernel-side promise settlement.
pub type KernelResolution = Resolution<KernelSlot>;

/// Reference count of a kernel object.
///
/// `reachable` counts holders that can invoke the object; `recognizable`
/// counts holders that can merely compare it (a superset).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObjectRefCount {
    /// Reachable holders.
    pub reachable: u64,
    /// Recognizing holders.
    pub recognizable: u64,
}

impl fmt::Display for ObjectRefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.reachable, self.recognizable)
    }
}

impl FromStr for ObjectRefCount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (r, c) = s
            .split_once(',')
            .ok_or_else(|| format!("invalid refcount {s:?}"))?;
        Ok(Self {
            reachable: r.parse().map_err(|_| format!("invalid refcount {s:?}"))?,
            recognizable: c.parse().map_err(|_| format!("invalid refcount {s:?}"))?,
        })
    }
}

/// Settlement state of a kernel promise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromiseState {
    /// Not yet settled.
    Unresolved {
        /// Vat allowed to resolve it; `None` while the run-queue holds that
        /// authority (or the kernel itself does).
        decider: Option<VatId>,
        /// Vats to notify on settlement.
        subscribers: BTreeSet<VatId>,
        /// Messages waiting for settlement.
        queue: Vec<KernelMessage>,
    },
    /// Settled with a value.
    Fulfilled(KernelCapData),
    /// Settled with a reason.
    Rejected(KernelCapData),
}

impl PromiseState {
    /// Check whether the promise is settled.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, PromiseState::Unresolved { .. })
    }

    /// Settlement data, if settled.
    pub fn data(&self) -> Option<&KernelCapData> {
        match self {
            PromiseState::Unresolved { .. } => None,
            PromiseState::Fulfilled(data) | PromiseState::Rejected(data) => Some(data),
        }
    }

    /// Storage tag: `unresolved`, `fulfilled` or `rejected`.
    pub fn tag(&self) -> &'static str {
        match self {
            PromiseState::Unresolved { .. } => "unresolved",
            PromiseState::Fulfilled(_) => "fulfilled",
            PromiseState::Rejected(_) => "rejected",
        }
    }
}

/// A kernel promise as read from the tables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelPromise {
    /// Holders: c-list entries, queued events, settlement data and pins.
    pub ref_count: u64,
    /// Current state.
    pub state: PromiseState,
}

/// Lifecycle of a vat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VatLifecycle {
    /// Created; `startVat` not yet delivered successfully.
    Starting,
    /// Running its current incarnation.
    Active,
    /// Being moved to a new incarnation.
    Upgrading,
    /// Gone; deliveries fail fast.
    Terminated,
}

impl VatLifecycle {
    /// Storage tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            VatLifecycle::Starting => "starting",
            VatLifecycle::Active => "active",
            VatLifecycle::Upgrading => "upgrading",
            VatLifecycle::Terminated => "terminated",
        }
    }
}

impl FromStr for VatLifecycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(VatLifecycle::Starting),
            "active" => Ok(VatLifecycle::Active),
            "upgrading" => Ok(VatLifecycle::Upgrading),
            "terminated" => Ok(VatLifecycle::Terminated),
            _ => Err(format!("invalid vat lifecycle {s:?}")),
        }
    }
}

/// Creation options recorded per vat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VatOptions {
    /// Human-readable name.
    pub name: String,
    /// Terminating a critical vat panics the kernel.
    #[serde(default)]
    pub critical: bool,
    /// Deliver messages aimed at promises this vat decides.
    #[serde(default)]
    pub enable_pipelining: bool,
    /// Deliveries between `bringOutYourDead`; `None` uses the kernel default.
    #[serde(default)]
    pub reap_interval: Option<u64>,
    /// Created at runtime rather than from the initial configuration.
    #[serde(default)]
    pub dynamic: bool,
}

impl VatOptions {
    /// Options with defaults for the given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            critical: false,
            enable_pipelining: false,
            reap_interval: None,
            dynamic: false,
        }
    }
}

/// Kind of garbage-collection action owed to a vat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GcActionType {
    /// Tell the exporter the kernel dropped its object.
    DropExport,
    /// Tell the exporter the kernel forgot its object.
    RetireExport,
    /// Tell an importer the object is gone.
    RetireImport,
}

impl GcActionType {
    /// Storage tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            GcActionType::DropExport => "dropExport",
            GcActionType::RetireExport => "retireExport",
            GcActionType::RetireImport => "retireImport",
        }
    }
}

impl FromStr for GcActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dropExport" => Ok(GcActionType::DropExport),
            "retireExport" => Ok(GcActionType::RetireExport),
            "retireImport" => Ok(GcActionType::RetireImport),
            _ => Err(format!("invalid GC action type {s:?}")),
        }
    }
}

/// One pending GC action. Orders by vat, then type, then kref.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GcAction {
    /// Vat the action is for.
    pub vat_id: VatId,
    /// What to tell it.
    pub action_type: GcActionType,
    /// Object concerned.
    pub kref: KernelSlot,
}

impl fmt::Display for GcAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.vat_id, self.action_type.as_str(), self.kref)
    }
}

impl FromStr for GcAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(' ');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(v), Some(t), Some(k), None) => Ok(GcAction {
                vat_id: v.parse()?,
                action_type: t.parse()?,
                kref: k.parse()?,
            }),
            _ => Err(format!("invalid GC action {s:?}")),
        }
    }
}

/// An item on the run-queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunQueueEvent {
    /// Deliver a message to an object or promise.
    Send {
        /// Receiver.
        target: KernelSlot,
        /// Invocation.
        msg: KernelMessage,
    },
    /// Tell a vat that promises it subscribed to have settled.
    Notify {
        /// Subscriber.
        vat_id: VatId,
        /// Settled promises, in settlement order.
        kpids: Vec<KernelSlot>,
    },
    /// Start a vat created at runtime.
    CreateVat {
        /// New vat.
        vat_id: VatId,
        /// Parameters for `startVat`.
        vat_parameters: KernelCapData,
    },
    /// Deliver `startVat` to a vat from the initial configuration.
    StartVat {
        /// Vat to start.
        vat_id: VatId,
        /// Parameters for `startVat`.
        vat_parameters: KernelCapData,
    },
    /// Move a vat to a new incarnation.
    UpgradeVat {
        /// Vat to upgrade.
        vat_id: VatId,
        /// Request handle for status queries.
        upgrade_id: u64,
        /// New code.
        bundle_id: BundleId,
        /// Parameters for the new incarnation's `startVat`.
        vat_parameters: KernelCapData,
        /// Free-form reason handed to promise holders.
        upgrade_message: String,
    },
    /// Terminate a vat on the host's request.
    TerminateVat {
        /// Vat to terminate.
        vat_id: VatId,
        /// Reason given to promise holders.
        reason: KernelCapData,
    },
    /// Ask a vat to collect garbage.
    BringOutYourDead {
        /// Vat to reap.
        vat_id: VatId,
    },
    /// GC delivery: exports dropped by the kernel.
    DropExports {
        /// Exporter.
        vat_id: VatId,
        /// Objects.
        krefs: Vec<KernelSlot>,
    },
    /// GC delivery: exports retired by the kernel.
    RetireExports {
        /// Exporter.
        vat_id: VatId,
        /// Objects.
        krefs: Vec<KernelSlot>,
    },
    /// GC delivery: imports retired by their exporter.
    RetireImports {
        /// Importer.
        vat_id: VatId,
        /// Objects.
        krefs: Vec<KernelSlot>,
    },
}

impl RunQueueEvent {
    /// Short name used in logs and policy input.
    pub fn kind(&self) -> &'static str {
        match self {
            RunQueueEvent::Send { .. } => "send",
            RunQueueEvent::Notify { .. } => "notify",
            RunQueueEvent::CreateVat { .. } => "create-vat",
            RunQueueEvent::StartVat { .. } => "startVat",
            RunQueueEvent::UpgradeVat { .. } => "upgrade-vat",
            RunQueueEvent::TerminateVat { .. } => "terminate-vat",
            RunQueueEvent::BringOutYourDead { .. } => "bringOutYourDead",
            RunQueueEvent::DropExports { .. } => "dropExports",
            RunQueueEvent::RetireExports { .. } => "retireExports",
            RunQueueEvent::RetireImports { .. } => "retireImports",
        }
    }

    /// Krefs whose refcounts this event holds while queued.
    pub fn held_refs(&self) -> Vec<KernelSlot> {
        match self {
            RunQueueEvent::Send { target, msg } => {
                std::iter::once(*target).chain(msg.slots().copied()).collect()
            }
            RunQueueEvent::Notify { kpids, .. } => kpids.clone(),
            RunQueueEvent::CreateVat { vat_parameters, .. }
            | RunQueueEvent::StartVat { vat_parameters, .. }
            | RunQueueEvent::UpgradeVat { vat_parameters, .. } => vat_parameters
                .slots
                .iter()
                .copied()
                .filter(|s| !s.is_device())
                .collect(),
            RunQueueEvent::TerminateVat { reason, .. } => reason.slots.clone(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swing_vat::CapData;

    #[test]
    fn test_kref_forms() {
        for text in ["ko1", "kp22", "kd3"] {
            assert_eq!(text.parse::<KernelSlot>().unwrap().to_string(), text);
        }
        for text in ["k1", "ko", "kx1", "ko1a", "o+1"] {
            assert!(text.parse::<KernelSlot>().is_err());
        }
    }

    #[test]
    fn test_gc_action_ordering_is_vat_then_type() {
        let a: GcAction = "v2 dropExport ko9".parse().unwrap();
        let b: GcAction = "v2 retireImport ko1".parse().unwrap();
        let c: GcAction = "v1 retireImport ko5".parse().unwrap();
        let mut all = vec![a, b, c];
        all.sort();
        assert_eq!(all, vec![c, a, b]);
        assert_eq!(a.to_string(), "v2 dropExport ko9");
    }

    #[test]
    fn test_held_refs_of_send() {
        let msg = Message::new(
            "go",
            CapData::new("[]", vec![KernelSlot::Object(4)]),
            Some(KernelSlot::Promise(7)),
        );
        let ev = RunQueueEvent::Send {
            target: KernelSlot::Object(1),
            msg,
        };
        assert_eq!(
            ev.held_refs(),
            vec![
                KernelSlot::Object(1),
                KernelSlot::Object(4),
                KernelSlot::Promise(7)
            ]
        );
    }

    #[test]
    fn test_refcount_text_form() {
        let rc: ObjectRefCount = "2,3".parse().unwrap();
        assert_eq!(rc, ObjectRefCount { reachable: 2, recognizable: 3 });
        assert_eq!(rc.to_string(), "2,3");
        assert!("2".parse::<ObjectRefCount>().is_err());
    }
}
