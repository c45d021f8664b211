//! Swing Vat - The Kernel/Vat Boundary
//!
//! Everything that crosses between the kernel and a vat worker:
//!
//! - `slot` - Vat IDs and vat-local references (`o+1`, `p-3`, `d-1`)
//! - `capdata` - Capability data, messages and resolutions, generic over
//!   the slot type so the kernel reuses them with kernel refs
//! - `protocol` - Closed enums of deliveries and syscalls
//! - `worker` - The blocking [`VatWorker`] / [`WorkerFactory`] contract
//! - `local` - In-process workers for hosts and tests
//!
//! ```text
//!        kernel                         vat worker
//!   ┌──────────────┐  VatDelivery  ┌────────────────┐
//!   │              │──────────────▶│                │
//!   │  c-list      │               │   deliver()    │
//!   │  translation │◀──────────────│                │
//!   │              │  VatSyscall   │  (blocking,    │
//!   │              │──────────────▶│   one at a     │
//!   │              │ SyscallResult │   time)        │
//!   │              │◀──────────────│                │
//!   └──────────────┘ DeliveryResult└────────────────┘
//! ```

pub mod capdata;
pub mod local;
pub mod protocol;
pub mod slot;
pub mod worker;

pub use capdata::{slot_marker, CapData, Message, Resolution};
pub use local::{FnWorker, LocalBundle, LocalWorkerFactory};
pub use protocol::{
    DeliveryResult, DeliveryStatus, SyscallValue, VatCapData, VatDelivery, VatMessage,
    VatResolution, VatSyscall, VatSyscallResult,
};
pub use slot::{SlotType, VatId, VatSlot};
pub use worker::{SyscallHandler, VatWorker, WorkerError, WorkerFactory};
