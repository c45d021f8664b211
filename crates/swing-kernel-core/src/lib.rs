//! Swing Kernel Core - Kernel Tables
//!
//! The state half of the kernel, with no workers and no scheduling:
//!
//! - `types` - Kernel refs, promise states, run-queue events, GC actions
//! - `keeper` - [`KernelKeeper`]: typed tables over a [`swing_store::SwingStore`]
//!   (objects, promises, c-lists, run-queue, GC, vat records)
//! - `invariants` - Recomputes refcounts and reports inconsistencies
//!
//! # Reference counting
//!
//! ```text
//!          vat A c-list            kernel tables            vat B c-list
//!     ┌──────────────────┐     ┌──────────────────┐     ┌──────────────────┐
//!     │ o+4  ◀──────────▶│ ko7 │ owner = A        │ ko7 │◀──────────▶ o-2  │
//!     │ (export: no rc)  │     │ refCount = r,c   │     │ (import: c+1,    │
//!     │                  │     │                  │     │  r+1 while R)    │
//!     │ p+1  ◀──────────▶│ kp3 │ decider = A      │ kp3 │◀──────────▶ p-5  │
//!     │ (+1)             │     │ refCount = n     │     │ (+1)             │
//!     └──────────────────┘     └────────▲─────────┘     └──────────────────┘
//!                                       │
//!                   run-queue events, promise queues,
//!                   settlement data and pins also hold refs
//! ```
//!
//! Counts are integers in the store. Nothing relies on host garbage
//! collection; an object leaves the table only through the
//! drop/retire handshake computed by [`KernelKeeper::process_refcounts`].

pub mod error;
pub mod invariants;
pub mod keeper;
pub mod types;

pub use error::KeeperError;
pub use invariants::{check_all_invariants, InvariantViolation};
pub use keeper::{ClistEntry, KernelKeeper, RefKind, Settlement, UpgradeOutcome};
pub use types::{
    GcAction, GcActionType, KernelCapData, KernelMessage, KernelPromise, KernelResolution,
    KernelSlot, ObjectRefCount, PromiseState, RunQueueEvent, VatLifecycle, VatOptions,
};
