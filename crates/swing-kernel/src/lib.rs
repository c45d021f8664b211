//! Swing Kernel - The Swingset Kernel Runtime
//!
//! Runs vats one crank at a time over the tables in `swing-kernel-core`:
//!
//! - `kernel` - [`Kernel`]: crank loop, routing, termination, upgrade,
//!   host operations and queries
//! - `syscall` - Executes a vat's syscalls against the kernel tables
//! - `warehouse` - Keeps workers online; replays transcripts on restart
//! - `transcript` - Transcript entries, replay checking, NDJSON export
//! - `device` - Host code vats call synchronously
//! - `policy` - When to stop running
//! - `config` - [`KernelConfig`] and the static vat table
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                            Kernel                            │
//! │                                                              │
//! │   host ops ──▶ run-queue ──▶ crank ──▶ route ──▶ translate   │
//! │                                                     │        │
//! │   ┌──────────────┐      ┌──────────────┐            ▼        │
//! │   │ KernelKeeper │◀─────│  syscalls    │◀──── VatWarehouse   │
//! │   │ (tables)     │      └──────────────┘      │  workers     │
//! │   └──────┬───────┘                            │  transcripts │
//! │          │                                    └──────────────┘
//! └──────────┼───────────────────────────────────────────────────┘
//!            ▼
//!        SwingStore (savepoints per crank, commit per block)
//! ```
//!
//! Everything is single-threaded. A delivery is a blocking call into the
//! worker; syscalls are answered while it runs.

pub mod config;
pub mod device;
pub mod error;
pub mod kernel;
pub mod policy;
mod syscall;
pub mod transcript;
pub mod warehouse;

pub use config::{KernelConfig, NamedBundles, StaticVatConfig};
pub use device::{Device, DeviceRegistry, FnDevice};
pub use error::{KernelError, SyscallError};
pub use kernel::{Kernel, PromiseStatus};
pub use policy::{CrankLimitPolicy, ForeverPolicy, PolicyInput, RunPolicy};
pub use transcript::{
    export_transcript, replay_transcript, CreateVatLine, DeliveryLine, ReplayReport, SyscallRecord,
    TranscriptEntry,
};
pub use warehouse::VatWarehouse;
