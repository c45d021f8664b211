//! Swing Chain - Block Manager
//!
//! Connects the swingset kernel to a chain's block cycle:
//!
//! - `manager` - [`BlockManager`]: begin/end/commit, replay of an
//!   interrupted block, decoherence detection
//! - `computron` - [`ComputronCounter`]: per-block compute budget
//! - `bridge` - the `bridge` device and the [`ChainSend`]s it collects
//! - `timer` - the `timer` device, advanced by block time
//! - `action` - block actions as the chain sends them
//! - `config` - [`ChainConfig`]: metering parameters and bridge routes
//!
//! # Architecture
//!
//! ```text
//!   chain ── BlockAction ──▶ BlockManager ── inbound(kind, body) ──▶ handler vat
//!     ▲                          │                                      │
//!     │                          │ run(ComputronCounter)                │ callNow
//!     │                          ▼                                      ▼
//!     └──── Vec<ChainSend> ── Outbox ◀──────────────────────────── bridge device
//!
//!   block time ──▶ TimerSchedule::poll ── wake(when) ──▶ handler objects
//! ```
//!
//! Host state lives under `host.*` keys in the kernel's store and is
//! committed in the same transaction as the kernel state.

pub mod action;
pub mod bridge;
pub mod computron;
pub mod config;
pub mod error;
pub mod manager;
pub mod timer;

pub use action::{BlockAction, BlockInfo, InboundAction, InboundQueue};
pub use bridge::{sends_hash, BridgeDevice, ChainSend, Outbox, BRIDGE_DEVICE};
pub use computron::{ComputronCounter, FAILED_CRANK_COMPUTRONS};
pub use config::{ChainConfig, ChainParams, BLOCK_COMPUTE_LIMIT, VAT_CREATION, XSNAP_COMPUTRON};
pub use error::BlockError;
pub use manager::BlockManager;
pub use timer::{TimerDevice, TimerSchedule, Wakeup, TIMER_DEVICE};
