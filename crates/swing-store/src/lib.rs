//! Swing Store - Transactional Storage for the Swingset Kernel
//!
//! Three namespaces behind one atomic commit:
//!
//! - **kv**: ordered string keys and values, with `getNextKey`-style
//!   iteration. Keys are classed by prefix: `local.*` (never hashed),
//!   `host.*` (host facet only) and consensus (everything else).
//! - **transcripts**: per-vat append-only item logs with span bounds.
//! - **blobs**: content-addressed code bundles and heap snapshots.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SwingStore                          │
//! │                                                             │
//! │   ┌───────────────┐   ┌───────────────┐   ┌─────────────┐   │
//! │   │   kv facet    │   │  transcripts  │   │    blobs    │   │
//! │   │ kernel / host │   │  spans, items │   │ bundles,    │   │
//! │   └───────┬───────┘   └───────┬───────┘   │ snapshots   │   │
//! │           └───────────┬───────┘           └──────┬──────┘   │
//! │                       ▼                          │          │
//! │            pending CommitBatch ◀─────────────────┘          │
//! │            + crank undo log / savepoints                    │
//! │            + crankhash / activityhash                       │
//! └───────────────────────┬─────────────────────────────────────┘
//!                         │ commit()
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │   StorageBackend: MemoryBackend | SqliteBackend             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing reaches the backend until [`SwingStore::commit`]; dropping
//! the store discards the overlay, which is exactly what a crash does.

pub mod backend;
pub mod blobs;
pub mod error;
pub mod store;
pub mod transcript;

pub use backend::{CommitBatch, MemoryBackend, StorageBackend};
#[cfg(feature = "sqlite")]
pub use backend::SqliteBackend;
pub use blobs::{BundleId, SnapshotInfo};
pub use error::StoreError;
pub use store::{CrankHashes, KeyClass, SwingStore, ACTIVITY_HASH_KEY};
pub use transcript::SpanBounds;
