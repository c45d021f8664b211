//! Error types for the block manager

use swing_kernel::KernelError;
use swing_store::StoreError;
use thiserror::Error;

/// Errors returned by block actions.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BlockError {
    /// The kernel's computed state no longer matches the chain. Sticky:
    /// every later action fails with the same error.
    #[error("decoherence: {0}")]
    Decoherence(String),

    /// Kernel failure while running a block.
    #[error(transparent)]
    Kernel(#[from] KernelError),

    /// Host state could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An inbound action names a kind with no handler vat.
    #[error("no bridge route for inbound action {0:?}")]
    Unrouted(String),

    /// The bootstrap block was asked for after the chain started.
    #[error("cannot run the bootstrap block: {0}")]
    Bootstrap(String),

    /// Bad chain configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error reading configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Host state held a value of the wrong shape.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BlockError {
    /// Create a configuration error.
    pub fn config(detail: impl Into<String>) -> Self {
        BlockError::Config(detail.into())
    }
}
