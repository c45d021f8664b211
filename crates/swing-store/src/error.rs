//! Error types for store operations

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error while opening or writing the backing files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A structured value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A key was written through the wrong facet (kernel vs host).
    #[error("key {key:?} cannot be written through the {facet} facet")]
    KeyClass {
        /// The offending key.
        key: String,
        /// Which facet refused it.
        facet: &'static str,
    },

    /// Crank bracketing was used out of order.
    #[error("{operation}: {detail}")]
    CrankState {
        /// The operation that was attempted.
        operation: &'static str,
        /// What was wrong with the current crank state.
        detail: &'static str,
    },

    /// Rollback to a savepoint that was never established in this crank.
    #[error("no such savepoint as {0:?}")]
    NoSuchSavepoint(String),

    /// Transcript operation on a vat with no (or an existing) transcript.
    #[error("transcript for {vat_id}: {detail}")]
    Transcript {
        /// Vat whose transcript was addressed.
        vat_id: String,
        /// What went wrong.
        detail: String,
    },

    /// A stored value did not have the expected shape.
    #[error("corrupt value at {key}: {detail}")]
    Corrupt {
        /// Key holding the corrupt value.
        key: String,
        /// Parse failure detail.
        detail: String,
    },

    /// The backend refused the commit batch; nothing was made visible.
    #[error("commit failed: {0}")]
    CommitFailed(String),
}

impl StoreError {
    /// Create a transcript error.
    pub fn transcript(vat_id: &str, detail: impl Into<String>) -> Self {
        StoreError::Transcript {
            vat_id: vat_id.to_string(),
            detail: detail.into(),
        }
    }

    /// Create a corrupt-value error.
    pub fn corrupt(key: &str, detail: impl ToString) -> Self {
        StoreError::Corrupt {
            key: key.to_string(),
            detail: detail.to_string(),
        }
    }

    /// Check if this is a commit failure.
    pub fn is_commit_failure(&self) -> bool {
        matches!(self, StoreError::CommitFailed(_))
    }
}
