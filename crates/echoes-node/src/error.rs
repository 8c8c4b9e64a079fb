//! Error types for the Echoes node.

use crate::text::Rejection;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in node operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persisted state contradicts itself
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Layer table error
    #[error("Layer table error: {0}")]
    Layers(#[from] echoes_layers::LayerError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

/// Client-visible failures of a message submission.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The text was rejected; resubmitting it unchanged will fail again.
    #[error("{0}")]
    Validation(#[from] Rejection),

    /// The daily quota for this identity is used up.
    #[error("daily quota exhausted, resets in {reset_in_seconds}s")]
    QuotaExceeded {
        reset_in_seconds: u64,
        /// Anonymous callers get a larger quota once they authenticate.
        requires_auth: bool,
    },

    /// Too many attempts in a short window.
    #[error("too many attempts, blocked until {until}")]
    AbuseBlocked { until: DateTime<Utc> },

    /// The current epoch is closing; nothing was consumed.
    #[error("{epoch_name} is closing, retry shortly")]
    EpochTransition { epoch_name: String },

    /// No current epoch exists.
    #[error("no active epoch")]
    NoActiveEpoch,

    /// The store failed. On the write path the outcome is uncertain.
    #[error("store failure: {0}")]
    Store(#[source] Error),
}

impl SubmitError {
    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SubmitError::Validation(_) => "validation",
            SubmitError::QuotaExceeded { .. } => "quota_exceeded",
            SubmitError::AbuseBlocked { .. } => "abuse_blocked",
            SubmitError::EpochTransition { .. } => "epoch_transition",
            SubmitError::NoActiveEpoch => "no_active_epoch",
            SubmitError::Store(_) => "store",
        }
    }

    /// Whether the same request may be resubmitted as is and succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SubmitError::QuotaExceeded { .. }
                | SubmitError::AbuseBlocked { .. }
                | SubmitError::EpochTransition { .. }
        )
    }

    /// The write may or may not have landed; callers must check state
    /// before resubmitting.
    pub fn is_uncertain(&self) -> bool {
        matches!(self, SubmitError::Store(_))
    }
}
