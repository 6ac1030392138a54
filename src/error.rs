//! Error kinds surfaced by the triage pipeline and its collaborators.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Input enumeration failure. Per-entry failures are logged and skipped;
/// only a failure to read the input directory itself reaches the caller.
#[derive(Debug, Error)]
pub enum EnumerationError {
    #[error("cannot read input directory {path:?}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Classification oracle failure. Never fatal to a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    /// Connection, transport or authentication failure
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("oracle call timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed request or explicit refusal by the oracle
    #[error("oracle refused request: {0}")]
    Refused(String),
}

impl OracleError {
    pub fn kind(&self) -> &'static str {
        match self {
            OracleError::Unavailable(_) => "unavailable",
            OracleError::Timeout(_) => "timeout",
            OracleError::Refused(_) => "refused",
        }
    }
}

/// Oracle output that does not conform to the verdict schema.
///
/// Carries the raw text for diagnosis.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid oracle output: {reason}")]
pub struct ValidationError {
    pub reason: String,
    pub raw: String,
}

impl ValidationError {
    pub fn new(reason: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            raw: raw.into(),
        }
    }
}

/// Result store failure. Fatal to the current event; aborts the batch only
/// when the store cannot be reopened.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("result store {path:?} unavailable: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write record to {path:?}: {reason}")]
    WriteFailed { path: PathBuf, reason: String },

    #[error("result store {path:?} has unexpected header {found:?}")]
    SchemaMismatch { path: PathBuf, found: String },
}
