//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid ledger key: {0}")]
    InvalidLedgerKey(String),

    #[error("invalid ledger entry {key}: {reason}")]
    InvalidLedgerEntry { key: String, reason: String },

    #[error("invalid session URL: {0}")]
    InvalidSessionUrl(String),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Classify this error for callers that only branch on the broad kind.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

/// Broad failure classes a UI host reacts to.
///
/// Every crate in the workspace maps its own error type onto these through a
/// `kind()` method.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Resume attempted without a stored session URL. The user must re-select
    /// the file and restart.
    NoResumableSession,
    /// The remote session no longer matches the expected size/offset. The
    /// ledger entry has been purged and the user must restart.
    StaleSession,
    /// Network failure or 5xx response, reported once retries are exhausted.
    TransientTransport,
    /// HTTP 412 on a status probe; the session state is ambiguous.
    PreconditionConflict,
    /// The push channel is unreachable. Uploads continue, live progress stops.
    ChannelConnection,
    /// Anything else (explicit rejections, I/O, malformed data).
    Other,
}

impl ErrorKind {
    /// Whether the user has to pick the file again and start over.
    pub fn requires_restart(&self) -> bool {
        matches!(self, Self::NoResumableSession | Self::StaleSession)
    }
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
