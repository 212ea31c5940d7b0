//! Upload client error types.

use reelup_core::{ErrorKind, UploadStatus};
use reelup_storage::StorageError;
use thiserror::Error;

/// Errors surfaced by transfers and protocol requests.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No record, or a record without a session URL.
    #[error("no resumable session for upload {0}; select the file again and restart")]
    NoResumableSession(String),

    #[error("upload {upload_id} is {status}, only paused uploads can be resumed")]
    NotResumable {
        upload_id: String,
        status: UploadStatus,
    },

    #[error("stale session {session_url}: {reason}")]
    StaleSession { session_url: String, reason: String },

    /// The file picked for a resume is not the one the session was opened
    /// for. The session itself is untouched.
    #[error("selected file is {actual} bytes, the upload expects {expected}")]
    FileMismatch { expected: u64, actual: u64 },

    #[error("transport failure after {attempts} attempt(s): {message}")]
    TransientTransport { attempts: usize, message: String },

    #[error("precondition failed for {0}")]
    PreconditionConflict(String),

    /// Explicit 4xx rejection. Never retried.
    #[error("request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// The server answered with something the protocol does not allow.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid session URL: {0}")]
    InvalidSessionUrl(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Core(#[from] reelup_core::Error),
}

impl ClientError {
    /// Broad failure class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoResumableSession(_) => ErrorKind::NoResumableSession,
            Self::StaleSession { .. } => ErrorKind::StaleSession,
            Self::TransientTransport { .. } => ErrorKind::TransientTransport,
            Self::PreconditionConflict(_) => ErrorKind::PreconditionConflict,
            Self::Storage(err) => err.kind(),
            Self::Core(err) => err.kind(),
            _ => ErrorKind::Other,
        }
    }
}

/// Result type for client operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;
