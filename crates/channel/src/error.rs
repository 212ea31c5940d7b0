//! Progress channel error types.

use reelup_core::ErrorKind;
use thiserror::Error;

/// Progress channel errors.
///
/// None of these fail an upload; they only mean live progress stops.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// `init` has not supplied a bearer token yet.
    #[error("progress channel not initialized")]
    NotInitialized,

    #[error("progress channel connection failed: {0}")]
    Connection(String),

    #[error("progress channel closed")]
    Closed,

    #[error("progress channel protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Core(#[from] reelup_core::Error),
}

impl ChannelError {
    /// Broad failure class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) | Self::Closed => ErrorKind::ChannelConnection,
            Self::Core(err) => err.kind(),
            _ => ErrorKind::Other,
        }
    }
}

/// Result type for channel operations.
pub type ChannelResult<T> = std::result::Result<T, ChannelError>;
