//! Core domain types and shared logic for reelup.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Upload records, statuses and progress observations
//! - Durable ledger keys and their persisted JSON form
//! - Transfer speed / ETA math
//! - Client configuration and the shared error taxonomy

pub mod config;
pub mod error;
pub mod ledger;
pub mod progress;
pub mod upload;

pub use config::{ChannelConfig, ClientConfig, LedgerConfig};
pub use error::{Error, ErrorKind, Result};
pub use ledger::{LedgerEntry, LedgerKey};
pub use progress::TransferMeter;
pub use upload::{FileInfo, Metadata, ProgressUpdate, UploadId, UploadRecord, UploadStatus};

/// Default chunk size: 5 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
