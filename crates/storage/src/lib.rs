//! Persisted key-value storage and the durable upload ledger for reelup.
//!
//! This crate provides:
//! - A small async key-value store trait
//! - Backends: in-memory and a single JSON document on local disk
//! - `UploadLedger`, the resumable-session records kept across reloads

pub mod backends;
pub mod error;
pub mod ledger;
pub mod traits;

pub use backends::{filesystem::FilesystemStore, memory::MemoryStore};
pub use error::{StorageError, StorageResult};
pub use ledger::UploadLedger;
pub use traits::KeyValueStore;

use reelup_core::config::LedgerConfig;
use std::sync::Arc;

/// Create a key-value store from configuration.
pub async fn from_config(config: &LedgerConfig) -> StorageResult<Arc<dyn KeyValueStore>> {
    match config {
        LedgerConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        LedgerConfig::Filesystem { path } => {
            let backend = FilesystemStore::open(path).await?;
            Ok(Arc::new(backend))
        }
    }
}
