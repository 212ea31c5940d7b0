//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;

/// Durable string key-value store.
///
/// Mirrors the browser storage model the ledger was designed around: flat
/// string keys, string values, no transactions. Implementations must make
/// every `set`/`remove` durable before returning.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// All keys currently stored, in no particular order.
    async fn keys(&self) -> StorageResult<Vec<String>>;

    /// Value for a key, or `None` if absent.
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Insert or replace a value.
    async fn set(&self, key: &str, value: String) -> StorageResult<()>;

    /// Delete a key. Removing an absent key is a no-op.
    async fn remove(&self, key: &str) -> StorageResult<()>;

    /// Get the name of this storage backend, for logging.
    fn backend_name(&self) -> &'static str;
}
