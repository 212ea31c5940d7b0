//! Durable upload ledger.
//!
//! The ledger is the record of resumable-upload sessions that survives a
//! reload. It is written when a session is created and read once at startup
//! by the reconciler.

use crate::error::StorageResult;
use crate::traits::KeyValueStore;
use reelup_core::ledger::{LEDGER_KEY_PREFIX, LedgerEntry, LedgerKey};
use reelup_core::upload::Metadata;
use std::sync::Arc;

/// Ledger of resumable sessions on top of a key-value store.
#[derive(Clone)]
pub struct UploadLedger {
    store: Arc<dyn KeyValueStore>,
}

impl UploadLedger {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// All well-formed session entries, sorted by key.
    ///
    /// Keys outside the `tus::<descriptor>::<fingerprint>` convention are not
    /// upload sessions and are ignored. Entries whose value cannot be decoded
    /// are logged and skipped; they never fail the scan.
    pub async fn list_entries(&self) -> StorageResult<Vec<LedgerEntry>> {
        let mut keys: Vec<LedgerKey> = self
            .store
            .keys()
            .await?
            .into_iter()
            .filter(|raw| raw.starts_with(LEDGER_KEY_PREFIX))
            .filter_map(|raw| match LedgerKey::parse(&raw) {
                Ok(key) => Some(key),
                Err(err) => {
                    tracing::debug!(key = %raw, error = %err, "ignoring non-session key");
                    None
                }
            })
            .collect();
        keys.sort();

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let raw_key = key.to_string();
            let raw = match self.store.get(&raw_key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(key = %raw_key, error = %err, "failed to read ledger entry, skipping");
                    continue;
                }
            };

            match LedgerEntry::decode(key, &raw) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    tracing::warn!(key = %raw_key, error = %err, "skipping malformed ledger entry");
                }
            }
        }

        Ok(entries)
    }

    /// Delete one entry. Removing an absent key is a no-op.
    pub async fn remove(&self, key: &LedgerKey) -> StorageResult<()> {
        self.store.remove(&key.to_string()).await?;
        tracing::debug!(key = %key, "removed ledger entry");
        Ok(())
    }

    /// First entry whose session URL equals `session_url`.
    pub async fn find_by_session_url(&self, session_url: &str) -> StorageResult<Option<LedgerEntry>> {
        Ok(self
            .list_entries()
            .await?
            .into_iter()
            .find(|entry| entry.session_url == session_url))
    }

    /// Every entry recorded for the same file content.
    pub async fn find_by_descriptor(&self, descriptor: &str) -> StorageResult<Vec<LedgerEntry>> {
        Ok(self
            .list_entries()
            .await?
            .into_iter()
            .filter(|entry| entry.key.descriptor() == descriptor)
            .collect())
    }

    /// Record a newly created session.
    pub async fn insert(
        &self,
        descriptor: &str,
        size: u64,
        metadata: Metadata,
        session_url: &str,
    ) -> StorageResult<LedgerEntry> {
        let key = LedgerKey::generate(descriptor)?;
        let entry = LedgerEntry::new(key, size, metadata, session_url.to_string());
        self.store.set(&entry.key.to_string(), entry.encode()?).await?;

        tracing::debug!(key = %entry.key, session_url, "recorded ledger entry");
        Ok(entry)
    }

    /// Delete every entry pointing at `session_url`; returns how many went.
    pub async fn remove_by_session_url(&self, session_url: &str) -> StorageResult<usize> {
        let mut removed = 0;
        for entry in self.list_entries().await? {
            if entry.session_url == session_url {
                self.remove(&entry.key).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
