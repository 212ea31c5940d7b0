use async_trait::async_trait;
use reelup_storage::error::{StorageError, StorageResult};
use reelup_storage::{KeyValueStore, MemoryStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Memory store that counts mutations and can be told to fail reads of
/// specific keys.
#[allow(dead_code)]
pub struct InstrumentedStore {
    inner: MemoryStore,
    unreadable: HashSet<String>,
    pub writes: AtomicUsize,
    pub removes: AtomicUsize,
}

#[allow(dead_code)]
impl InstrumentedStore {
    pub fn new<'a>(entries: impl IntoIterator<Item = (&'a str, String)>) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::with_entries(entries),
            unreadable: HashSet::new(),
            writes: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
        })
    }

    /// Same as `new`, but reads of `unreadable` keys return an I/O error.
    pub fn with_unreadable<'a>(
        entries: impl IntoIterator<Item = (&'a str, String)>,
        unreadable: &[&str],
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::with_entries(entries),
            unreadable: unreadable.iter().map(|k| k.to_string()).collect(),
            writes: AtomicUsize::new(0),
            removes: AtomicUsize::new(0),
        })
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyValueStore for InstrumentedStore {
    async fn keys(&self) -> StorageResult<Vec<String>> {
        self.inner.keys().await
    }

    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        if self.unreadable.contains(key) {
            return Err(StorageError::Io(std::io::Error::other(format!(
                "injected read failure for {key}"
            ))));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String) -> StorageResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(key).await
    }

    fn backend_name(&self) -> &'static str {
        "instrumented"
    }
}
