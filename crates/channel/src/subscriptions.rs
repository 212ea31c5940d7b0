//! Per-upload observer counts.
//!
//! Several observers may watch the same upload. The wire-level subscribe is
//! sent for the first observer and the wire-level unsubscribe only when the
//! last one leaves.

use reelup_core::upload::UploadId;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
pub struct SubscriptionRegistry {
    counts: Mutex<BTreeMap<UploadId, usize>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<UploadId, usize>> {
        self.counts.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("subscription Mutex was poisoned, recovering with into_inner()");
            poisoned.into_inner()
        })
    }

    /// Add an observer. Returns `true` for the first one.
    pub fn acquire(&self, upload_id: &UploadId) -> bool {
        let mut counts = self.lock();
        let count = counts.entry(upload_id.clone()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop an observer. Returns `true` when the last one left.
    ///
    /// Releasing an id nobody observes is a no-op.
    pub fn release(&self, upload_id: &UploadId) -> bool {
        let mut counts = self.lock();
        match counts.get_mut(upload_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                counts.remove(upload_id);
                true
            }
            None => false,
        }
    }

    pub fn count(&self, upload_id: &UploadId) -> usize {
        self.lock().get(upload_id).copied().unwrap_or(0)
    }

    /// Ids with at least one observer, ordered.
    pub fn ids(&self) -> Vec<UploadId> {
        self.lock().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
