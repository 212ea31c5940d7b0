//! In-memory, observable upload state.
//!
//! The store owns every `UploadRecord`. All operations are synchronous and
//! never block on I/O; async callers re-check a record through the store
//! after every suspension point instead of holding a copy.
//!
//! Rejected mutations are ignored, not errors: every mutator returns `false`
//! and logs at debug. That covers transitions out of `completed`/`failed`,
//! progress for records that are not uploading, progress that would move
//! `bytes_uploaded` backwards, and unknown ids.

use reelup_core::upload::{FileInfo, Metadata, ProgressUpdate, UploadId, UploadRecord, UploadStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// What changed on a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreEventKind {
    Started,
    Seeded,
    SessionAttached,
    Progress,
    Paused,
    Resumed,
    Completed,
    Failed,
    Removed,
}

/// Notification for one applied mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StoreEvent {
    pub upload_id: UploadId,
    pub kind: StoreEventKind,
}

#[derive(Default)]
struct Inner {
    records: BTreeMap<UploadId, UploadRecord>,
    /// Non-terminal ids in insertion order.
    active: Vec<UploadId>,
}

impl Inner {
    fn insert(&mut self, record: UploadRecord) {
        self.active.push(record.upload_id.clone());
        self.records.insert(record.upload_id.clone(), record);
    }

    fn retire(&mut self, upload_id: &UploadId) {
        self.active.retain(|id| id != upload_id);
    }
}

/// Observable map of upload records.
pub struct UploadStateStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for UploadStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadStateStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    /// Receive every applied mutation from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("upload state Mutex was poisoned, recovering with into_inner()");
            poisoned.into_inner()
        })
    }

    fn emit(&self, upload_id: &UploadId, kind: StoreEventKind) {
        // No receivers is fine.
        let _ = self.events.send(StoreEvent {
            upload_id: upload_id.clone(),
            kind,
        });
    }

    /// Apply `change` to an existing record, or log why it was refused.
    fn mutate<F>(&self, upload_id: &UploadId, kind: StoreEventKind, change: F) -> bool
    where
        F: FnOnce(&mut UploadRecord) -> Result<(), &'static str>,
    {
        let applied = {
            let mut inner = self.lock();
            let outcome = match inner.records.get_mut(upload_id) {
                Some(record) => change(record).map(|()| record.status.is_terminal()),
                None => Err("unknown upload"),
            };
            match outcome {
                Ok(terminal) => {
                    if terminal {
                        inner.retire(upload_id);
                    }
                    true
                }
                Err(reason) => {
                    tracing::debug!(upload_id = %upload_id, event = ?kind, reason, "ignoring upload state mutation");
                    false
                }
            }
        };

        if applied {
            self.emit(upload_id, kind);
        }
        applied
    }

    /// Insert a new record.
    ///
    /// With a session URL the record starts `uploading`; without one it is
    /// `pending` until `set_session_url` attaches a session. Starting an id
    /// that already exists is ignored.
    pub fn start(
        &self,
        upload_id: UploadId,
        session_url: Option<String>,
        file: FileInfo,
        metadata: Metadata,
        start_time: u64,
    ) -> bool {
        let session_url = session_url.filter(|url| !url.is_empty());
        let status = if session_url.is_some() {
            UploadStatus::Uploading
        } else {
            UploadStatus::Pending
        };

        {
            let mut inner = self.lock();
            if inner.records.contains_key(&upload_id) {
                tracing::debug!(upload_id = %upload_id, "ignoring start for existing upload");
                return false;
            }
            inner.insert(UploadRecord::new(
                upload_id.clone(),
                status,
                session_url,
                file,
                metadata,
                start_time,
            ));
        }

        tracing::debug!(upload_id = %upload_id, status = %status, "upload started");
        self.emit(&upload_id, StoreEventKind::Started);
        true
    }

    /// Insert a recovered record directly in `paused`.
    ///
    /// `bytes_uploaded` is the offset the server reported for the session.
    pub fn seed_paused(
        &self,
        upload_id: UploadId,
        session_url: String,
        file: FileInfo,
        metadata: Metadata,
        start_time: u64,
        bytes_uploaded: u64,
    ) -> bool {
        if session_url.is_empty() {
            tracing::debug!(upload_id = %upload_id, "refusing to seed paused upload without a session");
            return false;
        }

        {
            let mut inner = self.lock();
            if inner.records.contains_key(&upload_id) {
                tracing::debug!(upload_id = %upload_id, "ignoring seed for existing upload");
                return false;
            }
            let mut record = UploadRecord::new(
                upload_id.clone(),
                UploadStatus::Paused,
                Some(session_url),
                file,
                metadata,
                start_time,
            );
            record.bytes_uploaded = bytes_uploaded.min(record.bytes_total);
            record.percentage = if record.bytes_total == 0 {
                100.0
            } else {
                record.bytes_uploaded as f64 * 100.0 / record.bytes_total as f64
            };
            inner.insert(record);
        }

        self.emit(&upload_id, StoreEventKind::Seeded);
        true
    }

    /// Attach (or repair) the session URL.
    ///
    /// A `pending` record moves to `uploading`.
    pub fn set_session_url(&self, upload_id: &UploadId, session_url: impl Into<String>) -> bool {
        let session_url = session_url.into();
        self.mutate(upload_id, StoreEventKind::SessionAttached, |record| {
            if session_url.is_empty() {
                return Err("empty session url");
            }
            if record.status.is_terminal() {
                return Err("record is terminal");
            }
            record.session_url = Some(session_url);
            if record.status == UploadStatus::Pending {
                record.status = UploadStatus::Uploading;
            }
            Ok(())
        })
    }

    /// Record a progress observation.
    pub fn progress(&self, upload_id: &UploadId, update: ProgressUpdate) -> bool {
        self.mutate(upload_id, StoreEventKind::Progress, |record| {
            if record.status != UploadStatus::Uploading {
                return Err("record is not uploading");
            }
            if update.bytes_uploaded < record.bytes_uploaded {
                return Err("progress regression");
            }
            record.bytes_uploaded = update.bytes_uploaded;
            if update.bytes_total > 0 {
                record.bytes_total = update.bytes_total;
            }
            record.percentage = update.percentage;
            record.speed = update.speed;
            record.estimated_time_remaining = update.estimated_time_remaining;
            Ok(())
        })
    }

    /// `uploading -> paused`. Requires a session URL.
    pub fn pause(&self, upload_id: &UploadId) -> bool {
        self.mutate(upload_id, StoreEventKind::Paused, |record| {
            if record.status != UploadStatus::Uploading {
                return Err("record is not uploading");
            }
            if !record.has_session() {
                return Err("paused records need a session url");
            }
            record.status = UploadStatus::Paused;
            record.speed = 0.0;
            record.estimated_time_remaining = 0.0;
            Ok(())
        })
    }

    /// `paused -> uploading`.
    pub fn resume(&self, upload_id: &UploadId) -> bool {
        self.mutate(upload_id, StoreEventKind::Resumed, |record| {
            if record.status != UploadStatus::Paused {
                return Err("record is not paused");
            }
            record.status = UploadStatus::Uploading;
            Ok(())
        })
    }

    /// Move to `completed`.
    pub fn complete(&self, upload_id: &UploadId) -> bool {
        self.mutate(upload_id, StoreEventKind::Completed, |record| {
            if record.status.is_terminal() {
                return Err("record is terminal");
            }
            record.status = UploadStatus::Completed;
            record.bytes_uploaded = record.bytes_total;
            record.percentage = 100.0;
            record.speed = 0.0;
            record.estimated_time_remaining = 0.0;
            Ok(())
        })
    }

    /// Move to `failed` with `message`.
    pub fn error(&self, upload_id: &UploadId, message: impl Into<String>) -> bool {
        let message = message.into();
        self.mutate(upload_id, StoreEventKind::Failed, |record| {
            if record.status.is_terminal() {
                return Err("record is terminal");
            }
            record.status = UploadStatus::Failed;
            record.error = Some(message);
            record.speed = 0.0;
            record.estimated_time_remaining = 0.0;
            Ok(())
        })
    }

    /// Drop a record entirely.
    pub fn remove(&self, upload_id: &UploadId) -> bool {
        let removed = {
            let mut inner = self.lock();
            inner.retire(upload_id);
            inner.records.remove(upload_id).is_some()
        };
        if removed {
            self.emit(upload_id, StoreEventKind::Removed);
        }
        removed
    }

    pub fn get(&self, upload_id: &UploadId) -> Option<UploadRecord> {
        self.lock().records.get(upload_id).cloned()
    }

    pub fn contains(&self, upload_id: &UploadId) -> bool {
        self.lock().records.contains_key(upload_id)
    }

    /// Current status, if the record exists.
    pub fn status(&self, upload_id: &UploadId) -> Option<UploadStatus> {
        self.lock().records.get(upload_id).map(|record| record.status)
    }

    /// Copy of every record, ordered by id.
    pub fn snapshot(&self) -> Vec<UploadRecord> {
        self.lock().records.values().cloned().collect()
    }

    /// Non-terminal ids in insertion order.
    pub fn active_ids(&self) -> Vec<UploadId> {
        self.lock().active.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }
}
