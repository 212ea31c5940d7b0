//! Startup reconciliation of the ledger against the upload server.
//!
//! Each ledger entry is cross-checked with a status probe. Completed and
//! stale sessions are purged, unfinished ones are seeded into the state
//! store as `paused`. Anything inconclusive is left alone: losing an entry
//! for a live upload is worse than keeping a dead one.

use crate::protocol::{ProbeOutcome, TusClient};
use crate::state::UploadStateStore;
use reelup_core::ledger::{LedgerEntry, LedgerKey};
use reelup_core::upload::{FileInfo, UploadId, now_millis};
use reelup_storage::UploadLedger;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Metadata keys consulted when rebuilding a `FileInfo` from a ledger entry.
const FILENAME_KEYS: [&str; 2] = ["filename", "name"];
const FILETYPE_KEYS: [&str; 2] = ["filetype", "type"];

/// What one reconciliation pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Unfinished sessions now in the store as `paused`.
    pub seeded: Vec<UploadId>,
    /// Existing records whose session URL was backfilled.
    pub repaired: Vec<UploadId>,
    /// Entries purged because the server holds every byte.
    pub removed_complete: Vec<LedgerKey>,
    /// Entries purged because the session is gone or no longer matches.
    pub removed_stale: Vec<LedgerKey>,
    /// Entries left in the ledger without seeding a record.
    pub retained: Vec<LedgerKey>,
}

enum Verdict {
    Seed { offset: u64 },
    Complete,
    Stale(String),
    Keep(String),
}

fn judge(entry: &LedgerEntry, outcome: ProbeOutcome) -> Verdict {
    match outcome {
        ProbeOutcome::Indeterminate(reason) => Verdict::Keep(reason),
        ProbeOutcome::MissingOffsets => Verdict::Keep("no offset headers".into()),
        ProbeOutcome::Gone(status) => Verdict::Stale(format!("server returned {status}")),
        ProbeOutcome::Offsets { length, .. } if length != entry.size => {
            Verdict::Stale(format!("length {length} != recorded size {}", entry.size))
        }
        ProbeOutcome::Offsets { offset, length } if offset > length => {
            Verdict::Stale(format!("offset {offset} beyond length {length}"))
        }
        ProbeOutcome::Offsets { offset, length } if offset == length => Verdict::Complete,
        ProbeOutcome::Offsets { offset, .. } => Verdict::Seed { offset },
    }
}

/// Runs the reconciliation pass once per instance.
pub struct Reconciler {
    ledger: UploadLedger,
    client: TusClient,
    store: Arc<UploadStateStore>,
    ran: AtomicBool,
}

impl Reconciler {
    pub fn new(ledger: UploadLedger, client: TusClient, store: Arc<UploadStateStore>) -> Self {
        Self {
            ledger,
            client,
            store,
            ran: AtomicBool::new(false),
        }
    }

    /// Check whether the pass already ran.
    pub fn has_run(&self) -> bool {
        self.ran.load(Ordering::SeqCst)
    }

    /// Reconcile every ledger entry.
    ///
    /// Returns `None` when called again on the same instance. Errors are
    /// logged per entry and never abort the pass.
    pub async fn run(&self) -> Option<ReconcileReport> {
        if self.ran.swap(true, Ordering::SeqCst) {
            tracing::debug!("reconciliation already ran, skipping");
            return None;
        }

        let mut report = ReconcileReport::default();
        let entries = match self.ledger.list_entries().await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, "failed to scan upload ledger");
                return Some(report);
            }
        };

        // Records present before the pass; anything seeded during it is
        // caught by `seed_paused` refusing a duplicate id.
        let known: HashSet<UploadId> = self
            .store
            .snapshot()
            .into_iter()
            .map(|record| record.upload_id)
            .collect();

        for entry in entries {
            self.reconcile_entry(entry, &known, &mut report).await;
        }

        tracing::info!(
            seeded = report.seeded.len(),
            repaired = report.repaired.len(),
            removed_complete = report.removed_complete.len(),
            removed_stale = report.removed_stale.len(),
            retained = report.retained.len(),
            "reconciled upload ledger"
        );
        Some(report)
    }

    async fn reconcile_entry(
        &self,
        entry: LedgerEntry,
        known: &HashSet<UploadId>,
        report: &mut ReconcileReport,
    ) {
        let upload_id = match entry.upload_id() {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(key = %entry.key, error = %err, "ledger entry has no usable upload id");
                report.retained.push(entry.key);
                return;
            }
        };

        if known.contains(&upload_id) {
            let missing_session = self
                .store
                .get(&upload_id)
                .is_some_and(|record| !record.has_session());
            if missing_session && self.store.set_session_url(&upload_id, &entry.session_url) {
                tracing::debug!(upload_id = %upload_id, "repaired session url");
                report.repaired.push(upload_id);
            } else {
                report.retained.push(entry.key);
            }
            return;
        }

        let outcome = self.client.probe(&entry.session_url).await;
        match judge(&entry, outcome) {
            Verdict::Keep(reason) => {
                tracing::info!(upload_id = %upload_id, reason = %reason, "session state unknown, keeping entry");
                report.retained.push(entry.key);
            }
            Verdict::Stale(reason) => {
                tracing::info!(upload_id = %upload_id, reason = %reason, "removing stale session");
                if self.purge(&entry).await {
                    report.removed_stale.push(entry.key);
                } else {
                    report.retained.push(entry.key);
                }
            }
            Verdict::Complete => {
                tracing::info!(upload_id = %upload_id, "session already complete, removing entry");
                if self.purge(&entry).await {
                    report.removed_complete.push(entry.key);
                } else {
                    report.retained.push(entry.key);
                }
            }
            Verdict::Seed { offset } => {
                let file = file_info(&entry, &upload_id);
                let start_time = entry.creation_millis().unwrap_or_else(now_millis);
                if self.store.seed_paused(
                    upload_id.clone(),
                    entry.session_url.clone(),
                    file,
                    entry.metadata.clone(),
                    start_time,
                    offset,
                ) {
                    tracing::info!(upload_id = %upload_id, offset, size = entry.size, "seeded paused upload");
                    report.seeded.push(upload_id);
                } else {
                    report.retained.push(entry.key);
                }
            }
        }
    }

    async fn purge(&self, entry: &LedgerEntry) -> bool {
        match self.ledger.remove(&entry.key).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(key = %entry.key, error = %err, "failed to remove ledger entry");
                false
            }
        }
    }
}

fn file_info(entry: &LedgerEntry, upload_id: &UploadId) -> FileInfo {
    let lookup = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| entry.metadata.get(*key))
            .filter(|value| !value.is_empty())
            .cloned()
    };

    let mut file = FileInfo::new(
        lookup(&FILENAME_KEYS).unwrap_or_else(|| upload_id.to_string()),
        entry.size,
    );
    file.content_type = lookup(&FILETYPE_KEYS);
    file
}

#[cfg(test)]
mod tests {
    use super::*;
    use reelup_core::upload::Metadata;

    fn entry(size: u64) -> LedgerEntry {
        let mut metadata = Metadata::new();
        metadata.insert("filename".into(), "ep1.mp4".into());
        metadata.insert("filetype".into(), "video/mp4".into());
        LedgerEntry::new(
            LedgerKey::parse("tus::reelup-a::1").unwrap(),
            size,
            metadata,
            "https://up.example.com/files/abc123".into(),
        )
    }

    #[test]
    fn judge_classifies_probe_outcomes() {
        let e = entry(1000);
        let offsets = |offset, length| ProbeOutcome::Offsets { offset, length };

        assert!(matches!(judge(&e, offsets(400, 1000)), Verdict::Seed { offset: 400 }));
        assert!(matches!(judge(&e, offsets(0, 1000)), Verdict::Seed { offset: 0 }));
        assert!(matches!(judge(&e, offsets(1000, 1000)), Verdict::Complete));
        assert!(matches!(judge(&e, offsets(500, 500)), Verdict::Stale(_)));
        assert!(matches!(judge(&e, offsets(1200, 1000)), Verdict::Stale(_)));
        assert!(matches!(judge(&e, ProbeOutcome::Gone(404)), Verdict::Stale(_)));
        assert!(matches!(judge(&e, ProbeOutcome::MissingOffsets), Verdict::Keep(_)));
        assert!(matches!(
            judge(&e, ProbeOutcome::Indeterminate("412".into())),
            Verdict::Keep(_)
        ));
    }

    #[test]
    fn file_info_from_metadata() {
        let e = entry(1000);
        let id = UploadId::new("abc123");
        let file = file_info(&e, &id);
        assert_eq!(file.name, "ep1.mp4");
        assert_eq!(file.size, 1000);
        assert_eq!(file.content_type.as_deref(), Some("video/mp4"));

        let bare = LedgerEntry::new(e.key.clone(), 5, Metadata::new(), e.session_url.clone());
        let file = file_info(&bare, &id);
        assert_eq!(file.name, "abc123");
        assert!(file.content_type.is_none());
    }
}
