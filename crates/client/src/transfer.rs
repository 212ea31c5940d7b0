//! Chunked transfers: forward uploads and resumption of paused sessions.
//!
//! Progress ticks are handed to the caller's callback; the executor itself
//! only drives status transitions (`resume`, `complete`, `error`). After every
//! suspension point the record is looked up again, so a pause or removal
//! that lands mid-transfer stops the loop before the next chunk.

use crate::error::{ClientError, ClientResult};
use crate::protocol::{ProbeOutcome, TusClient};
use crate::state::UploadStateStore;
use bytes::Bytes;
use dashmap::DashMap;
use reelup_core::ClientConfig;
use reelup_core::ledger::LedgerEntry;
use reelup_core::progress::TransferMeter;
use reelup_core::upload::{
    FileInfo, Metadata, ProgressUpdate, UploadId, UploadStatus, now_millis,
};
use reelup_storage::UploadLedger;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tokio_util::sync::CancellationToken;

/// Readable, seekable byte source.
pub trait SourceReader: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> SourceReader for T {}

/// The file bytes for a transfer, supplied fresh by the user.
pub struct UploadSource {
    info: FileInfo,
    reader: Box<dyn SourceReader>,
}

impl UploadSource {
    pub fn new(info: FileInfo, reader: impl SourceReader + 'static) -> Self {
        Self {
            info,
            reader: Box::new(reader),
        }
    }

    /// Open a local file.
    pub async fn open(path: impl AsRef<Path>) -> ClientResult<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        let meta = file.metadata().await?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut info = FileInfo::new(name, meta.len());
        info.last_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .and_then(|d| u64::try_from(d.as_millis()).ok());

        Ok(Self::new(info, file))
    }

    /// In-memory source.
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let info = FileInfo::new(name, data.len() as u64);
        Self::new(info, std::io::Cursor::new(data))
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.info.content_type = Some(content_type.into());
        self
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    async fn seek(&mut self, offset: u64) -> ClientResult<()> {
        self.reader.seek(SeekFrom::Start(offset)).await?;
        Ok(())
    }

    async fn read_chunk(&mut self, len: u64) -> ClientResult<Bytes> {
        let mut buf = Vec::new();
        (&mut self.reader).take(len).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

/// How a transfer ended without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The server acknowledged every byte.
    Completed,
    /// Stopped early because the upload was paused or removed.
    Paused,
}

/// Cancellation handle of one transfer attempt.
///
/// A pause followed by a resume leaves the old attempt running until its
/// in-flight chunk returns; the generation tells the two apart.
#[derive(Clone)]
struct Ticket {
    generation: u64,
    cancel: CancellationToken,
}

/// Drives chunked transfers against the upload server.
pub struct TransferExecutor {
    client: TusClient,
    ledger: UploadLedger,
    store: Arc<UploadStateStore>,
    chunk_size: u64,
    cancellations: DashMap<UploadId, Ticket>,
    generations: AtomicU64,
}

impl TransferExecutor {
    pub fn new(
        config: &ClientConfig,
        client: TusClient,
        ledger: UploadLedger,
        store: Arc<UploadStateStore>,
    ) -> Self {
        Self {
            client,
            ledger,
            store,
            chunk_size: config.chunk_size.max(1),
            cancellations: DashMap::new(),
            generations: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<UploadStateStore> {
        &self.store
    }

    /// Resume a paused upload with a freshly supplied file.
    #[tracing::instrument(skip(self, source, on_progress), fields(upload_id = %upload_id))]
    pub async fn resume<F>(
        &self,
        upload_id: &UploadId,
        mut source: UploadSource,
        on_progress: F,
    ) -> ClientResult<TransferOutcome>
    where
        F: FnMut(ProgressUpdate) + Send,
    {
        let record = self
            .store
            .get(upload_id)
            .filter(|record| record.has_session())
            .ok_or_else(|| ClientError::NoResumableSession(upload_id.to_string()))?;
        let session_url = record.session_url.clone().unwrap_or_default();

        if record.status != UploadStatus::Paused {
            return Err(ClientError::NotResumable {
                upload_id: upload_id.to_string(),
                status: record.status,
            });
        }
        if source.info().size != record.file.size {
            return Err(ClientError::FileMismatch {
                expected: record.file.size,
                actual: source.info().size,
            });
        }
        if !self.store.resume(upload_id) {
            let status = self.store.status(upload_id);
            return Err(match status {
                Some(status) => ClientError::NotResumable {
                    upload_id: upload_id.to_string(),
                    status,
                },
                None => ClientError::NoResumableSession(upload_id.to_string()),
            });
        }

        let ticket = self.register(upload_id);
        let offset = match self.client.probe(&session_url).await {
            ProbeOutcome::Offsets { offset, length }
                if length == record.file.size && offset <= length =>
            {
                offset
            }
            ProbeOutcome::Offsets { offset, length } => {
                let reason = format!("server reports {offset}/{length} bytes");
                return self.stale(upload_id, &session_url, &ticket, reason).await;
            }
            ProbeOutcome::Gone(status) => {
                let reason = format!("server returned {status}");
                return self.stale(upload_id, &session_url, &ticket, reason).await;
            }
            ProbeOutcome::Indeterminate(reason) => {
                // Nothing is known to be wrong with the session; hand it back.
                self.hand_back(upload_id, &ticket);
                return Err(ClientError::PreconditionConflict(reason));
            }
            ProbeOutcome::MissingOffsets => {
                self.hand_back(upload_id, &ticket);
                return Err(ClientError::Protocol(
                    "status probe without offset headers".into(),
                ));
            }
        };

        tracing::info!(offset, size = record.file.size, "resuming upload");
        let result: ClientResult<TransferOutcome> = async {
            source.seek(offset).await?;
            self.run_chunks(
                upload_id,
                &session_url,
                &mut source,
                offset,
                &ticket.cancel,
                on_progress,
            )
            .await
        }
        .await;
        self.finish(upload_id, &session_url, &ticket, result).await
    }

    /// Start a new upload: create a session, record it, transfer from zero.
    #[tracing::instrument(skip(self, source, metadata, on_progress), fields(file = %source.info().name))]
    pub async fn start<F>(
        &self,
        mut source: UploadSource,
        metadata: Metadata,
        on_progress: F,
    ) -> ClientResult<(UploadId, TransferOutcome)>
    where
        F: FnMut(ProgressUpdate) + Send,
    {
        let info = source.info().clone();
        let mut session_metadata = metadata.clone();
        session_metadata
            .entry("filename".into())
            .or_insert_with(|| info.name.clone());
        if let Some(content_type) = &info.content_type {
            session_metadata
                .entry("filetype".into())
                .or_insert_with(|| content_type.clone());
        }

        let session_url = self.client.create(info.size, &session_metadata).await?;
        let upload_id = UploadId::from_session_url(&session_url)?;

        let descriptor = info.content_descriptor(self.client.endpoint().as_str());
        if let Err(err) = self
            .ledger
            .insert(&descriptor, info.size, session_metadata, &session_url)
            .await
        {
            // The upload still works; it just cannot survive a reload.
            tracing::warn!(upload_id = %upload_id, error = %err, "failed to record session in ledger");
        }

        if !self.store.start(
            upload_id.clone(),
            Some(session_url.clone()),
            info,
            metadata,
            now_millis(),
        ) {
            // The entry above points at a session no record owns.
            if let Err(err) = self.ledger.remove_by_session_url(&session_url).await {
                tracing::warn!(upload_id = %upload_id, error = %err, "failed to purge ledger entry");
            }
            return Err(ClientError::Protocol(format!(
                "server reissued existing upload id {upload_id}"
            )));
        }

        let ticket = self.register(&upload_id);
        let result = self
            .run_chunks(&upload_id, &session_url, &mut source, 0, &ticket.cancel, on_progress)
            .await;
        let outcome = self.finish(&upload_id, &session_url, &ticket, result).await?;
        Ok((upload_id, outcome))
    }

    /// Stop a running transfer after its in-flight chunk and mark it paused.
    pub fn pause(&self, upload_id: &UploadId) -> bool {
        if let Some((_, ticket)) = self.cancellations.remove(upload_id) {
            ticket.cancel.cancel();
        }
        self.store.pause(upload_id)
    }

    /// Abandon an upload: stop it, delete the remote session, forget it.
    pub async fn discard(&self, upload_id: &UploadId) -> ClientResult<()> {
        if let Some((_, ticket)) = self.cancellations.remove(upload_id) {
            ticket.cancel.cancel();
        }

        if let Some(session_url) = self
            .store
            .get(upload_id)
            .and_then(|record| record.session_url)
            .filter(|url| !url.is_empty())
        {
            if let Err(err) = self.client.terminate(&session_url).await {
                tracing::warn!(upload_id = %upload_id, error = %err, "failed to terminate session");
            }
            self.ledger.remove_by_session_url(&session_url).await?;
        }

        self.store.remove(upload_id);
        Ok(())
    }

    /// Ledger entries recorded for the same file content.
    pub async fn previous_sessions(&self, file: &FileInfo) -> ClientResult<Vec<LedgerEntry>> {
        let descriptor = file.content_descriptor(self.client.endpoint().as_str());
        Ok(self.ledger.find_by_descriptor(&descriptor).await?)
    }

    fn register(&self, upload_id: &UploadId) -> Ticket {
        let ticket = Ticket {
            generation: self.generations.fetch_add(1, Ordering::Relaxed),
            cancel: CancellationToken::new(),
        };
        self.cancellations.insert(upload_id.clone(), ticket.clone());
        ticket
    }

    /// Drop the ticket, unless a newer transfer already replaced it.
    fn unregister(&self, upload_id: &UploadId, ticket: &Ticket) {
        self.cancellations
            .remove_if(upload_id, |_, held| held.generation == ticket.generation);
    }

    /// The transfer has not been paused, removed or superseded.
    fn is_current(&self, upload_id: &UploadId, ticket: &Ticket) -> bool {
        !ticket.cancel.is_cancelled() && self.still_uploading(upload_id)
    }

    fn hand_back(&self, upload_id: &UploadId, ticket: &Ticket) {
        self.unregister(upload_id, ticket);
        if self.is_current(upload_id, ticket) {
            self.store.pause(upload_id);
        }
    }

    fn still_uploading(&self, upload_id: &UploadId) -> bool {
        self.store.status(upload_id) == Some(UploadStatus::Uploading)
    }

    async fn run_chunks<F>(
        &self,
        upload_id: &UploadId,
        session_url: &str,
        source: &mut UploadSource,
        start: u64,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> ClientResult<TransferOutcome>
    where
        F: FnMut(ProgressUpdate) + Send,
    {
        let total = source.info().size;
        let meter = TransferMeter::new(start, total);
        let mut offset = start;

        while offset < total {
            if cancel.is_cancelled() || !self.still_uploading(upload_id) {
                tracing::debug!(upload_id = %upload_id, offset, "transfer stopped");
                return Ok(TransferOutcome::Paused);
            }

            let chunk = source.read_chunk(self.chunk_size.min(total - offset)).await?;
            if chunk.is_empty() {
                return Err(ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("source ended at {offset} of {total} bytes"),
                )));
            }
            let sent = chunk.len() as u64;

            let acked = match self
                .client
                .patch_cancellable(session_url, offset, chunk, cancel)
                .await
            {
                Ok(acked) => acked,
                Err(ClientError::Cancelled) => return Ok(TransferOutcome::Paused),
                Err(err) => return Err(err),
            };
            if acked <= offset || acked > total {
                return Err(ClientError::Protocol(format!(
                    "server acknowledged offset {acked} after chunk at {offset}"
                )));
            }
            if acked != offset + sent {
                // Partial acceptance; re-read from where the server stopped.
                source.seek(acked).await?;
            }
            offset = acked;
            on_progress(meter.observe(offset));
        }

        Ok(TransferOutcome::Completed)
    }

    async fn finish(
        &self,
        upload_id: &UploadId,
        session_url: &str,
        ticket: &Ticket,
        result: ClientResult<TransferOutcome>,
    ) -> ClientResult<TransferOutcome> {
        self.unregister(upload_id, ticket);

        if !self.is_current(upload_id, ticket) {
            if let Err(err) = &result {
                tracing::debug!(upload_id = %upload_id, error = %err, "dropping result of a stopped transfer");
            }
            return Ok(TransferOutcome::Paused);
        }

        match result {
            Ok(TransferOutcome::Completed) => {
                self.store.complete(upload_id);
                if let Err(err) = self.ledger.remove_by_session_url(session_url).await {
                    tracing::warn!(upload_id = %upload_id, error = %err, "failed to purge ledger entry");
                }
                tracing::info!(upload_id = %upload_id, "upload completed");
                Ok(TransferOutcome::Completed)
            }
            Ok(TransferOutcome::Paused) => Ok(TransferOutcome::Paused),
            Err(err) => {
                tracing::warn!(upload_id = %upload_id, error = %err, "upload failed");
                self.store.error(upload_id, err.to_string());
                Err(err)
            }
        }
    }

    async fn stale(
        &self,
        upload_id: &UploadId,
        session_url: &str,
        ticket: &Ticket,
        reason: String,
    ) -> ClientResult<TransferOutcome> {
        self.unregister(upload_id, ticket);
        tracing::warn!(upload_id = %upload_id, reason = %reason, "session is stale");

        if let Err(err) = self.ledger.remove_by_session_url(session_url).await {
            tracing::warn!(upload_id = %upload_id, error = %err, "failed to purge ledger entry");
        }
        let err = ClientError::StaleSession {
            session_url: session_url.to_string(),
            reason,
        };
        if self.is_current(upload_id, ticket) {
            self.store.error(upload_id, err.to_string());
        }
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_reads_file_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ep1.mp4");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        let source = UploadSource::open(&path).await.unwrap();
        assert_eq!(source.info().name, "ep1.mp4");
        assert_eq!(source.info().size, 10);
        assert!(source.info().last_modified.is_some());
    }

    #[tokio::test]
    async fn open_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = UploadSource::open(dir.path().join("missing.mp4")).await;
        assert!(matches!(result, Err(ClientError::Io(_))));
    }

    #[tokio::test]
    async fn chunks_follow_seek() {
        let mut source =
            UploadSource::from_bytes("ep1.mp4", &b"0123456789"[..]).with_content_type("video/mp4");
        assert_eq!(source.info().content_type.as_deref(), Some("video/mp4"));

        source.seek(4).await.unwrap();
        assert_eq!(source.read_chunk(4).await.unwrap(), Bytes::from_static(b"4567"));
        // Short read at the end of the file.
        assert_eq!(source.read_chunk(4).await.unwrap(), Bytes::from_static(b"89"));
        assert!(source.read_chunk(4).await.unwrap().is_empty());
    }
}
