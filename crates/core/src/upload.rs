//! Upload record types and lifecycle.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;
use url::Url;

/// Arbitrary key-value metadata needed to finalize the server-side
/// association of an upload (target entity, episode number, title, ...).
pub type Metadata = BTreeMap<String, String>;

/// Opaque upload identifier.
///
/// The identifier is assigned by the resumable-upload server: it is the
/// trailing path segment of the session URL.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadId(String);

impl UploadId {
    /// Wrap an identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the upload ID from the trailing path segment of a session URL.
    pub fn from_session_url(session_url: &str) -> crate::Result<Self> {
        let url = Url::parse(session_url)
            .map_err(|e| crate::Error::InvalidSessionUrl(format!("{session_url}: {e}")))?;

        url.path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
            .map(|segment| Self(segment.to_string()))
            .ok_or_else(|| {
                crate::Error::InvalidSessionUrl(format!("{session_url}: no trailing path segment"))
            })
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UploadId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Upload record status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Known locally, no resumable session yet.
    Pending,
    /// Bytes are being transferred.
    Uploading,
    /// A session exists but no transfer is running.
    Paused,
    /// The server acknowledged every byte.
    Completed,
    /// The transfer failed for good.
    Failed,
}

impl UploadStatus {
    /// Check if the record may still change status.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Check if the record reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Description of the file being uploaded.
///
/// Only the description survives a reload; the bytes themselves must be
/// supplied again by the user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    /// File name as chosen by the user.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// MIME type, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Last modification time in epoch milliseconds, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<u64>,
}

impl FileInfo {
    /// Describe a file by name and size only.
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            content_type: None,
            last_modified: None,
        }
    }

    /// Stable content descriptor used in ledger keys.
    ///
    /// The same file selected again against the same endpoint yields the same
    /// descriptor, which is what lets previous sessions be found.
    pub fn content_descriptor(&self, endpoint: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0]);
        hasher.update(self.size.to_be_bytes());
        hasher.update(self.last_modified.unwrap_or_default().to_be_bytes());
        hasher.update(self.content_type.as_deref().unwrap_or_default().as_bytes());
        hasher.update([0]);
        hasher.update(endpoint.as_bytes());
        let digest = hasher.finalize();

        let hex: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
        format!("reelup-{hex}")
    }
}

/// One progress observation for an upload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub bytes_uploaded: u64,
    pub bytes_total: u64,
    /// 0 to 100.
    pub percentage: f64,
    /// Bytes per second.
    pub speed: f64,
    /// Seconds.
    pub estimated_time_remaining: f64,
}

/// In-memory state of one upload, owned by the upload state store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub upload_id: UploadId,
    pub status: UploadStatus,
    /// Resumable-upload session endpoint, once a session exists.
    pub session_url: Option<String>,
    pub file: FileInfo,
    pub metadata: Metadata,
    pub bytes_uploaded: u64,
    pub bytes_total: u64,
    pub percentage: f64,
    pub speed: f64,
    pub estimated_time_remaining: f64,
    /// Epoch milliseconds when the transfer began.
    pub start_time: u64,
    /// Set only when `status` is `Failed`.
    pub error: Option<String>,
}

impl UploadRecord {
    /// Create a record with zeroed progress.
    pub fn new(
        upload_id: UploadId,
        status: UploadStatus,
        session_url: Option<String>,
        file: FileInfo,
        metadata: Metadata,
        start_time: u64,
    ) -> Self {
        let bytes_total = file.size;
        Self {
            upload_id,
            status,
            session_url,
            file,
            metadata,
            bytes_uploaded: 0,
            bytes_total,
            percentage: 0.0,
            speed: 0.0,
            estimated_time_remaining: 0.0,
            start_time,
            error: None,
        }
    }

    /// Check if the record can be resumed with a freshly supplied file.
    pub fn is_resumable(&self) -> bool {
        self.status == UploadStatus::Paused && self.has_session()
    }

    /// Check if a non-empty session URL is attached.
    pub fn has_session(&self) -> bool {
        self.session_url.as_deref().is_some_and(|url| !url.is_empty())
    }

    /// Current progress fields as one value.
    pub fn progress(&self) -> ProgressUpdate {
        ProgressUpdate {
            bytes_uploaded: self.bytes_uploaded,
            bytes_total: self.bytes_total,
            percentage: self.percentage,
            speed: self.speed,
            estimated_time_remaining: self.estimated_time_remaining,
        }
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> u64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000).unwrap_or_default()
}
