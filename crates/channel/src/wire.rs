//! JSON frames exchanged with the push server.
//!
//! Every frame is a text message of the form
//! `{"event": "<name>", "data": {...}}`.

use reelup_core::upload::UploadId;
use serde::{Deserialize, Serialize};

/// Payload naming one upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRef {
    pub upload_id: UploadId,
}

/// Frames sent by the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    Subscribe(UploadRef),
    Unsubscribe(UploadRef),
    GetProgress(UploadRef),
}

impl ClientEvent {
    pub fn subscribe(upload_id: &UploadId) -> Self {
        Self::Subscribe(UploadRef {
            upload_id: upload_id.clone(),
        })
    }

    pub fn unsubscribe(upload_id: &UploadId) -> Self {
        Self::Unsubscribe(UploadRef {
            upload_id: upload_id.clone(),
        })
    }

    pub fn get_progress(upload_id: &UploadId) -> Self {
        Self::GetProgress(UploadRef {
            upload_id: upload_id.clone(),
        })
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Progress as reported by the server. Only the id is mandatory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub upload_id: UploadId,
    pub bytes_uploaded: Option<u64>,
    pub bytes_total: Option<u64>,
    pub percentage: Option<f64>,
    pub speed: Option<f64>,
    pub estimated_time_remaining: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedPayload {
    pub upload_id: UploadId,
    pub error: String,
}

/// Connection or protocol level error, not tied to an upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(alias = "error")]
    pub message: String,
}

/// Frames sent by the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Progress(ProgressPayload),
    Completed(UploadRef),
    Failed(FailedPayload),
    Error(ErrorPayload),
    Subscribed(UploadRef),
    Unsubscribed(UploadRef),
}

impl ServerEvent {
    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
