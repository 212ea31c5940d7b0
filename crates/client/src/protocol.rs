//! Resumable-upload protocol client (tus 1.0).
//!
//! Every request carries the bearer token and the `Tus-Resumable` version
//! header. Creation, chunk and termination requests go through a
//! `RetrySchedule`; status probes are never retried because the reconciler
//! treats any inconclusive probe as "keep the entry".

use crate::error::{ClientError, ClientResult};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use reelup_core::ClientConfig;
use reelup_core::upload::Metadata;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use url::Url;

pub const TUS_RESUMABLE: &str = "Tus-Resumable";
pub const UPLOAD_OFFSET: &str = "Upload-Offset";
pub const UPLOAD_LENGTH: &str = "Upload-Length";
pub const UPLOAD_METADATA: &str = "Upload-Metadata";
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// Result of a status probe against a session URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The server reported both offset and length.
    Offsets { offset: u64, length: u64 },
    /// Success, but without usable offset/length headers.
    MissingOffsets,
    /// Any non-success status other than 412.
    Gone(u16),
    /// 412 or a transport failure. The session may still be alive.
    Indeterminate(String),
}

/// Delays between retries of a transient failure.
///
/// The first attempt is immediate; after the n-th transient failure the
/// schedule waits `delays[n]` before trying again. Once the delays run out
/// the failure is surfaced as `TransientTransport`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetrySchedule {
    delays: Vec<Duration>,
}

impl RetrySchedule {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn from_millis(delays_ms: &[u64]) -> Self {
        Self::new(delays_ms.iter().map(|ms| Duration::from_millis(*ms)).collect())
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::default()
    }

    /// Maximum number of attempts.
    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Run `make_request` until it produces a non-5xx response.
    ///
    /// Transport errors and 5xx responses are retried; any other response
    /// (including 4xx) is returned as is. Cancelling `cancel` stops further
    /// retries but never aborts a request already on the wire.
    pub async fn run<F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut make_request: F,
    ) -> ClientResult<Response>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = reqwest::Result<Response>>,
    {
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }

            let failure = match make_request().await {
                Ok(response) if response.status().is_server_error() => {
                    format!("server error ({})", response.status())
                }
                Ok(response) => return Ok(response),
                Err(err) => format!("request error ({err})"),
            };

            let Some(delay) = self.delays.get(attempt).copied() else {
                return Err(ClientError::TransientTransport {
                    attempts: attempt + 1,
                    message: failure,
                });
            };
            attempt += 1;

            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "{failure}, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Client for one resumable-upload server.
#[derive(Clone)]
pub struct TusClient {
    http: reqwest::Client,
    endpoint: Url,
    token: String,
    version: String,
    retry: RetrySchedule,
}

impl TusClient {
    /// Create a client for the configured creation endpoint.
    pub fn new(config: &ClientConfig, token: &str) -> ClientResult<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| ClientError::InvalidSessionUrl(format!("{}: {e}", config.endpoint)))?;
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint,
            token: token.to_string(),
            version: config.protocol_version.clone(),
            retry: RetrySchedule::new(config.retry_delays()),
        })
    }

    /// Replace the retry schedule.
    pub fn with_retry(mut self, retry: RetrySchedule) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn retry_schedule(&self) -> &RetrySchedule {
        &self.retry
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.token)
            .header(TUS_RESUMABLE, &self.version)
    }

    fn session(url: &str) -> ClientResult<Url> {
        Url::parse(url).map_err(|e| ClientError::InvalidSessionUrl(format!("{url}: {e}")))
    }

    /// Ask the server how far a session got (HEAD).
    #[instrument(skip(self), fields(session_url = %url))]
    pub async fn probe(&self, url: &str) -> ProbeOutcome {
        let target = match Self::session(url) {
            Ok(target) => target,
            Err(err) => return ProbeOutcome::Indeterminate(err.to_string()),
        };

        let response = match self
            .request(Method::HEAD, target)
            .header("Cache-Control", "no-store")
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(error = %err, "probe request failed");
                return ProbeOutcome::Indeterminate(err.to_string());
            }
        };

        let status = response.status();
        if status == StatusCode::PRECONDITION_FAILED {
            return ProbeOutcome::Indeterminate(format!("precondition failed ({status})"));
        }
        if !status.is_success() {
            return ProbeOutcome::Gone(status.as_u16());
        }

        match (
            header_u64(&response, UPLOAD_OFFSET),
            header_u64(&response, UPLOAD_LENGTH),
        ) {
            (Some(offset), Some(length)) => ProbeOutcome::Offsets { offset, length },
            _ => ProbeOutcome::MissingOffsets,
        }
    }

    /// Create a session for `length` bytes and return its absolute URL.
    #[instrument(skip(self, metadata), fields(endpoint = %self.endpoint))]
    pub async fn create(&self, length: u64, metadata: &Metadata) -> ClientResult<String> {
        let encoded = encode_metadata_header(metadata);
        let response = self
            .retry
            .run(&CancellationToken::new(), || {
                let mut req = self
                    .request(Method::POST, self.endpoint.clone())
                    .header(UPLOAD_LENGTH, length.to_string());
                if !encoded.is_empty() {
                    req = req.header(UPLOAD_METADATA, encoded.as_str());
                }
                req.send()
            })
            .await?;

        let response = check_status(response).await?;
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ClientError::Protocol("creation response without Location".into()))?;
        let session = self
            .endpoint
            .join(location)
            .map_err(|e| ClientError::InvalidSessionUrl(format!("{location}: {e}")))?;

        tracing::debug!(session_url = %session, "created upload session");
        Ok(session.to_string())
    }

    /// Send one chunk starting at `offset`; returns the acknowledged offset.
    pub async fn patch(&self, url: &str, offset: u64, data: Bytes) -> ClientResult<u64> {
        self.patch_cancellable(url, offset, data, &CancellationToken::new())
            .await
    }

    /// `patch`, but retries stop once `cancel` fires.
    #[instrument(skip(self, data, cancel), fields(session_url = %url, len = data.len()))]
    pub async fn patch_cancellable(
        &self,
        url: &str,
        offset: u64,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> ClientResult<u64> {
        let target = Self::session(url)?;
        let response = self
            .retry
            .run(cancel, || {
                self.request(Method::PATCH, target.clone())
                    .header(UPLOAD_OFFSET, offset.to_string())
                    .header(reqwest::header::CONTENT_TYPE, OFFSET_OCTET_STREAM)
                    .body(data.clone())
                    .send()
            })
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(ClientError::StaleSession {
                session_url: url.to_string(),
                reason: format!("server returned {status}"),
            });
        }

        let response = check_status(response).await?;
        header_u64(&response, UPLOAD_OFFSET).ok_or_else(|| {
            ClientError::Protocol(format!("chunk response without {UPLOAD_OFFSET}"))
        })
    }

    /// Delete a session. Already-gone sessions count as deleted.
    #[instrument(skip(self), fields(session_url = %url))]
    pub async fn terminate(&self, url: &str) -> ClientResult<()> {
        let target = Self::session(url)?;
        let response = self
            .retry
            .run(&CancellationToken::new(), || {
                self.request(Method::DELETE, target.clone()).send()
            })
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            tracing::debug!(%status, "session already gone");
            return Ok(());
        }
        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: Response) -> ClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::PRECONDITION_FAILED {
        return Err(ClientError::PreconditionConflict(body));
    }
    Err(ClientError::Rejected {
        status: status.as_u16(),
        body,
    })
}

fn header_u64(response: &Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// `Upload-Metadata` value: comma-separated `key base64(value)` pairs.
pub fn encode_metadata_header(metadata: &Metadata) -> String {
    metadata
        .iter()
        .map(|(key, value)| format!("{key} {}", general_purpose::STANDARD.encode(value)))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_header_encoding() {
        let mut metadata = Metadata::new();
        metadata.insert("filename".into(), "ep1.mp4".into());
        metadata.insert("episode".into(), "3".into());
        assert_eq!(
            encode_metadata_header(&metadata),
            "episode Mw==,filename ZXAxLm1wNA=="
        );
        assert_eq!(encode_metadata_header(&Metadata::new()), "");
    }

    #[test]
    fn retry_schedule_from_config() {
        let config = ClientConfig::default();
        let client = TusClient::new(&config, "token").unwrap();
        let schedule = client.retry_schedule();
        assert_eq!(schedule.delays(), config.retry_delays().as_slice());
        assert_eq!(schedule.max_attempts(), 5);
        assert_eq!(schedule.delays()[0], Duration::ZERO);
        assert_eq!(schedule.delays()[3], Duration::from_secs(5));
        assert_eq!(RetrySchedule::none().max_attempts(), 1);
    }

    #[test]
    fn client_rejects_invalid_endpoint() {
        let config = ClientConfig {
            endpoint: "not a url".into(),
            ..ClientConfig::default()
        };
        assert!(matches!(
            TusClient::new(&config, "token"),
            Err(ClientError::InvalidSessionUrl(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_schedule_does_not_send() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut calls = 0;
        let result = RetrySchedule::from_millis(&[0, 0])
            .run(&cancel, || {
                calls += 1;
                reqwest::Client::new().get("http://127.0.0.1:9/").send()
            })
            .await;
        assert!(matches!(result, Err(ClientError::Cancelled)));
        assert_eq!(calls, 0);
    }
}
