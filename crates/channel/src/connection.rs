//! Websocket driver task.
//!
//! One driver owns the socket for as long as the channel is in use. It
//! reconnects on the configured schedule, re-sends a subscribe frame for every
//! observed upload after each (re)connect, and applies server events to the
//! upload state store.

use crate::error::{ChannelError, ChannelResult};
use crate::subscriptions::SubscriptionRegistry;
use crate::wire::{ClientEvent, ProgressPayload, ServerEvent};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use reelup_client::UploadStateStore;
use reelup_core::ChannelConfig;
use reelup_core::upload::{ProgressUpdate, UploadId};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Connection lifecycle notifications for host applications.
#[derive(Clone, Debug, PartialEq)]
pub enum ChannelNotice {
    Connected,
    /// The socket dropped; a reconnect follows unless the schedule is spent.
    Disconnected(String),
    /// Waiting `delay` before reconnect attempt `attempt` (1-based).
    Reconnecting { attempt: usize, delay: Duration },
    /// The server sent an `error` frame.
    ServerError(String),
    /// Every reconnect delay was used without reconnecting. Live progress
    /// stops; uploads are unaffected.
    GaveUp,
}

/// Requests from the channel handle to the driver.
#[derive(Debug)]
pub(crate) enum Command {
    Subscribe(UploadId),
    Unsubscribe(UploadId),
    GetProgress(UploadId),
}

enum SessionEnd {
    Cancelled,
    Dropped(String),
}

pub(crate) struct Driver {
    pub(crate) config: ChannelConfig,
    pub(crate) token: String,
    pub(crate) store: Arc<UploadStateStore>,
    pub(crate) registry: Arc<SubscriptionRegistry>,
    pub(crate) notices: broadcast::Sender<ChannelNotice>,
    pub(crate) connected: Arc<AtomicBool>,
    pub(crate) cancel: CancellationToken,
}

impl Driver {
    pub(crate) async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let delays = self.config.reconnect_delays();
        let mut attempt = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.connect().await {
                Ok(stream) => {
                    attempt = 0;
                    info!(url = %self.config.url, "progress channel connected");
                    self.connected.store(true, Ordering::SeqCst);
                    self.notify(ChannelNotice::Connected);

                    let end = self.serve(stream, &mut commands).await;
                    self.connected.store(false, Ordering::SeqCst);
                    match end {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Dropped(reason) => {
                            warn!(reason = %reason, "progress channel disconnected");
                            self.notify(ChannelNotice::Disconnected(reason));
                        }
                    }
                }
                Err(err) => {
                    warn!(attempt, url = %self.config.url, error = %err, "progress channel connect failed");
                }
            }

            let Some(delay) = delays.get(attempt).copied() else {
                error!(
                    attempts = delays.len(),
                    url = %self.config.url,
                    "progress channel reconnect attempts exhausted"
                );
                self.notify(ChannelNotice::GaveUp);
                break;
            };
            attempt += 1;
            self.notify(ChannelNotice::Reconnecting { attempt, delay });

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        debug!("progress channel driver stopped");
    }

    async fn connect(&self) -> ChannelResult<WsStream> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::Connection(format!("invalid channel url: {e}")))?;
        let value = HeaderValue::from_str(&format!("Bearer {}", self.token))
            .map_err(|e| ChannelError::Connection(format!("invalid bearer token: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);

        let connect_timeout = self.config.connect_timeout();
        match timeout(connect_timeout, connect_async(request)).await {
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(err)) => Err(ChannelError::Connection(format!("connect failed: {err}"))),
            Err(_) => Err(ChannelError::Connection(format!(
                "connect timed out after {connect_timeout:?}"
            ))),
        }
    }

    async fn serve(
        &self,
        stream: WsStream,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> SessionEnd {
        let (mut write, mut read) = stream.split();
        let mut sent: HashSet<UploadId> = HashSet::new();

        for upload_id in self.registry.ids() {
            if let Err(err) = send_event(&mut write, &ClientEvent::subscribe(&upload_id)).await {
                return SessionEnd::Dropped(err.to_string());
            }
            sent.insert(upload_id);
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Cancelled;
                    };
                    if let Err(err) = self.dispatch(&mut write, &mut sent, command).await {
                        return SessionEnd::Dropped(err.to_string());
                    }
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => self.apply_frame(&text),
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                        return SessionEnd::Dropped(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return SessionEnd::Dropped(format!("read failed: {err}")),
                    None => return SessionEnd::Dropped("stream ended".to_string()),
                }
            }
        }
    }

    async fn dispatch(
        &self,
        write: &mut WsSink,
        sent: &mut HashSet<UploadId>,
        command: Command,
    ) -> ChannelResult<()> {
        match command {
            Command::Subscribe(upload_id) => {
                // Already covered by the resubscribe pass, or released again
                // before the driver got to it.
                if sent.contains(&upload_id) || self.registry.count(&upload_id) == 0 {
                    return Ok(());
                }
                send_event(write, &ClientEvent::subscribe(&upload_id)).await?;
                sent.insert(upload_id);
            }
            Command::Unsubscribe(upload_id) => {
                if self.registry.count(&upload_id) > 0 || !sent.remove(&upload_id) {
                    return Ok(());
                }
                send_event(write, &ClientEvent::unsubscribe(&upload_id)).await?;
            }
            Command::GetProgress(upload_id) => {
                send_event(write, &ClientEvent::get_progress(&upload_id)).await?;
            }
        }
        Ok(())
    }

    fn apply_frame(&self, text: &str) {
        let event = match ServerEvent::decode(text) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "ignoring undecodable progress channel frame");
                return;
            }
        };
        self.apply(event);
    }

    fn apply(&self, event: ServerEvent) {
        match event {
            ServerEvent::Progress(payload) => {
                let upload_id = payload.upload_id.clone();
                let Some(update) = self.merge_progress(payload) else {
                    debug!(upload_id = %upload_id, "progress for unknown upload");
                    return;
                };
                self.store.progress(&upload_id, update);
            }
            ServerEvent::Completed(reference) => {
                self.store.complete(&reference.upload_id);
            }
            ServerEvent::Failed(payload) => {
                warn!(upload_id = %payload.upload_id, error = %payload.error, "server reported upload failure");
                self.store.error(&payload.upload_id, payload.error);
            }
            ServerEvent::Error(payload) => {
                warn!(message = %payload.message, "progress channel server error");
                self.notify(ChannelNotice::ServerError(payload.message));
            }
            ServerEvent::Subscribed(reference) => {
                debug!(upload_id = %reference.upload_id, "subscription acknowledged");
            }
            ServerEvent::Unsubscribed(reference) => {
                debug!(upload_id = %reference.upload_id, "unsubscription acknowledged");
            }
        }
    }

    /// Fill fields the server left out from the current record.
    fn merge_progress(&self, payload: ProgressPayload) -> Option<ProgressUpdate> {
        let record = self.store.get(&payload.upload_id)?;
        let bytes_total = payload
            .bytes_total
            .filter(|total| *total > 0)
            .unwrap_or(record.bytes_total);

        let bytes_uploaded = match (payload.bytes_uploaded, payload.percentage) {
            (Some(bytes), _) => bytes,
            (None, Some(percentage)) => {
                let fraction = percentage.clamp(0.0, 100.0) / 100.0;
                (fraction * bytes_total as f64).round() as u64
            }
            (None, None) => record.bytes_uploaded,
        };

        let percentage = payload.percentage.unwrap_or_else(|| {
            if bytes_total == 0 {
                0.0
            } else {
                bytes_uploaded as f64 * 100.0 / bytes_total as f64
            }
        });

        Some(ProgressUpdate {
            bytes_uploaded,
            bytes_total,
            percentage,
            speed: payload.speed.unwrap_or(record.speed),
            estimated_time_remaining: payload
                .estimated_time_remaining
                .unwrap_or(record.estimated_time_remaining),
        })
    }

    fn notify(&self, notice: ChannelNotice) {
        // No receivers is fine.
        let _ = self.notices.send(notice);
    }
}

async fn send_event(write: &mut WsSink, event: &ClientEvent) -> ChannelResult<()> {
    let json = event
        .encode()
        .map_err(|e| ChannelError::Protocol(format!("failed to encode frame: {e}")))?;
    write
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| ChannelError::Connection(format!("send failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reelup_core::upload::{FileInfo, Metadata, UploadStatus};

    fn driver(store: Arc<UploadStateStore>) -> Driver {
        let (notices, _) = broadcast::channel(8);
        Driver {
            config: ChannelConfig::default(),
            token: "token".into(),
            store,
            registry: Arc::new(SubscriptionRegistry::new()),
            notices,
            connected: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    fn uploading(store: &UploadStateStore, id: &str) -> UploadId {
        let upload_id = UploadId::new(id);
        store.start(
            upload_id.clone(),
            Some(format!("http://localhost/files/{id}")),
            FileInfo::new("ep1.mp4", 1000),
            Metadata::new(),
            1,
        );
        upload_id
    }

    #[test]
    fn percentage_only_progress_derives_bytes() {
        let store = Arc::new(UploadStateStore::new());
        let id = uploading(&store, "x");
        let driver = driver(store.clone());

        driver.apply_frame(r#"{"event":"progress","data":{"uploadId":"x","percentage":10}}"#);

        let record = store.get(&id).unwrap();
        assert_eq!(record.bytes_uploaded, 100);
        assert_eq!(record.bytes_total, 1000);
        assert_eq!(record.percentage, 10.0);
    }

    #[test]
    fn failure_is_terminal_for_later_progress() {
        let store = Arc::new(UploadStateStore::new());
        let id = uploading(&store, "x");
        let driver = driver(store.clone());

        driver.apply_frame(r#"{"event":"progress","data":{"uploadId":"x","percentage":10}}"#);
        driver.apply_frame(r#"{"event":"failed","data":{"uploadId":"x","error":"disk full"}}"#);
        driver.apply_frame(r#"{"event":"progress","data":{"uploadId":"x","percentage":50}}"#);

        let record = store.get(&id).unwrap();
        assert_eq!(record.status, UploadStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("disk full"));
        assert_eq!(record.bytes_uploaded, 100);
    }

    #[test]
    fn server_error_becomes_notice() {
        let store = Arc::new(UploadStateStore::new());
        let driver = driver(store);
        let mut notices = driver.notices.subscribe();

        driver.apply_frame(r#"{"event":"error","data":{"message":"unauthorized"}}"#);
        assert_eq!(
            notices.try_recv().unwrap(),
            ChannelNotice::ServerError("unauthorized".into())
        );
    }

    #[test]
    fn unknown_upload_and_garbage_are_ignored() {
        let store = Arc::new(UploadStateStore::new());
        let driver = driver(store.clone());

        driver.apply_frame(r#"{"event":"progress","data":{"uploadId":"nope","percentage":10}}"#);
        driver.apply_frame("not json");
        driver.apply_frame(r#"{"event":"completed","data":{"uploadId":"nope"}}"#);
        assert!(store.is_empty());
    }
}
