//! Handle used by host applications to observe uploads over the push channel.

use crate::connection::{ChannelNotice, Command, Driver};
use crate::error::{ChannelError, ChannelResult};
use crate::subscriptions::SubscriptionRegistry;
use reelup_client::UploadStateStore;
use reelup_core::ChannelConfig;
use reelup_core::upload::UploadId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

const NOTICE_CAPACITY: usize = 64;

struct DriverHandle {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Live progress channel.
///
/// The socket is opened lazily by the first `subscribe` and shared by every
/// observer. Server events land in the upload state store; connection state
/// is reported through [`ProgressChannel::notices`].
pub struct ProgressChannel {
    config: ChannelConfig,
    store: Arc<UploadStateStore>,
    registry: Arc<SubscriptionRegistry>,
    token: Mutex<Option<String>>,
    driver: Mutex<Option<DriverHandle>>,
    notices: broadcast::Sender<ChannelNotice>,
    connected: Arc<AtomicBool>,
}

impl ProgressChannel {
    pub fn new(config: ChannelConfig, store: Arc<UploadStateStore>) -> ChannelResult<Self> {
        config.validate()?;
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Ok(Self {
            config,
            store,
            registry: Arc::new(SubscriptionRegistry::new()),
            token: Mutex::new(None),
            driver: Mutex::new(None),
            notices,
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    fn lock_token(&self) -> MutexGuard<'_, Option<String>> {
        self.token.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("token Mutex was poisoned, recovering with into_inner()");
            poisoned.into_inner()
        })
    }

    fn lock_driver(&self) -> MutexGuard<'_, Option<DriverHandle>> {
        self.driver.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("driver Mutex was poisoned, recovering with into_inner()");
            poisoned.into_inner()
        })
    }

    /// Supply the bearer token used for the handshake.
    ///
    /// A new token takes effect on the next connection.
    pub fn init(&self, token: impl Into<String>) {
        *self.lock_token() = Some(token.into());
    }

    /// Start observing an upload.
    ///
    /// Must be called inside a tokio runtime. Connects on first use, and
    /// again after the driver gave up.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub fn subscribe(&self, upload_id: &UploadId) -> ChannelResult<()> {
        let token = self.lock_token().clone().ok_or(ChannelError::NotInitialized)?;

        let first = self.registry.acquire(upload_id);
        let mut driver = self.lock_driver();
        let handle = self.ensure_driver(&mut driver, token);
        if first {
            send_command(handle, Command::Subscribe(upload_id.clone()));
        }
        Ok(())
    }

    /// Stop observing an upload. The server is told only when the last
    /// observer leaves; returns `true` in that case.
    #[instrument(skip(self), fields(upload_id = %upload_id))]
    pub fn unsubscribe(&self, upload_id: &UploadId) -> bool {
        if !self.registry.release(upload_id) {
            return false;
        }
        if let Some(handle) = self.lock_driver().as_ref() {
            send_command(handle, Command::Unsubscribe(upload_id.clone()));
        }
        true
    }

    /// Ask the server to push the current progress of an upload.
    pub fn request_progress(&self, upload_id: &UploadId) -> ChannelResult<()> {
        let token = self.lock_token().clone().ok_or(ChannelError::NotInitialized)?;
        let mut driver = self.lock_driver();
        self.ensure_driver(&mut driver, token)
            .commands
            .send(Command::GetProgress(upload_id.clone()))
            .map_err(|_| ChannelError::Closed)
    }

    /// Connection lifecycle notifications.
    pub fn notices(&self) -> broadcast::Receiver<ChannelNotice> {
        self.notices.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Observers currently registered for an upload.
    pub fn subscription_count(&self, upload_id: &UploadId) -> usize {
        self.registry.count(upload_id)
    }

    /// Close the socket and forget every subscription. Safe to call more
    /// than once.
    pub async fn teardown(&self) {
        let handle = self.lock_driver().take();
        self.registry.clear();

        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(err) = handle.task.await {
                debug!(error = %err, "progress channel driver ended abnormally");
            }
            info!("progress channel torn down");
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Return the running driver, spawning one if none is alive.
    fn ensure_driver<'a>(
        &self,
        driver: &'a mut Option<DriverHandle>,
        token: String,
    ) -> &'a DriverHandle {
        if driver.as_ref().is_some_and(|handle| handle.task.is_finished()) {
            *driver = None;
        }
        driver.get_or_insert_with(|| self.spawn_driver(token))
    }

    fn spawn_driver(&self, token: String) -> DriverHandle {
        let (commands, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let driver = Driver {
            config: self.config.clone(),
            token,
            store: self.store.clone(),
            registry: self.registry.clone(),
            notices: self.notices.clone(),
            connected: self.connected.clone(),
            cancel: cancel.clone(),
        };
        debug!(url = %self.config.url, "spawning progress channel driver");
        let task = tokio::spawn(driver.run(receiver));
        DriverHandle {
            commands,
            cancel,
            task,
        }
    }
}

impl Drop for ProgressChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_driver().take() {
            handle.cancel.cancel();
        }
    }
}

fn send_command(handle: &DriverHandle, command: Command) {
    if let Err(err) = handle.commands.send(command) {
        debug!(command = ?err.0, "progress channel driver is gone");
    }
}
