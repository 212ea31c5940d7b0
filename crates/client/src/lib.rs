//! Client side of resumable video uploads.
//!
//! This crate provides:
//! - The tus protocol client (probe, create, chunk, terminate) with retries
//! - The observable in-memory upload state store
//! - Startup reconciliation of the durable ledger against the server
//! - Forward and resumed chunked transfers

pub mod error;
pub mod protocol;
pub mod reconcile;
pub mod state;
pub mod transfer;

pub use error::{ClientError, ClientResult};
pub use protocol::{ProbeOutcome, RetrySchedule, TusClient};
pub use reconcile::{ReconcileReport, Reconciler};
pub use state::{StoreEvent, StoreEventKind, UploadStateStore};
pub use transfer::{TransferExecutor, TransferOutcome, UploadSource};

use reelup_core::ClientConfig;
use reelup_storage::UploadLedger;
use std::sync::Arc;

/// Everything a host application needs, wired from one configuration.
pub struct UploadCore {
    pub store: Arc<UploadStateStore>,
    pub ledger: UploadLedger,
    pub reconciler: Reconciler,
    pub executor: TransferExecutor,
}

impl UploadCore {
    /// Build the components over the configured ledger backend.
    pub async fn from_config(config: &ClientConfig, token: &str) -> ClientResult<Self> {
        config.validate()?;
        let backend = reelup_storage::from_config(&config.ledger).await?;
        let ledger = UploadLedger::new(backend);
        let client = TusClient::new(config, token)?;
        Ok(Self::new(config, client, ledger))
    }

    /// Build the components from an existing client and ledger.
    pub fn new(config: &ClientConfig, client: TusClient, ledger: UploadLedger) -> Self {
        let store = Arc::new(UploadStateStore::new());
        let reconciler = Reconciler::new(ledger.clone(), client.clone(), store.clone());
        let executor = TransferExecutor::new(config, client, ledger.clone(), store.clone());
        Self {
            store,
            ledger,
            reconciler,
            executor,
        }
    }
}
