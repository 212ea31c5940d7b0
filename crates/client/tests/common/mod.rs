#![allow(dead_code)]

use httpmock::MockServer;
use reelup_client::{RetrySchedule, TusClient, UploadCore};
use reelup_core::upload::Metadata;
use reelup_core::{ClientConfig, LedgerConfig};
use reelup_storage::{KeyValueStore, MemoryStore, UploadLedger};
use std::net::TcpListener;
use std::sync::Arc;

pub const TOKEN: &str = "secret-token";

pub fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

/// Client configuration pointed at `server`, with tiny chunks and
/// millisecond retries.
pub fn config_for(server: &MockServer) -> ClientConfig {
    ClientConfig {
        endpoint: server.url("/files/"),
        chunk_size: 400,
        retry_delays_ms: vec![0, 1, 1],
        ledger: LedgerConfig::Memory,
        ..ClientConfig::default()
    }
}

pub fn client_for(server: &MockServer) -> TusClient {
    TusClient::new(&config_for(server), TOKEN)
        .unwrap()
        .with_retry(RetrySchedule::from_millis(&[0, 1, 1]))
}

/// Components over an in-memory ledger the test can inspect.
pub fn core_for(server: &MockServer) -> (UploadCore, Arc<MemoryStore>) {
    let backend = Arc::new(MemoryStore::new());
    let ledger = UploadLedger::new(backend.clone());
    let core = UploadCore::new(&config_for(server), client_for(server), ledger);
    (core, backend)
}

/// Persisted ledger value for a session on `server`.
pub fn entry_json(server: &MockServer, size: u64, upload_id: &str) -> String {
    serde_json::json!({
        "size": size,
        "metadata": {"filename": "ZXAxLm1wNA==", "movieId": "NDI="},
        "creationTime": "2024-05-01T10:00:00Z",
        "uploadUrl": server.url(format!("/files/{upload_id}")),
    })
    .to_string()
}

pub async fn seed_ledger(backend: &MemoryStore, key: &str, value: String) {
    backend.set(key, value).await.unwrap();
}

pub fn metadata() -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("movieId".into(), "42".into());
    metadata
}

/// Deterministic ASCII payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'a' + (i % 26) as u8).collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
