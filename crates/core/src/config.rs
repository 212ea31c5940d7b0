//! Client configuration.
//!
//! Loaded from an optional TOML file merged with `REELUP_`-prefixed
//! environment variables (nested keys separated by `__`, e.g.
//! `REELUP_CHANNEL__URL`). The bearer token is deliberately absent: it is
//! handed to the transfer client and the progress channel at runtime.

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resumable-upload protocol version sent in `Tus-Resumable`.
pub const DEFAULT_PROTOCOL_VERSION: &str = "1.0.0";

/// Top-level client configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Session creation endpoint of the resumable-upload server.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Protocol version header value.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Bytes per PATCH request.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Delays between attempts of a transfer request, in milliseconds.
    /// One retry per entry.
    #[serde(default = "default_retry_delays_ms")]
    pub retry_delays_ms: Vec<u64>,
    /// Where ledger entries are persisted.
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Progress push channel.
    #[serde(default)]
    pub channel: ChannelConfig,
}

/// Persisted ledger backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LedgerConfig {
    /// In-process only; sessions do not survive a restart.
    Memory,
    /// A single JSON document on local disk.
    Filesystem {
        /// Path of the ledger document.
        path: PathBuf,
    },
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/ledger.json"),
        }
    }
}

/// Progress channel configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Websocket URL of the push server.
    #[serde(default = "default_channel_url")]
    pub url: String,
    /// Delays before each reconnect attempt, in milliseconds. The channel
    /// gives up once every delay has been used without reconnecting.
    #[serde(default = "default_reconnect_delays_ms")]
    pub reconnect_delays_ms: Vec<u64>,
    /// Handshake timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: default_channel_url(),
            reconnect_delays_ms: default_reconnect_delays_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Minimum number of reconnect attempts the channel must make.
pub const MIN_RECONNECT_ATTEMPTS: usize = 3;

fn default_endpoint() -> String {
    "http://127.0.0.1:1080/files/".to_string()
}

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}

fn default_chunk_size() -> u64 {
    crate::DEFAULT_CHUNK_SIZE
}

fn default_retry_delays_ms() -> Vec<u64> {
    vec![0, 1000, 3000, 5000]
}

fn default_channel_url() -> String {
    "ws://127.0.0.1:3001/uploads".to_string()
}

fn default_reconnect_delays_ms() -> Vec<u64> {
    vec![1000, 2000, 5000]
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            protocol_version: default_protocol_version(),
            chunk_size: default_chunk_size(),
            retry_delays_ms: default_retry_delays_ms(),
            ledger: LedgerConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from an optional TOML file and the environment.
    ///
    /// A missing file is not an error; defaults fill whatever the environment
    /// does not set.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = path
            && path.exists()
        {
            figment = figment.merge(Toml::file(path));
        }

        let config: ClientConfig = figment
            .merge(Env::prefixed("REELUP_").split("__"))
            .extract()
            .map_err(|e| crate::Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> crate::Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(crate::Error::Config("endpoint must not be empty".into()));
        }
        if self.chunk_size == 0 {
            return Err(crate::Error::Config("chunk_size must be positive".into()));
        }
        self.channel.validate()
    }

    /// Retry delays as durations.
    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }
}

impl ChannelConfig {
    /// Validate the reconnect schedule: at least three attempts, each delay
    /// non-zero and no shorter than the one before.
    pub fn validate(&self) -> crate::Result<()> {
        if self.url.trim().is_empty() {
            return Err(crate::Error::Config("channel.url must not be empty".into()));
        }
        if self.reconnect_delays_ms.len() < MIN_RECONNECT_ATTEMPTS {
            return Err(crate::Error::Config(format!(
                "channel.reconnect_delays_ms needs at least {MIN_RECONNECT_ATTEMPTS} entries"
            )));
        }
        if self.reconnect_delays_ms.contains(&0) {
            return Err(crate::Error::Config(
                "channel.reconnect_delays_ms entries must be non-zero".into(),
            ));
        }
        if self.reconnect_delays_ms.windows(2).any(|w| w[1] < w[0]) {
            return Err(crate::Error::Config(
                "channel.reconnect_delays_ms must not decrease".into(),
            ));
        }
        Ok(())
    }

    /// Reconnect delays as durations.
    pub fn reconnect_delays(&self) -> Vec<Duration> {
        self.reconnect_delays_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }

    /// Handshake timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ClientConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry_delays_ms, vec![0, 1000, 3000, 5000]);
        assert_eq!(config.protocol_version, "1.0.0");
        assert_eq!(config.retry_delays()[2], Duration::from_secs(3));
    }

    #[test]
    fn reconnect_schedule_rules() {
        let mut channel = ChannelConfig {
            reconnect_delays_ms: vec![100, 200],
            ..ChannelConfig::default()
        };
        assert!(channel.validate().is_err());

        channel.reconnect_delays_ms = vec![0, 100, 200];
        assert!(channel.validate().is_err());

        channel.reconnect_delays_ms = vec![300, 100, 200];
        assert!(channel.validate().is_err());

        channel.reconnect_delays_ms = vec![100, 100, 200];
        channel.validate().unwrap();
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let config = ClientConfig {
            chunk_size: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.chunk_size, crate::DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn load_reads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reelup.toml");
        std::fs::write(
            &path,
            r#"
endpoint = "https://up.example.com/files/"
chunk_size = 1024
retry_delays_ms = [0, 10]

[ledger]
type = "memory"

[channel]
url = "wss://push.example.com/uploads"
reconnect_delays_ms = [10, 20, 40]
"#,
        )
        .unwrap();

        let config = ClientConfig::load(Some(&path)).unwrap();
        assert_eq!(config.endpoint, "https://up.example.com/files/");
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.retry_delays_ms, vec![0, 10]);
        assert!(matches!(config.ledger, LedgerConfig::Memory));
        assert_eq!(config.channel.url, "wss://push.example.com/uploads");
        assert_eq!(config.channel.connect_timeout_ms, 10_000);
    }

    #[test]
    fn load_rejects_invalid_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reelup.toml");
        std::fs::write(&path, "[channel]\nreconnect_delays_ms = [5]\n").unwrap();

        assert!(matches!(
            ClientConfig::load(Some(&path)),
            Err(crate::Error::Config(_))
        ));
    }
}
