//! Configuration type definitions.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::Credentials;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Analytical store connection.
    #[serde(default)]
    pub store: StoreConfig,

    /// Default flat file (overridable from the command line).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileConfig>,

    /// Batching and job behaviour.
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// Analytical store configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Store port (default: 8443).
    #[serde(default = "default_store_port")]
    pub port: u16,

    /// Database name (default: "default").
    #[serde(default = "default_name")]
    pub database: String,

    /// Username (default: "default").
    #[serde(default = "default_name")]
    pub username: String,

    /// Access token.
    #[serde(default)]
    pub token: String,

    /// JSON snapshot backing the in-process store. The sample catalog is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_store_port(),
            database: default_name(),
            username: default_name(),
            token: String::new(),
            snapshot: None,
        }
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("token", &"[REDACTED]")
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

impl StoreConfig {
    /// Credentials for connecting the store adapter.
    pub fn credentials(&self) -> Credentials {
        Credentials::Store {
            host: self.host.clone(),
            port: self.port,
            database: self.database.clone(),
            username: self.username.clone(),
            token: self.token.clone(),
        }
    }
}

/// Flat file configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    /// Path to the file.
    pub path: PathBuf,

    /// Field delimiter (default: ",").
    #[serde(default = "default_delimiter")]
    pub delimiter: String,

    /// Whether the first record is a header (default: true).
    #[serde(default = "default_true")]
    pub has_headers: bool,
}

impl FileConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: default_delimiter(),
            has_headers: true,
        }
    }

    /// Delimiter as a single byte. Validation guarantees this is present.
    pub fn delimiter_byte(&self) -> u8 {
        match self.delimiter.as_str() {
            "\\t" | "tab" => b'\t',
            other => other.as_bytes().first().copied().unwrap_or(b','),
        }
    }

    /// Credentials for connecting the file adapter.
    pub fn credentials(&self) -> Credentials {
        Credentials::File {
            path: self.path.clone(),
            delimiter: self.delimiter_byte(),
            has_headers: self.has_headers,
        }
    }
}

/// Batching and job behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Smallest batch the engine will use (default: 100).
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,

    /// Target number of progress updates per job (default: 20).
    #[serde(default = "default_progress_updates")]
    pub progress_updates: u64,

    /// Optional cap on the batch size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_batch_size: Option<usize>,

    /// Rows shown in previews (default: 10).
    #[serde(default = "default_preview_limit")]
    pub preview_limit: usize,

    /// How long reset waits for a cancelled job before aborting it (default: 5000 ms).
    #[serde(default = "default_reset_grace_period_ms")]
    pub reset_grace_period_ms: u64,

    /// Batches of read-ahead between source and target (default: 4).
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            min_batch_size: default_min_batch_size(),
            progress_updates: default_progress_updates(),
            max_batch_size: None,
            preview_limit: default_preview_limit(),
            reset_grace_period_ms: default_reset_grace_period_ms(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

impl IngestConfig {
    pub fn reset_grace_period(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.reset_grace_period_ms)
    }
}

// Default value functions for serde
fn default_host() -> String {
    "localhost".to_string()
}

fn default_store_port() -> u16 {
    8443
}

fn default_name() -> String {
    "default".to_string()
}

fn default_delimiter() -> String {
    ",".to_string()
}

fn default_true() -> bool {
    true
}

fn default_min_batch_size() -> usize {
    100
}

fn default_progress_updates() -> u64 {
    20
}

fn default_preview_limit() -> usize {
    10
}

fn default_reset_grace_period_ms() -> u64 {
    5000
}

fn default_stream_buffer() -> usize {
    4
}
