//! Server configuration
//!
//! Defaults match the classic deployment (port 12345, database under
//! `data/`). A JSON file can override any subset of fields; command-line
//! flags are applied on top of that in `main`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Default listen address
pub const DEFAULT_ADDR: &str = "0.0.0.0:12345";

/// Default database file
pub const DEFAULT_DB_PATH: &str = "data/chat_server.db";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub bind_addr: String,
    /// SQLite database file
    pub db_path: PathBuf,
    /// Whether a sender receives its own broadcast
    pub echo_to_sender: bool,
    /// Bad first lines tolerated before the connection is closed
    pub max_handshake_failures: u32,
    /// Seconds without a line before the connection is closed; 0 disables
    pub idle_timeout_secs: u64,
    /// Per-session outbound buffer, in messages
    pub outbound_buffer: usize,
    /// Persistence queue capacity, in records
    pub persistence_queue: usize,
    /// Longest accepted line, excluding the terminator
    pub max_line_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_ADDR.to_string(),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            echo_to_sender: true,
            max_handshake_failures: 3,
            idle_timeout_secs: 600,
            outbound_buffer: 64,
            persistence_queue: 1024,
            max_line_bytes: 8192,
        }
    }
}

impl ServerConfig {
    /// Load from a JSON file; missing fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}
