//! Centralized configuration for the relay.
//!
//! `ProtocolConfig` holds the fixed wire constants; `RelayConfig` holds the
//! per-session settings a caller may override.

use crate::platform::paths::default_socket_path;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Protocol constants shared by the relay and the instrumentation peer.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Reserved action asking the peer for the rest of an incomplete result.
    pub const CONTINUATION_ACTION: &'static str = "__continue__";
    /// Result status meaning the command succeeded.
    pub const STATUS_OK: i64 = 0;
    /// Separator between the type tag and the JSON payload of a result frame.
    pub const TAG_SEPARATOR: u8 = b',';

    pub const DEFAULT_READ_CHUNK_SIZE: usize = 8192;
    pub const DEFAULT_MAX_RESULT_BYTES: usize = 64 * 1024 * 1024; // 64MB

    pub const SOCKET_DIR_NAME: &'static str = "instrument-relay";
    pub const SOCKET_FILE_NAME: &'static str = "relay.sock";
}

/// Environment variables read by [`RelayConfig::from_env`].
pub struct RelayEnv;

impl RelayEnv {
    pub const SOCKET: &'static str = "INSTRUMENT_RELAY_SOCKET";
    pub const READ_CHUNK: &'static str = "INSTRUMENT_RELAY_READ_CHUNK";
    pub const MAX_RESULT_BYTES: &'static str = "INSTRUMENT_RELAY_MAX_RESULT_BYTES";
}

/// Settings for one relay session.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Path of the Unix domain socket the peer connects to.
    pub socket_path: PathBuf,
    /// Size of each read from a peer connection.
    pub read_chunk_size: usize,
    /// Upper bound on buffered bytes for a single result.
    pub max_result_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            read_chunk_size: ProtocolConfig::DEFAULT_READ_CHUNK_SIZE,
            max_result_bytes: ProtocolConfig::DEFAULT_MAX_RESULT_BYTES,
        }
    }
}

impl RelayConfig {
    /// Default settings listening on `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Self::default()
        }
    }

    /// Load settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(path) = lookup(RelayEnv::SOCKET).filter(|p| !p.is_empty()) {
            cfg.socket_path = PathBuf::from(path);
        }

        if let Some(n) = parse_size(&lookup, RelayEnv::READ_CHUNK) {
            cfg.read_chunk_size = n;
        }

        if let Some(n) = parse_size(&lookup, RelayEnv::MAX_RESULT_BYTES) {
            cfg.max_result_bytes = n;
        }

        cfg
    }

    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    pub fn with_max_result_bytes(mut self, limit: usize) -> Self {
        self.max_result_bytes = limit;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

fn parse_size(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let raw = lookup(key)?;
    match raw.trim().parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            warn!(variable = key, value = %raw, "Ignoring invalid relay setting");
            None
        }
    }
}
