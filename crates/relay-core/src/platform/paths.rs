//! Socket endpoint path utilities.
//!
//! The endpoint is recreated on every start: a stale socket file left behind
//! by a previous run is removed and the parent directory is ensured.

use crate::config::ProtocolConfig;
use crate::error::{RelayError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Get the well-known socket path used when none is configured.
///
/// # Platform Behavior
/// - **Linux**: `$XDG_RUNTIME_DIR/instrument-relay/relay.sock`
/// - **Elsewhere / no runtime dir**: `$TMPDIR/instrument-relay/relay.sock`
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(ProtocolConfig::SOCKET_DIR_NAME)
        .join(ProtocolConfig::SOCKET_FILE_NAME)
}

/// Make `path` ready to bind: remove any stale file and create its parent.
pub async fn prepare_socket_path(path: &Path) -> Result<()> {
    remove_socket_file(path).await?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RelayError::io_with_path(e, parent))?;
    }

    Ok(())
}

/// Remove the socket file at `path`. A missing file is not an error.
pub async fn remove_socket_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(socket = %path.display(), "Removed socket file");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RelayError::io_with_path(e, path)),
    }
}
