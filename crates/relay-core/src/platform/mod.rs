//! Platform abstraction layer.
//!
//! All filesystem handling of the socket endpoint lives here so the session
//! and connection code only ever see a prepared path.
//!
//! # Supported Platforms
//!
//! - **Linux / macOS / other Unix**: Full support
//! - **Windows**: Not supported (no Unix domain socket listener in tokio)

pub mod paths;

pub use paths::{default_socket_path, prepare_socket_path, remove_socket_file};

/// Returns true if the current platform can host a relay.
pub fn is_supported_platform() -> bool {
    cfg!(unix)
}
