//! Relay Core - Command relay between a driving application and an
//! instrumentation process.
//!
//! The instrumentation peer connects to a Unix domain socket owned by the
//! relay. Each connection carries exactly one exchange: the peer writes the
//! result of the previous command (possibly partial) and half-closes, then
//! the relay writes the next command and closes. Results larger than one
//! exchange are reassembled across connections using a continuation
//! command.
//!
//! # Example
//!
//! ```rust,ignore
//! use relay_core::{Relay, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> relay_core::Result<()> {
//!     let mut relay = Relay::new(RelayConfig::from_env());
//!     let connected = relay.start().await?;
//!
//!     // Commands may be queued before the peer connects.
//!     let session = relay.submit("getSession");
//!     let first = connected.await?;
//!     println!("Peer connected (first ever: {})", first);
//!     println!("Session: {}", session.await?);
//!
//!     relay.safe_shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod accumulator;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod platform;
pub mod protocol;
pub mod session;

mod connection;
mod queue;

// Re-export commonly used types
pub use accumulator::{Frame, ResultAccumulator};
pub use config::{ProtocolConfig, RelayConfig, RelayEnv};
pub use dispatch::RelayStats;
pub use error::{RelayError, Result};
pub use protocol::{validate_action, CommandFrame, ResultFrame};
pub use session::{FirstConnection, Relay};
