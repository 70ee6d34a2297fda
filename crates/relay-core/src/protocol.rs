//! Wire format between the relay and the instrumentation peer.
//!
//! Each connection carries one half-duplex round. The peer writes the result
//! of the previous command (if any) and half-closes; the relay answers with
//! the next command and half-closes.
//!
//! ```text
//! peer  -> relay: <tag>,{"status": <int>, "value": <any>}
//! relay -> peer : {"cmd": "<action>"}
//! ```

use crate::config::ProtocolConfig;
use crate::{RelayError, Result};
use serde::{Deserialize, Serialize};

/// Outbound command frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFrame {
    pub cmd: String,
}

impl CommandFrame {
    pub fn new(action: impl Into<String>) -> Self {
        Self { cmd: action.into() }
    }

    /// Frame asking the peer for the remainder of the previous result.
    pub fn continuation() -> Self {
        Self::new(ProtocolConfig::CONTINUATION_ACTION)
    }

    pub fn is_continuation(&self) -> bool {
        self.cmd == ProtocolConfig::CONTINUATION_ACTION
    }

    /// Serialize to the bytes written on the socket.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// JSON body of an inbound result frame.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ResultPayload {
    pub status: i64,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// A complete inbound result frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultFrame {
    /// One-character type tag preceding the payload.
    pub tag: char,
    pub status: i64,
    pub value: serde_json::Value,
}

impl ResultFrame {
    pub fn is_success(&self) -> bool {
        self.status == ProtocolConfig::STATUS_OK
    }

    /// Success yields the payload; any other status becomes `CommandFailed`.
    pub fn into_outcome(self) -> Result<serde_json::Value> {
        if self.is_success() {
            Ok(self.value)
        } else {
            Err(RelayError::command_failed(self.status, self.value))
        }
    }
}

/// Check that a caller-supplied action can be submitted.
pub fn validate_action(action: &str) -> Result<()> {
    if action.trim().is_empty() {
        return Err(RelayError::Validation {
            field: "action".to_string(),
            message: "Action name must not be empty".to_string(),
        });
    }
    if action == ProtocolConfig::CONTINUATION_ACTION {
        return Err(RelayError::Validation {
            field: "action".to_string(),
            message: format!("'{}' is reserved for result continuation", action),
        });
    }
    Ok(())
}
