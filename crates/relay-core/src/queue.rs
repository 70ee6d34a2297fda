//! Pending commands awaiting dispatch.
//!
//! Submissions join the tail. A continuation for an incomplete result joins
//! the head, so the caller that owns it keeps the peer until its result is
//! whole.

use crate::config::ProtocolConfig;
use crate::protocol::CommandFrame;
use crate::{RelayError, Result};
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tracing::debug;

/// Completion side of a submitted command.
pub(crate) type Reply = oneshot::Sender<Result<serde_json::Value>>;

/// One request from a caller, consumed exactly once.
#[derive(Debug)]
pub(crate) struct Command {
    action: String,
    continuation: bool,
    reply: Reply,
}

impl Command {
    pub(crate) fn new(action: impl Into<String>, reply: Reply) -> Self {
        Self {
            action: action.into(),
            continuation: false,
            reply,
        }
    }

    /// Replace this command with a request for the rest of its result.
    ///
    /// The completion is carried over so the original caller is answered.
    pub(crate) fn into_continuation(self) -> Self {
        Self {
            continuation: true,
            ..self
        }
    }

    /// Caller's action, also for continuations.
    pub(crate) fn action(&self) -> &str {
        &self.action
    }

    pub(crate) fn is_continuation(&self) -> bool {
        self.continuation
    }

    /// Action written on the wire.
    pub(crate) fn wire_action(&self) -> &str {
        if self.continuation {
            ProtocolConfig::CONTINUATION_ACTION
        } else {
            &self.action
        }
    }

    pub(crate) fn frame(&self) -> CommandFrame {
        CommandFrame::new(self.wire_action())
    }

    /// Fulfil the caller's future.
    pub(crate) fn complete(self, outcome: Result<serde_json::Value>) {
        if self.reply.send(outcome).is_err() {
            debug!(action = %self.action, "Caller dropped command before completion");
        }
    }

    pub(crate) fn fail(self, err: RelayError) {
        self.complete(Err(err));
    }
}

/// Ordered list of commands not yet sent to the peer.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    pending: VecDeque<Command>,
}

impl CommandQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a caller submission.
    pub(crate) fn push(&mut self, command: Command) {
        self.pending.push_back(command);
    }

    /// Put a command ahead of everything else.
    pub(crate) fn push_front(&mut self, command: Command) {
        self.pending.push_front(command);
    }

    pub(crate) fn pop(&mut self) -> Option<Command> {
        self.pending.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Reject every queued command with the error produced by `make_err`.
    ///
    /// Returns how many commands were rejected.
    pub(crate) fn reject_all(&mut self, make_err: impl Fn() -> RelayError) -> usize {
        let count = self.pending.len();
        for command in self.pending.drain(..) {
            command.fail(make_err());
        }
        count
    }
}
