//! The dispatch state machine.
//!
//! Runs once per connection-end event:
//!
//! 1. Resolve the prior exchange. With a command in flight, ask the
//!    accumulator for its result: an incomplete result puts a continuation at
//!    the head of the queue, a complete one fulfils the caller. With nothing
//!    in flight, buffered bytes are unsolicited and discarded.
//! 2. Dispatch the next command, or arm the deferred hook so the next
//!    submission is sent straight away.
//!
//! At most one command is in flight at any instant. The `Dispatcher` does no
//! I/O; the connection manager writes the frames it hands out.

use crate::accumulator::{Frame, ResultAccumulator};
use crate::queue::{Command, CommandQueue};
use crate::{RelayError, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Live counters shared between the session handle and its driver task.
#[derive(Debug, Default)]
pub(crate) struct RelayCounters {
    pub submitted: AtomicU64,
    pub dispatched: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub continuations: AtomicU64,
    pub unsolicited: AtomicU64,
    pub connections: AtomicU64,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
}

impl RelayCounters {
    fn enter_flight(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave_flight(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> RelayStats {
        RelayStats {
            submitted: self.submitted.load(Ordering::SeqCst),
            dispatched: self.dispatched.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            continuations: self.continuations.load(Ordering::SeqCst),
            unsolicited: self.unsolicited.load(Ordering::SeqCst),
            connections: self.connections.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            max_in_flight: self.max_in_flight.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time view of a relay session's activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    /// Commands accepted into the queue.
    pub submitted: u64,
    /// Frames written to the peer, continuations included.
    pub dispatched: u64,
    /// Commands fulfilled with a success result.
    pub completed: u64,
    /// Commands rejected for any reason.
    pub failed: u64,
    /// Continuation requests issued for incomplete results.
    pub continuations: u64,
    /// Frames received with no command in flight.
    pub unsolicited: u64,
    /// Peer connections accepted over the session's lifetime.
    pub connections: u64,
    /// Commands currently awaiting their result (0 or 1).
    pub in_flight: u64,
    /// Highest value `in_flight` has reached.
    pub max_in_flight: u64,
}

/// What step 1 of the loop did with the prior exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    /// Nothing in flight and nothing received.
    Idle,
    /// Bytes arrived with nothing in flight and were dropped.
    Unsolicited,
    /// The result is incomplete; a continuation heads the queue.
    Continued,
    /// The caller received a success result.
    Completed,
    /// The caller received an error.
    Failed,
}

/// Queue, in-flight marker and reassembly buffer for one session.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    queue: CommandQueue,
    in_flight: Option<Command>,
    accumulator: ResultAccumulator,
    dispatch_on_submit: bool,
    counters: Arc<RelayCounters>,
}

impl Dispatcher {
    pub(crate) fn new(max_result_bytes: usize, counters: Arc<RelayCounters>) -> Self {
        Self {
            queue: CommandQueue::new(),
            in_flight: None,
            accumulator: ResultAccumulator::new(max_result_bytes),
            dispatch_on_submit: false,
            counters,
        }
    }

    /// Queue a caller's command.
    ///
    /// Returns true when the deferred hook was armed: the caller must run
    /// [`Dispatcher::next_frame`] now instead of waiting for a connection end.
    pub(crate) fn submit(&mut self, command: Command) -> bool {
        self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        self.queue.push(command);
        std::mem::take(&mut self.dispatch_on_submit)
    }

    /// Feed bytes read from the current connection.
    pub(crate) fn receive(&mut self, chunk: &[u8]) {
        let Err(err) = self.accumulator.add_data(chunk) else {
            return;
        };
        self.accumulator.reset_buffer();
        match self.take_in_flight() {
            Some(command) => {
                warn!(action = %command.action(), error = %err, "Result exceeds size limit");
                self.finish(command, Err(err));
            }
            None => {
                warn!(error = %err, "Discarding oversized data with no command in flight");
                self.counters.unsolicited.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Step 1: settle the command whose result the peer just finished sending.
    pub(crate) fn resolve_exchange(&mut self) -> Resolution {
        let Some(command) = self.take_in_flight() else {
            if self.accumulator.is_empty() {
                debug!("Peer connected with no command in flight");
                return Resolution::Idle;
            }
            warn!(
                bytes = self.accumulator.len(),
                "Discarding result frame with no command in flight"
            );
            self.accumulator.reset_buffer();
            self.counters.unsolicited.fetch_add(1, Ordering::SeqCst);
            return Resolution::Unsolicited;
        };

        match self.accumulator.get_result() {
            Ok(Frame::NeedsMoreData) => {
                debug!(
                    action = %command.action(),
                    buffered = self.accumulator.len(),
                    "Result incomplete, requesting continuation"
                );
                self.counters.continuations.fetch_add(1, Ordering::SeqCst);
                self.queue.push_front(command.into_continuation());
                Resolution::Continued
            }
            Ok(Frame::Complete(frame)) => {
                let outcome = frame.into_outcome();
                let resolution = if outcome.is_ok() {
                    Resolution::Completed
                } else {
                    Resolution::Failed
                };
                self.finish(command, outcome);
                resolution
            }
            Err(err) => {
                warn!(action = %command.action(), error = %err, "Dropping malformed result");
                self.accumulator.reset_buffer();
                self.finish(command, Err(err));
                Resolution::Failed
            }
        }
    }

    /// Step 2: move the queue head into flight and return its encoded frame.
    ///
    /// Returns `None` and arms the deferred hook when the queue is empty, or
    /// returns `None` untouched while a command is still in flight.
    pub(crate) fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.in_flight.is_some() {
            return None;
        }

        while let Some(command) = self.queue.pop() {
            match command.frame().encode() {
                Ok(bytes) => {
                    debug!(
                        action = %command.action(),
                        continuation = command.is_continuation(),
                        queued = self.queue.len(),
                        "Dispatching command"
                    );
                    self.counters.dispatched.fetch_add(1, Ordering::SeqCst);
                    self.counters.enter_flight();
                    self.in_flight = Some(command);
                    return Some(bytes);
                }
                Err(err) => self.finish(command, Err(err)),
            }
        }

        self.dispatch_on_submit = true;
        None
    }

    /// Fail the in-flight command, e.g. when its frame could not be written.
    pub(crate) fn abort_in_flight(&mut self, err: RelayError) {
        if let Some(command) = self.take_in_flight() {
            self.finish(command, Err(err));
        }
    }

    /// Put the in-flight command back at the head of the queue.
    ///
    /// Used when its frame never reached the peer, so the next connection
    /// end sends it again.
    pub(crate) fn requeue_in_flight(&mut self) -> bool {
        let Some(command) = self.take_in_flight() else {
            return false;
        };
        debug!(action = %command.action(), "Command returned to queue head");
        self.queue.push_front(command);
        true
    }

    /// Forget the deferred hook; the next connection end dispatches instead.
    pub(crate) fn disarm(&mut self) {
        self.dispatch_on_submit = false;
    }

    /// Reject everything outstanding and clear all dispatch state.
    ///
    /// Returns how many commands were rejected.
    pub(crate) fn close(&mut self) -> usize {
        self.disarm();
        self.accumulator.reset_buffer();
        let mut rejected = 0;
        if let Some(command) = self.take_in_flight() {
            self.finish(command, Err(RelayError::SessionClosed));
            rejected += 1;
        }
        let queued = self.queue.reject_all(|| RelayError::SessionClosed);
        self.counters.failed.fetch_add(queued as u64, Ordering::SeqCst);
        rejected + queued
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.dispatch_on_submit
    }

    pub(crate) fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    fn take_in_flight(&mut self) -> Option<Command> {
        let command = self.in_flight.take()?;
        self.counters.leave_flight();
        Some(command)
    }

    fn finish(&self, command: Command, outcome: Result<serde_json::Value>) {
        let counter = if outcome.is_ok() {
            &self.counters.completed
        } else {
            &self.counters.failed
        };
        counter.fetch_add(1, Ordering::SeqCst);
        command.complete(outcome);
    }
}
