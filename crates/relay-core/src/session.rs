//! The caller-owned relay session.
//!
//! `Relay` is the only public entry point: submit commands, start and stop
//! listening, read counters. All protocol state lives in the driver task
//! spawned by [`Relay::start`].

use crate::config::RelayConfig;
use crate::connection::{ConnectionManager, DriverOptions, Event, EventReceiver, EventSender};
use crate::dispatch::{RelayCounters, RelayStats};
use crate::platform::{prepare_socket_path, remove_socket_file};
use crate::protocol::validate_action;
use crate::queue::Command;
use crate::{RelayError, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Resolves once, when the first peer connects after [`Relay::start`].
///
/// The value is `true` only if this is the first connection the session has
/// ever accepted. Resolves to `Err(SessionClosed)` if the relay shuts down
/// before any peer connects.
#[derive(Debug)]
#[must_use = "FirstConnection does nothing unless awaited"]
pub struct FirstConnection {
    rx: oneshot::Receiver<bool>,
}

impl Future for FirstConnection {
    type Output = Result<bool>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| RelayError::SessionClosed))
    }
}

struct RunningRelay {
    socket_path: PathBuf,
    task: JoinHandle<EventReceiver>,
}

/// A relay session between the driving application and one
/// instrumentation peer.
///
/// # Example
///
/// ```rust,no_run
/// use relay_core::{Relay, RelayConfig};
///
/// # async fn demo() -> relay_core::Result<()> {
/// let mut relay = Relay::new(RelayConfig::new("/tmp/instrument-relay/relay.sock"));
/// let connected = relay.start().await?;
///
/// let session = relay.submit("getSession");
/// connected.await?;
/// println!("{}", session.await?);
///
/// relay.safe_shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Relay {
    config: RelayConfig,
    events: EventSender,
    /// Event receiver while no driver is running.
    parked: Option<EventReceiver>,
    running: Option<RunningRelay>,
    counters: Arc<RelayCounters>,
}

impl Relay {
    /// Create a stopped session. Commands may be submitted before `start`.
    pub fn new(config: RelayConfig) -> Self {
        let (events, parked) = mpsc::unbounded_channel();
        Self {
            config,
            events,
            parked: Some(parked),
            running: None,
            counters: Arc::new(RelayCounters::default()),
        }
    }

    /// Create a session configured from the environment.
    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::from_env())
    }

    /// Queue `action` for the peer and return a future for its result.
    ///
    /// The command is queued immediately, before the future is polled.
    /// The future resolves with the peer's value on success, or rejects with
    /// `CommandFailed` carrying the peer's error value. Empty actions and the
    /// reserved continuation action are rejected with `Validation` without
    /// touching the queue.
    pub fn submit(
        &self,
        action: impl Into<String>,
    ) -> impl Future<Output = Result<serde_json::Value>> + Send + 'static {
        let action = action.into();
        let (tx, rx) = oneshot::channel();

        let queued = validate_action(&action).map(|()| {
            debug!(action = %action, "Submitting command");
            if self.events.send(Event::Submit(Command::new(action, tx))).is_err() {
                warn!("Relay driver is gone; command dropped");
            }
        });

        async move {
            queued?;
            rx.await.map_err(|_| RelayError::SessionClosed)?
        }
    }

    /// Prepare the socket endpoint and begin listening.
    ///
    /// Fails if the stale socket file cannot be removed, the parent directory
    /// cannot be created, or the socket cannot be bound. On success returns a
    /// [`FirstConnection`] future.
    pub async fn start(&mut self) -> Result<FirstConnection> {
        if self.running.is_some() {
            return Err(RelayError::AlreadyRunning);
        }

        let socket_path = self.config.socket_path.clone();
        prepare_socket_path(&socket_path).await?;
        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| RelayError::io_with_path(e, &socket_path))?;

        let events = match self.parked.take() {
            Some(events) => events,
            None => self.reset_channel(),
        };
        let (first_tx, first_rx) = oneshot::channel();

        let manager = ConnectionManager::new(
            listener,
            DriverOptions {
                socket_path: socket_path.clone(),
                read_chunk_size: self.config.read_chunk_size,
                max_result_bytes: self.config.max_result_bytes,
            },
            events,
            self.events.clone(),
            first_tx,
            self.counters.clone(),
        );
        let task = tokio::spawn(manager.run());

        self.running = Some(RunningRelay { socket_path, task });
        Ok(FirstConnection { rx: first_rx })
    }

    /// Stop the session.
    ///
    /// Rejects the in-flight command and every queued command with
    /// `SessionClosed`, drops the current peer connection, closes the
    /// listener and removes the socket file. Calling it on a stopped session
    /// does nothing. Fails only if the socket file cannot be removed.
    pub async fn shutdown(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            debug!("Relay already stopped");
            return Ok(());
        };

        info!(socket = %running.socket_path.display(), "Relay shutting down");
        let _ = self.events.send(Event::Shutdown);

        match running.task.await {
            Ok(events) => self.parked = Some(events),
            Err(e) => {
                warn!(error = %e, "Relay driver ended abnormally");
                let events = self.reset_channel();
                self.parked = Some(events);
            }
        }

        remove_socket_file(&running.socket_path).await
    }

    /// Like [`Relay::shutdown`], but logs failures instead of returning them.
    pub async fn safe_shutdown(&mut self) {
        if let Err(e) = self.shutdown().await {
            warn!(error = %e, "Relay shutdown failed");
        }
    }

    /// Snapshot of the session's counters.
    pub fn stats(&self) -> RelayStats {
        self.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn socket_path(&self) -> &Path {
        self.config.socket_path()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Replace a lost event channel. Commands queued in the old one are
    /// dropped and their callers see `SessionClosed`.
    fn reset_channel(&mut self) -> EventReceiver {
        let (events, receiver) = mpsc::unbounded_channel();
        self.events = events;
        receiver
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.task.abort();
        }
    }
}
