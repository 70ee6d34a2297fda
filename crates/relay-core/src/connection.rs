//! Connection lifecycle for one running relay.
//!
//! A single driver task owns the listening socket, the current peer
//! connection and the [`Dispatcher`]. Callers and per-connection reader tasks
//! reach it only through the event channel, so every queue or in-flight
//! mutation happens on this one task, one event at a time.
//!
//! ```text
//! Listening --accept--> Open --peer half-close--> (dispatch) --> Closed
//!     ^                                                           |
//!     +-----------------------------------------------------------+
//! ```

use crate::dispatch::{Dispatcher, RelayCounters};
use crate::queue::Command;
use crate::RelayError;
use bytes::{Bytes, BytesMut};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept so a persistent error cannot spin the task.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(150);

/// Input to the driver task.
#[derive(Debug)]
pub(crate) enum Event {
    /// A caller submitted a command.
    Submit(Command),
    /// Bytes read from a peer connection.
    Data { connection: u64, chunk: Bytes },
    /// The peer half-closed: it has finished writing this exchange.
    End { connection: u64 },
    /// Reading from the connection failed.
    Closed {
        connection: u64,
        error: std::io::Error,
    },
    /// Tear down and hand the event receiver back.
    Shutdown,
}

pub(crate) type EventSender = mpsc::UnboundedSender<Event>;
pub(crate) type EventReceiver = mpsc::UnboundedReceiver<Event>;

/// The peer connection currently carrying an exchange.
struct PeerConnection {
    id: u64,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

impl PeerConnection {
    /// Write one command frame and half-close our side.
    async fn send_and_finish(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(frame).await?;
        self.writer.shutdown().await
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Settings the driver needs besides its socket and channel.
pub(crate) struct DriverOptions {
    pub socket_path: PathBuf,
    pub read_chunk_size: usize,
    pub max_result_bytes: usize,
}

/// Driver for one run of a relay session, from `start` to `shutdown`.
pub(crate) struct ConnectionManager {
    listener: UnixListener,
    socket_path: PathBuf,
    read_chunk_size: usize,
    events: EventReceiver,
    events_tx: EventSender,
    dispatcher: Dispatcher,
    current: Option<PeerConnection>,
    first_connection: Option<oneshot::Sender<bool>>,
    counters: Arc<RelayCounters>,
}

impl ConnectionManager {
    pub(crate) fn new(
        listener: UnixListener,
        options: DriverOptions,
        events: EventReceiver,
        events_tx: EventSender,
        first_connection: oneshot::Sender<bool>,
        counters: Arc<RelayCounters>,
    ) -> Self {
        Self {
            listener,
            socket_path: options.socket_path,
            read_chunk_size: options.read_chunk_size.max(1),
            events,
            events_tx,
            dispatcher: Dispatcher::new(options.max_result_bytes, counters.clone()),
            current: None,
            first_connection: Some(first_connection),
            counters,
        }
    }

    /// Serve events and connections until shutdown.
    ///
    /// Returns the event receiver so the session can start again later with
    /// commands submitted in the meantime still queued in order.
    pub(crate) async fn run(mut self) -> EventReceiver {
        info!(socket = %self.socket_path.display(), "Relay listening");

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(Event::Submit(command)) => self.on_submit(command).await,
                    Some(Event::Data { connection, chunk }) => self.on_data(connection, &chunk),
                    Some(Event::End { connection }) => self.on_end(connection).await,
                    Some(Event::Closed { connection, error }) => self.on_closed(connection, error),
                    Some(Event::Shutdown) | None => break,
                },
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => self.on_accept(stream),
                    Err(e) => {
                        error!(error = %e, "Relay accept error");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }

        self.teardown()
    }

    async fn on_submit(&mut self, command: Command) {
        debug!(action = %command.action(), "Command queued");
        if self.dispatcher.submit(command) {
            self.dispatch_next().await;
        }
    }

    fn on_accept(&mut self, stream: UnixStream) {
        let ordinal = self.counters.connections.fetch_add(1, Ordering::SeqCst);
        let id = ordinal + 1;

        if let Some(previous) = self.current.take() {
            warn!(
                previous = previous.id,
                connection = id,
                "Replacing current peer connection"
            );
        }
        // The new connection's own end event drives the next dispatch.
        self.dispatcher.disarm();

        let (reader, writer) = stream.into_split();
        let reader = tokio::spawn(read_loop(
            id,
            reader,
            self.events_tx.clone(),
            self.read_chunk_size,
        ));
        self.current = Some(PeerConnection { id, writer, reader });
        debug!(
            connection = id,
            in_flight = self.dispatcher.has_in_flight(),
            "Peer connected"
        );

        if let Some(tx) = self.first_connection.take() {
            let first = ordinal == 0;
            info!(connection = id, first, "Peer connected to relay");
            let _ = tx.send(first);
        }
    }

    fn on_data(&mut self, connection: u64, chunk: &[u8]) {
        if !self.is_current(connection) {
            warn!(
                connection,
                bytes = chunk.len(),
                "Ignoring data from replaced connection"
            );
            return;
        }
        self.dispatcher.receive(chunk);
    }

    async fn on_end(&mut self, connection: u64) {
        if !self.is_current(connection) {
            warn!(connection, "Ignoring end of replaced connection");
            return;
        }
        let resolution = self.dispatcher.resolve_exchange();
        debug!(connection, ?resolution, "Peer finished writing");
        self.dispatch_next().await;
    }

    fn on_closed(&mut self, connection: u64, error: std::io::Error) {
        if !self.is_current(connection) {
            return;
        }
        warn!(connection, error = %error, "Peer connection failed");
        self.current = None;
        self.dispatcher.disarm();
    }

    /// Send the queue head on the current connection and end the exchange.
    async fn dispatch_next(&mut self) {
        let Some(connection) = self.current.as_mut() else {
            debug!(
                queued = self.dispatcher.queued(),
                "No peer connection; command stays queued"
            );
            return;
        };

        let Some(frame) = self.dispatcher.next_frame() else {
            debug!(
                connection = connection.id,
                armed = self.dispatcher.is_armed(),
                "Nothing to dispatch"
            );
            return;
        };

        let id = connection.id;
        match connection.send_and_finish(&frame).await {
            Ok(()) => {}
            Err(e) if peer_gone(&e) => {
                // A held connection the peer closed; the command goes out on
                // its next connection instead.
                warn!(connection = id, error = %e, "Peer closed connection before dispatch");
                self.dispatcher.requeue_in_flight();
                self.current = None;
                return;
            }
            Err(e) => {
                warn!(connection = id, error = %e, "Failed to write command to peer");
                self.dispatcher.abort_in_flight(RelayError::from(e));
            }
        }

        debug!(connection = id, "Exchange complete");
        self.current = None;
    }

    fn is_current(&self, connection: u64) -> bool {
        self.current.as_ref().is_some_and(|c| c.id == connection)
    }

    fn teardown(mut self) -> EventReceiver {
        let rejected = self.dispatcher.close();
        if rejected > 0 {
            info!(rejected, "Rejected outstanding commands on shutdown");
        }
        if let Some(connection) = self.current.take() {
            debug!(connection = connection.id, "Closing peer connection");
        }

        let ConnectionManager {
            listener, events, ..
        } = self;
        drop(listener);
        info!("Relay stopped listening");
        events
    }
}

/// Write errors meaning the peer had already closed the connection.
fn peer_gone(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::NotConnected
    )
}

/// Forward everything the peer writes on one connection to the driver.
async fn read_loop(
    connection: u64,
    mut reader: OwnedReadHalf,
    events: EventSender,
    chunk_size: usize,
) {
    let mut buf = BytesMut::with_capacity(chunk_size);
    loop {
        buf.reserve(chunk_size);
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = events.send(Event::End { connection });
                return;
            }
            Ok(_) => {
                let chunk = buf.split().freeze();
                if events.send(Event::Data { connection, chunk }).is_err() {
                    return;
                }
            }
            Err(error) => {
                let _ = events.send(Event::Closed { connection, error });
                return;
            }
        }
    }
}
