//! Instrument Relay CLI - line-oriented driver for the command relay.
//!
//! Reads one action per line from stdin, relays it to the instrumentation
//! peer and prints each result to stdout as a JSON line, in submission order.

mod output;

use anyhow::Result;
use clap::Parser;
use output::{print_outcomes, Pending};
use relay_core::{Relay, RelayConfig};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "instrument-relay")]
#[command(about = "Relay commands to an instrumentation peer over a Unix socket")]
struct Args {
    /// Socket path the peer connects to (defaults to INSTRUMENT_RELAY_SOCKET
    /// or the runtime directory)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries results.
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let mut config = RelayConfig::from_env();
    if let Some(socket) = args.socket {
        config = config.with_socket_path(socket);
    }

    info!("Starting instrument relay");
    let mut relay = Relay::new(config);
    let connected = relay.start().await?;
    info!(socket = %relay.socket_path().display(), "Waiting for instrumentation peer");

    tokio::spawn(async move {
        match connected.await {
            Ok(first) => info!(first, "Instrumentation peer connected"),
            Err(e) => debug!(error = %e, "Relay stopped before a peer connected"),
        }
    });

    let (pending_tx, pending_rx) = mpsc::unbounded_channel();
    let mut printer = tokio::spawn(print_outcomes(pending_rx, tokio::io::stdout()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let interrupted = loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    let action = line.trim();
                    if action.is_empty() {
                        continue;
                    }
                    let result = Box::pin(relay.submit(action));
                    let _ = pending_tx.send(Pending { action: action.to_string(), result });
                }
                None => break false,
            },
            _ = tokio::signal::ctrl_c() => break true,
        }
    };
    drop(pending_tx);

    if interrupted {
        info!("Shutdown signal received");
    } else {
        info!("Input closed, waiting for outstanding results");
        tokio::select! {
            _ = &mut printer => {}
            _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        }
    }

    relay.safe_shutdown().await;

    if !printer.is_finished() {
        // Outstanding commands were rejected by shutdown; print them.
        match printer.await {
            Ok(Err(e)) => warn!(error = %e, "Failed to write results"),
            Err(e) => warn!(error = %e, "Result printer failed"),
            Ok(Ok(())) => {}
        }
    }

    info!(stats = ?relay.stats(), "Instrument relay stopped");
    Ok(())
}
