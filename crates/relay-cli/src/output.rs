//! JSON-lines output for command results.

use relay_core::Result;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

pub type ResultFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// A submitted command whose result has not been printed yet.
pub struct Pending {
    pub action: String,
    pub result: ResultFuture,
}

/// One line of output.
#[derive(Debug, Serialize)]
pub struct CommandOutcome {
    pub action: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandOutcome {
    pub fn new(action: String, result: Result<Value>) -> Self {
        match result {
            Ok(value) => Self {
                action,
                ok: true,
                value: Some(value),
                error: None,
            },
            Err(e) => Self {
                action,
                ok: false,
                value: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Await each pending command in submission order and write its outcome.
///
/// Returns when the sender side is dropped and every result is written.
pub async fn print_outcomes<W>(
    mut pending: mpsc::UnboundedReceiver<Pending>,
    mut out: W,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(Pending { action, result }) = pending.recv().await {
        let outcome = CommandOutcome::new(action, result.await);
        debug!(action = %outcome.action, ok = outcome.ok, "Command finished");

        let mut line = serde_json::to_vec(&outcome)?;
        line.push(b'\n');
        out.write_all(&line).await?;
        out.flush().await?;
    }
    Ok(())
}
