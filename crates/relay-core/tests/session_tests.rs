//! Integration tests for the Relay public interface.
//!
//! A fake instrumentation peer talks to the relay over a real Unix domain
//! socket, one exchange per connection: write a result (or nothing),
//! half-close, then read the next command until the relay closes.

use futures::future::join_all;
use relay_core::{ProtocolConfig, Relay, RelayConfig, RelayError};
use serde_json::{json, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn socket_in(temp: &TempDir) -> PathBuf {
    temp.path().join("relay/relay.sock")
}

fn relay_in(temp: &TempDir) -> Relay {
    Relay::new(RelayConfig::new(socket_in(temp)))
}

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, fut)
        .await
        .expect("Timed out waiting for relay")
}

/// One peer exchange. Returns the action the relay sent back, or `None` if
/// the relay closed without sending a command.
async fn exchange(path: &Path, payload: &[u8]) -> Option<String> {
    let mut stream = UnixStream::connect(path).await.unwrap();
    stream.write_all(payload).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    if out.is_empty() {
        return None;
    }
    let frame: Value = serde_json::from_slice(&out).unwrap();
    Some(frame["cmd"].as_str().unwrap().to_string())
}

fn ok_frame(value: Value) -> Vec<u8> {
    format!("R,{}", json!({"status": 0, "value": value})).into_bytes()
}

#[tokio::test]
async fn test_get_session_round_trip() {
    let temp = TempDir::new().unwrap();
    let path = socket_in(&temp);
    let mut relay = relay_in(&temp);

    let connected = relay.start().await.unwrap();
    let session = relay.submit("getSession");

    assert_eq!(
        within(exchange(&path, b"")).await.as_deref(),
        Some("getSession")
    );
    assert!(within(connected).await.unwrap());

    let peer = tokio::spawn({
        let path = path.clone();
        async move { exchange(&path, &ok_frame(json!({"sessionId": "abc"}))).await }
    });

    assert_eq!(within(session).await.unwrap(), json!({"sessionId": "abc"}));

    // Nothing else queued: the peer's connection is held until shutdown.
    relay.shutdown().await.unwrap();
    assert_eq!(within(peer).await.unwrap(), None);
}

#[tokio::test]
async fn test_fragmented_result_uses_continuation() {
    let temp = TempDir::new().unwrap();
    let path = socket_in(&temp);
    let mut relay = relay_in(&temp);
    let _connected = relay.start().await.unwrap();

    let tree = relay.submit("dumpTree");

    assert_eq!(
        within(exchange(&path, b"")).await.as_deref(),
        Some("dumpTree")
    );
    assert_eq!(
        within(exchange(&path, br#"R,{"status":0,"value":[1,2,"#))
            .await
            .as_deref(),
        Some(ProtocolConfig::CONTINUATION_ACTION)
    );

    let peer = tokio::spawn({
        let path = path.clone();
        async move { exchange(&path, b"3]}").await }
    });

    assert_eq!(within(tree).await.unwrap(), json!([1, 2, 3]));

    let stats = relay.stats();
    assert_eq!(stats.continuations, 1);
    assert_eq!(stats.dispatched, 2);
    assert_eq!(stats.completed, 1);

    relay.shutdown().await.unwrap();
    within(peer).await.unwrap();
}

#[tokio::test]
async fn test_failure_status_rejects_with_peer_message() {
    let temp = TempDir::new().unwrap();
    let path = socket_in(&temp);
    let mut relay = relay_in(&temp);
    let _connected = relay.start().await.unwrap();

    let attach = relay.submit("attach");
    within(exchange(&path, b"")).await;

    let peer = tokio::spawn({
        let path = path.clone();
        async move { exchange(&path, br#"R,{"status":2,"value":"no such target"}"#).await }
    });

    let err = within(attach).await.unwrap_err();
    assert!(err.is_command_failure());
    assert_eq!(err.status(), Some(2));
    assert_eq!(err.to_string(), "no such target");

    relay.shutdown().await.unwrap();
    within(peer).await.unwrap();
}

#[tokio::test]
async fn test_commands_complete_in_submission_order_one_at_a_time() {
    let temp = TempDir::new().unwrap();
    let path = socket_in(&temp);
    let mut relay = relay_in(&temp);
    let _connected = relay.start().await.unwrap();

    let pending: Vec<_> = ["a", "b", "c"].iter().map(|a| relay.submit(*a)).collect();

    let peer = tokio::spawn({
        let path = path.clone();
        async move {
            let mut seen = Vec::new();
            let mut next = exchange(&path, b"").await;
            while let Some(action) = next {
                seen.push(action.clone());
                next = exchange(&path, &ok_frame(json!(action))).await;
            }
            seen
        }
    });

    let results: Vec<Value> = within(join_all(pending))
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(results, vec![json!("a"), json!("b"), json!("c")]);

    let stats = relay.stats();
    assert_eq!(stats.max_in_flight, 1);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.dispatched, 3);
    assert_eq!(stats.completed, 3);

    relay.shutdown().await.unwrap();
    assert_eq!(within(peer).await.unwrap(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_submit_while_idle_dispatches_on_held_connection() {
    let temp = TempDir::new().unwrap();
    let path = socket_in(&temp);
    let mut relay = relay_in(&temp);
    let _connected = relay.start().await.unwrap();

    // Nothing queued: the relay holds this connection open.
    let peer = tokio::spawn({
        let path = path.clone();
        async move { exchange(&path, b"").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let step = relay.submit("step");
    assert_eq!(within(peer).await.unwrap().as_deref(), Some("step"));

    let peer = tokio::spawn({
        let path = path.clone();
        async move { exchange(&path, &ok_frame(json!(true))).await }
    });
    assert_eq!(within(step).await.unwrap(), json!(true));

    relay.shutdown().await.unwrap();
    within(peer).await.unwrap();
}

#[tokio::test]
async fn test_command_survives_peer_closing_held_connection() {
    let temp = TempDir::new().unwrap();
    let path = socket_in(&temp);
    let mut relay = relay_in(&temp);
    let _connected = relay.start().await.unwrap();

    // Nothing queued, so the relay holds this connection; the peer then
    // gives up on it entirely.
    let mut held = UnixStream::connect(&path).await.unwrap();
    held.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(held);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let step = relay.submit("step");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(within(exchange(&path, b"")).await.as_deref(), Some("step"));
    let peer = tokio::spawn({
        let path = path.clone();
        async move { exchange(&path, &ok_frame(json!("done"))).await }
    });
    assert_eq!(within(step).await.unwrap(), json!("done"));
    assert_eq!(relay.stats().failed, 0);

    relay.shutdown().await.unwrap();
    within(peer).await.unwrap();
}

#[tokio::test]
async fn test_new_connection_replaces_current() {
    let temp = TempDir::new().unwrap();
    let path = socket_in(&temp);
    let mut relay = relay_in(&temp);
    let _connected = relay.start().await.unwrap();

    let first = relay.submit("first");

    // Connection A never finishes writing before B arrives.
    let mut replaced = UnixStream::connect(&path).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(within(exchange(&path, b"")).await.as_deref(), Some("first"));

    // A's late end does not resolve or dispatch anything.
    let _ = replaced.write_all(&ok_frame(json!("stale"))).await;
    let _ = replaced.shutdown().await;
    let mut out = Vec::new();
    let _ = within(replaced.read_to_end(&mut out)).await;
    assert!(out.is_empty());

    let peer = tokio::spawn({
        let path = path.clone();
        async move { exchange(&path, &ok_frame(json!("fresh"))).await }
    });
    assert_eq!(within(first).await.unwrap(), json!("fresh"));

    let stats = relay.stats();
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.unsolicited, 0);

    relay.shutdown().await.unwrap();
    within(peer).await.unwrap();
}

#[tokio::test]
async fn test_accept_disarms_deferred_dispatch() {
    let temp = TempDir::new().unwrap();
    let path = socket_in(&temp);
    let mut relay = relay_in(&temp);
    let _connected = relay.start().await.unwrap();

    // Held connection with nothing queued arms the deferred hook.
    let held = tokio::spawn({
        let path = path.clone();
        async move { exchange(&path, b"").await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A new connection replaces it; the held one is closed unused.
    let mut next = UnixStream::connect(&path).await.unwrap();
    assert_eq!(within(held).await.unwrap(), None);

    // The submit must wait for the new connection's end event.
    let step = relay.submit("step");
    let mut buf = [0u8; 64];
    assert!(
        tokio::time::timeout(Duration::from_millis(100), next.read(&mut buf))
            .await
            .is_err(),
        "command written before the peer finished its exchange"
    );

    next.shutdown().await.unwrap();
    let mut out = Vec::new();
    within(next.read_to_end(&mut out)).await.unwrap();
    assert_eq!(out, br#"{"cmd":"step"}"#.to_vec());

    relay.shutdown().await.unwrap();
    assert!(matches!(within(step).await, Err(RelayError::SessionClosed)));
}

#[tokio::test]
async fn test_unsolicited_frame_is_discarded() {
    let temp = TempDir::new().unwrap();
    let path = socket_in(&temp);
    let mut relay = relay_in(&temp);
    let _connected = relay.start().await.unwrap();

    let peer = tokio::spawn({
        let path = path.clone();
        async move { exchange(&path, &ok_frame(json!("stray"))).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let next = relay.submit("next");
    assert_eq!(within(peer).await.unwrap().as_deref(), Some("next"));
    assert_eq!(relay.stats().unsolicited, 1);

    relay.shutdown().await.unwrap();
    assert!(matches!(within(next).await, Err(RelayError::SessionClosed)));
}

#[tokio::test]
async fn test_malformed_frame_rejects_command() {
    let temp = TempDir::new().unwrap();
    let path = socket_in(&temp);
    let mut relay = relay_in(&temp);
    let _connected = relay.start().await.unwrap();

    let broken = relay.submit("broken");
    within(exchange(&path, b"")).await;

    let peer = tokio::spawn({
        let path = path.clone();
        async move { exchange(&path, b"not a frame at all").await }
    });

    assert!(matches!(
        within(broken).await,
        Err(RelayError::MalformedFrame { .. })
    ));

    relay.shutdown().await.unwrap();
    within(peer).await.unwrap();
}

#[tokio::test]
async fn test_in_flight_command_rejected_on_shutdown() {
    let temp = TempDir::new().unwrap();
    let path = socket_in(&temp);
    let mut relay = relay_in(&temp);
    let _connected = relay.start().await.unwrap();

    let in_flight = relay.submit("slow");
    let queued = relay.submit("after");
    assert_eq!(within(exchange(&path, b"")).await.as_deref(), Some("slow"));

    relay.shutdown().await.unwrap();

    assert!(matches!(
        within(in_flight).await,
        Err(RelayError::SessionClosed)
    ));
    assert!(matches!(within(queued).await, Err(RelayError::SessionClosed)));
    assert_eq!(relay.stats().failed, 2);
}

#[tokio::test]
async fn test_first_connection_only_true_once() {
    let temp = TempDir::new().unwrap();
    let path = socket_in(&temp);
    let mut relay = relay_in(&temp);

    let connected = relay.start().await.unwrap();
    let peer = tokio::spawn({
        let path = path.clone();
        async move { exchange(&path, b"").await }
    });
    assert!(within(connected).await.unwrap());
    relay.shutdown().await.unwrap();
    within(peer).await.unwrap();

    let connected = relay.start().await.unwrap();
    let peer = tokio::spawn({
        let path = path.clone();
        async move { exchange(&path, b"").await }
    });
    assert!(!within(connected).await.unwrap());
    relay.shutdown().await.unwrap();
    within(peer).await.unwrap();

    assert_eq!(relay.stats().connections, 2);
}

#[tokio::test]
async fn test_shutdown_removes_socket_and_is_repeatable() {
    let temp = TempDir::new().unwrap();
    let mut relay = relay_in(&temp);

    let _connected = relay.start().await.unwrap();
    assert!(relay.socket_path().exists());

    relay.shutdown().await.unwrap();
    assert!(!relay.socket_path().exists());
    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_replaces_stale_socket_file() {
    let temp = TempDir::new().unwrap();
    let path = socket_in(&temp);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, b"left over").unwrap();

    let mut relay = relay_in(&temp);
    let _connected = relay.start().await.unwrap();

    assert!(UnixStream::connect(&path).await.is_ok());
    relay.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_commands_submitted_while_stopped_run_after_restart() {
    let temp = TempDir::new().unwrap();
    let path = socket_in(&temp);
    let mut relay = relay_in(&temp);

    let _connected = relay.start().await.unwrap();
    relay.shutdown().await.unwrap();

    let later = relay.submit("later");
    let _connected = relay.start().await.unwrap();

    assert_eq!(within(exchange(&path, b"")).await.as_deref(), Some("later"));
    let peer = tokio::spawn({
        let path = path.clone();
        async move { exchange(&path, &ok_frame(json!(42))).await }
    });
    assert_eq!(within(later).await.unwrap(), json!(42));

    relay.shutdown().await.unwrap();
    within(peer).await.unwrap();
}

#[tokio::test]
async fn test_invalid_actions_rejected_without_queueing() {
    let temp = TempDir::new().unwrap();
    let relay = relay_in(&temp);

    assert!(matches!(
        relay.submit("").await,
        Err(RelayError::Validation { .. })
    ));
    assert!(matches!(
        relay.submit(ProtocolConfig::CONTINUATION_ACTION).await,
        Err(RelayError::Validation { .. })
    ));
    assert_eq!(relay.stats().submitted, 0);
}
