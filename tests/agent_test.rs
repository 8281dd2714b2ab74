//! Integration tests for the corexd agent.
//!
//! Each test spins up a real daemon on a free port and drives it over a
//! WebSocket client connection, the same way the GUI does.

#![cfg(unix)]

use corexd::auth::TokenStore;
use corexd::config::DaemonConfig;
use corexd::ipc::{
    self,
    protocol::{self, Envelope, StreamKind},
};
use corexd::session::SessionRegistry;
use corexd::AppContext;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start a daemon on a random port and return its URL, token, and context.
async fn start_test_daemon() -> (String, String, Arc<AppContext>) {
    let data_dir = tempfile::tempdir().unwrap().keep();
    let port = get_free_port();

    let config = Arc::new(DaemonConfig::new(
        Some(port),
        Some(data_dir.clone()),
        Some("warn".to_string()),
        None,
    ));
    let token_store = Arc::new(TokenStore::generate(&data_dir).unwrap());
    let token = token_store.token().to_string();

    let ctx = Arc::new(AppContext {
        config,
        registry: Arc::new(SessionRegistry::new()),
        token_store,
        started_at: std::time::Instant::now(),
    });

    let ctx_server = ctx.clone();
    tokio::spawn(async move {
        ipc::run(ctx_server).await.ok();
    });

    // Give the server a moment to bind
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("ws://127.0.0.1:{port}"), token, ctx)
}

fn get_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn send(ws: &mut Ws, msg: &Envelope) {
    ws.send(Message::Text(protocol::encode(msg))).await.unwrap();
}

/// Next decoded envelope, or None once the server closes the connection.
async fn recv(ws: &mut Ws) -> Option<Envelope> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for a message")?;
        match msg {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn connect_and_auth(url: &str, token: &str) -> Ws {
    let (mut ws, _) = connect_async(url).await.expect("ws connect failed");
    send(
        &mut ws,
        &Envelope::Auth {
            token: token.to_string(),
        },
    )
    .await;
    match recv(&mut ws).await {
        Some(Envelope::AuthOk) => ws,
        other => panic!("expected auth_ok, got {other:?}"),
    }
}

/// Run one command and collect (session_id, stdout, stderr, terminal message).
async fn run_to_terminal(ws: &mut Ws, command: &str, cwd: &str) -> (Uuid, String, String, Envelope) {
    send(
        ws,
        &Envelope::Execute {
            command: command.to_string(),
            cwd: cwd.to_string(),
        },
    )
    .await;

    let session_id = match recv(ws).await {
        Some(Envelope::Started { session_id, .. }) => session_id,
        other => panic!("expected started, got {other:?}"),
    };

    let mut stdout = String::new();
    let mut stderr = String::new();
    loop {
        match recv(ws).await.expect("stream ended before terminal message") {
            Envelope::Output {
                session_id: sid,
                stream,
                data,
            } => {
                assert_eq!(sid, session_id);
                match stream {
                    StreamKind::Stdout => stdout.push_str(&data),
                    StreamKind::Stderr => stderr.push_str(&data),
                }
            }
            terminal @ (Envelope::Complete { .. }
            | Envelope::Cancelled { .. }
            | Envelope::Error { .. }) => {
                return (session_id, stdout, stderr, terminal);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

// ─── Auth ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn correct_token_is_accepted() {
    let (url, token, _ctx) = start_test_daemon().await;
    let _ws = connect_and_auth(&url, &token).await;
}

#[tokio::test]
async fn wrong_token_is_rejected_and_connection_closed() {
    let (url, _token, _ctx) = start_test_daemon().await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    send(
        &mut ws,
        &Envelope::Auth {
            token: "definitely-wrong".to_string(),
        },
    )
    .await;

    match recv(&mut ws).await {
        Some(Envelope::AuthFail { .. }) => {}
        other => panic!("expected auth_fail, got {other:?}"),
    }
    assert!(recv(&mut ws).await.is_none(), "connection should be closed");
}

#[tokio::test]
async fn execute_before_auth_is_rejected() {
    let (url, _token, ctx) = start_test_daemon().await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    send(
        &mut ws,
        &Envelope::Execute {
            command: "echo nope".to_string(),
            cwd: "/tmp".to_string(),
        },
    )
    .await;

    match recv(&mut ws).await {
        Some(Envelope::AuthFail { .. }) => {}
        other => panic!("expected auth_fail, got {other:?}"),
    }
    assert!(recv(&mut ws).await.is_none(), "connection should be closed");
    assert_eq!(ctx.registry.active_count().await, 0);
}

// ─── Execution ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn echo_streams_stdout_then_completes() {
    let (url, token, _ctx) = start_test_daemon().await;
    let mut ws = connect_and_auth(&url, &token).await;

    let (_sid, stdout, stderr, terminal) = run_to_terminal(&mut ws, "echo hello", "/tmp").await;
    assert_eq!(stdout, "hello\n");
    assert_eq!(stderr, "");
    assert!(matches!(terminal, Envelope::Complete { exit_code: 0, .. }));
}

#[tokio::test]
async fn stdout_chunks_reassemble_in_order() {
    let (url, token, _ctx) = start_test_daemon().await;
    let mut ws = connect_and_auth(&url, &token).await;

    let (_sid, stdout, _stderr, terminal) =
        run_to_terminal(&mut ws, r"printf 'a\nb\nc\n'", "/tmp").await;
    assert_eq!(stdout, "a\nb\nc\n");
    assert!(matches!(terminal, Envelope::Complete { exit_code: 0, .. }));
}

#[tokio::test]
async fn stderr_is_tagged_separately() {
    let (url, token, _ctx) = start_test_daemon().await;
    let mut ws = connect_and_auth(&url, &token).await;

    let (_sid, stdout, stderr, terminal) =
        run_to_terminal(&mut ws, r#"sh -c "echo oops 1>&2""#, "/tmp").await;
    assert_eq!(stdout, "");
    assert_eq!(stderr, "oops\n");
    assert!(matches!(terminal, Envelope::Complete { exit_code: 0, .. }));
}

#[tokio::test]
async fn nonzero_exit_code_is_relayed() {
    let (url, token, _ctx) = start_test_daemon().await;
    let mut ws = connect_and_auth(&url, &token).await;

    let (_sid, _stdout, _stderr, terminal) =
        run_to_terminal(&mut ws, r#"sh -c "exit 3""#, "/tmp").await;
    assert!(matches!(terminal, Envelope::Complete { exit_code: 3, .. }));
}

#[tokio::test]
async fn missing_binary_fails_with_error_and_no_output() {
    let (url, token, ctx) = start_test_daemon().await;
    let mut ws = connect_and_auth(&url, &token).await;

    send(
        &mut ws,
        &Envelope::Execute {
            command: "/nonexistent/bin --flag".to_string(),
            cwd: "/tmp".to_string(),
        },
    )
    .await;

    // Spawn failed before a process existed: the terminal error is the first
    // and only message for the session.
    match recv(&mut ws).await {
        Some(Envelope::Error {
            session_id: Some(_),
            message,
        }) => assert!(message.contains("failed to start"), "got: {message}"),
        other => panic!("expected session error, got {other:?}"),
    }
    assert_eq!(ctx.registry.active_count().await, 0);
}

#[tokio::test]
async fn empty_command_fails_without_spawning() {
    let (url, token, _ctx) = start_test_daemon().await;
    let mut ws = connect_and_auth(&url, &token).await;

    send(
        &mut ws,
        &Envelope::Execute {
            command: "   ".to_string(),
            cwd: "/tmp".to_string(),
        },
    )
    .await;
    match recv(&mut ws).await {
        Some(Envelope::Error {
            session_id: Some(_),
            message,
        }) => assert!(message.contains("empty"), "got: {message}"),
        other => panic!("expected session error, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_workdir_fails_without_spawning() {
    let (url, token, _ctx) = start_test_daemon().await;
    let mut ws = connect_and_auth(&url, &token).await;

    send(
        &mut ws,
        &Envelope::Execute {
            command: "echo hi".to_string(),
            cwd: "/no/such/dir".to_string(),
        },
    )
    .await;
    match recv(&mut ws).await {
        Some(Envelope::Error {
            session_id: Some(_),
            message,
        }) => assert!(message.contains("does not exist"), "got: {message}"),
        other => panic!("expected session error, got {other:?}"),
    }
}

// ─── Cancellation ────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_terminates_long_running_command_quickly() {
    let (url, token, ctx) = start_test_daemon().await;
    let mut ws = connect_and_auth(&url, &token).await;

    send(
        &mut ws,
        &Envelope::Execute {
            command: "sleep 100".to_string(),
            cwd: "/tmp".to_string(),
        },
    )
    .await;
    let session_id = match recv(&mut ws).await {
        Some(Envelope::Started { session_id, .. }) => session_id,
        other => panic!("expected started, got {other:?}"),
    };

    let started = std::time::Instant::now();
    send(&mut ws, &Envelope::Cancel { session_id }).await;

    match recv(&mut ws).await {
        Some(Envelope::Cancelled { session_id: sid }) => assert_eq!(sid, session_id),
        other => panic!("expected cancelled, got {other:?}"),
    }
    // Well before the 100s the sleep would have taken.
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(ctx.registry.active_count().await, 0);
}

#[tokio::test]
async fn cancel_after_completion_is_a_silent_noop() {
    let (url, token, _ctx) = start_test_daemon().await;
    let mut ws = connect_and_auth(&url, &token).await;

    let (session_id, _stdout, _stderr, terminal) =
        run_to_terminal(&mut ws, "echo done", "/tmp").await;
    assert!(matches!(terminal, Envelope::Complete { .. }));

    // Cancel twice after the terminal message: no error, no second terminal.
    send(&mut ws, &Envelope::Cancel { session_id }).await;
    send(&mut ws, &Envelope::Cancel { session_id }).await;

    // The next traffic on the connection is the next session's, nothing else.
    let (sid2, stdout, _stderr, terminal) = run_to_terminal(&mut ws, "echo again", "/tmp").await;
    assert_ne!(sid2, session_id);
    assert_eq!(stdout, "again\n");
    assert!(matches!(terminal, Envelope::Complete { exit_code: 0, .. }));
}

#[tokio::test]
async fn cancelling_another_connections_session_is_rejected() {
    let (url, token, ctx) = start_test_daemon().await;
    let mut ws_a = connect_and_auth(&url, &token).await;
    let mut ws_b = connect_and_auth(&url, &token).await;

    send(
        &mut ws_a,
        &Envelope::Execute {
            command: "sleep 100".to_string(),
            cwd: "/tmp".to_string(),
        },
    )
    .await;
    let sid_a = match recv(&mut ws_a).await {
        Some(Envelope::Started { session_id, .. }) => session_id,
        other => panic!("expected started, got {other:?}"),
    };

    // B may not cancel A's session.
    send(&mut ws_b, &Envelope::Cancel { session_id: sid_a }).await;
    match recv(&mut ws_b).await {
        Some(Envelope::Error {
            session_id: Some(sid),
            message,
        }) => {
            assert_eq!(sid, sid_a);
            assert!(message.contains("not owned"), "got: {message}");
        }
        other => panic!("expected ownership error, got {other:?}"),
    }

    // A's session is untouched and still cancellable by A itself.
    assert_eq!(ctx.registry.active_count().await, 1);
    send(&mut ws_a, &Envelope::Cancel { session_id: sid_a }).await;
    match recv(&mut ws_a).await {
        Some(Envelope::Cancelled { session_id }) => assert_eq!(session_id, sid_a),
        other => panic!("expected cancelled, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_sessions_on_separate_connections_are_isolated() {
    let (url, token, _ctx) = start_test_daemon().await;
    let mut ws_a = connect_and_auth(&url, &token).await;
    let mut ws_b = connect_and_auth(&url, &token).await;

    send(
        &mut ws_a,
        &Envelope::Execute {
            command: "sleep 100".to_string(),
            cwd: "/tmp".to_string(),
        },
    )
    .await;
    let sid_a = match recv(&mut ws_a).await {
        Some(Envelope::Started { session_id, .. }) => session_id,
        other => panic!("expected started, got {other:?}"),
    };

    // Cancelling A's session must not disturb B's.
    send(&mut ws_a, &Envelope::Cancel { session_id: sid_a }).await;
    match recv(&mut ws_a).await {
        Some(Envelope::Cancelled { .. }) => {}
        other => panic!("expected cancelled, got {other:?}"),
    }

    let (_sid_b, stdout, _stderr, terminal) = run_to_terminal(&mut ws_b, "echo hello", "/tmp").await;
    assert_eq!(stdout, "hello\n");
    assert!(matches!(terminal, Envelope::Complete { exit_code: 0, .. }));
}

// ─── Disconnect ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn disconnect_cancels_every_owned_session() {
    let (url, token, ctx) = start_test_daemon().await;
    let mut ws = connect_and_auth(&url, &token).await;

    for _ in 0..2 {
        send(
            &mut ws,
            &Envelope::Execute {
                command: "sleep 100".to_string(),
                cwd: "/tmp".to_string(),
            },
        )
        .await;
        match recv(&mut ws).await {
            Some(Envelope::Started { .. }) => {}
            other => panic!("expected started, got {other:?}"),
        }
    }
    assert_eq!(ctx.registry.active_count().await, 2);

    drop(ws);

    // Both sessions reach a terminal state and are evicted; their processes
    // are reaped by the supervisors.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while ctx.registry.active_count().await > 0 {
        assert!(
            std::time::Instant::now() < deadline,
            "sessions survived their connection"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ─── Protocol violations ─────────────────────────────────────────────────────

#[tokio::test]
async fn out_of_order_message_closes_connection() {
    let (url, token, _ctx) = start_test_daemon().await;
    let mut ws = connect_and_auth(&url, &token).await;

    // A client must never send daemon->client variants.
    send(
        &mut ws,
        &Envelope::Complete {
            session_id: Uuid::new_v4(),
            exit_code: 0,
        },
    )
    .await;
    match recv(&mut ws).await {
        Some(Envelope::Error {
            session_id: None,
            message,
        }) => assert!(message.contains("unexpected"), "got: {message}"),
        other => panic!("expected protocol error, got {other:?}"),
    }
    assert!(recv(&mut ws).await.is_none(), "connection should be closed");
}

#[tokio::test]
async fn malformed_frame_closes_connection() {
    let (url, token, _ctx) = start_test_daemon().await;
    let mut ws = connect_and_auth(&url, &token).await;

    ws.send(Message::Text("{not json".to_string())).await.unwrap();
    match recv(&mut ws).await {
        Some(Envelope::Error {
            session_id: None, ..
        }) => {}
        other => panic!("expected protocol error, got {other:?}"),
    }
    assert!(recv(&mut ws).await.is_none(), "connection should be closed");
}

// ─── Health endpoint ─────────────────────────────────────────────────────────

#[tokio::test]
async fn health_endpoint_answers_plain_http() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (url, _token, _ctx) = start_test_daemon().await;
    let addr = url.trim_start_matches("ws://").to_string();

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains(r#""status":"ok""#));
    assert!(response.contains("activeSessions"));
}
