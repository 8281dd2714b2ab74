pub mod auth;
pub mod protocol;

use crate::session::executor;
use crate::AppContext;
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use self::protocol::Envelope;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long a fresh connection gets to present its `auth` message.
const AUTH_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Outbound channel ────────────────────────────────────────────────────────

/// Handle for queueing outbound messages to one client connection.
///
/// Senders never block: the queue is bounded, and overflow marks the
/// connection stalled, which terminates it (and, through the disconnect
/// path, every session it owns). That keeps a slow client from wedging an
/// executor's read loop or growing daemon memory without bound.
#[derive(Clone)]
pub struct ClientChannel {
    connection_id: Uuid,
    tx: mpsc::Sender<Envelope>,
    stalled: Arc<Notify>,
}

impl ClientChannel {
    pub fn send(&self, msg: Envelope) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                warn!(
                    connection = %self.connection_id,
                    dropped = msg.kind(),
                    "outbound buffer full — marking connection stalled"
                );
                self.stalled.notify_one();
            }
            // Receiver gone: the connection is already closing and its
            // sessions are being cancelled by the disconnect path.
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

// ─── Server ──────────────────────────────────────────────────────────────────

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let addr = format!("{}:{}", ctx.config.bind_address, ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "agent listening (WebSocket + HTTP health on same port)");

    // Graceful shutdown: resolve on SIGTERM (Unix) or Ctrl-C (all platforms).
    // Pinned so we can use it in the select! loop without moving.
    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — cancelling sessions and stopping");
                drain_sessions(&ctx).await;
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("agent stopped");
    Ok(())
}

/// Cancel every live session and wait (bounded by the kill grace period)
/// until their supervisors have reaped the children.
async fn drain_sessions(ctx: &AppContext) {
    let cancelled = ctx.registry.cancel_all().await;
    if cancelled == 0 {
        return;
    }
    info!(sessions = cancelled, "waiting for sessions to terminate");
    let deadline = Duration::from_secs(ctx.config.limits.cancel_grace_secs + 2);
    let _ = tokio::time::timeout(deadline, async {
        while ctx.registry.active_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
}

/// Returns a future that resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Respond to an HTTP `GET /health` request with a JSON status document.
///
/// The daemon shares its port between WebSocket traffic and a plain HTTP
/// health endpoint so clients can check liveness without a WS library.
async fn handle_health_check(mut stream: TcpStream, ctx: &AppContext) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // Consume the request (we don't inspect it — any GET /health is fine).
    let mut req_buf = vec![0u8; 1024];
    let _ = stream.read(&mut req_buf).await;

    let body = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": ctx.started_at.elapsed().as_secs(),
        "activeSessions": ctx.registry.active_count().await,
        "port": ctx.config.port,
    });
    let body_str = body.to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body_str.len(),
        body_str
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

// ─── Per-connection handler ──────────────────────────────────────────────────

async fn handle_connection(stream: TcpStream, ctx: Arc<AppContext>) -> Result<()> {
    // GET /health shares the port; everything else is a WebSocket upgrade
    // (which also starts with "GET " but on a different path).
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n >= 11 && &peek_buf[..11] == b"GET /health" {
        return handle_health_check(stream, &ctx).await;
    }

    let ws = accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();
    let connection_id = Uuid::new_v4();
    let max_frame = ctx.config.limits.max_frame_bytes;

    // ── Auth handshake ───────────────────────────────────────────────────
    // The first frame from every client must be an `auth` message carrying
    // the current token. Anything else — wrong token, out-of-order message,
    // undecodable frame, or silence past the deadline — closes the
    // connection after at most one `auth_fail`.
    let first = tokio::time::timeout(AUTH_HANDSHAKE_TIMEOUT, stream.next()).await;
    let text = match first {
        Ok(Some(Ok(Message::Text(t)))) => t,
        // Timeout, connection closed, or non-text frame — reject silently.
        _ => return Ok(()),
    };

    let reject = match protocol::decode(&text, max_frame) {
        Ok(Envelope::Auth { token }) if ctx.token_store.verify(&token) => None,
        Ok(Envelope::Auth { .. }) => Some("invalid token".to_string()),
        Ok(other) => Some(format!(
            "authentication required — got {} before auth",
            other.kind()
        )),
        Err(e) => Some(format!("protocol violation: {e}")),
    };
    if let Some(reason) = reject {
        warn!(connection = %connection_id, reason = %reason, "authentication failed");
        let reply = Envelope::AuthFail { reason };
        let _ = sink.send(Message::Text(protocol::encode(&reply))).await;
        let _ = sink.close().await;
        return Ok(());
    }
    sink.send(Message::Text(protocol::encode(&Envelope::AuthOk)))
        .await?;
    debug!(connection = %connection_id, "client authenticated");

    // ── Authenticated loop ───────────────────────────────────────────────
    let (tx, mut rx) = mpsc::channel::<Envelope>(ctx.config.limits.outbound_buffer);
    let stalled = Arc::new(Notify::new());
    let client = ClientChannel {
        connection_id,
        tx,
        stalled: stalled.clone(),
    };

    loop {
        tokio::select! {
            // Incoming message from the client
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match handle_frame(&text, connection_id, &client, &ctx).await {
                            FrameOutcome::Continue => {}
                            FrameOutcome::Violation(reply) => {
                                warn!(connection = %connection_id, "protocol violation — closing");
                                let _ = sink.send(Message::Text(protocol::encode(&reply))).await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, err = %e, "ws error");
                        break;
                    }
                    _ => {}
                }
            }
            // Outgoing session traffic
            outbound = rx.recv() => {
                // The sender half lives in `client` above, so recv() yields
                // Some until this loop ends.
                if let Some(msg) = outbound {
                    if let Err(e) = sink.send(Message::Text(protocol::encode(&msg))).await {
                        warn!(connection = %connection_id, err = %e, "send error");
                        break;
                    }
                }
            }
            // A sender hit the buffer bound — the client is not draining.
            _ = stalled.notified() => {
                warn!(connection = %connection_id, "outbound buffer overflow — closing stalled connection");
                break;
            }
        }
    }

    // Disconnect, graceful or not: no session may outlive its connection.
    let cancelled = ctx.registry.cancel_all_for(connection_id).await;
    if cancelled > 0 {
        info!(
            connection = %connection_id,
            sessions = cancelled,
            "cancelled sessions for closed connection"
        );
    }
    let _ = sink.close().await;
    Ok(())
}

enum FrameOutcome {
    Continue,
    /// Protocol violation: send this final message, then close the connection.
    Violation(Envelope),
}

async fn handle_frame(
    text: &str,
    connection_id: Uuid,
    client: &ClientChannel,
    ctx: &Arc<AppContext>,
) -> FrameOutcome {
    let msg = match protocol::decode(text, ctx.config.limits.max_frame_bytes) {
        Ok(m) => m,
        Err(e) => {
            return FrameOutcome::Violation(Envelope::Error {
                session_id: None,
                message: format!("protocol violation: {e}"),
            });
        }
    };

    match msg {
        Envelope::Execute { command, cwd } => {
            let limit = ctx.config.limits.max_sessions;
            if limit > 0 && ctx.registry.active_count().await >= limit {
                client.send(Envelope::Error {
                    session_id: None,
                    message: format!("session limit reached ({limit})"),
                });
                return FrameOutcome::Continue;
            }
            let session = ctx.registry.create(connection_id, &command, &cwd).await;
            info!(
                session = %session.id,
                connection = %connection_id,
                command = %command,
                cwd = %cwd,
                "execute"
            );
            tokio::spawn(executor::run(ctx.clone(), session.id, client.clone()));
            FrameOutcome::Continue
        }
        Envelope::Cancel { session_id } => {
            match ctx.registry.get(session_id).await {
                Some(s) if s.connection_id != connection_id => {
                    // A connection may only cancel its own sessions.
                    warn!(
                        connection = %connection_id,
                        session = %session_id,
                        "cancel rejected — session owned by another connection"
                    );
                    client.send(Envelope::Error {
                        session_id: Some(session_id),
                        message: "session is not owned by this connection".to_string(),
                    });
                }
                Some(_) => {
                    let outcome = ctx.registry.request_cancel(session_id).await;
                    debug!(session = %session_id, outcome = ?outcome, "cancel requested");
                }
                // Unknown or already-evicted session: cancelling after
                // completion is a no-op, not an error.
                None => {}
            }
            FrameOutcome::Continue
        }
        // Everything else is out-of-order traffic: daemon->client variants
        // echoed back, or a second auth.
        other => FrameOutcome::Violation(Envelope::Error {
            session_id: None,
            message: format!("unexpected {} message", other.kind()),
        }),
    }
}
