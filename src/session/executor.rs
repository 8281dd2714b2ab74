//! Child-process execution for one session.
//!
//! [`run`] is spawned once per `execute` request. It owns the child process
//! for its entire life, reads stdout and stderr concurrently (never blocking
//! one on the other), and is the only place that emits the session's terminal
//! message — which is always the last message the client sees for that
//! session.

use crate::ipc::protocol::{Envelope, StreamKind};
use crate::ipc::ClientChannel;
use crate::session::{Finalize, SessionStatus};
use crate::AppContext;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use uuid::Uuid;

const READ_CHUNK_BYTES: usize = 8192;

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("command is empty")]
    EmptyCommand,
    #[error("command could not be parsed: {0:?}")]
    Unparseable(String),
    #[error("working directory {0:?} does not exist")]
    WorkdirMissing(String),
    #[error("working directory {0:?} is not a directory")]
    WorkdirNotDir(String),
    #[error("failed to start {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Split the wire command line into an argument vector using POSIX word
/// rules. No shell is interposed — the first word is the program, resolved
/// via PATH.
fn parse_command(command: &str) -> Result<Vec<String>, SpawnError> {
    if command.trim().is_empty() {
        return Err(SpawnError::EmptyCommand);
    }
    let argv =
        shlex::split(command).ok_or_else(|| SpawnError::Unparseable(command.to_string()))?;
    if argv.is_empty() {
        return Err(SpawnError::EmptyCommand);
    }
    Ok(argv)
}

fn check_workdir(cwd: &str) -> Result<(), SpawnError> {
    let path = Path::new(cwd);
    if !path.exists() {
        return Err(SpawnError::WorkdirMissing(cwd.to_string()));
    }
    if !path.is_dir() {
        return Err(SpawnError::WorkdirNotDir(cwd.to_string()));
    }
    Ok(())
}

fn spawn_child(argv: &[String], cwd: &str) -> Result<Child, SpawnError> {
    Command::new(&argv[0])
        .args(&argv[1..])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SpawnError::Spawn {
            program: argv[0].clone(),
            source,
        })
}

/// Run one session's command to its terminal message, then evict the session.
pub async fn run(ctx: Arc<AppContext>, session_id: Uuid, client: ClientChannel) {
    let Some(session) = ctx.registry.get(session_id).await else {
        return;
    };

    // ── Validate + spawn ─────────────────────────────────────────────────
    // All of these fail the session pending -> failed with no process created.
    let argv = match parse_command(&session.command)
        .and_then(|argv| check_workdir(&session.cwd).map(|_| argv))
    {
        Ok(argv) => argv,
        Err(e) => {
            fail_session(&ctx, session_id, &client, e.to_string()).await;
            return;
        }
    };
    let mut child = match spawn_child(&argv, &session.cwd) {
        Ok(child) => child,
        Err(e) => {
            fail_session(&ctx, session_id, &client, e.to_string()).await;
            return;
        }
    };

    if let Err(e) = ctx.registry.transition(session_id, SessionStatus::Running).await {
        // Registry refused running — the session is gone or already finalized.
        warn!(session = %session_id, err = %e, "could not mark session running");
        let _ = child.kill().await;
        let _ = child.wait().await;
        ctx.registry.remove(session_id).await;
        return;
    }

    client.send(Envelope::Started {
        session_id,
        command: session.command.clone(),
        cwd: session.cwd.clone(),
    });
    debug!(session = %session_id, pid = ?child.id(), "process started");

    // ── Stream pumps ─────────────────────────────────────────────────────
    // One task per stream; each preserves byte order within its stream.
    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        // Pipes were requested at spawn, so this should not happen; treat the
        // child as unusable rather than running it blind.
        let _ = child.kill().await;
        let _ = child.wait().await;
        finalize_and_notify(
            &ctx,
            session_id,
            &client,
            SessionStatus::Failed,
            None,
            Envelope::Error {
                session_id: Some(session_id),
                message: "child process pipes unavailable".to_string(),
            },
        )
        .await;
        return;
    };
    let out_pump = tokio::spawn(pump_stream(
        stdout,
        StreamKind::Stdout,
        session_id,
        client.clone(),
    ));
    let err_pump = tokio::spawn(pump_stream(
        stderr,
        StreamKind::Stderr,
        session_id,
        client.clone(),
    ));

    // ── Supervise ────────────────────────────────────────────────────────
    let cancel = session.cancel.clone();
    let grace = Duration::from_secs(ctx.config.limits.cancel_grace_secs);

    let (exit_status, was_cancelled) = tokio::select! {
        status = child.wait() => (status, false),
        _ = cancel.cancelled() => (terminate(&mut child, grace).await, true),
    };

    // The pipes close when the child dies, so both pumps run to EOF here.
    // Joining them before the terminal message guarantees no output follows it.
    let out_failure = pump_failure(out_pump.await);
    let err_failure = pump_failure(err_pump.await);
    let stream_error = out_failure.or(err_failure);

    let (status, exit_code, terminal) = if was_cancelled {
        (
            SessionStatus::Cancelled,
            None,
            Envelope::Cancelled { session_id },
        )
    } else {
        match exit_status {
            Ok(es) => {
                if let Some(message) = stream_error {
                    // Partial output was already delivered; the session still
                    // must not report success.
                    (
                        SessionStatus::Failed,
                        es.code(),
                        Envelope::Error {
                            session_id: Some(session_id),
                            message: format!("output stream failed: {message}"),
                        },
                    )
                } else if let Some(code) = es.code() {
                    (
                        SessionStatus::Completed,
                        Some(code),
                        Envelope::Complete {
                            session_id,
                            exit_code: code,
                        },
                    )
                } else {
                    // Killed by a signal we did not send.
                    (
                        SessionStatus::Failed,
                        None,
                        Envelope::Error {
                            session_id: Some(session_id),
                            message: signal_message(&es),
                        },
                    )
                }
            }
            Err(e) => (
                SessionStatus::Failed,
                None,
                Envelope::Error {
                    session_id: Some(session_id),
                    message: format!("failed to reap child process: {e}"),
                },
            ),
        }
    };

    finalize_and_notify(&ctx, session_id, &client, status, exit_code, terminal).await;
}

/// Graceful stop signal first, forced kill after the grace period.
async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid was returned by our own spawned child.
            unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        }
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
        debug!(pid = ?child.id(), grace_secs = grace.as_secs(), "grace period expired — killing");
    }
    #[cfg(not(unix))]
    let _ = grace; // no graceful stop signal on this platform
    child.start_kill()?;
    child.wait().await
}

/// Apply the terminal transition, send the terminal message if this caller
/// won, then evict the session.
async fn finalize_and_notify(
    ctx: &AppContext,
    session_id: Uuid,
    client: &ClientChannel,
    status: SessionStatus,
    exit_code: Option<i32>,
    terminal: Envelope,
) {
    match ctx.registry.finalize(session_id, status, exit_code).await {
        Ok(Finalize::Won) => client.send(terminal),
        Ok(Finalize::AlreadyTerminal(prior)) => {
            debug!(session = %session_id, status = prior.as_str(), "terminal transition lost the race");
        }
        Err(e) => warn!(session = %session_id, err = %e, "terminal transition rejected"),
    }
    ctx.registry.remove(session_id).await;
}

/// Fail a session that never produced a process.
async fn fail_session(ctx: &AppContext, session_id: Uuid, client: &ClientChannel, message: String) {
    finalize_and_notify(
        ctx,
        session_id,
        client,
        SessionStatus::Failed,
        None,
        Envelope::Error {
            session_id: Some(session_id),
            message,
        },
    )
    .await;
}

fn pump_failure(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Option<String> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(e) => Some(format!("output reader task failed: {e}")),
    }
}

#[cfg(unix)]
fn signal_message(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(sig) => format!("process terminated by signal {sig}"),
        None => "process terminated abnormally".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_message(_status: &std::process::ExitStatus) -> String {
    "process terminated abnormally".to_string()
}

// ─── Stream pumping ──────────────────────────────────────────────────────────

/// Read one child stream to EOF, emitting an `output` message per chunk.
async fn pump_stream<R>(
    mut reader: R,
    stream: StreamKind,
    session_id: Uuid,
    client: ClientChannel,
) -> std::io::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut carry: Vec<u8> = Vec::new();
    let mut buf = [0u8; READ_CHUNK_BYTES];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        carry.extend_from_slice(&buf[..n]);
        let text = drain_utf8(&mut carry);
        if !text.is_empty() {
            client.send(Envelope::Output {
                session_id,
                stream,
                data: text,
            });
        }
    }
    if !carry.is_empty() {
        // Trailing bytes that never completed a UTF-8 sequence.
        let text = String::from_utf8_lossy(&carry).into_owned();
        client.send(Envelope::Output {
            session_id,
            stream,
            data: text,
        });
    }
    Ok(())
}

/// Take the decodable prefix of `buf` as text, replacing invalid sequences
/// and keeping an incomplete trailing character (at most 3 bytes) for the
/// next chunk. This keeps multi-byte characters split across read boundaries
/// intact, so concatenating the emitted chunks reconstructs the stream.
fn drain_utf8(buf: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        let (valid, bad) = match std::str::from_utf8(buf) {
            Ok(_) => (buf.len(), None),
            Err(e) => (e.valid_up_to(), e.error_len()),
        };
        out.push_str(&String::from_utf8_lossy(&buf[..valid]));
        match bad {
            Some(n) => {
                out.push('\u{FFFD}');
                buf.drain(..valid + n);
            }
            None => {
                buf.drain(..valid);
                break;
            }
        }
    }
    out
}
