//! Wire protocol between the daemon and its local GUI client.
//!
//! One JSON-encoded [`Envelope`] per WebSocket text frame. Encoding is total
//! over all variants; decoding enforces a frame-size cap and returns a typed
//! [`DecodeError`] instead of panicking into caller state. Both directions
//! share the same tagged union — which variants are *acceptable* at a given
//! point in the conversation is the connection handler's business, not the
//! codec's.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Which child stream an output chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// The message envelope exchanged over a connection.
///
/// `started` is the daemon's acknowledgement of an `execute` — it carries the
/// session id the client needs to correlate `output` messages and issue
/// `cancel`. Exactly one of `complete`, `cancelled`, or `error` terminates a
/// session; nothing for that session follows its terminal message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// First message on every connection: the candidate auth token.
    Auth { token: String },
    AuthOk,
    /// Authentication rejected; the connection closes right after.
    AuthFail { reason: String },
    /// Run `command` (POSIX word-split, no shell) inside `cwd`.
    Execute { command: String, cwd: String },
    /// The session was created and its process spawned.
    Started {
        session_id: Uuid,
        command: String,
        cwd: String,
    },
    /// One chunk of child output. Byte order within a stream is preserved.
    Output {
        session_id: Uuid,
        stream: StreamKind,
        data: String,
    },
    /// Terminal: the process ran to completion.
    Complete { session_id: Uuid, exit_code: i32 },
    /// Terminal: the session was cancelled before natural completion.
    Cancelled { session_id: Uuid },
    /// Session-scoped failure (with id) or connection-scoped complaint (without).
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
        message: String,
    },
    /// Request termination of a running session owned by this connection.
    Cancel { session_id: Uuid },
}

impl Envelope {
    /// The wire tag, for logging and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Auth { .. } => "auth",
            Envelope::AuthOk => "auth_ok",
            Envelope::AuthFail { .. } => "auth_fail",
            Envelope::Execute { .. } => "execute",
            Envelope::Started { .. } => "started",
            Envelope::Output { .. } => "output",
            Envelope::Complete { .. } => "complete",
            Envelope::Cancelled { .. } => "cancelled",
            Envelope::Error { .. } => "error",
            Envelope::Cancel { .. } => "cancel",
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame of {len} bytes exceeds the {max}-byte limit")]
    Oversized { len: usize, max: usize },
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode an envelope as a JSON text frame.
pub fn encode(msg: &Envelope) -> String {
    // The envelope contains nothing that can fail to serialize.
    serde_json::to_string(msg).unwrap_or_default()
}

/// Decode one text frame. Frames above `max_frame_bytes` are rejected before
/// any parsing happens.
pub fn decode(text: &str, max_frame_bytes: usize) -> Result<Envelope, DecodeError> {
    if text.len() > max_frame_bytes {
        return Err(DecodeError::Oversized {
            len: text.len(),
            max: max_frame_bytes,
        });
    }
    Ok(serde_json::from_str(text)?)
}
