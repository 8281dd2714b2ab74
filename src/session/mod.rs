pub mod executor;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

// ─── Session state ───────────────────────────────────────────────────────────

/// Lifecycle state of a session.
///
/// `pending → running → {completed, failed, cancelled}`, with the shortcut
/// `pending → failed` when the process never starts. The three right-hand
/// states are terminal; a terminal session is immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

fn legal(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Failed)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
    )
}

// ─── Cancellation handle ─────────────────────────────────────────────────────

/// Cancellation signal shared between the registry and the one task
/// supervising the session's child process.
///
/// Requesting is idempotent and safe at any point in the session's life,
/// including after natural completion — the supervising task is the single
/// consumer and resolves late requests as no-ops.
#[derive(Debug)]
pub struct CancelFlag {
    requested: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
        // notify_one stores a permit when no task is waiting yet, so a
        // request that lands before the supervisor starts waiting still wakes it.
        self.notify.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Wait until cancellation has been requested. Completes immediately if
    /// it already was.
    pub async fn cancelled(&self) {
        if self.is_requested() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// One tracked command execution, from spawn to terminal state.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    /// The connection that created (and exclusively owns) this session.
    pub connection_id: Uuid,
    pub command: String,
    pub cwd: String,
    pub status: SessionStatus,
    /// Set only in terminal states, and only when the process reported one.
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Present for the whole lifetime so cancel requests have somewhere to
    /// land even before spawn confirms.
    pub cancel: Arc<CancelFlag>,
}

// ─── Errors and outcomes ─────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session not found")]
    NotFound,
    #[error("illegal transition {} -> {}", .from.as_str(), .to.as_str())]
    IllegalTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
}

/// Result of a terminal transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalize {
    /// This caller performed the terminal transition.
    Won,
    /// Another path already finalized the session; this attempt is a no-op.
    AlreadyTerminal(SessionStatus),
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Requested,
    /// The session finished before the request landed — the classic
    /// cancel/completion race, resolved silently.
    AlreadyTerminal,
    /// Unknown (or already evicted) session id.
    NotFound,
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// The single source of truth for which sessions exist, who owns them, and
/// where they are in their lifecycle.
///
/// This is the only structure in the daemon mutated from multiple tasks
/// (connection handlers and session supervisors); every mutation happens
/// under its lock, which makes terminal transitions linearizable — when a
/// natural completion and a cancellation race, exactly one wins.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate a fresh session in `pending` state.
    pub async fn create(&self, connection_id: Uuid, command: &str, cwd: &str) -> Session {
        let session = Session {
            id: Uuid::new_v4(),
            connection_id,
            command: command.to_string(),
            cwd: cwd.to_string(),
            status: SessionStatus::Pending,
            exit_code: None,
            created_at: Utc::now(),
            finished_at: None,
            cancel: Arc::new(CancelFlag::new()),
        };
        self.sessions.write().await.insert(session.id, session.clone());
        debug!(session = %session.id, connection = %connection_id, "session created");
        session
    }

    /// Snapshot of a session, if it still exists.
    pub async fn get(&self, id: Uuid) -> Option<Session> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Sessions not yet in a terminal state.
    pub async fn active_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| !s.status.is_terminal())
            .count()
    }

    /// Apply a non-terminal status transition. Illegal moves (including any
    /// mutation of a terminal session) are a programming error and rejected.
    pub async fn transition(&self, id: Uuid, to: SessionStatus) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(RegistryError::NotFound)?;
        if !legal(session.status, to) {
            return Err(RegistryError::IllegalTransition {
                from: session.status,
                to,
            });
        }
        debug!(session = %id, from = session.status.as_str(), to = to.as_str(), "transition");
        session.status = to;
        Ok(())
    }

    /// Move a session to a terminal state, resolving concurrent attempts to
    /// exactly one winner. The loser's attempt is a no-op, not an error.
    pub async fn finalize(
        &self,
        id: Uuid,
        to: SessionStatus,
        exit_code: Option<i32>,
    ) -> Result<Finalize, RegistryError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(RegistryError::NotFound)?;
        if session.status.is_terminal() {
            return Ok(Finalize::AlreadyTerminal(session.status));
        }
        if !to.is_terminal() || !legal(session.status, to) {
            return Err(RegistryError::IllegalTransition {
                from: session.status,
                to,
            });
        }
        session.status = to;
        session.exit_code = exit_code;
        session.finished_at = Some(Utc::now());
        info!(
            session = %id,
            status = to.as_str(),
            exit_code = ?exit_code,
            "session finished"
        );
        Ok(Finalize::Won)
    }

    /// Request cancellation of one session. Idempotent; no-op on terminal or
    /// already-evicted sessions.
    pub async fn request_cancel(&self, id: Uuid) -> CancelOutcome {
        let sessions = self.sessions.read().await;
        match sessions.get(&id) {
            None => CancelOutcome::NotFound,
            Some(s) if s.status.is_terminal() => CancelOutcome::AlreadyTerminal,
            Some(s) => {
                s.cancel.request();
                CancelOutcome::Requested
            }
        }
    }

    /// Request cancellation of every non-terminal session owned by a
    /// connection. Invoked on disconnect — no child process may outlive the
    /// connection that started it. Returns how many sessions were signalled.
    pub async fn cancel_all_for(&self, connection_id: Uuid) -> usize {
        let sessions = self.sessions.read().await;
        let mut n = 0;
        for s in sessions.values() {
            if s.connection_id == connection_id && !s.status.is_terminal() {
                s.cancel.request();
                n += 1;
            }
        }
        n
    }

    /// Request cancellation of every non-terminal session (daemon shutdown).
    pub async fn cancel_all(&self) -> usize {
        let sessions = self.sessions.read().await;
        let mut n = 0;
        for s in sessions.values() {
            if !s.status.is_terminal() {
                s.cancel.request();
                n += 1;
            }
        }
        n
    }

    /// Evict a session once its terminal message has been delivered.
    pub async fn remove(&self, id: Uuid) {
        self.sessions.write().await.remove(&id);
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
