pub mod config;
pub mod ipc;
pub mod session;

// Re-export auth so main.rs can use corexd::auth directly.
pub use ipc::auth;

use std::sync::Arc;

use config::DaemonConfig;
use ipc::auth::TokenStore;
use session::SessionRegistry;

/// Shared application state passed to every connection handler and session
/// supervisor.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    /// The single source of truth for in-flight sessions — the only shared
    /// structure mutated from multiple tasks.
    pub registry: Arc<SessionRegistry>,
    /// Every new connection must present this run's token in an `auth`
    /// message before any other traffic is accepted.
    pub token_store: Arc<TokenStore>,
    pub started_at: std::time::Instant,
}
