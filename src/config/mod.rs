use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

const DEFAULT_PORT: u16 = 8765;
const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
const DEFAULT_OUTBOUND_BUFFER: usize = 1024;
const DEFAULT_CANCEL_GRACE_SECS: u64 = 5;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ─── LimitsConfig ────────────────────────────────────────────────────────────

/// Resource limits (`[limits]` in config.toml).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest accepted text frame in bytes. Larger frames are a protocol
    /// violation and close the connection.
    pub max_frame_bytes: usize,
    /// Outbound messages buffered per connection before it is considered
    /// stalled and terminated.
    pub outbound_buffer: usize,
    /// Seconds between the graceful stop signal and the forced kill when a
    /// session is cancelled.
    pub cancel_grace_secs: u64,
    /// Maximum concurrent sessions across all connections (0 = unlimited).
    pub max_sessions: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            cancel_grace_secs: DEFAULT_CANCEL_GRACE_SECS,
            max_sessions: 0,
        }
    }
}

// ─── TOML override layer ─────────────────────────────────────────────────────

/// Shape of `{data_dir}/config.toml` — all fields are optional overrides.
#[derive(Debug, Default, Deserialize)]
struct TomlConfig {
    port: Option<u16>,
    bind_address: Option<String>,
    log: Option<String>,
    log_format: Option<String>,
    limits: Option<LimitsConfig>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let text = std::fs::read_to_string(&path).ok()?;
    match toml::from_str(&text) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            warn!(path = %path.display(), err = %e, "config.toml is invalid — ignoring");
            None
        }
    }
}

// ─── DaemonConfig ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub port: u16,
    /// Bind address for the WebSocket server (default: 127.0.0.1 — the
    /// daemon is a local synchronization primitive, not a network service).
    pub bind_address: String,
    /// Holds the token file and the optional config.toml.
    pub data_dir: PathBuf,
    pub log: String,
    /// "pretty" (compact human-readable) | "json" (for log aggregators).
    pub log_format: String,
    pub limits: LimitsConfig,
}

impl DaemonConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        bind_address: Option<String>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);

        // Load TOML as the lowest-priority override layer
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let bind_address = bind_address
            .or(toml.bind_address)
            .unwrap_or_else(default_bind_address);
        let log_format = std::env::var("COREXD_LOG_FORMAT")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.log_format)
            .unwrap_or_else(|| "pretty".to_string());
        let limits = toml.limits.unwrap_or_default();

        Self {
            port,
            bind_address,
            data_dir,
            log,
            log_format,
            limits,
        }
    }
}

/// Default data directory: `$XDG_DATA_HOME/corexd` or `~/.local/share/corexd`,
/// falling back to `./.corexd` when no home is available.
pub fn default_data_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("corexd");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return PathBuf::from(home).join(".local/share/corexd");
        }
    }
    PathBuf::from(".corexd")
}
