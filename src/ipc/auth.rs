use anyhow::{Context, Result};
use rand_core::{OsRng, RngCore};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Random bytes per token; hex-encoded on disk (64 chars, 256 bits).
const TOKEN_BYTES: usize = 32;

/// The shared secret gating access to the daemon.
///
/// A fresh token is generated on every daemon start and written to
/// `{data_dir}/auth_token` with user-only read/write permissions (mode 0600
/// on Unix), overwriting whatever a previous run left behind — exactly one
/// token is valid at a time. The GUI client reads the file out-of-band and
/// presents the token in its `auth` message.
///
/// The token file must be kept secret — it is the only credential protecting
/// the local WebSocket port from other processes on the same machine.
pub struct TokenStore {
    token: String,
    path: PathBuf,
}

impl TokenStore {
    /// Generate and persist a new token, invalidating any previous one.
    ///
    /// Failure here must abort daemon startup: without a readable token file
    /// a legitimate client can never authenticate.
    pub fn generate(data_dir: &Path) -> Result<Self> {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        let path = token_path(data_dir);
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;
        std::fs::write(&path, &token)
            .with_context(|| format!("writing token file {}", path.display()))?;

        // Restrict to owner read/write only on Unix
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("setting permissions on {}", path.display()))?;
        }

        Ok(Self { token, path })
    }

    /// Constant-time check of a candidate token against the current one.
    /// Empty or malformed input returns false without erroring.
    pub fn verify(&self, candidate: &str) -> bool {
        constant_time_eq(self.token.as_bytes(), candidate.as_bytes())
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best-effort removal of the token file on clean shutdown. A stale file
    /// from an unclean exit is harmless — the next start overwrites it, and
    /// clients treat staleness as "daemon needs a restart".
    pub fn remove_file(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Location of the token file inside a data directory.
pub fn token_path(data_dir: &Path) -> PathBuf {
    data_dir.join("auth_token")
}

/// Byte equality without early exit, so comparison time does not leak how
/// many leading bytes matched. Length mismatch returns immediately — the
/// length of the real token is not a secret.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Warn when the token file is readable by group or world (e.g. restrictive
/// umask lost to a copy, or a non-Unix filesystem mount).
pub fn check_token_permissions(data_dir: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let path = token_path(data_dir);
        if let Ok(meta) = std::fs::metadata(&path) {
            let mode = meta.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                warn!(
                    path = %path.display(),
                    mode = format!("{mode:o}"),
                    "auth token file is readable by other users — expected 0600"
                );
            }
        }
    }
    #[cfg(not(unix))]
    let _ = data_dir;
}
