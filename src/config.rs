//! Ambient configuration snapshotted from the process environment at CLI
//! entry. Components receive the fields they need by parameter; nothing
//! below this layer reads the environment ad hoc (the one-shot
//! `SI_VAULT_PRIVATE_KEY` override in `vault::keys` is the documented
//! exception).

use crate::error::Result;
use crate::util;
use std::path::PathBuf;
use std::time::Duration;

/// Default per-call deadline for custody requests.
pub const CUSTODY_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// `SI_VAULT_ENV` — environment slug fallback.
    pub vault_env: Option<String>,
    /// `SI_VAULT_ENV_FILE` — env file path fallback.
    pub vault_env_file: Option<String>,
    /// `SI_VAULT_PUBLIC_KEY` — expected public key hint; mismatch is fatal.
    pub vault_public_key_hint: Option<String>,
    /// `SI_CUSTODY_BASE_URL` — custody service base URL.
    pub custody_base_url: Option<String>,
    /// `SI_CUSTODY_TOKEN` — custody bearer token.
    pub custody_token: Option<String>,
    /// `SI_SUN_ALLOW_INSECURE_HTTP` — permit http:// to loopback only.
    pub allow_insecure_http: bool,
    /// `SI_VAULT_ALLOW_SYMLINK_ENV_FILE` — permit writes through symlinks.
    pub allow_symlink_env_file: bool,
    /// `SI_STATE_DIR` — state root override (tests, CI).
    pub state_dir: Option<PathBuf>,
    /// `DOCKER_HOST` / `DOCKER_TLS_VERIFY` — docker exec safety check.
    pub docker_host: Option<String>,
    pub docker_tls_verify: Option<String>,
    /// `--json` global flag.
    pub json: bool,
}

fn non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    /// Snapshot the process environment once.
    pub fn from_env() -> Self {
        Self {
            vault_env: non_empty("SI_VAULT_ENV"),
            vault_env_file: non_empty("SI_VAULT_ENV_FILE"),
            vault_public_key_hint: non_empty("SI_VAULT_PUBLIC_KEY"),
            custody_base_url: non_empty("SI_CUSTODY_BASE_URL"),
            custody_token: non_empty("SI_CUSTODY_TOKEN"),
            allow_insecure_http: non_empty("SI_SUN_ALLOW_INSECURE_HTTP")
                .is_some_and(|v| util::is_truthy(&v)),
            allow_symlink_env_file: non_empty("SI_VAULT_ALLOW_SYMLINK_ENV_FILE")
                .is_some_and(|v| util::is_truthy(&v)),
            state_dir: non_empty("SI_STATE_DIR").map(PathBuf::from),
            docker_host: non_empty("DOCKER_HOST"),
            docker_tls_verify: non_empty("DOCKER_TLS_VERIFY"),
            json: false,
        }
    }

    /// State root for trust and control-plane data.
    pub fn state_root(&self) -> Result<PathBuf> {
        util::state_root(self.state_dir.as_deref())
    }

    /// Construct the custody client from the configured base URL and token.
    pub fn custody(&self) -> Result<crate::custody::CustodyClient> {
        crate::custody::CustodyClient::new(
            self.custody_base_url.as_deref().unwrap_or_default(),
            self.custody_token.as_deref().unwrap_or_default(),
            CUSTODY_TIMEOUT,
            self.allow_insecure_http,
        )
    }
}
