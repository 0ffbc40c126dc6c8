//! Layered configuration: CLI flags (with `clap`'s `env` fallback) over
//! environment variables over built-in defaults, plus a `Storage`-backed
//! settings table for the handful of values that can change without a
//! restart (see [`crate::storage::Storage::get_setting`]).

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use std::path::PathBuf;

const DEFAULT_PORT: u16 = 4300;
const DEFAULT_MAX_SESSIONS: usize = 10;
/// §4.6's `T_idle`: minutes of inactivity with no open bridge connection
/// before the idle reaper pauses a session. Spec default is 5 minutes.
const DEFAULT_IDLE_MINUTES: i64 = 5;
const DEFAULT_PRUNE_DAYS: u32 = 30;
const DEFAULT_AGENT_BINARY: &str = "agent";

/// Resolved daemon configuration. Built once at startup from CLI args (which
/// already carry their own env fallback via `clap(env = "...")`) plus the
/// remaining environment variables spec.md §6 doesn't expose as flags.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub host: String,
    /// RPC Bridge WebSocket port — the one CLI `--port`/`RELAY_PORT` controls.
    pub port: u16,
    /// REST surface port. Not independently configurable; derived so the
    /// two listeners never collide without requiring a second CLI flag.
    pub rest_port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    pub max_sessions: usize,
    /// Minutes of inactivity (with no open bridge connection) before the
    /// idle reaper pauses a session's sandbox (`active -> idle`).
    pub idle_minutes: i64,
    /// Days an archived/error session is retained before the event pruner
    /// removes it (0 = never prune).
    pub session_prune_days: u32,
    /// `SANDBOX_PROVIDER` — one of `mock`, `docker`, `cloudflare`.
    pub sandbox_provider: String,
    /// Path to the agent binary the `docker`/local-container provider spawns.
    pub agent_binary: PathBuf,
    /// Base URL of the remote worker fleet (`cloudflare` provider).
    pub remote_base_url: String,
    /// Shared-secret bearer token for the remote worker fleet.
    pub remote_token: String,
}

impl DaemonConfig {
    /// `host`/`port`/`data_dir`/`log` arrive already resolved by clap (CLI
    /// flag, falling back to its `env` attribute, falling back to clap's
    /// default).
    pub fn new(host: String, port: u16, data_dir: PathBuf, log: String, max_sessions: usize) -> Self {
        let idle_minutes = std::env::var("RELAY_IDLE_MINUTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_IDLE_MINUTES);
        let session_prune_days = std::env::var("RELAY_PRUNE_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PRUNE_DAYS);
        let sandbox_provider = std::env::var("SANDBOX_PROVIDER").unwrap_or_else(|_| "mock".to_string());
        let agent_binary = std::env::var("RELAY_AGENT_BINARY")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_AGENT_BINARY));
        let remote_base_url = std::env::var("RELAY_REMOTE_URL").unwrap_or_default();
        let remote_token = std::env::var("RELAY_REMOTE_TOKEN").unwrap_or_default();

        Self {
            host,
            port,
            rest_port: port.saturating_add(1),
            data_dir,
            log,
            max_sessions,
            idle_minutes,
            session_prune_days,
            sandbox_provider,
            agent_binary,
            remote_base_url,
            remote_token,
        }
    }
}

/// Default data dir when `--data-dir`/`RELAY_DATA_DIR` is unset.
pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library").join("Application Support").join("relayd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("relayd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("relayd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("relayd");
        }
    }
    PathBuf::from(".relayd")
}

pub fn default_port() -> u16 {
    DEFAULT_PORT
}

pub fn default_max_sessions() -> usize {
    DEFAULT_MAX_SESSIONS
}

/// Reads and base64-decodes `RELAY_ENCRYPTION_KEY`, plus the optional
/// `RELAY_ENCRYPTION_KEY_VERSION` (default 1). A missing or malformed key is
/// a configuration error — the caller maps it to exit code 1 rather than
/// starting a daemon that can never decrypt its own secrets.
pub fn encryption_key_from_env() -> Result<(Vec<u8>, i64)> {
    let raw = std::env::var("RELAY_ENCRYPTION_KEY")
        .map_err(|_| anyhow!("RELAY_ENCRYPTION_KEY is required (base64-encoded, 32 bytes)"))?;
    let key = base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .context("RELAY_ENCRYPTION_KEY is not valid base64")?;
    if key.len() != 32 {
        return Err(anyhow!("RELAY_ENCRYPTION_KEY must decode to exactly 32 bytes, got {}", key.len()));
    }
    let version = std::env::var("RELAY_ENCRYPTION_KEY_VERSION")
        .ok()
        .map(|v| v.parse::<i64>().context("RELAY_ENCRYPTION_KEY_VERSION must be an integer"))
        .transpose()?
        .unwrap_or(1);
    Ok((key, version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rest_port_is_derived_from_bridge_port() {
        let cfg = DaemonConfig::new("0.0.0.0".into(), 4300, PathBuf::from("/tmp/relayd-test"), "info".into(), 10);
        assert_eq!(cfg.rest_port, 4301);
    }

    #[test]
    fn sandbox_provider_defaults_to_mock() {
        std::env::remove_var("SANDBOX_PROVIDER");
        let cfg = DaemonConfig::new("0.0.0.0".into(), 4300, PathBuf::from("/tmp/relayd-test"), "info".into(), 10);
        assert_eq!(cfg.sandbox_provider, "mock");
    }
}
