//! Sandbox provider abstraction.
//!
//! A `Sandbox` is the capability contract every backend (mock, local
//! container, remote worker) implements. The [`manager::SandboxManager`]
//! dispatches to the right implementation based on `session.provider` and
//! otherwise carries no sandbox-specific logic — no in-memory bookkeeping of
//! live sandboxes lives here, only in the per-session handle the Session
//! Service keeps (see `crate::session`).

pub mod local;
pub mod manager;
pub mod mock;
pub mod remote;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::storage::EnvironmentRow;

/// Everything a provider needs to bring up a sandbox for a session. Secrets
/// are injected only here (at create/resume) and are never logged or
/// included in any error string.
pub struct SandboxContext {
    pub session_id: String,
    pub workspace: PathBuf,
    pub environment: Option<EnvironmentRow>,
    pub repo_clone_url: Option<String>,
    pub branch: Option<String>,
    /// Decrypted secret manifest, `ENV_NAME -> value`, written to the
    /// sandbox's environment at process/container start and never persisted
    /// in plaintext.
    pub secrets: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Running,
    Paused,
    Exited,
    Unknown,
}

/// The bidirectional stdio-shaped channel between the Session Service and a
/// live sandbox. `commands` carries one JSON value per line written to the
/// sandbox's stdin (or wire-equivalent); `events` carries one JSON value per
/// line read back. Agent event `type` values are intentionally opaque to
/// this layer — see the Open Question resolution in DESIGN.md.
pub struct SandboxStream {
    pub commands: mpsc::Sender<serde_json::Value>,
    pub events: mpsc::Receiver<serde_json::Value>,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Brings up a new sandbox for `ctx.session_id` and returns a
    /// provider-specific id used by subsequent calls.
    async fn create(&self, ctx: SandboxContext) -> Result<String>;

    /// Attaches to an already-created (or resumed) sandbox, returning its
    /// stdio-shaped stream. Only one attach should be outstanding per
    /// sandbox at a time — the Session Service enforces this via the
    /// per-session handle.
    async fn attach(&self, provider_id: &str) -> Result<SandboxStream>;

    async fn pause(&self, provider_id: &str) -> Result<()>;

    async fn resume(&self, provider_id: &str) -> Result<()>;

    async fn terminate(&self, provider_id: &str) -> Result<()>;

    async fn status(&self, provider_id: &str) -> Result<SandboxStatus>;
}
