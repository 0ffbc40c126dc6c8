pub mod bridge;
pub mod config;
pub mod journal;
pub mod repo;
pub mod rest;
pub mod sandbox;
pub mod scheduler;
pub mod secrets;
pub mod session;
pub mod storage;

use std::sync::Arc;

use bridge::event::EventBroadcaster;
use config::DaemonConfig;
use journal::Journal;
use repo::RepoRegistry;
use secrets::SecretBox;
use session::SessionManager;
use storage::Storage;

/// Shared application state handed to every REST route, the bridge accept
/// loop, and the scheduler's background tasks.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub storage: Arc<Storage>,
    pub journal: Arc<Journal>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub repo_registry: Arc<RepoRegistry>,
    pub session_manager: Arc<SessionManager>,
    pub secrets: Arc<SecretBox>,
    pub started_at: std::time::Instant,
}
