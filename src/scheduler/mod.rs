//! Idle scheduler: two independent background loops that keep the session
//! table and event journal bounded without any client involvement.
//!
//! - **Idle reaper** pauses (`active -> idle`) sessions with no open bridge
//!   connection that have sat idle past `idle_minutes`, suspending their
//!   sandboxes along the way. This is distinct from archiving: an idle
//!   session can still be re-activated.
//! - **Event pruner** removes archived/error sessions (and, by cascade,
//!   their events) once they're older than `session_prune_days`.
//!
//! Both loops log and continue on a transient error rather than aborting —
//! a single failed sweep shouldn't take either job down for the rest of the
//! process's life.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::{session::SessionManager, storage::Storage};

const REAP_INTERVAL: Duration = Duration::from_secs(60);
const PRUNE_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

pub fn spawn_idle_reaper(session_manager: Arc<SessionManager>, idle_minutes: i64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REAP_INTERVAL);
        loop {
            ticker.tick().await;
            match session_manager.reap_idle(idle_minutes).await {
                Ok(0) => {}
                Ok(n) => info!(paused = n, "idle reaper paused sessions"),
                Err(e) => error!(error = %e, "idle reaper sweep failed"),
            }
        }
    });
}

pub fn spawn_event_pruner(storage: Arc<Storage>, retain_days: u32) {
    if retain_days == 0 {
        info!("event pruner disabled (RELAY_PRUNE_DAYS=0)");
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        let mut consecutive_failures = 0u32;
        loop {
            ticker.tick().await;
            match storage.prune_old_sessions(retain_days).await {
                Ok(n) => {
                    consecutive_failures = 0;
                    if n > 0 {
                        info!(pruned = n, "event pruner removed stale sessions");
                    }
                    if let Err(e) = storage.vacuum().await {
                        error!(error = %e, "post-prune vacuum failed");
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;
                    error!(error = %e, consecutive_failures, "event pruner sweep failed");
                }
            }
        }
    });
}
