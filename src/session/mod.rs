//! Session Service: the session lifecycle state machine and the bridge
//! between a session's durable row, its journal, and its live sandbox.
//!
//! States: `creating -> idle -> active -> idle -> archived`, with `error`
//! reachable from any of the first three. Every transition is driven
//! through [`crate::storage::Storage::transition_session`]'s atomic
//! `UPDATE ... WHERE status IN (...)`, so two callers racing to activate or
//! archive the same session never both win.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::{collections::HashMap, path::PathBuf, sync::Arc};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{error, info, warn};

use crate::{
    bridge::event::EventBroadcaster,
    journal::Journal,
    sandbox::{manager::SandboxManager, SandboxContext, SandboxStatus},
    secrets::SecretBox,
    storage::{NewSession, Storage},
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: String,
    pub mode: String,
    pub status: String,
    pub repo_full_name: Option<String>,
    pub working_path: Option<String>,
    pub branch: Option<String>,
    pub provider: Option<String>,
    pub model_provider: Option<String>,
    pub model_id: Option<String>,
    pub environment_id: Option<String>,
    pub error_reason: Option<String>,
    pub created_at: String,
    pub last_activity_at: String,
    pub updated_at: String,
}

fn row_to_view(row: crate::storage::SessionRow) -> SessionView {
    SessionView {
        id: row.id,
        mode: row.mode,
        status: row.status,
        repo_full_name: row.repo_full_name,
        working_path: row.working_path,
        branch: row.branch,
        provider: row.provider,
        model_provider: row.model_provider,
        model_id: row.model_id,
        environment_id: row.environment_id,
        error_reason: row.error_reason,
        created_at: row.created_at,
        last_activity_at: row.last_activity_at,
        updated_at: row.updated_at,
    }
}

/// Options accepted by `SessionManager::create`.
pub struct CreateSessionOptions {
    pub mode: String,
    pub repo_full_name: Option<String>,
    pub branch: Option<String>,
    pub provider: String,
    pub model_provider: Option<String>,
    pub model_id: Option<String>,
    pub system_prompt: Option<String>,
    pub repo_clone_url: Option<String>,
    pub environment_id: Option<String>,
}

/// In-memory state for a session whose sandbox is (or was) attached. The
/// Store remains the only durable source of truth for `status` — this
/// struct only caches the live command channel and the per-session
/// execute lock, matching the "Manager holds no in-memory map of live
/// sandboxes" design constraint: provider-specific state is the sandbox
/// implementation's problem, this is just the glue.
struct SessionHandle {
    /// Guards the append-journal-then-broadcast critical section and
    /// ensures commands arrive at the sandbox in the order clients sent
    /// them, even across concurrent connections to the same session.
    lock: Mutex<()>,
    commands: RwLock<Option<mpsc::Sender<serde_json::Value>>>,
    forwarder_started: std::sync::atomic::AtomicBool,
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self {
            lock: Mutex::new(()),
            commands: RwLock::new(None),
            forwarder_started: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

pub struct SessionManager {
    storage: Arc<Storage>,
    journal: Arc<Journal>,
    broadcaster: Arc<EventBroadcaster>,
    sandbox: Arc<SandboxManager>,
    secrets: Arc<SecretBox>,
    data_dir: PathBuf,
    handles: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionManager {
    pub fn new(
        storage: Arc<Storage>,
        journal: Arc<Journal>,
        broadcaster: Arc<EventBroadcaster>,
        sandbox: Arc<SandboxManager>,
        secrets: Arc<SecretBox>,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            storage,
            journal,
            broadcaster,
            sandbox,
            secrets,
            data_dir,
            handles: RwLock::new(HashMap::new()),
        }
    }

    async fn handle_for(&self, session_id: &str) -> Arc<SessionHandle> {
        if let Some(h) = self.handles.read().await.get(session_id) {
            return h.clone();
        }
        let mut handles = self.handles.write().await;
        handles
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionHandle::default()))
            .clone()
    }

    fn workspace_path(&self, session_id: &str) -> PathBuf {
        self.data_dir.join("sessions").join(session_id).join("workspace")
    }

    /// Resolves an environment's secret reference (if any) into the name/value
    /// pairs a sandbox provider injects at create/resume. The secret payload
    /// is a JSON object of `{ "ENV_NAME": "value" }` pairs, decrypted once per
    /// sandbox start and never logged or journaled.
    async fn resolve_secrets(&self, environment_id: Option<&str>) -> Result<Vec<(String, String)>> {
        let Some(environment_id) = environment_id else {
            return Ok(vec![]);
        };
        let Some(environment) = self.storage.get_environment(environment_id).await? else {
            return Ok(vec![]);
        };
        let Some(secret_id) = environment.secret_id else {
            return Ok(vec![]);
        };
        let plaintext = self.secrets.get(&secret_id).await?;
        let pairs: HashMap<String, String> = serde_json::from_str(&plaintext).context("secret payload is not a JSON object of env vars")?;
        Ok(pairs.into_iter().collect())
    }

    // ─── CRUD ───────────────────────────────────────────────────────────────

    pub async fn create(&self, max_sessions: usize, opts: CreateSessionOptions) -> Result<SessionView> {
        if opts.mode == "code" && opts.repo_full_name.is_none() {
            anyhow::bail!("VALIDATION: code mode requires a repo reference");
        }
        if max_sessions > 0 {
            let count = self.storage.count_active_sessions().await?;
            if count >= max_sessions as u64 {
                anyhow::bail!("SESSION_LIMIT: session limit reached ({max_sessions} max)");
            }
        }

        let row = self
            .storage
            .create_session(NewSession {
                mode: &opts.mode,
                repo_full_name: opts.repo_full_name.as_deref(),
                branch: opts.branch.as_deref(),
                provider: Some(&opts.provider),
                model_provider: opts.model_provider.as_deref(),
                model_id: opts.model_id.as_deref(),
                system_prompt: opts.system_prompt.as_deref(),
                environment_id: opts.environment_id.as_deref(),
            })
            .await?;

        info!(id = %row.id, provider = %opts.provider, "session created");

        let session_id = row.id.clone();
        let workspace = self.workspace_path(&session_id);
        let storage = self.storage.clone();
        let sandbox = self.sandbox.clone();
        let provider = opts.provider.clone();
        let repo_clone_url = opts.repo_clone_url.clone();
        let branch = opts.branch.clone().unwrap_or_default();
        let broadcaster = self.broadcaster.clone();
        let secrets = self.resolve_secrets(opts.environment_id.as_deref()).await?;

        // Sandbox creation can be slow (cloning a repo, pulling an image) —
        // run it in the background so `create` returns immediately with
        // status `creating`, matching the contract clients see over the
        // bridge: subscribe, then watch for the transition to `idle`.
        tokio::spawn(async move {
            let ctx = SandboxContext {
                session_id: session_id.clone(),
                workspace,
                environment: None,
                repo_clone_url,
                branch: Some(branch),
                secrets,
            };
            match sandbox.create_session(&provider, ctx).await {
                Ok(provider_id) => {
                    let _ = storage.set_session_provider_id(&session_id, &provider_id).await;
                    let transitioned = storage
                        .transition_session(&session_id, &["creating"], "idle")
                        .await
                        .unwrap_or(false);
                    if transitioned {
                        broadcaster.broadcast(&session_id, "session_status", json!({"status": "idle"}));
                    }
                }
                Err(e) => {
                    error!(session = %session_id, error = %e, "sandbox creation failed");
                    let _ = storage
                        .update_session_status(&session_id, "error", Some(&e.to_string()))
                        .await;
                    broadcaster.broadcast(&session_id, "session_status", json!({"status": "error", "reason": e.to_string()}));
                }
            }
        });

        Ok(row_to_view(row))
    }

    pub async fn list(&self) -> Result<Vec<SessionView>> {
        Ok(self.storage.list_sessions().await?.into_iter().map(row_to_view).collect())
    }

    pub async fn get(&self, session_id: &str) -> Result<SessionView> {
        self.storage
            .get_session(session_id)
            .await?
            .map(row_to_view)
            .context("SESSION_NOT_FOUND")
    }

    pub async fn delete(&self, session_id: &str) -> Result<()> {
        let row = self
            .storage
            .get_session(session_id)
            .await?
            .context("SESSION_NOT_FOUND")?;

        if let (Some(provider), Some(provider_id)) = (row.provider.as_deref(), row.provider_id.as_deref()) {
            if let Err(e) = self.sandbox.terminate_session(provider, provider_id).await {
                warn!(session = %session_id, error = %e, "sandbox terminate failed during delete");
            }
        }
        self.handles.write().await.remove(session_id);

        // The `events` foreign key is ON DELETE CASCADE, so this also wipes
        // the session's full journal in the same statement.
        self.storage.delete_session(session_id).await?;
        info!(id = %session_id, "session deleted");
        Ok(())
    }

    // ─── Activation ─────────────────────────────────────────────────────────

    /// Ensures the session's sandbox is attached and its event-forwarder
    /// task is running, then transitions `idle -> active` (a no-op if the
    /// session is already `active`, so concurrent/duplicate activate calls
    /// are idempotent). Per §4.3's state table, `archived` and `error` are
    /// terminal with respect to `activate` — only `delete`/`archive` leave
    /// them. Returns the current max journal seq so the caller (the bridge)
    /// knows where replay should resume from after this call.
    pub async fn activate(&self, session_id: &str) -> Result<i64> {
        let row = self
            .storage
            .get_session(session_id)
            .await?
            .context("SESSION_NOT_FOUND")?;
        match row.status.as_str() {
            "archived" => anyhow::bail!("VALIDATION: session is archived and cannot be activated"),
            "error" => anyhow::bail!("VALIDATION: session is in an error state and cannot be activated"),
            "creating" => anyhow::bail!("VALIDATION: session is still provisioning, cannot activate yet"),
            _ => {}
        }
        let provider = row.provider.clone().context("session has no provider configured")?;

        let handle = self.handle_for(session_id).await;
        let _guard = handle.lock.lock().await;

        let already_attached = handle.commands.read().await.is_some();
        if !already_attached {
            let provider_id = match row.provider_id.clone() {
                Some(id) => {
                    self.sandbox.resume_session(&provider, &id).await?;
                    id
                }
                None => {
                    let secrets = self.resolve_secrets(row.environment_id.as_deref()).await?;
                    self.sandbox
                        .create_session(
                            &provider,
                            SandboxContext {
                                session_id: session_id.to_string(),
                                workspace: self.workspace_path(session_id),
                                environment: None,
                                repo_clone_url: None,
                                branch: row.branch.clone(),
                                secrets,
                            },
                        )
                        .await?
                }
            };
            if Some(provider_id.as_str()) != row.provider_id.as_deref() {
                self.storage.set_session_provider_id(session_id, &provider_id).await?;
            }

            let stream = self.sandbox.attach_session(&provider, &provider_id).await?;
            *handle.commands.write().await = Some(stream.commands);

            if !handle.forwarder_started.swap(true, std::sync::atomic::Ordering::SeqCst) {
                let mut events = stream.events;
                let journal = self.journal.clone();
                let broadcaster = self.broadcaster.clone();
                let storage = self.storage.clone();
                let session_id_owned = session_id.to_string();
                let handle_for_forwarder = handle.clone();
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        let kind = event.get("type").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
                        // Hold the per-session lock across append+broadcast so
                        // it never interleaves with a client-submitted command
                        // being journaled via `submit_command`.
                        let _guard = handle_for_forwarder.lock.lock().await;
                        match journal.append(&session_id_owned, &kind, &event).await {
                            Ok(journal_event) => {
                                broadcaster.broadcast_agent_event(
                                    &session_id_owned,
                                    journal_event.seq,
                                    &journal_event.kind,
                                    journal_event.payload,
                                );
                            }
                            Err(e) => warn!(session = %session_id_owned, error = %e, "failed to append journal event"),
                        }
                        drop(_guard);
                        if kind == "agent_end" || kind == "sandbox_exited" {
                            let _ = storage.transition_session(&session_id_owned, &["active"], "idle").await;
                            broadcaster.broadcast(&session_id_owned, "session_status", json!({"status": "idle"}));
                        }
                    }
                });
            }
        } else if row.status != "active" {
            self.sandbox.resume_session(&provider, row.provider_id.as_deref().unwrap_or_default()).await.ok();
        }

        // `row.status` was already checked above to be `idle` or `active`
        // (anything else bailed out before any sandbox I/O happened), so
        // this transition either moves `idle -> active` or is a harmless
        // no-op when the session was already active.
        self.storage.transition_session(session_id, &["idle"], "active").await?;
        self.storage.touch_session(session_id).await?;
        self.broadcaster.broadcast(session_id, "session_status", json!({"status": "active"}));

        self.journal.get_max_seq(session_id).await
    }

    pub async fn touch(&self, session_id: &str) -> Result<()> {
        self.storage.touch_session(session_id).await
    }

    /// Forwards a client command into the session's attached sandbox. The
    /// per-session lock guarantees commands from interleaved connections to
    /// the same session are delivered in arrival order.
    pub async fn send_command(&self, session_id: &str, command: serde_json::Value) -> Result<()> {
        let handle = self.handle_for(session_id).await;
        let _guard = handle.lock.lock().await;
        let commands = handle.commands.read().await;
        let sender = commands.as_ref().context("session is not active — call activate first")?;
        sender
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("sandbox command channel closed"))?;
        self.storage.touch_session(session_id).await?;
        Ok(())
    }

    /// Like [`Self::send_command`], but for commands that must themselves
    /// appear in session history (currently just `prompt`): the command is
    /// journaled and broadcast under the same per-session lock the event
    /// forwarder uses, before being forwarded to the sandbox, so replay sees
    /// the prompt in its correct position relative to the agent's response.
    /// Returns the journal seq assigned to the command.
    pub async fn submit_command(&self, session_id: &str, kind: &str, command: serde_json::Value) -> Result<i64> {
        let handle = self.handle_for(session_id).await;
        let _guard = handle.lock.lock().await;
        let commands = handle.commands.read().await;
        let sender = commands.as_ref().context("session is not active — call activate first")?;

        let journal_event = self.journal.append(session_id, kind, &command).await?;
        self.broadcaster.broadcast_agent_event(
            session_id,
            journal_event.seq,
            &journal_event.kind,
            journal_event.payload.clone(),
        );

        sender
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("sandbox command channel closed"))?;
        self.storage.touch_session(session_id).await?;
        Ok(journal_event.seq)
    }

    /// Pauses an `active` session's sandbox and moves it to `idle` — the
    /// same transition the idle reaper drives, exposed here so any other
    /// caller of the Session Service gets the identical handle-eviction and
    /// broadcast behavior rather than re-deriving it. A no-op (not an
    /// error) if the session isn't currently `active`.
    pub async fn pause(&self, session_id: &str) -> Result<()> {
        let row = self.storage.get_session(session_id).await?.context("SESSION_NOT_FOUND")?;
        if row.status != "active" {
            return Ok(());
        }
        if let (Some(provider), Some(provider_id)) = (row.provider.as_deref(), row.provider_id.as_deref()) {
            if let Err(e) = self.sandbox.pause_session(provider, provider_id).await {
                warn!(session = %session_id, error = %e, "pause: sandbox pause failed, transitioning to idle anyway");
            }
        }
        let transitioned = self.storage.transition_session(session_id, &["active"], "idle").await?;
        if transitioned {
            // Drop the cached command stream so the next `activate`
            // re-attaches rather than writing into a paused sandbox.
            self.handles.write().await.remove(session_id);
            self.broadcaster.broadcast(session_id, "session_status", json!({"status": "idle"}));
        }
        Ok(())
    }

    // ─── Maintenance ────────────────────────────────────────────────────────

    pub async fn drain(&self) {
        let handles: Vec<(String, Arc<SessionHandle>)> = self.handles.read().await.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (session_id, handle) in handles {
            let _guard = handle.lock.lock().await;
            if let Some(sender) = handle.commands.read().await.as_ref() {
                let _ = sender.send(json!({"type": "abort"})).await;
            }
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
                if let Ok(Some(row)) = self.storage.get_session(&session_id).await {
                    if let (Some(provider), Some(provider_id)) = (row.provider.as_deref(), row.provider_id.as_deref()) {
                        let _ = self.sandbox.pause_session(provider, provider_id).await;
                    }
                }
            })
            .await;
            let _ = self.storage.update_session_status(&session_id, "idle", None).await;
        }
        info!("all active sessions drained");
    }

    /// Idle reaper (§4.8): finds sessions in `active` with no open bridge
    /// connection (per the [`EventBroadcaster`] Connection Registry) whose
    /// `last_activity_at` is older than `idle_minutes`, and pauses their
    /// sandboxes — `active -> idle`, per §4.3's `idle > T` transition. This
    /// is the same effect the grace timer in §4.6 describes for "last
    /// connection leaves": the reaper's tick interval stands in for the
    /// per-connection timer, since both reduce to "no client has been
    /// attached for T_idle". A session with a live connection is left
    /// alone no matter how stale its timestamp looks — `touch` only moves
    /// on command/event traffic, not on an open-but-silent socket, so a
    /// quiet-but-attached client would otherwise get paused out from under
    /// itself.
    pub async fn reap_idle(&self, idle_minutes: i64) -> Result<u64> {
        let cutoff = chrono::Utc::now() - chrono::Duration::minutes(idle_minutes);
        let candidates: Vec<_> = self
            .storage
            .list_sessions()
            .await?
            .into_iter()
            .filter(|s| s.status == "active")
            .filter(|s| chrono::DateTime::parse_from_rfc3339(&s.last_activity_at).map(|t| t < cutoff).unwrap_or(false))
            .collect();

        let mut paused = 0u64;
        for row in candidates {
            if self.broadcaster.has_open_connections(&row.id).await {
                continue;
            }
            // Re-check status right before pausing — the candidate list was
            // built from a snapshot, and `pause` itself re-derives from the
            // current row, so this can only under-count, never double-pause.
            let still_active = self.storage.get_session(&row.id).await.ok().flatten().map(|r| r.status == "active").unwrap_or(false);
            if !still_active {
                continue;
            }
            if let Err(e) = self.pause(&row.id).await {
                warn!(session = %row.id, error = %e, "idle reaper: pause failed");
                continue;
            }
            paused += 1;
        }
        Ok(paused)
    }

    /// Logical deletion (§4.3's `archive` transition): terminates the
    /// sandbox and moves the session to `archived` from any non-archived
    /// state, but — unlike [`Self::delete`] — leaves the row and its
    /// journaled events in place. An archived session can never be
    /// re-activated; it is retained only for history/audit until the
    /// Scheduler's event pruner eventually removes it past the retention
    /// horizon.
    pub async fn archive(&self, session_id: &str) -> Result<()> {
        let row = self.storage.get_session(session_id).await?.context("SESSION_NOT_FOUND")?;
        if row.status == "archived" {
            anyhow::bail!("VALIDATION: session is already archived");
        }

        if let (Some(provider), Some(provider_id)) = (row.provider.as_deref(), row.provider_id.as_deref()) {
            if let Err(e) = self.sandbox.terminate_session(provider, provider_id).await {
                warn!(session = %session_id, error = %e, "sandbox terminate failed during archive");
            }
        }
        self.handles.write().await.remove(session_id);

        self.storage
            .transition_session(session_id, &["creating", "idle", "active", "error"], "archived")
            .await?;
        self.broadcaster.broadcast(session_id, "session_status", json!({"status": "archived"}));
        info!(id = %session_id, "session archived");
        Ok(())
    }

    pub async fn sandbox_status(&self, session_id: &str) -> Result<SandboxStatus> {
        let row = self.storage.get_session(session_id).await?.context("SESSION_NOT_FOUND")?;
        match (row.provider.as_deref(), row.provider_id.as_deref()) {
            (Some(provider), Some(provider_id)) => self.sandbox.status(provider, provider_id).await,
            _ => Ok(SandboxStatus::Unknown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::manager::SandboxManager;
    use std::path::PathBuf;

    async fn test_manager() -> (SessionManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
        let journal = Arc::new(Journal::new(storage.clone()));
        let broadcaster = Arc::new(EventBroadcaster::new());
        let sandbox = Arc::new(SandboxManager::new(
            PathBuf::from("/bin/true"),
            dir.path().to_path_buf(),
            "https://worker.example".into(),
            "tok".into(),
        ));
        let secrets = Arc::new(SecretBox::new(storage.clone(), b"test-key-material", 1).unwrap());
        let manager = SessionManager::new(storage, journal, broadcaster, sandbox, secrets, dir.path().to_path_buf());
        (manager, dir)
    }

    #[tokio::test]
    async fn create_starts_in_creating_then_moves_to_idle() {
        let (manager, _dir) = test_manager().await;
        let view = manager
            .create(
                0,
                CreateSessionOptions {
                    mode: "chat".into(),
                    repo_full_name: None,
                    branch: None,
                    provider: "mock".into(),
                    model_provider: None,
                    model_id: None,
                    system_prompt: None,
                    repo_clone_url: None,
                    environment_id: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(view.status, "creating");

        // Background sandbox creation runs on a spawned task.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let refreshed = manager.get(&view.id).await.unwrap();
        assert_eq!(refreshed.status, "idle");
    }

    #[tokio::test]
    async fn activate_transitions_idle_to_active_and_returns_seq() {
        let (manager, _dir) = test_manager().await;
        let view = manager
            .create(
                0,
                CreateSessionOptions {
                    mode: "chat".into(),
                    repo_full_name: None,
                    branch: None,
                    provider: "mock".into(),
                    model_provider: None,
                    model_id: None,
                    system_prompt: None,
                    repo_clone_url: None,
                    environment_id: None,
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let seq = manager.activate(&view.id).await.unwrap();
        assert_eq!(seq, 0);
        let refreshed = manager.get(&view.id).await.unwrap();
        assert_eq!(refreshed.status, "active");
    }

    #[tokio::test]
    async fn session_limit_is_enforced() {
        let (manager, _dir) = test_manager().await;
        manager
            .create(
                1,
                CreateSessionOptions {
                    mode: "chat".into(),
                    repo_full_name: None,
                    branch: None,
                    provider: "mock".into(),
                    model_provider: None,
                    model_id: None,
                    system_prompt: None,
                    repo_clone_url: None,
                    environment_id: None,
                },
            )
            .await
            .unwrap();
        let err = manager
            .create(
                1,
                CreateSessionOptions {
                    mode: "chat".into(),
                    repo_full_name: None,
                    branch: None,
                    provider: "mock".into(),
                    model_provider: None,
                    model_id: None,
                    system_prompt: None,
                    repo_clone_url: None,
                    environment_id: None,
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("SESSION_LIMIT"));
    }

    /// `archive` retains events (unlike `delete`) and is terminal: a second
    /// archive call on an already-archived session is rejected.
    #[tokio::test]
    async fn archive_retains_events_and_is_not_reentrant() {
        let (manager, _dir) = test_manager().await;
        let view = manager
            .create(
                0,
                CreateSessionOptions {
                    mode: "chat".into(),
                    repo_full_name: None,
                    branch: None,
                    provider: "mock".into(),
                    model_provider: None,
                    model_id: None,
                    system_prompt: None,
                    repo_clone_url: None,
                    environment_id: None,
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        manager.activate(&view.id).await.unwrap();
        manager
            .submit_command(&view.id, "prompt", serde_json::json!({"type": "prompt", "message": "hi"}))
            .await
            .unwrap();

        manager.archive(&view.id).await.unwrap();

        let archived = manager.get(&view.id).await.unwrap();
        assert_eq!(archived.status, "archived");
        assert!(manager.journal.get_max_seq(&view.id).await.unwrap() > 0, "events survive archive");

        let err = manager.archive(&view.id).await.unwrap_err();
        assert!(err.to_string().contains("already archived"));
    }

    /// The idle reaper pauses (`active -> idle`) sessions with no open
    /// bridge connection past the cutoff; it never archives them, and a
    /// session with a registered open connection is left untouched even
    /// when its `last_activity_at` is arbitrarily stale.
    #[tokio::test]
    async fn reap_idle_pauses_active_sessions_with_no_open_connections() {
        let (manager, _dir) = test_manager().await;
        let view = manager
            .create(
                0,
                CreateSessionOptions {
                    mode: "chat".into(),
                    repo_full_name: None,
                    branch: None,
                    provider: "mock".into(),
                    model_provider: None,
                    model_id: None,
                    system_prompt: None,
                    repo_clone_url: None,
                    environment_id: None,
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        manager.activate(&view.id).await.unwrap();

        // A negative idle_minutes makes "now" always past the cutoff.
        let paused = manager.reap_idle(-1).await.unwrap();
        assert_eq!(paused, 1);
        assert_eq!(manager.get(&view.id).await.unwrap().status, "idle");
    }

    #[tokio::test]
    async fn reap_idle_skips_sessions_with_an_open_connection() {
        let (manager, _dir) = test_manager().await;
        let view = manager
            .create(
                0,
                CreateSessionOptions {
                    mode: "chat".into(),
                    repo_full_name: None,
                    branch: None,
                    provider: "mock".into(),
                    model_provider: None,
                    model_id: None,
                    system_prompt: None,
                    repo_clone_url: None,
                    environment_id: None,
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        manager.activate(&view.id).await.unwrap();
        manager.broadcaster.connection_opened(&view.id).await;

        let paused = manager.reap_idle(-1).await.unwrap();
        assert_eq!(paused, 0);
        assert_eq!(manager.get(&view.id).await.unwrap().status, "active");
    }
}
