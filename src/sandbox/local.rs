//! Local-container sandbox provider.
//!
//! Spawns the agent binary as a subprocess with piped stdin/stdout rooted at
//! the session's workspace directory. Commands are written as one JSON line
//! per write; events are read back the same way. Pause/resume use
//! `SIGSTOP`/`SIGCONT` on Unix (flag-only elsewhere — there is no portable
//! native suspend primitive); terminate sends `SIGKILL` and reaps the child
//! so no zombie is left behind.
//!
//! Unlike a single-shot subprocess-per-turn model, the agent process here
//! lives for the sandbox's whole lifetime: `create` spawns it once, and
//! `attach` can be called multiple times (e.g. after a bridge reconnect)
//! without restarting the process — each attach gets its own bridged copy
//! of the event stream via a broadcast channel.
//!
//! Secrets are never passed as raw env values chosen by the caller — each
//! one is written to its own file under `<data-dir>/pi-secrets-<id>/` and
//! the subprocess is given a single manifest env var (`ENV_NAME\tFILENAME`
//! per line) to read them back from, so an attacker-controlled secret name
//! can never be used to smuggle extra environment variables or shell
//! metacharacters into the child's environment.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::{broadcast, mpsc, Mutex, RwLock},
};
use tracing::warn;
use uuid::Uuid;

use super::{Sandbox, SandboxContext, SandboxStatus, SandboxStream};
use crate::repo::RepoRegistry;

const SECRETS_MANIFEST_ENV: &str = "SANDBOX_SECRETS_MANIFEST";

struct LocalInstance {
    workspace: PathBuf,
    agent_dir: PathBuf,
    backup_path: PathBuf,
    pid: AtomicU32,
    paused: AtomicBool,
    cancelled: AtomicBool,
    current_child: Mutex<Option<Child>>,
    commands: mpsc::Sender<serde_json::Value>,
    events: broadcast::Sender<serde_json::Value>,
    exited: AtomicBool,
}

pub struct LocalContainerSandbox {
    agent_binary: PathBuf,
    data_dir: PathBuf,
    instances: RwLock<HashMap<String, Arc<LocalInstance>>>,
}

impl LocalContainerSandbox {
    pub fn new(agent_binary: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            agent_binary,
            data_dir,
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Writes each secret to its own file under `<data-dir>/pi-secrets-<id>/`
    /// plus a `manifest.tsv` of `ENV_NAME\tFILENAME` lines, and returns the
    /// manifest's path. Secret values never touch the subprocess's argv or
    /// a caller-chosen env var name.
    async fn write_secrets_manifest(&self, session_id: &str, secrets: &[(String, String)]) -> Result<Option<PathBuf>> {
        if secrets.is_empty() {
            return Ok(None);
        }
        let dir = self.data_dir.join(format!("pi-secrets-{session_id}"));
        tokio::fs::create_dir_all(&dir).await?;

        let mut manifest = String::new();
        for (i, (name, value)) in secrets.iter().enumerate() {
            let filename = format!("secret_{i}");
            let path = dir.join(&filename);
            tokio::fs::write(&path, value).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
            }
            manifest.push_str(name);
            manifest.push('\t');
            manifest.push_str(&filename);
            manifest.push('\n');
        }
        let manifest_path = dir.join("manifest.tsv");
        tokio::fs::write(&manifest_path, manifest).await?;
        Ok(Some(manifest_path))
    }

    /// Archives `workspace/` and `agent/` into `backup.tar.gz`, run on pause
    /// so a later resume (possibly on a fresh process) can restore state.
    fn write_backup(workspace: &Path, agent_dir: &Path, backup_path: &Path) -> Result<()> {
        if let Some(parent) = backup_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(backup_path)?;
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        if workspace.exists() {
            builder.append_dir_all("workspace", workspace)?;
        }
        if agent_dir.exists() {
            builder.append_dir_all("agent", agent_dir)?;
        }
        builder.finish()?;
        Ok(())
    }

    /// Extracts a prior `backup.tar.gz` into the session's workspace/agent
    /// directories, if one exists. A missing backup is not an error — the
    /// sandbox simply starts fresh.
    fn restore_backup(workspace: &Path, agent_dir: &Path, backup_path: &Path) -> Result<()> {
        if !backup_path.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(workspace)?;
        std::fs::create_dir_all(agent_dir)?;
        let file = std::fs::File::open(backup_path)?;
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        archive.unpack(workspace.parent().unwrap_or(workspace))?;
        Ok(())
    }
}

#[async_trait]
impl Sandbox for LocalContainerSandbox {
    async fn create(&self, ctx: SandboxContext) -> Result<String> {
        let agent_dir = self.data_dir.join("sessions").join(&ctx.session_id).join("agent");
        let backup_path = self.data_dir.join("sessions").join(&ctx.session_id).join("backup.tar.gz");

        Self::restore_backup(&ctx.workspace, &agent_dir, &backup_path)
            .context("failed to restore sandbox backup")?;
        tokio::fs::create_dir_all(&ctx.workspace).await?;
        tokio::fs::create_dir_all(&agent_dir).await?;

        // A `code`-mode session needs its repo checked out before the agent
        // starts. Only clone on a fresh sandbox — a restored backup already
        // has the workspace populated from the prior run, and cloning over
        // it would fail since `clone_into` requires an empty destination.
        if !backup_path.exists() {
            if let Some(clone_url) = &ctx.repo_clone_url {
                let mut entries = tokio::fs::read_dir(&ctx.workspace).await?;
                if entries.next_entry().await?.is_none() {
                    RepoRegistry::clone_into(clone_url, ctx.branch.as_deref(), &ctx.workspace)
                        .await
                        .context("failed to clone repo into sandbox workspace")?;
                    if ctx.branch.is_none() {
                        // No branch was requested — report back the one the
                        // clone actually checked out (the repo's default)
                        // so it's visible to whoever reads this session's logs.
                        let workspace = ctx.workspace.clone();
                        let session_id = ctx.session_id.clone();
                        if let Ok(Some(branch)) = tokio::task::spawn_blocking(move || RepoRegistry::current_branch(&workspace)).await? {
                            tracing::info!(session = %session_id, branch = %branch, "workspace checked out at default branch");
                        }
                    }
                }
            }
        }

        let manifest_path = self.write_secrets_manifest(&ctx.session_id, &ctx.secrets).await?;

        let mut cmd = Command::new(&self.agent_binary);
        cmd.current_dir(&ctx.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(path) = &manifest_path {
            cmd.env(SECRETS_MANIFEST_ENV, path);
        }

        let mut child = cmd
            .spawn()
            .context("failed to spawn agent binary — check SANDBOX_AGENT_BINARY")?;

        let stdin = child.stdin.take().context("no stdin")?;
        let stdout = child.stdout.take().context("no stdout")?;
        let stderr = child.stderr.take().context("no stderr")?;
        let pid = child.id().unwrap_or(0);

        let id = format!("local-{}", Uuid::new_v4());
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<serde_json::Value>(256);
        let (evt_tx, _) = broadcast::channel::<serde_json::Value>(256);

        let instance = Arc::new(LocalInstance {
            workspace: ctx.workspace.clone(),
            agent_dir,
            backup_path,
            pid: AtomicU32::new(pid),
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            current_child: Mutex::new(Some(child)),
            commands: cmd_tx,
            events: evt_tx.clone(),
            exited: AtomicBool::new(false),
        });

        // Writer: serializes each command to a single JSON line before the
        // write so a cancelled write can never leave a partial line on the
        // pipe.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(cmd) = cmd_rx.recv().await {
                let mut line = match serde_json::to_vec(&cmd) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize sandbox command");
                        continue;
                    }
                };
                line.push(b'\n');
                if stdin.write_all(&line).await.is_err() {
                    break;
                }
            }
        });

        // Stderr drain — logged only, never surfaced as an event.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "sandbox_stderr", "{line}");
            }
        });

        // Reader: one broadcast fan-out per instance so every attach sees
        // every event from the point it subscribed.
        let instance_for_reader = instance.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match serde_json::from_str::<serde_json::Value>(&line) {
                        Ok(value) => {
                            let _ = evt_tx.send(value);
                        }
                        Err(_) => warn!(line = %line, "unparseable sandbox event"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "sandbox stdout read error");
                        break;
                    }
                }
            }
            instance_for_reader.exited.store(true, Ordering::Release);
            instance_for_reader.pid.store(0, Ordering::Relaxed);
            if let Some(mut child) = instance_for_reader.current_child.lock().await.take() {
                let _ = child.wait().await;
            }
            if !instance_for_reader.cancelled.load(Ordering::Acquire) {
                let _ = evt_tx.send(serde_json::json!({"type": "sandbox_exited", "expected": false}));
            }
        });

        self.instances.write().await.insert(id.clone(), instance);
        Ok(id)
    }

    async fn attach(&self, provider_id: &str) -> Result<SandboxStream> {
        let instances = self.instances.read().await;
        let instance = instances
            .get(provider_id)
            .ok_or_else(|| anyhow!("unknown local sandbox {provider_id}"))?
            .clone();
        drop(instances);

        let mut broadcast_rx = instance.events.subscribe();
        let (evt_tx, evt_rx) = mpsc::channel::<serde_json::Value>(256);
        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(value) => {
                        if evt_tx.send(value).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "local sandbox event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(SandboxStream {
            commands: instance.commands.clone(),
            events: evt_rx,
        })
    }

    async fn pause(&self, provider_id: &str) -> Result<()> {
        let instances = self.instances.read().await;
        let instance = instances
            .get(provider_id)
            .ok_or_else(|| anyhow!("unknown local sandbox {provider_id}"))?
            .clone();
        drop(instances);
        instance.paused.store(true, Ordering::Relaxed);
        #[cfg(unix)]
        {
            let pid = instance.pid.load(Ordering::Relaxed);
            if pid != 0 {
                // SAFETY: pid came from our own spawned child; SIGSTOP on a
                // process we own cannot affect unrelated processes.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGSTOP);
                }
            }
        }
        let workspace = instance.workspace.clone();
        let agent_dir = instance.agent_dir.clone();
        let backup_path = instance.backup_path.clone();
        tokio::task::spawn_blocking(move || Self::write_backup(&workspace, &agent_dir, &backup_path))
            .await?
            .context("failed to write sandbox backup")?;
        Ok(())
    }

    async fn resume(&self, provider_id: &str) -> Result<()> {
        let instances = self.instances.read().await;
        let instance = instances
            .get(provider_id)
            .ok_or_else(|| anyhow!("unknown local sandbox {provider_id}"))?
            .clone();
        drop(instances);
        instance.paused.store(false, Ordering::Relaxed);
        #[cfg(unix)]
        {
            let pid = instance.pid.load(Ordering::Relaxed);
            if pid != 0 {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGCONT);
                }
            }
        }
        Ok(())
    }

    async fn terminate(&self, provider_id: &str) -> Result<()> {
        let mut instances = self.instances.write().await;
        let instance = match instances.remove(provider_id) {
            Some(i) => i,
            None => return Ok(()),
        };
        drop(instances);

        instance.cancelled.store(true, Ordering::Release);
        #[cfg(unix)]
        {
            let pid = instance.pid.load(Ordering::Relaxed);
            if pid != 0 && instance.paused.load(Ordering::Relaxed) {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGCONT);
                }
            }
        }
        if let Some(mut child) = instance.current_child.lock().await.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        instance.pid.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn status(&self, provider_id: &str) -> Result<SandboxStatus> {
        let instances = self.instances.read().await;
        let instance = match instances.get(provider_id) {
            Some(i) => i,
            None => return Ok(SandboxStatus::Unknown),
        };
        if instance.exited.load(Ordering::Acquire) {
            return Ok(SandboxStatus::Exited);
        }
        if instance.paused.load(Ordering::Relaxed) {
            return Ok(SandboxStatus::Paused);
        }
        Ok(SandboxStatus::Running)
    }
}
