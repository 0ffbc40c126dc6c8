//! Remote-worker sandbox provider.
//!
//! Lifecycle calls (create/pause/resume/terminate/status) go over a plain
//! HTTPS REST client. The stdio channel is a WebSocket the relay dials out
//! to the worker (the worker never calls back in), reconnecting with
//! exponential backoff if the connection drops mid-session — the same
//! shape as any outbound relay client: start at 2s, double, cap at 60s.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message};
use tracing::{info, warn};

use super::{Sandbox, SandboxContext, SandboxStatus, SandboxStream};

/// Resolution for the Open Question in DESIGN.md: what happens when a
/// remote worker's restore of a previously-paused sandbox fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreFallback {
    /// Surface the failure and leave the session in `error`.
    Error,
    /// Proceed with a clean sandbox rather than failing the session.
    Fresh,
}

impl RestoreFallback {
    pub fn from_env() -> Self {
        match std::env::var("RELAY_RESTORE_FALLBACK").as_deref() {
            Ok("error") => RestoreFallback::Error,
            _ => RestoreFallback::Fresh,
        }
    }
}

pub struct RemoteWorkerSandbox {
    http: reqwest::Client,
    base_url: String,
    token: String,
    restore_fallback: RestoreFallback,
}

impl RemoteWorkerSandbox {
    pub fn new(base_url: String, token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            token,
            restore_fallback: RestoreFallback::from_env(),
        }
    }

    /// `provider_id` is always `remote-<worker_id>` (see [`Sandbox::create`]),
    /// so the worker id is recoverable from the persisted id alone — this
    /// provider keeps no in-memory handle table. The DB row's `providerId`
    /// is the only source of truth, per DESIGN.md, so a relay restart can
    /// `attach`/`resume` a previously-created remote sandbox without ever
    /// having seen its `create` call in this process.
    fn worker_id(provider_id: &str) -> Result<&str> {
        provider_id
            .strip_prefix("remote-")
            .ok_or_else(|| anyhow!("not a remote sandbox id: {provider_id}"))
    }

    fn ws_url(&self, worker_id: &str) -> String {
        let wire = self
            .base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{wire}/ws/sandboxes/{worker_id}")
    }

    async fn sleep_backoff(attempt: u32) {
        let secs = (2u64.saturating_mul(1 << attempt.min(5))).min(60);
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }
}

#[async_trait]
impl Sandbox for RemoteWorkerSandbox {
    async fn create(&self, ctx: SandboxContext) -> Result<String> {
        let env_url = ctx
            .environment
            .as_ref()
            .and_then(|e| e.remote_worker_url.clone())
            .unwrap_or_else(|| self.base_url.clone());

        let body = serde_json::json!({
            "sessionId": ctx.session_id,
            "repoCloneUrl": ctx.repo_clone_url,
            "branch": ctx.branch,
            "secrets": ctx.secrets.iter().map(|(k, _)| k).collect::<Vec<_>>(),
        });
        let resp = self
            .http
            .post(format!("{env_url}/api/sandboxes"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .context("remote worker create request failed")?;
        if !resp.status().is_success() {
            return Err(anyhow!("remote worker create returned {}", resp.status()));
        }
        let parsed: serde_json::Value = resp.json().await?;
        let worker_id = parsed
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("remote worker response missing id"))?;

        Ok(format!("remote-{worker_id}"))
    }

    async fn attach(&self, provider_id: &str) -> Result<SandboxStream> {
        let worker_id = Self::worker_id(provider_id)?.to_string();

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<serde_json::Value>(256);
        let (evt_tx, evt_rx) = mpsc::channel::<serde_json::Value>(256);

        let url = self.ws_url(&worker_id);
        let token = self.token.clone();
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                let mut request = match url.clone().into_client_request() {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "invalid remote worker ws url");
                        return;
                    }
                };
                request
                    .headers_mut()
                    .insert("Authorization", format!("Bearer {token}").parse().unwrap());

                match tokio_tungstenite::connect_async(request).await {
                    Ok((ws, _)) => {
                        attempt = 0;
                        info!(worker = %worker_id, "connected to remote worker");
                        let (mut write, mut read) = ws.split();
                        loop {
                            tokio::select! {
                                incoming = read.next() => {
                                    match incoming {
                                        Some(Ok(Message::Text(text))) => {
                                            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                                                if evt_tx.send(value).await.is_err() {
                                                    return;
                                                }
                                            }
                                        }
                                        Some(Ok(Message::Close(_))) | None => break,
                                        Some(Err(e)) => {
                                            warn!(error = %e, "remote worker ws read error");
                                            break;
                                        }
                                        _ => {}
                                    }
                                }
                                outgoing = cmd_rx.recv() => {
                                    match outgoing {
                                        Some(cmd) => {
                                            let text = match serde_json::to_string(&cmd) {
                                                Ok(t) => t,
                                                Err(_) => continue,
                                            };
                                            if write.send(Message::Text(text)).await.is_err() {
                                                break;
                                            }
                                        }
                                        None => return,
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, attempt, "remote worker ws connect failed, retrying");
                    }
                }
                attempt += 1;
                Self::sleep_backoff(attempt).await;
            }
        });

        Ok(SandboxStream {
            commands: cmd_tx,
            events: evt_rx,
        })
    }

    async fn pause(&self, provider_id: &str) -> Result<()> {
        self.lifecycle_call(provider_id, "pause").await
    }

    async fn resume(&self, provider_id: &str) -> Result<()> {
        match self.lifecycle_call(provider_id, "resume").await {
            Ok(()) => Ok(()),
            Err(e) if self.restore_fallback == RestoreFallback::Fresh => {
                warn!(error = %e, "remote worker restore failed, proceeding with fresh sandbox per RELAY_RESTORE_FALLBACK=fresh");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn terminate(&self, provider_id: &str) -> Result<()> {
        let Ok(worker_id) = Self::worker_id(provider_id) else {
            return Ok(());
        };
        let resp = self
            .http
            .delete(format!("{}/api/sandboxes/{}", self.base_url, worker_id))
            .bearer_auth(&self.token)
            .send()
            .await;
        match resp {
            Ok(r) if r.status().is_success() || r.status().as_u16() == 404 => Ok(()),
            Ok(r) => Err(anyhow!("remote worker terminate returned {}", r.status())),
            Err(e) => Err(e.into()),
        }
    }

    async fn status(&self, provider_id: &str) -> Result<SandboxStatus> {
        let Ok(worker_id) = Self::worker_id(provider_id) else {
            return Ok(SandboxStatus::Unknown);
        };
        let resp = self
            .http
            .get(format!("{}/api/sandboxes/{}", self.base_url, worker_id))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("remote worker status request failed")?;
        if resp.status().as_u16() == 404 {
            return Ok(SandboxStatus::Exited);
        }
        let parsed: serde_json::Value = resp.json().await?;
        let status = match parsed.get("status").and_then(|v| v.as_str()) {
            Some("creating") => SandboxStatus::Creating,
            Some("running") => SandboxStatus::Running,
            Some("paused") => SandboxStatus::Paused,
            Some("exited") => SandboxStatus::Exited,
            _ => SandboxStatus::Unknown,
        };
        Ok(status)
    }
}

impl RemoteWorkerSandbox {
    async fn lifecycle_call(&self, provider_id: &str, action: &str) -> Result<()> {
        let worker_id = Self::worker_id(provider_id)?;
        let resp = self
            .http
            .post(format!(
                "{}/api/sandboxes/{}/{}",
                self.base_url, worker_id, action
            ))
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("remote worker {action} request failed"))?;
        if !resp.status().is_success() {
            return Err(anyhow!("remote worker {action} returned {}", resp.status()));
        }
        Ok(())
    }
}
