//! In-process mock sandbox provider.
//!
//! Used by integration tests and by `SANDBOX_PROVIDER=mock` deployments
//! where no real agent binary or remote worker is available. Every
//! `prompt` command produces a synthetic `agent_start` /
//! `message_update` / `agent_end` sequence, which exercises the full
//! journal-append and replay path without spawning a process.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, RwLock};

use super::{Sandbox, SandboxContext, SandboxStatus, SandboxStream};

struct MockInstance {
    status: RwLock<SandboxStatus>,
}

#[derive(Default)]
pub struct MockSandbox {
    instances: RwLock<HashMap<String, Arc<MockInstance>>>,
    counter: AtomicU64,
}

impl MockSandbox {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    async fn create(&self, ctx: SandboxContext) -> Result<String> {
        let id = format!(
            "mock-{}-{}",
            ctx.session_id,
            self.counter.fetch_add(1, Ordering::SeqCst)
        );
        self.instances.write().await.insert(
            id.clone(),
            Arc::new(MockInstance {
                status: RwLock::new(SandboxStatus::Running),
            }),
        );
        Ok(id)
    }

    async fn attach(&self, provider_id: &str) -> Result<SandboxStream> {
        let instances = self.instances.read().await;
        let instance = instances
            .get(provider_id)
            .ok_or_else(|| anyhow!("unknown mock sandbox {provider_id}"))?
            .clone();
        drop(instances);

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<serde_json::Value>(64);
        let (evt_tx, evt_rx) = mpsc::channel::<serde_json::Value>(64);

        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let kind = cmd.get("type").and_then(|v| v.as_str()).unwrap_or("");
                match kind {
                    "prompt" => {
                        let message = cmd.get("message").cloned().unwrap_or_default();
                        let _ = evt_tx.send(serde_json::json!({"type": "agent_start"})).await;
                        let _ = evt_tx
                            .send(serde_json::json!({
                                "type": "message_update",
                                "role": "assistant",
                                "content": format!("echo: {}", message.as_str().unwrap_or_default()),
                            }))
                            .await;
                        let _ = evt_tx.send(serde_json::json!({"type": "agent_end"})).await;
                    }
                    "abort" => {
                        let _ = evt_tx.send(serde_json::json!({"type": "agent_end", "aborted": true})).await;
                    }
                    "get_state" => {
                        let _ = evt_tx
                            .send(serde_json::json!({"type": "state", "status": *instance.status.read().await}))
                            .await;
                    }
                    _ => {}
                }
            }
        });

        Ok(SandboxStream {
            commands: cmd_tx,
            events: evt_rx,
        })
    }

    async fn pause(&self, provider_id: &str) -> Result<()> {
        let instances = self.instances.read().await;
        let instance = instances
            .get(provider_id)
            .ok_or_else(|| anyhow!("unknown mock sandbox {provider_id}"))?;
        *instance.status.write().await = SandboxStatus::Paused;
        Ok(())
    }

    async fn resume(&self, provider_id: &str) -> Result<()> {
        let instances = self.instances.read().await;
        let instance = instances
            .get(provider_id)
            .ok_or_else(|| anyhow!("unknown mock sandbox {provider_id}"))?;
        *instance.status.write().await = SandboxStatus::Running;
        Ok(())
    }

    async fn terminate(&self, provider_id: &str) -> Result<()> {
        let mut instances = self.instances.write().await;
        if let Some(instance) = instances.remove(provider_id) {
            *instance.status.write().await = SandboxStatus::Exited;
        }
        Ok(())
    }

    async fn status(&self, provider_id: &str) -> Result<SandboxStatus> {
        let instances = self.instances.read().await;
        match instances.get(provider_id) {
            Some(instance) => Ok(*instance.status.read().await),
            None => Ok(SandboxStatus::Unknown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prompt_produces_start_update_end_sequence() {
        let sandbox = MockSandbox::new();
        let id = sandbox
            .create(SandboxContext {
                session_id: "s1".into(),
                workspace: std::path::PathBuf::from("/tmp/s1"),
                environment: None,
                repo_clone_url: None,
                branch: None,
                secrets: vec![],
            })
            .await
            .unwrap();
        let mut stream = sandbox.attach(&id).await.unwrap();
        stream
            .commands
            .send(serde_json::json!({"type": "prompt", "message": "hi"}))
            .await
            .unwrap();

        let e1 = stream.events.recv().await.unwrap();
        let e2 = stream.events.recv().await.unwrap();
        let e3 = stream.events.recv().await.unwrap();
        assert_eq!(e1["type"], "agent_start");
        assert_eq!(e2["type"], "message_update");
        assert_eq!(e3["type"], "agent_end");
    }

    #[tokio::test]
    async fn pause_resume_updates_status() {
        let sandbox = MockSandbox::new();
        let id = sandbox
            .create(SandboxContext {
                session_id: "s2".into(),
                workspace: std::path::PathBuf::from("/tmp/s2"),
                environment: None,
                repo_clone_url: None,
                branch: None,
                secrets: vec![],
            })
            .await
            .unwrap();
        sandbox.pause(&id).await.unwrap();
        assert_eq!(sandbox.status(&id).await.unwrap(), SandboxStatus::Paused);
        sandbox.resume(&id).await.unwrap();
        assert_eq!(sandbox.status(&id).await.unwrap(), SandboxStatus::Running);
    }
}
