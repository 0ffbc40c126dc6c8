//! Stateless sandbox manager: resolves a session's configured provider to a
//! concrete [`Sandbox`] implementation and forwards the call. No sandbox
//! bookkeeping lives here — each provider implementation owns its own
//! instance table.

use anyhow::{anyhow, Result};
use std::{path::PathBuf, sync::Arc};

use super::{local::LocalContainerSandbox, mock::MockSandbox, remote::RemoteWorkerSandbox, Sandbox, SandboxContext, SandboxStatus, SandboxStream};

pub struct SandboxManager {
    mock: Arc<MockSandbox>,
    local: Arc<LocalContainerSandbox>,
    remote: Arc<RemoteWorkerSandbox>,
}

impl SandboxManager {
    pub fn new(agent_binary: PathBuf, data_dir: PathBuf, remote_base_url: String, remote_token: String) -> Self {
        Self {
            mock: Arc::new(MockSandbox::new()),
            local: Arc::new(LocalContainerSandbox::new(agent_binary, data_dir)),
            remote: Arc::new(RemoteWorkerSandbox::new(remote_base_url, remote_token)),
        }
    }

    fn provider(&self, name: &str) -> Result<Arc<dyn Sandbox>> {
        match name {
            "mock" => Ok(self.mock.clone()),
            "docker" => Ok(self.local.clone()),
            "cloudflare" => Ok(self.remote.clone()),
            other => Err(anyhow!("unknown sandbox provider {other}")),
        }
    }

    pub async fn create_session(&self, provider: &str, ctx: SandboxContext) -> Result<String> {
        self.provider(provider)?.create(ctx).await
    }

    pub async fn attach_session(&self, provider: &str, provider_id: &str) -> Result<SandboxStream> {
        self.provider(provider)?.attach(provider_id).await
    }

    pub async fn pause_session(&self, provider: &str, provider_id: &str) -> Result<()> {
        self.provider(provider)?.pause(provider_id).await
    }

    pub async fn resume_session(&self, provider: &str, provider_id: &str) -> Result<()> {
        self.provider(provider)?.resume(provider_id).await
    }

    pub async fn terminate_session(&self, provider: &str, provider_id: &str) -> Result<()> {
        self.provider(provider)?.terminate(provider_id).await
    }

    pub async fn status(&self, provider: &str, provider_id: &str) -> Result<SandboxStatus> {
        self.provider(provider)?.status(provider_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(PathBuf::from("/usr/local/bin/agent"), dir.path().to_path_buf(), "https://worker.example".into(), "tok".into());
        let err = manager
            .create_session(
                "nonexistent",
                SandboxContext {
                    session_id: "s1".into(),
                    workspace: PathBuf::from("/tmp/s1"),
                    environment: None,
                    repo_clone_url: None,
                    branch: None,
                    secrets: vec![],
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown sandbox provider"));
    }

    #[tokio::test]
    async fn mock_provider_round_trips_through_manager() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SandboxManager::new(PathBuf::from("/usr/local/bin/agent"), dir.path().to_path_buf(), "https://worker.example".into(), "tok".into());
        let id = manager
            .create_session(
                "mock",
                SandboxContext {
                    session_id: "s1".into(),
                    workspace: PathBuf::from("/tmp/s1"),
                    environment: None,
                    repo_clone_url: None,
                    branch: None,
                    secrets: vec![],
                },
            )
            .await
            .unwrap();
        assert_eq!(manager.status("mock", &id).await.unwrap(), SandboxStatus::Running);
        manager.terminate_session("mock", &id).await.unwrap();
        assert_eq!(manager.status("mock", &id).await.unwrap(), SandboxStatus::Unknown);
    }
}
