//! Repo registry: tracked GitHub repositories and the local clone operation
//! used to materialize a session's workspace directory.
//!
//! Git operations run through `git2` (vendored libgit2 — no system OpenSSL,
//! no subprocess spawning) on a blocking thread pool, since libgit2 is
//! synchronous.

use anyhow::{Context, Result};
use chrono::Utc;
use git2::Repository;
use std::{path::Path, sync::Arc};

use crate::storage::{RepoRow, Storage};

#[derive(Clone)]
pub struct RepoRegistry {
    storage: Arc<Storage>,
}

impl RepoRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub async fn list(&self) -> Result<Vec<RepoRow>> {
        self.storage.list_repos().await
    }

    pub async fn get(&self, id: &str) -> Result<Option<RepoRow>> {
        self.storage.get_repo(id).await
    }

    /// Register (or refresh) a repo's metadata. The relay does not poll
    /// GitHub itself — the REST client supplies metadata obtained out of
    /// band (PAT-authenticated `GET /repos/:owner/:name`) and this just
    /// persists it. Per §3's data model, `id = owner/name`, so the id is
    /// `full_name` itself rather than a generated surrogate key — a repo is
    /// addressable by the same identifier whether this is its first upsert
    /// or its hundredth.
    pub async fn upsert(
        &self,
        full_name: &str,
        owner: &str,
        private: bool,
        default_branch: &str,
        clone_url: &str,
        description: Option<&str>,
    ) -> Result<RepoRow> {
        let row = RepoRow {
            id: full_name.to_string(),
            full_name: full_name.to_string(),
            owner: owner.to_string(),
            private,
            default_branch: default_branch.to_string(),
            clone_url: clone_url.to_string(),
            description: description.map(|s| s.to_string()),
            updated_at: Utc::now().to_rfc3339(),
        };
        self.storage.upsert_repo(&row).await?;
        Ok(row)
    }

    /// Clones `clone_url` into `dest` (created if missing, must not already
    /// contain a repository), checking out `branch` if given or the repo's
    /// default branch otherwise. Used by the local-container sandbox
    /// provider to materialize a `code`-mode session's workspace.
    pub async fn clone_into(clone_url: &str, branch: Option<&str>, dest: &Path) -> Result<()> {
        let clone_url = clone_url.to_string();
        let branch = branch.map(|b| b.to_string());
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut builder = git2::build::RepoBuilder::new();
            if let Some(branch) = branch.as_deref() {
                builder.branch(branch);
            }
            builder
                .clone(&clone_url, &dest)
                .with_context(|| format!("failed to clone {clone_url} into {}", dest.display()))?;
            Ok(())
        })
        .await?
    }

    /// Opens an existing workspace checkout and reports the currently
    /// checked-out branch name, used to populate `sessions.branch` when a
    /// caller didn't specify one explicitly.
    pub fn current_branch(workspace: &Path) -> Result<Option<String>> {
        let repo = Repository::open(workspace).context("not a git repository")?;
        let head = repo.head()?;
        Ok(head.shorthand().map(|s| s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_reuses_existing_id_on_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
        let registry = RepoRegistry::new(storage);

        let first = registry
            .upsert("acme/widgets", "acme", false, "main", "https://example.com/acme/widgets.git", None)
            .await
            .unwrap();
        let second = registry
            .upsert(
                "acme/widgets",
                "acme",
                false,
                "main",
                "https://example.com/acme/widgets.git",
                Some("updated description"),
            )
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.description.as_deref(), Some("updated description"));
    }
}
