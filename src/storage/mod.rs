use anyhow::Result;
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::{path::Path, str::FromStr};
use uuid::Uuid;

/// Default timeout for individual SQLite queries.
/// Prevents a wedged database file from blocking the relay indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct SessionRow {
    pub id: String,
    pub mode: String,
    pub status: String,
    pub repo_full_name: Option<String>,
    pub working_path: Option<String>,
    pub branch: Option<String>,
    pub provider: Option<String>,
    pub provider_id: Option<String>,
    pub model_provider: Option<String>,
    pub model_id: Option<String>,
    pub system_prompt: Option<String>,
    pub environment_id: Option<String>,
    pub error_reason: Option<String>,
    pub created_at: String,
    pub last_activity_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct EventRow {
    pub id: i64,
    pub session_id: String,
    pub seq: i64,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub payload: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct RepoRow {
    pub id: String,
    pub full_name: String,
    pub owner: String,
    pub private: bool,
    pub default_branch: String,
    pub clone_url: String,
    pub description: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct EnvironmentRow {
    pub id: String,
    pub name: String,
    pub sandbox_type: String,
    pub image: Option<String>,
    pub remote_worker_url: Option<String>,
    pub secret_id: Option<String>,
    pub resource_tier: String,
    pub is_default: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SecretRow {
    pub id: String,
    pub kind: String,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub key_version: i64,
    pub aad: String,
    pub created_at: String,
}

/// New-session fields a caller supplies; everything else (id, timestamps,
/// initial status) is assigned by the Store.
pub struct NewSession<'a> {
    pub mode: &'a str,
    pub repo_full_name: Option<&'a str>,
    pub branch: Option<&'a str>,
    pub provider: Option<&'a str>,
    pub model_provider: Option<&'a str>,
    pub model_id: Option<&'a str>,
    pub system_prompt: Option<&'a str>,
    pub environment_id: Option<&'a str>,
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("relay.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(QUERY_TIMEOUT)
                .foreign_keys(true)
                .create_if_missing(true);

        // A single pooled connection turns every `&self.pool` query (including
        // `append_event`'s read-then-write seq assignment) into a connection
        // that SQLite itself serializes — no two callers ever take their
        // `MAX(seq)` snapshot on different connections and race to insert the
        // same `next_seq`. `busy_timeout` above still matters for the brief
        // window a checkpoint or an external `sqlite3` client holds the file.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Clone of the connection pool (cheap — Arc-backed internally).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }

        // Idempotent column additions for future schema growth (ALTER TABLE
        // IF NOT EXISTS isn't supported in SQLite, so the duplicate-column
        // error is swallowed).
        let alter_stmts: [&str; 0] = [];
        for stmt in alter_stmts {
            let result = sqlx::query(stmt).execute(pool).await;
            if let Err(e) = result {
                let msg = e.to_string();
                if !msg.contains("duplicate column") {
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    // ─── Sessions ───────────────────────────────────────────────────────────

    pub async fn create_session(&self, new: NewSession<'_>) -> Result<SessionRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO sessions (
                id, mode, status, repo_full_name, working_path, branch,
                provider, provider_id, model_provider, model_id, system_prompt,
                environment_id, error_reason, created_at, last_activity_at, updated_at
             ) VALUES (?, ?, 'creating', ?, NULL, ?, ?, NULL, ?, ?, ?, ?, NULL, ?, ?, ?)",
        )
        .bind(&id)
        .bind(new.mode)
        .bind(new.repo_full_name)
        .bind(new.branch)
        .bind(new.provider)
        .bind(new.model_provider)
        .bind(new.model_id)
        .bind(new.system_prompt)
        .bind(new.environment_id)
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_session(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session not found after insert"))
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRow>> {
        Ok(sqlx::query_as("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM sessions ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    pub async fn count_active_sessions(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sessions WHERE status NOT IN ('archived', 'error')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 as u64)
    }

    pub async fn update_session_status(
        &self,
        id: &str,
        status: &str,
        error_reason: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE sessions SET status = ?, error_reason = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(error_reason)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically transitions a session's status only if it currently sits
    /// in one of `from`. Returns `true` if the transition took effect. This
    /// single `UPDATE ... WHERE status IN (...)` removes the TOCTOU window a
    /// separate read-then-write would otherwise leave open.
    pub async fn transition_session(&self, id: &str, from: &[&str], to: &str) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let placeholders = from.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "UPDATE sessions SET status = ?, updated_at = ? WHERE id = ? AND status IN ({placeholders})"
        );
        let mut q = sqlx::query(&sql).bind(to).bind(&now).bind(id);
        for s in from {
            q = q.bind(*s);
        }
        let result = q.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn touch_session(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE sessions SET last_activity_at = ?, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_session_provider_id(&self, id: &str, provider_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE sessions SET provider_id = ?, updated_at = ? WHERE id = ?")
            .bind(provider_id)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_session_working_path(&self, id: &str, working_path: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE sessions SET working_path = ?, updated_at = ? WHERE id = ?")
            .bind(working_path)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes a session row. The `events` foreign key is `ON DELETE CASCADE`
    /// so this also removes the session's full journal in one statement.
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// On relay startup, any session left in a transient state by a
    /// previous (crashed/killed) process is recovered to `error` so clients
    /// observe a terminal state rather than a permanently stuck one.
    pub async fn recover_stale_sessions(&self) -> Result<u64> {
        with_timeout(async {
            let now = Utc::now().to_rfc3339();
            let n = sqlx::query(
                "UPDATE sessions SET status = 'error', error_reason = 'relay restarted', updated_at = ?
                 WHERE status IN ('creating', 'active')",
            )
            .bind(&now)
            .execute(&self.pool)
            .await?
            .rows_affected();
            Ok(n)
        })
        .await
    }

    // ─── Event Journal ──────────────────────────────────────────────────────

    /// Appends an event to a session's journal, assigning the next
    /// contiguous `seq` within a single transaction. The unique index on
    /// `(session_id, seq)` turns a concurrent double-append into a
    /// constraint violation rather than a silently accepted duplicate.
    pub async fn append_event(&self, session_id: &str, kind: &str, payload: &str) -> Result<EventRow> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;
        let next_seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO events (session_id, seq, type, payload, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(next_seq)
        .bind(kind)
        .bind(payload)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        let row: EventRow = sqlx::query_as(
            "SELECT id, session_id, seq, type, payload, created_at FROM events WHERE session_id = ? AND seq = ?",
        )
        .bind(session_id)
        .bind(next_seq)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row)
    }

    pub async fn events_after(&self, session_id: &str, since_seq: i64) -> Result<Vec<EventRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT id, session_id, seq, type, payload, created_at FROM events
                 WHERE session_id = ? AND seq > ? ORDER BY seq ASC",
            )
            .bind(session_id)
            .bind(since_seq)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    pub async fn recent_events(&self, session_id: &str, limit: i64) -> Result<Vec<EventRow>> {
        with_timeout(async {
            let rows: Vec<EventRow> = sqlx::query_as(
                "SELECT * FROM (
                     SELECT id, session_id, seq, type, payload, created_at FROM events
                     WHERE session_id = ? ORDER BY seq DESC LIMIT ?
                 ) ORDER BY seq ASC",
            )
            .bind(session_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        })
        .await
    }

    pub async fn max_seq(&self, session_id: &str) -> Result<i64> {
        let seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM events WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(seq)
    }

    pub async fn delete_events_for_session(&self, session_id: &str) -> Result<u64> {
        let n = sqlx::query("DELETE FROM events WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(n)
    }

    // ─── Maintenance ────────────────────────────────────────────────────────

    pub async fn prune_old_sessions(&self, retain_days: u32) -> Result<u64> {
        if retain_days == 0 {
            return Ok(0);
        }
        with_timeout(async {
            let cutoff = (Utc::now() - chrono::Duration::days(retain_days as i64)).to_rfc3339();
            let n = sqlx::query(
                "DELETE FROM sessions WHERE status IN ('archived', 'error') AND updated_at < ?",
            )
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
            Ok(n)
        })
        .await
    }

    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    // ─── Repos ──────────────────────────────────────────────────────────────

    pub async fn upsert_repo(&self, row: &RepoRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO repos (id, full_name, owner, private, default_branch, clone_url, description, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               full_name = excluded.full_name, owner = excluded.owner,
               private = excluded.private, default_branch = excluded.default_branch,
               clone_url = excluded.clone_url, description = excluded.description,
               updated_at = excluded.updated_at",
        )
        .bind(&row.id)
        .bind(&row.full_name)
        .bind(&row.owner)
        .bind(row.private)
        .bind(&row.default_branch)
        .bind(&row.clone_url)
        .bind(&row.description)
        .bind(&row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_repos(&self) -> Result<Vec<RepoRow>> {
        Ok(sqlx::query_as("SELECT * FROM repos ORDER BY full_name ASC")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn get_repo(&self, id: &str) -> Result<Option<RepoRow>> {
        Ok(sqlx::query_as("SELECT * FROM repos WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    // ─── Environments ───────────────────────────────────────────────────────

    pub async fn list_environments(&self) -> Result<Vec<EnvironmentRow>> {
        Ok(sqlx::query_as("SELECT * FROM environments ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn get_environment(&self, id: &str) -> Result<Option<EnvironmentRow>> {
        Ok(sqlx::query_as("SELECT * FROM environments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn create_environment(
        &self,
        name: &str,
        sandbox_type: &str,
        image: Option<&str>,
        remote_worker_url: Option<&str>,
        secret_id: Option<&str>,
        resource_tier: &str,
    ) -> Result<EnvironmentRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO environments (id, name, sandbox_type, image, remote_worker_url, secret_id, resource_tier, is_default, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(sandbox_type)
        .bind(image)
        .bind(remote_worker_url)
        .bind(secret_id)
        .bind(resource_tier)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        self.get_environment(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("environment not found after insert"))
    }

    // ─── Secrets ────────────────────────────────────────────────────────────

    pub async fn put_secret(&self, row: &SecretRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO secrets (id, kind, ciphertext, nonce, key_version, aad, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
               kind = excluded.kind, ciphertext = excluded.ciphertext,
               nonce = excluded.nonce, key_version = excluded.key_version,
               aad = excluded.aad",
        )
        .bind(&row.id)
        .bind(&row.kind)
        .bind(&row.ciphertext)
        .bind(&row.nonce)
        .bind(row.key_version)
        .bind(&row.aad)
        .bind(&row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_secret(&self, id: &str) -> Result<Option<SecretRow>> {
        Ok(sqlx::query_as("SELECT * FROM secrets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    // ─── Settings ───────────────────────────────────────────────────────────

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_storage() -> Storage {
        let dir = tempfile::tempdir().unwrap();
        Storage::new(dir.path()).await.unwrap()
    }

    #[tokio::test]
    async fn creates_session_with_creating_status() {
        let storage = test_storage().await;
        let session = storage
            .create_session(NewSession {
                mode: "chat",
                repo_full_name: Some("acme/widgets"),
                branch: None,
                provider: Some("local"),
                model_provider: None,
                model_id: None,
                system_prompt: None,
                environment_id: None,
            })
            .await
            .unwrap();
        assert_eq!(session.status, "creating");
        assert_eq!(session.repo_full_name.as_deref(), Some("acme/widgets"));
    }

    #[tokio::test]
    async fn transition_session_is_atomic_on_status() {
        let storage = test_storage().await;
        let session = storage
            .create_session(NewSession {
                mode: "chat",
                repo_full_name: None,
                branch: None,
                provider: Some("mock"),
                model_provider: None,
                model_id: None,
                system_prompt: None,
                environment_id: None,
            })
            .await
            .unwrap();

        let ok = storage
            .transition_session(&session.id, &["creating"], "idle")
            .await
            .unwrap();
        assert!(ok);

        // Second attempt from the same stale `from` set must fail since the
        // status has already moved on.
        let stale = storage
            .transition_session(&session.id, &["creating"], "idle")
            .await
            .unwrap();
        assert!(!stale);
    }

    #[tokio::test]
    async fn append_event_assigns_contiguous_seq() {
        let storage = test_storage().await;
        let session = storage
            .create_session(NewSession {
                mode: "chat",
                repo_full_name: None,
                branch: None,
                provider: Some("mock"),
                model_provider: None,
                model_id: None,
                system_prompt: None,
                environment_id: None,
            })
            .await
            .unwrap();

        let e1 = storage
            .append_event(&session.id, "agent_start", "{}")
            .await
            .unwrap();
        let e2 = storage
            .append_event(&session.id, "agent_end", "{}")
            .await
            .unwrap();
        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);
        assert_eq!(storage.max_seq(&session.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn deleting_session_cascades_events() {
        let storage = test_storage().await;
        let session = storage
            .create_session(NewSession {
                mode: "chat",
                repo_full_name: None,
                branch: None,
                provider: Some("mock"),
                model_provider: None,
                model_id: None,
                system_prompt: None,
                environment_id: None,
            })
            .await
            .unwrap();
        storage
            .append_event(&session.id, "agent_start", "{}")
            .await
            .unwrap();
        storage.delete_session(&session.id).await.unwrap();
        let remaining = storage.events_after(&session.id, 0).await.unwrap();
        assert!(remaining.is_empty());
    }
}
