//! Append-only per-session event journal.
//!
//! This is a thin façade over [`crate::storage::Storage`]: the Store already
//! holds the rows, but the Journal is where the append-only contract — seq
//! contiguity, no silent duplicate acceptance, replay from an arbitrary
//! point — is expressed and tested independently of how the rows happen to
//! be persisted.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;

use crate::storage::{EventRow, Storage};

#[derive(Debug, Clone, Serialize)]
pub struct JournalEvent {
    pub seq: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: String,
}

impl From<EventRow> for JournalEvent {
    fn from(row: EventRow) -> Self {
        let payload = serde_json::from_str(&row.payload).unwrap_or(serde_json::Value::Null);
        JournalEvent {
            seq: row.seq,
            kind: row.kind,
            payload,
            created_at: row.created_at,
        }
    }
}

#[derive(Clone)]
pub struct Journal {
    storage: Arc<Storage>,
}

impl Journal {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Appends one event and returns it with its assigned seq. `seq` is
    /// monotonically increasing per session and starts at 1; there are no
    /// gaps for a session that has never had a concurrent double-append
    /// rejected by the Store's unique index.
    pub async fn append(
        &self,
        session_id: &str,
        kind: &str,
        payload: &serde_json::Value,
    ) -> Result<JournalEvent> {
        let payload_str = serde_json::to_string(payload)?;
        let row = self.storage.append_event(session_id, kind, &payload_str).await?;
        Ok(row.into())
    }

    pub async fn get_after_seq(&self, session_id: &str, since_seq: i64) -> Result<Vec<JournalEvent>> {
        Ok(self
            .storage
            .events_after(session_id, since_seq)
            .await?
            .into_iter()
            .map(JournalEvent::from)
            .collect())
    }

    pub async fn get_recent(&self, session_id: &str, limit: i64) -> Result<Vec<JournalEvent>> {
        Ok(self
            .storage
            .recent_events(session_id, limit)
            .await?
            .into_iter()
            .map(JournalEvent::from)
            .collect())
    }

    pub async fn get_max_seq(&self, session_id: &str) -> Result<i64> {
        self.storage.max_seq(session_id).await
    }

    pub async fn delete_for_session(&self, session_id: &str) -> Result<u64> {
        self.storage.delete_events_for_session(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NewSession;

    async fn test_journal() -> (Journal, String) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path()).await.unwrap());
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
        (Journal::new(storage), session.id)
    }

    #[tokio::test]
    async fn get_after_seq_replays_everything_on_zero() {
        let (journal, session_id) = test_journal().await;
        journal
            .append(&session_id, "agent_start", &serde_json::json!({}))
            .await
            .unwrap();
        journal
            .append(&session_id, "agent_end", &serde_json::json!({}))
            .await
            .unwrap();

        let all = journal.get_after_seq(&session_id, 0).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].seq, 1);
        assert_eq!(all[1].seq, 2);
    }

    #[tokio::test]
    async fn get_after_seq_is_exclusive_of_cursor() {
        let (journal, session_id) = test_journal().await;
        let e1 = journal
            .append(&session_id, "agent_start", &serde_json::json!({}))
            .await
            .unwrap();
        journal
            .append(&session_id, "agent_end", &serde_json::json!({}))
            .await
            .unwrap();

        let after = journal.get_after_seq(&session_id, e1.seq).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].kind, "agent_end");
    }

    #[tokio::test]
    async fn max_seq_is_zero_for_empty_journal() {
        let (journal, session_id) = test_journal().await;
        assert_eq!(journal.get_max_seq(&session_id).await.unwrap(), 0);
    }
}
