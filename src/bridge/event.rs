use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

/// Broadcasts session-scoped event envelopes to every connected bridge, and
/// doubles as the process-wide Connection Registry (§9): a `sessionId ->
/// open connection count` map the Scheduler's idle reaper consults to find
/// sessions with "no open connections" before pausing them. Each bridge
/// connection subscribes to the broadcast once and filters by `sessionId`
/// locally — simpler than fanning out per-session channels, and correct at
/// the scale of a single relay process.
pub struct EventBroadcaster {
    tx: broadcast::Sender<String>,
    connections: RwLock<HashMap<String, u64>>,
}

/// Shape a connection needs to decide whether an envelope is its own.
#[derive(Deserialize)]
pub struct EnvelopeHeader {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx, connections: RwLock::new(HashMap::new()) }
    }

    /// Registers one more open connection for `session_id`. Paired with
    /// [`Self::connection_closed`]; the bridge calls this once a connection
    /// has passed its active/sandbox-bound checks and is about to start
    /// streaming, and calls the matching close on every exit path.
    pub async fn connection_opened(&self, session_id: &str) {
        *self.connections.write().await.entry(session_id.to_string()).or_insert(0) += 1;
    }

    /// Deregisters a connection opened via [`Self::connection_opened`].
    /// Removes the map entry entirely once the count reaches zero so
    /// `has_open_connections` doesn't need to special-case a stale `0` entry.
    pub async fn connection_closed(&self, session_id: &str) {
        let mut connections = self.connections.write().await;
        if let std::collections::hash_map::Entry::Occupied(mut entry) = connections.entry(session_id.to_string()) {
            *entry.get_mut() -= 1;
            if *entry.get() == 0 {
                entry.remove();
            }
        }
    }

    /// `true` if any bridge connection is currently attached to `session_id`.
    /// The idle reaper only pauses sessions where this is `false` — an
    /// active session with a live client attached is never paused out from
    /// under it, no matter how stale `lastActivityAt` looks.
    pub async fn has_open_connections(&self, session_id: &str) -> bool {
        self.connections.read().await.contains_key(session_id)
    }

    /// Publishes one event envelope scoped to `session_id`. Silently dropped
    /// if nobody is subscribed — a session with no attached bridge
    /// connection still has its events durably recorded in the journal.
    pub fn broadcast(&self, session_id: &str, event_type: &str, payload: Value) {
        let envelope = serde_json::json!({
            "sessionId": session_id,
            "type": event_type,
            "payload": payload,
        });
        let _ = self.tx.send(serde_json::to_string(&envelope).unwrap_or_default());
    }

    /// Publishes a journaled, seq-bearing agent/command event. Shaped
    /// identically to the bridge's replay path (`sessionId`/`type`/`seq`/
    /// `payload`, flat — no nested envelope) so a client can't tell whether
    /// a given event arrived live or via replay.
    pub fn broadcast_agent_event(&self, session_id: &str, seq: i64, kind: &str, payload: Value) {
        let envelope = serde_json::json!({
            "sessionId": session_id,
            "type": kind,
            "seq": seq,
            "payload": payload,
        });
        let _ = self.tx.send(serde_json::to_string(&envelope).unwrap_or_default());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_envelope_carries_session_id_for_filtering() {
        let b = EventBroadcaster::new();
        let mut rx = b.subscribe();
        b.broadcast("sess-1", "session_status", serde_json::json!({"status": "idle"}));
        let raw = rx.try_recv().unwrap();
        let header: EnvelopeHeader = serde_json::from_str(&raw).unwrap();
        assert_eq!(header.session_id, "sess-1");
    }

    #[tokio::test]
    async fn connection_registry_tracks_open_count_per_session() {
        let b = EventBroadcaster::new();
        assert!(!b.has_open_connections("sess-1").await);

        b.connection_opened("sess-1").await;
        assert!(b.has_open_connections("sess-1").await);

        b.connection_opened("sess-1").await;
        b.connection_closed("sess-1").await;
        assert!(b.has_open_connections("sess-1").await, "one connection still open");

        b.connection_closed("sess-1").await;
        assert!(!b.has_open_connections("sess-1").await, "last connection closed");

        // A different session's registry is unaffected.
        assert!(!b.has_open_connections("sess-2").await);
    }
}
