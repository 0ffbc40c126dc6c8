//! RPC Bridge: the per-session WebSocket surface clients use to stream
//! agent events and send commands.
//!
//! A client connects to `/ws/sessions/{id}?lastSeq=n`. The session must
//! already be `active` with a sandbox bound — activation itself only
//! happens through the blocking `POST /sessions/:id/activate` REST call,
//! never implicitly from a WebSocket upgrade. After the handshake the
//! bridge sends a `connected` message, replays any journal events the
//! client's `lastSeq` missed (framed with `replay_start`/`replay_end`),
//! then streams live events as they're appended while forwarding inbound
//! WebSocket text frames into the session as sandbox commands. The
//! connection is closed with:
//!   - `4004` if the session id doesn't exist
//!   - `4003` if the session isn't active or has no sandbox bound
//!   - `1000` on a normal client-initiated disconnect
//!
//! This is a raw `tokio-tungstenite` accept loop rather than an axum router
//! — the protocol here is a long-lived bidirectional stream, not a request
//! per connection, so there is no benefit to routing through HTTP framework
//! machinery the way the REST surface does.

pub mod event;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, Mutex},
};
use tokio_tungstenite::tungstenite::{
    handshake::server::{Request, Response},
    protocol::CloseFrame,
    Message,
};
use tracing::{info, warn};

use crate::{journal::Journal, session::SessionManager};
use event::EventBroadcaster;

const NOT_FOUND: u16 = 4004;
const NOT_ACTIVE: u16 = 4003;
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// The closed set of command `type`s a client may send over the bridge.
/// Anything else is rejected with `INVALID_COMMAND` and dropped rather than
/// forwarded to the sandbox.
const ALLOWED_COMMAND_TYPES: &[&str] = &["prompt", "abort", "get_state", "set_model", "native_tool_response"];

/// Crude per-IP connection throttle: more than `MAX_PER_WINDOW` accepted
/// connections from one address inside `WINDOW` are refused. Protects
/// against a misbehaving client hammering the bridge with reconnects.
struct ConnectionRateLimiter {
    seen: HashMap<std::net::IpAddr, Vec<Instant>>,
}

const WINDOW: Duration = Duration::from_secs(10);
const MAX_PER_WINDOW: usize = 20;

impl ConnectionRateLimiter {
    fn new() -> Self {
        Self { seen: HashMap::new() }
    }

    fn allow(&mut self, ip: std::net::IpAddr) -> bool {
        let now = Instant::now();
        let entry = self.seen.entry(ip).or_default();
        entry.retain(|t| now.duration_since(*t) < WINDOW);
        if entry.len() >= MAX_PER_WINDOW {
            return false;
        }
        entry.push(now);
        true
    }
}

struct ParsedHandshake {
    session_id: Option<String>,
    last_seq: i64,
}

/// Deregisters this connection from the Connection Registry on every exit
/// path (normal close, error, panic) without needing a matching
/// `connection_closed` call at each `return`/`break` site. `Drop` can't
/// `.await`, so the deregistration itself is spawned as a short detached task.
struct ConnectionGuard {
    broadcaster: Arc<EventBroadcaster>,
    session_id: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let broadcaster = self.broadcaster.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            broadcaster.connection_closed(&session_id).await;
        });
    }
}

/// Pulled out of the request during the WS upgrade callback, since
/// `tokio_tungstenite`'s handshake only exposes the request to a
/// synchronous callback — nothing async can run until the socket is
/// upgraded.
fn parse_handshake(request: &Request) -> ParsedHandshake {
    let path = request.uri().path();
    let session_id = path.strip_prefix("/ws/sessions/").map(|s| s.trim_end_matches('/').to_string());

    let mut last_seq = 0i64;
    if let Some(query) = request.uri().query() {
        for pair in query.split('&') {
            let mut parts = pair.splitn(2, '=');
            let (key, value) = (parts.next().unwrap_or(""), parts.next().unwrap_or(""));
            if key == "lastSeq" {
                last_seq = value.parse().unwrap_or(0);
            }
        }
    }
    ParsedHandshake { session_id, last_seq }
}

pub async fn run(
    host: &str,
    port: u16,
    session_manager: Arc<SessionManager>,
    journal: Arc<Journal>,
    broadcaster: Arc<EventBroadcaster>,
) -> Result<()> {
    let listener = TcpListener::bind((host, port)).await?;
    info!(%host, port, "bridge listening");
    serve(listener, session_manager, journal, broadcaster).await
}

/// Split out of [`run`] so tests can bind an ephemeral port (`:0`), read
/// back the OS-assigned address via `TcpListener::local_addr`, and drive a
/// real WebSocket client against it without racing a fixed port number.
pub async fn serve(
    listener: TcpListener,
    session_manager: Arc<SessionManager>,
    journal: Arc<Journal>,
    broadcaster: Arc<EventBroadcaster>,
) -> Result<()> {
    let limiter = Arc::new(Mutex::new(ConnectionRateLimiter::new()));

    loop {
        let (stream, peer) = listener.accept().await?;
        if !limiter.lock().await.allow(peer.ip()) {
            warn!(%peer, "bridge connection rate-limited");
            continue;
        }
        let session_manager = session_manager.clone();
        let journal = journal.clone();
        let broadcaster = broadcaster.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, session_manager, journal, broadcaster).await {
                warn!(%peer, error = %e, "bridge connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    session_manager: Arc<SessionManager>,
    journal: Arc<Journal>,
    broadcaster: Arc<EventBroadcaster>,
) -> Result<()> {
    let parsed = Arc::new(std::sync::Mutex::new(None::<ParsedHandshake>));
    let parsed_for_cb = parsed.clone();

    let callback = move |request: &Request, response: Response| {
        let handshake = parse_handshake(request);
        *parsed_for_cb.lock().unwrap() = Some(handshake);
        Ok(response)
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let handshake = parsed.lock().unwrap().take().unwrap_or(ParsedHandshake { session_id: None, last_seq: 0 });

    let (mut write, mut read) = ws.split();

    let session_id = match handshake.session_id {
        Some(id) => id,
        None => {
            let _ = write
                .send(Message::Close(Some(CloseFrame { code: NOT_FOUND.into(), reason: "missing session id".into() })))
                .await;
            return Ok(());
        }
    };

    let session = match session_manager.get(&session_id).await {
        Ok(view) => view,
        Err(_) => {
            let _ = write
                .send(Message::Close(Some(CloseFrame { code: NOT_FOUND.into(), reason: "session not found".into() })))
                .await;
            return Ok(());
        }
    };

    if session.status != "active" || session.provider.is_none() {
        let _ = write
            .send(Message::Close(Some(CloseFrame { code: NOT_ACTIVE.into(), reason: "session is not active".into() })))
            .await;
        return Ok(());
    }

    info!(%peer, session_id = %session_id, last_seq = handshake.last_seq, "bridge connection opened");
    broadcaster.connection_opened(&session_id).await;
    let _conn_guard = ConnectionGuard { broadcaster: broadcaster.clone(), session_id: session_id.clone() };

    let max_seq = journal.get_max_seq(&session_id).await?;
    let connected = serde_json::to_string(&serde_json::json!({
        "type": "connected",
        "sessionId": session_id,
        "lastSeq": max_seq,
    }))?;
    write.send(Message::Text(connected)).await?;

    if handshake.last_seq > 0 && handshake.last_seq < max_seq {
        let replay_start = serde_json::to_string(&serde_json::json!({
            "type": "replay_start",
            "fromSeq": handshake.last_seq,
            "toSeq": max_seq,
        }))?;
        write.send(Message::Text(replay_start)).await?;

        for event in journal.get_after_seq(&session_id, handshake.last_seq).await? {
            let text = serde_json::to_string(&serde_json::json!({
                "sessionId": session_id,
                "type": event.kind,
                "seq": event.seq,
                "payload": event.payload,
            }))?;
            write.send(Message::Text(text)).await?;
        }

        let replay_end = serde_json::to_string(&serde_json::json!({
            "type": "replay_end",
            "fromSeq": handshake.last_seq,
            "toSeq": max_seq,
        }))?;
        write.send(Message::Text(replay_end)).await?;
    }

    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_DEPTH);
    let forwarder_session_id = session_id.clone();
    let mut broadcast_rx = broadcaster.subscribe();
    let dropped = Arc::new(AtomicU64::new(0));
    let dropped_for_forwarder = dropped.clone();
    tokio::spawn(async move {
        loop {
            match broadcast_rx.recv().await {
                Ok(raw) => {
                    let Ok(header) = serde_json::from_str::<event::EnvelopeHeader>(&raw) else {
                        continue;
                    };
                    if header.session_id != forwarder_session_id {
                        continue;
                    }
                    if out_tx.try_send(raw).is_err() {
                        dropped_for_forwarder.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(session_id = %forwarder_session_id, skipped = n, "bridge connection lagged behind broadcast");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                match outgoing {
                    Some(text) => {
                        if write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_incoming_command(&session_manager, &session_id, &text, &mut write).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = write.send(Message::Close(Some(CloseFrame { code: 1000, reason: "".into() }))).await;
                        break;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %session_id, error = %e, "bridge read error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    if dropped.load(Ordering::Relaxed) > 0 {
        warn!(session_id = %session_id, dropped = dropped.load(Ordering::Relaxed), "bridge connection dropped events from a full outbound queue");
    }
    info!(%peer, session_id = %session_id, "bridge connection closed");
    Ok(())
}

/// Validates an inbound command against the closed command-type union,
/// journals `prompt` commands (so they appear in session history, matching
/// scenario S2's expected event order), and forwards everything else
/// straight through. Unknown types get an `error` reply on this connection
/// only and are never forwarded to the sandbox or broadcast.
type BridgeWriter = futures_util::stream::SplitSink<tokio_tungstenite::WebSocketStream<TcpStream>, Message>;

async fn handle_incoming_command(
    session_manager: &Arc<SessionManager>,
    session_id: &str,
    text: &str,
    write: &mut BridgeWriter,
) {
    let command: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "unparseable bridge command");
            return;
        }
    };

    let kind = command.get("type").and_then(|v| v.as_str()).unwrap_or("");
    if !ALLOWED_COMMAND_TYPES.contains(&kind) {
        let error = serde_json::json!({"type": "error", "code": "INVALID_COMMAND", "commandType": kind});
        if let Ok(text) = serde_json::to_string(&error) {
            let _ = write.send(Message::Text(text)).await;
        }
        return;
    }

    let result = if kind == "prompt" {
        session_manager.submit_command(session_id, kind, command).await.map(|_| ())
    } else {
        session_manager.send_command(session_id, command).await
    };

    if let Err(e) = result {
        warn!(session_id = %session_id, error = %e, "failed to forward bridge command");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_blocks_after_threshold() {
        let mut limiter = ConnectionRateLimiter::new();
        let ip: std::net::IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..MAX_PER_WINDOW {
            assert!(limiter.allow(ip));
        }
        assert!(!limiter.allow(ip));
    }

    #[test]
    fn rejects_command_types_outside_the_closed_set() {
        assert!(ALLOWED_COMMAND_TYPES.contains(&"prompt"));
        assert!(!ALLOWED_COMMAND_TYPES.contains(&"shell_exec"));
    }
}
