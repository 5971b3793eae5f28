//! Streaming session adapter.
//!
//! Owns the HTTP surface of one sidecar: session creation, message sends,
//! and the single shared NDJSON event stream. Inbound wire events are
//! decoded, run through per-session [`SessionStreamState`], and fanned out
//! as normalized [`SessionEvent`]s on a broadcast channel.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bw_core::errors::EngineError;
use bw_core::events::SessionEvent;
use bw_core::ids::{MessageId, SessionId};

use crate::protocol;
use crate::stream_state::SessionStreamState;

#[derive(serde::Deserialize)]
struct CreateSessionResponse {
    session_id: String,
}

/// Adapter over one sidecar process. Per-session streaming state is keyed
/// by session id; the shared event stream multiplexes all sessions.
pub struct SessionAdapter {
    client: reqwest::Client,
    base_url: String,
    event_tx: broadcast::Sender<SessionEvent>,
    sessions: DashMap<SessionId, SessionStreamState>,
    reconnect_backoff: Duration,
}

impl SessionAdapter {
    pub fn new(base_url: impl Into<String>, reconnect_backoff: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            event_tx,
            sessions: DashMap::new(),
            reconnect_backoff,
        }
    }

    /// Subscribe to the normalized event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Create a new session on the sidecar and start tracking its stream
    /// state.
    pub async fn create_session(&self) -> Result<SessionId, EngineError> {
        let url = format!("{}/sessions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| EngineError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(EngineError::Http(format!(
                "session create returned {}",
                resp.status()
            )));
        }

        let body: CreateSessionResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::Http(e.to_string()))?;

        let session_id = SessionId::from_raw(body.session_id);
        self.sessions
            .insert(session_id.clone(), SessionStreamState::new());
        info!(session_id = %session_id, "Session created");
        Ok(session_id)
    }

    /// Whether we still hold streaming state for a session. Idle sessions
    /// stay tracked until explicit disposal so they can take follow-ups.
    pub fn has_session(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Post a message to a session.
    pub async fn send_message(
        &self,
        session_id: &SessionId,
        text: &str,
    ) -> Result<(), EngineError> {
        if !self.has_session(session_id) {
            return Err(EngineError::SessionNotRunning(session_id.clone()));
        }

        let url = format!("{}/sessions/{}/messages", self.base_url, session_id);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| EngineError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(EngineError::Http(format!(
                "message send returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Forward a graceful interrupt. Session state is retained: the agent
    /// may accept one more follow-up after stopping.
    pub async fn interrupt(&self, session_id: &SessionId) -> Result<(), EngineError> {
        if !self.has_session(session_id) {
            return Err(EngineError::SessionNotRunning(session_id.clone()));
        }

        let url = format!("{}/sessions/{}/interrupt", self.base_url, session_id);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| EngineError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(EngineError::Http(format!(
                "interrupt returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Take the accumulated transcript text for a finished message.
    pub fn take_message_text(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
    ) -> Option<String> {
        self.sessions
            .get_mut(session_id)
            .and_then(|mut s| s.take_text(message_id))
    }

    /// Drop state for one session.
    pub fn remove_session(&self, session_id: &SessionId) {
        self.sessions.remove(session_id);
    }

    /// Drop all session state.
    pub fn dispose(&self) {
        self.sessions.clear();
    }

    /// Decode and apply one NDJSON line, broadcasting the resulting events.
    /// Malformed lines are logged and skipped; the stream continues.
    pub fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let event = match protocol::decode_line(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Skipping malformed stream event");
                return;
            }
        };

        let session_id = event.session_id().clone();
        // Events can reference sessions resumed from a previous run; track
        // them on first sight instead of dropping their stream.
        let mut state = self.sessions.entry(session_id.clone()).or_default();
        for out in state.apply(&session_id, event) {
            if self.event_tx.send(out).is_err() {
                debug!("No subscribers for session event");
            }
        }
    }

    /// Consume the shared event stream until cancelled. Transport errors
    /// re-attach with a fixed backoff; per-session state survives the
    /// reconnect untouched.
    pub fn run_stream(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let adapter = Arc::clone(self);
        tokio::spawn(async move {
            let url = format!("{}/events", adapter.base_url);
            loop {
                if cancel.is_cancelled() {
                    break;
                }

                let resp = tokio::select! {
                    _ = cancel.cancelled() => break,
                    resp = adapter.client.get(&url).send() => resp,
                };

                let resp = match resp {
                    Ok(resp) if resp.status().is_success() => resp,
                    Ok(resp) => {
                        warn!(status = %resp.status(), "Event stream refused, retrying");
                        tokio::time::sleep(adapter.reconnect_backoff).await;
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "Event stream connect failed, retrying");
                        tokio::time::sleep(adapter.reconnect_backoff).await;
                        continue;
                    }
                };

                info!("Event stream attached");
                let mut stream = resp.bytes_stream();
                let mut buf = BytesMut::new();

                loop {
                    let chunk = tokio::select! {
                        _ = cancel.cancelled() => return,
                        chunk = stream.next() => chunk,
                    };

                    match chunk {
                        Some(Ok(bytes)) => {
                            buf.extend_from_slice(&bytes);
                            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                                let line = buf.split_to(pos + 1);
                                match std::str::from_utf8(&line) {
                                    Ok(text) => adapter.handle_line(text),
                                    Err(e) => {
                                        warn!(error = %e, "Skipping non-UTF-8 stream line");
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Event stream dropped, reconnecting");
                            break;
                        }
                        None => {
                            warn!("Event stream ended, reconnecting");
                            break;
                        }
                    }
                }

                tokio::time::sleep(adapter.reconnect_backoff).await;
            }
        })
    }
}
