//! Sidecar wire protocol.
//!
//! The event stream delivers newline-delimited JSON objects shaped
//! `{ "type": ..., "properties": ... }`. Each line is decoded exactly once
//! here into the closed `UpstreamEvent` union; nothing past this module
//! dispatches on type strings.

use serde::Deserialize;
use serde_json::Value;

use bw_core::errors::EngineError;
use bw_core::events::{Role, SessionStatusKind};
use bw_core::ids::{MessageId, SessionId, ToolCallId};

/// Raw envelope as it appears on the wire.
#[derive(Debug, Deserialize)]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub properties: Value,
}

/// Typed upstream events. Message metadata and message content arrive as
/// independent event types in no guaranteed order; `MessageStarted` carries
/// the role, `ContentUpdated` carries the full accumulated text.
#[derive(Clone, Debug, PartialEq)]
pub enum UpstreamEvent {
    MessageStarted {
        session_id: SessionId,
        message_id: MessageId,
        role: Role,
    },
    ContentUpdated {
        session_id: SessionId,
        message_id: MessageId,
        text: String,
    },
    MessageCompleted {
        session_id: SessionId,
        message_id: MessageId,
    },
    ToolCallStarted {
        session_id: SessionId,
        call_id: ToolCallId,
        tool: String,
        input: Value,
    },
    ToolCallCompleted {
        session_id: SessionId,
        call_id: ToolCallId,
        output: String,
        is_error: bool,
    },
    StatusChanged {
        session_id: SessionId,
        status: SessionStatusKind,
        message: Option<String>,
    },
    SessionError {
        session_id: SessionId,
        message: String,
    },
}

#[derive(Debug, Deserialize)]
struct MessageStartedProps {
    session_id: String,
    message_id: String,
    role: Role,
}

#[derive(Debug, Deserialize)]
struct ContentUpdatedProps {
    session_id: String,
    message_id: String,
    /// Full accumulated text of the message so far, not a delta.
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessageCompletedProps {
    session_id: String,
    message_id: String,
}

#[derive(Debug, Deserialize)]
struct ToolCallStartedProps {
    session_id: String,
    call_id: String,
    tool: String,
    #[serde(default)]
    input: Value,
}

#[derive(Debug, Deserialize)]
struct ToolCallCompletedProps {
    session_id: String,
    call_id: String,
    #[serde(default)]
    output: String,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Deserialize)]
struct StatusChangedProps {
    session_id: String,
    status: SessionStatusKind,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionErrorProps {
    session_id: String,
    message: String,
}

/// Decode one wire envelope into a typed event.
///
/// Unknown event types and malformed properties are protocol errors; the
/// caller logs and skips them, the stream continues.
pub fn decode(wire: WireEvent) -> Result<UpstreamEvent, EngineError> {
    fn props<T: serde::de::DeserializeOwned>(
        event_type: &str,
        properties: Value,
    ) -> Result<T, EngineError> {
        serde_json::from_value(properties)
            .map_err(|e| EngineError::UpstreamProtocol(format!("{event_type}: {e}")))
    }

    match wire.event_type.as_str() {
        // `message.created` and `message.updated` both carry the role; the
        // adapter only cares about the first sighting.
        "message.created" | "message.updated" => {
            let p: MessageStartedProps = props(&wire.event_type, wire.properties)?;
            Ok(UpstreamEvent::MessageStarted {
                session_id: SessionId::from_raw(p.session_id),
                message_id: MessageId::from_raw(p.message_id),
                role: p.role,
            })
        }
        "message.content.updated" => {
            let p: ContentUpdatedProps = props(&wire.event_type, wire.properties)?;
            Ok(UpstreamEvent::ContentUpdated {
                session_id: SessionId::from_raw(p.session_id),
                message_id: MessageId::from_raw(p.message_id),
                text: p.content,
            })
        }
        "message.completed" => {
            let p: MessageCompletedProps = props(&wire.event_type, wire.properties)?;
            Ok(UpstreamEvent::MessageCompleted {
                session_id: SessionId::from_raw(p.session_id),
                message_id: MessageId::from_raw(p.message_id),
            })
        }
        "tool.call.started" => {
            let p: ToolCallStartedProps = props(&wire.event_type, wire.properties)?;
            Ok(UpstreamEvent::ToolCallStarted {
                session_id: SessionId::from_raw(p.session_id),
                call_id: ToolCallId::from_raw(p.call_id),
                tool: p.tool,
                input: p.input,
            })
        }
        "tool.call.completed" => {
            let p: ToolCallCompletedProps = props(&wire.event_type, wire.properties)?;
            Ok(UpstreamEvent::ToolCallCompleted {
                session_id: SessionId::from_raw(p.session_id),
                call_id: ToolCallId::from_raw(p.call_id),
                output: p.output,
                is_error: p.is_error,
            })
        }
        "session.status.changed" => {
            let p: StatusChangedProps = props(&wire.event_type, wire.properties)?;
            Ok(UpstreamEvent::StatusChanged {
                session_id: SessionId::from_raw(p.session_id),
                status: p.status,
                message: p.message,
            })
        }
        "session.error" => {
            let p: SessionErrorProps = props(&wire.event_type, wire.properties)?;
            Ok(UpstreamEvent::SessionError {
                session_id: SessionId::from_raw(p.session_id),
                message: p.message,
            })
        }
        other => Err(EngineError::UpstreamProtocol(format!(
            "unknown event type: {other}"
        ))),
    }
}

/// Parse one NDJSON line into a typed event.
pub fn decode_line(line: &str) -> Result<UpstreamEvent, EngineError> {
    let wire: WireEvent = serde_json::from_str(line)
        .map_err(|e| EngineError::UpstreamProtocol(format!("invalid envelope: {e}")))?;
    decode(wire)
}

impl UpstreamEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::MessageStarted { session_id, .. }
            | Self::ContentUpdated { session_id, .. }
            | Self::MessageCompleted { session_id, .. }
            | Self::ToolCallStarted { session_id, .. }
            | Self::ToolCallCompleted { session_id, .. }
            | Self::StatusChanged { session_id, .. }
            | Self::SessionError { session_id, .. } => session_id,
        }
    }
}
