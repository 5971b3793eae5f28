use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, SessionId, ToolCallId};
use crate::task::{ChatMessage, TaskStatus};

/// Who authored a streamed message. The sidecar reports role and text in
/// separate event types, so the adapter records this per message id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// Coarse session status reported by the sidecar's status stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatusKind {
    Initializing,
    Working,
    Idle,
    Failed,
}

/// Normalized session events — the adapter's entire output vocabulary.
/// Raw sidecar protocol events are decoded once at the adapter boundary
/// and never travel further than `bw-agent`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    #[serde(rename = "text_delta")]
    TextDelta {
        session_id: SessionId,
        text: String,
        message_id: MessageId,
    },

    #[serde(rename = "stream_complete")]
    StreamComplete {
        session_id: SessionId,
        message_id: MessageId,
    },

    #[serde(rename = "tool_use")]
    ToolUse {
        session_id: SessionId,
        tool: String,
        input: serde_json::Value,
        call_id: ToolCallId,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        session_id: SessionId,
        call_id: ToolCallId,
        output: String,
        is_error: bool,
    },

    #[serde(rename = "session_status")]
    SessionStatus {
        session_id: SessionId,
        status: SessionStatusKind,
        message: Option<String>,
    },

    #[serde(rename = "complete")]
    Complete {
        session_id: SessionId,
        result: serde_json::Value,
    },

    #[serde(rename = "error")]
    Error {
        session_id: SessionId,
        message: String,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::TextDelta { session_id, .. }
            | Self::StreamComplete { session_id, .. }
            | Self::ToolUse { session_id, .. }
            | Self::ToolResult { session_id, .. }
            | Self::SessionStatus { session_id, .. }
            | Self::Complete { session_id, .. }
            | Self::Error { session_id, .. } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text_delta",
            Self::StreamComplete { .. } => "stream_complete",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::SessionStatus { .. } => "session_status",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }
}

/// Status of a single progress step (analyze-request, generate-assets, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Started,
    Completed,
    Failed,
}

/// Per-task events delivered to the caller over one mpsc channel.
/// One variant per callback in the task lifecycle surface; the tagged union
/// makes delivery ordering explicit instead of relying on listener wiring.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskEvent {
    #[serde(rename = "message")]
    Message { message: ChatMessage },

    #[serde(rename = "message_batch")]
    MessageBatch { messages: Vec<ChatMessage> },

    #[serde(rename = "text_delta")]
    TextDelta { text: String, message_id: MessageId },

    #[serde(rename = "stream_complete")]
    StreamComplete { message_id: MessageId },

    #[serde(rename = "progress")]
    Progress {
        stage: String,
        status: ProgressStatus,
        message: Option<String>,
    },

    #[serde(rename = "permission_request")]
    PermissionRequest { request: serde_json::Value },

    #[serde(rename = "complete")]
    Complete { result: serde_json::Value },

    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "status_changed")]
    StatusChanged { status: TaskStatus },
}

impl TaskEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::MessageBatch { .. } => "message_batch",
            Self::TextDelta { .. } => "text_delta",
            Self::StreamComplete { .. } => "stream_complete",
            Self::Progress { .. } => "progress",
            Self::PermissionRequest { .. } => "permission_request",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
            Self::StatusChanged { .. } => "status_changed",
        }
    }

    /// Terminal events are reported exactly once per task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}
