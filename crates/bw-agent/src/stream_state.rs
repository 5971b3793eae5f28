//! Per-session streaming state.
//!
//! Two quirks of the sidecar protocol are absorbed here so the rest of the
//! system only ever sees clean incremental events:
//!
//! 1. Content updates carry the *full* accumulated text of the current
//!    message. Emitting that verbatim would duplicate content client-side,
//!    so we diff against the length already emitted and forward the suffix.
//! 2. Role and content arrive in separate, unordered event types. We record
//!    roles as they appear and suppress user-authored content; a message
//!    with no recorded role streams as assistant, since tool-originated
//!    content can precede its role record.

use std::collections::HashMap;

use bw_core::events::{Role, SessionEvent, SessionStatusKind};
use bw_core::ids::{MessageId, SessionId};

use crate::protocol::UpstreamEvent;

/// Mutable streaming state for one session. Keyed by session id in the
/// adapter; state never crosses sessions even though the transport is one
/// shared stream.
#[derive(Debug, Default)]
pub struct SessionStreamState {
    current_message: Option<MessageId>,
    emitted_len: usize,
    roles: HashMap<MessageId, Role>,
    /// Accumulated assistant text per in-flight message, for transcript
    /// assembly on stream completion.
    accumulated: HashMap<MessageId, String>,
}

impl SessionStreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text accumulated for a message so far, if any.
    pub fn accumulated_text(&self, message_id: &MessageId) -> Option<&str> {
        self.accumulated.get(message_id).map(String::as_str)
    }

    /// Take the finished transcript text for a message, removing it.
    pub fn take_text(&mut self, message_id: &MessageId) -> Option<String> {
        self.accumulated.remove(message_id)
    }

    fn role_of(&self, message_id: &MessageId) -> Role {
        // Default to assistant: dropping content that merely raced its role
        // record would lose tool-originated output.
        self.roles.get(message_id).copied().unwrap_or(Role::Assistant)
    }

    /// Apply one upstream event, producing zero or more normalized events.
    pub fn apply(&mut self, session_id: &SessionId, event: UpstreamEvent) -> Vec<SessionEvent> {
        match event {
            UpstreamEvent::MessageStarted {
                message_id, role, ..
            } => {
                self.roles.insert(message_id, role);
                Vec::new()
            }

            UpstreamEvent::ContentUpdated {
                message_id, text, ..
            } => {
                if self.role_of(&message_id) == Role::User {
                    return Vec::new();
                }

                if self.current_message.as_ref() != Some(&message_id) {
                    self.current_message = Some(message_id.clone());
                    self.emitted_len = 0;
                }

                let delta = match text.get(self.emitted_len..) {
                    Some(suffix) if !suffix.is_empty() => suffix.to_owned(),
                    _ => return Vec::new(),
                };
                self.emitted_len = text.len();
                self.accumulated.insert(message_id.clone(), text);

                vec![SessionEvent::TextDelta {
                    session_id: session_id.clone(),
                    text: delta,
                    message_id,
                }]
            }

            UpstreamEvent::MessageCompleted { message_id, .. } => {
                if self.role_of(&message_id) == Role::User {
                    return Vec::new();
                }
                if self.current_message.as_ref() == Some(&message_id) {
                    self.current_message = None;
                    self.emitted_len = 0;
                }
                vec![SessionEvent::StreamComplete {
                    session_id: session_id.clone(),
                    message_id,
                }]
            }

            UpstreamEvent::ToolCallStarted {
                call_id,
                tool,
                input,
                ..
            } => vec![SessionEvent::ToolUse {
                session_id: session_id.clone(),
                tool,
                input,
                call_id,
            }],

            UpstreamEvent::ToolCallCompleted {
                call_id,
                output,
                is_error,
                ..
            } => vec![SessionEvent::ToolResult {
                session_id: session_id.clone(),
                call_id,
                output,
                is_error,
            }],

            UpstreamEvent::StatusChanged {
                status, message, ..
            } => {
                let mut events = vec![SessionEvent::SessionStatus {
                    session_id: session_id.clone(),
                    status,
                    message: message.clone(),
                }];
                // Idle means the agent finished its current task. We report
                // completion but keep this state alive: the session may get
                // a follow-up message later.
                if status == SessionStatusKind::Idle {
                    events.push(SessionEvent::Complete {
                        session_id: session_id.clone(),
                        result: serde_json::json!({ "status": "idle" }),
                    });
                }
                events
            }

            UpstreamEvent::SessionError { message, .. } => vec![SessionEvent::Error {
                session_id: session_id.clone(),
                message,
            }],
        }
    }
}
