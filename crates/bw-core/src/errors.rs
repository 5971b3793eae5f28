use crate::ids::{SessionId, TaskId};

/// Typed error taxonomy for the runtime.
///
/// Fatal errors stop the subsystem that raised them; everything else
/// terminates at most one task. `UpstreamProtocol` never terminates
/// anything — malformed stream events are logged and skipped.
#[derive(Clone, Debug, thiserror::Error)]
pub enum EngineError {
    #[error("task {0} is already running or queued")]
    DuplicateTask(TaskId),

    #[error("task queue is full (limit {limit})")]
    QueueFull { limit: usize },

    #[error("sidecar never became ready within {timeout_secs}s")]
    ServerStartupTimeout { timeout_secs: u64 },

    #[error("request timed out waiting for user decision")]
    RequestTimedOut,

    #[error("no running session for {0}")]
    SessionNotRunning(SessionId),

    #[error("no running task {0}")]
    TaskNotRunning(TaskId),

    #[error("malformed upstream event: {0}")]
    UpstreamProtocol(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("failed to spawn sidecar process: {0}")]
    ProcessSpawn(String),

    #[error("interrupted")]
    Interrupted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Short classification string for structured logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::DuplicateTask(_) => "duplicate_task",
            Self::QueueFull { .. } => "queue_full",
            Self::ServerStartupTimeout { .. } => "server_startup_timeout",
            Self::RequestTimedOut => "request_timed_out",
            Self::SessionNotRunning(_) => "session_not_running",
            Self::TaskNotRunning(_) => "task_not_running",
            Self::UpstreamProtocol(_) => "upstream_protocol",
            Self::Http(_) => "http",
            Self::ProcessSpawn(_) => "process_spawn",
            Self::Interrupted => "interrupted",
            Self::Internal(_) => "internal",
        }
    }

    /// Fatal errors mean no session work can proceed at all.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ServerStartupTimeout { .. } | Self::ProcessSpawn(_)
        )
    }
}
