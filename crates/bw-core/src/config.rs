use std::path::PathBuf;
use std::time::Duration;

/// How long the tool-side HTTP channel waits before giving up on a question.
/// The question's late-answer marker is derived from this same constant so
/// the two timeouts cannot drift apart.
pub const ASK_CHANNEL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Grace period past the channel timeout before a pending question is marked
/// answerable-but-channel-closed.
pub const LATE_MARKER_GRACE: Duration = Duration::from_secs(10);

/// Primary timeout for question and permission waits: the caller receives
/// `RequestTimedOut` once this elapses.
pub const REQUEST_PRIMARY_TIMEOUT: Duration = Duration::from_secs(6 * 60);

/// How long a timed-out question stays answerable before it is dropped.
/// Bounds the pending-request map over a long-lived process.
pub const LATE_ANSWER_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Runtime configuration shared by all subsystems.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Admission-control limit: tasks running at once.
    pub max_concurrent_tasks: usize,
    /// Debounce window for coalescing chat messages into one UI batch.
    pub message_debounce: Duration,

    /// Command used to launch the session-hosting sidecar.
    pub sidecar_command: PathBuf,
    /// Port the sidecar's HTTP surface listens on.
    pub sidecar_port: u16,
    /// Bound on how long `/health` may stay unreachable at startup.
    pub startup_timeout: Duration,
    /// Interval between startup readiness polls.
    pub startup_poll_interval: Duration,
    /// Interval between background liveness probes after startup.
    pub liveness_probe_interval: Duration,
    /// Fixed backoff before re-attaching a dropped event stream.
    pub stream_reconnect_backoff: Duration,

    /// Fixed local ports for the three approval listeners.
    pub file_permission_port: u16,
    pub question_port: u16,
    pub commerce_permission_port: u16,
    /// Auto-approve low-risk file operations without asking.
    pub auto_approve_low_risk: bool,
    /// Paths under this directory downgrade file-operation risk.
    pub safe_directory: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            message_debounce: Duration::from_millis(50),
            sidecar_command: PathBuf::from("brandwork-agent"),
            sidecar_port: 9470,
            startup_timeout: Duration::from_secs(30),
            startup_poll_interval: Duration::from_millis(500),
            liveness_probe_interval: Duration::from_secs(30),
            stream_reconnect_backoff: Duration::from_secs(2),
            file_permission_port: 9471,
            question_port: 9472,
            commerce_permission_port: 9473,
            auto_approve_low_risk: false,
            safe_directory: std::env::temp_dir(),
        }
    }
}

impl RuntimeConfig {
    /// Queue depth equals the concurrency limit; beyond it starts fail
    /// with `QueueFull`.
    pub fn max_queued_tasks(&self) -> usize {
        self.max_concurrent_tasks
    }

    pub fn sidecar_base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.sidecar_port)
    }
}
