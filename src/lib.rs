//! Brandwork engine — wires the sidecar, session adapter, scheduler, and
//! approval arbiter into one runtime.
//!
//! The crates underneath are independent: `bw-agent` speaks to the
//! sidecar, `bw-scheduler` enforces admission, `bw-approvals` arbitrates
//! user decisions. This crate owns the composition: the executor that
//! drives sessions on the scheduler's behalf, the event router that
//! carries transcript batches back to callers, and the background task
//! that turns late answers into follow-up messages.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bw_agent::adapter::SessionAdapter;
use bw_agent::process::SidecarProcess;
use bw_approvals::{ApprovalRequest, ApprovalServers, LateAnswer, PermissionArbiter};
use bw_core::config::RuntimeConfig;
use bw_core::errors::EngineError;
use bw_core::events::{ProgressStatus, SessionEvent, SessionStatusKind, TaskEvent};
use bw_core::ids::{SessionId, TaskId, ToolCallId};
use bw_core::task::{ChatMessage, Task, TaskConfig};
use bw_scheduler::batcher::{MessageBatcher, MessageSink};
use bw_scheduler::scheduler::{TaskExecutor, TaskScheduler};

pub use bw_core::{config, errors, events, ids, task};

/// Routes flushed message batches back onto each task's event channel.
///
/// The batcher is task-agnostic; this sink resolves a task id to the
/// channel its caller registered at start. Batches surface as
/// `MessageBatch`, each message then re-surfaces individually as
/// `Message` for the caller's history store.
#[derive(Default)]
pub struct TaskEventRouter {
    senders: DashMap<TaskId, mpsc::Sender<TaskEvent>>,
}

impl TaskEventRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, task_id: TaskId, sender: mpsc::Sender<TaskEvent>) {
        self.senders.insert(task_id, sender);
    }

    pub fn unregister(&self, task_id: &TaskId) {
        self.senders.remove(task_id);
    }

    fn send(&self, task_id: &TaskId, event: TaskEvent) {
        let Some(sender) = self.senders.get(task_id) else {
            debug!(task_id = %task_id, "No registered channel for task event");
            return;
        };
        if sender.try_send(event).is_err() {
            warn!(task_id = %task_id, "Task event channel full or closed; dropping");
        }
    }
}

impl MessageSink for TaskEventRouter {
    fn deliver_batch(&self, task_id: &TaskId, messages: Vec<ChatMessage>) {
        self.send(task_id, TaskEvent::MessageBatch { messages });
    }

    fn persist(&self, task_id: &TaskId, message: &ChatMessage) {
        self.send(
            task_id,
            TaskEvent::Message {
                message: message.clone(),
            },
        );
    }
}

/// Production `TaskExecutor`: one agent session per task, driven over the
/// adapter's normalized event stream.
pub struct AdapterExecutor {
    adapter: Arc<SessionAdapter>,
    batcher: MessageBatcher,
    router: Arc<TaskEventRouter>,
    /// Task → session mapping, retained past completion so an idle session
    /// can take follow-ups until explicit disposal.
    sessions: DashMap<TaskId, SessionId>,
}

impl AdapterExecutor {
    pub fn new(
        adapter: Arc<SessionAdapter>,
        batcher: MessageBatcher,
        router: Arc<TaskEventRouter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            batcher,
            router,
            sessions: DashMap::new(),
        })
    }

    pub fn session_for(&self, task_id: &TaskId) -> Option<SessionId> {
        self.sessions.get(task_id).map(|s| s.clone())
    }

    /// Drop the task → session mapping and the adapter's session state.
    pub fn dispose_task(&self, task_id: &TaskId) {
        if let Some((_, session_id)) = self.sessions.remove(task_id) {
            self.adapter.remove_session(&session_id);
        }
        self.router.unregister(task_id);
    }

    async fn resolve_session(&self, config: &TaskConfig) -> Result<SessionId, EngineError> {
        if let Some(session_id) = &config.resume_session_id {
            if self.adapter.has_session(session_id) {
                info!(session_id = %session_id, "Resuming retained session");
                return Ok(session_id.clone());
            }
        }
        self.adapter.create_session().await
    }

    async fn run(
        &self,
        task_id: &TaskId,
        session_id: &SessionId,
        config: &TaskConfig,
        events: &mpsc::Sender<TaskEvent>,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, EngineError> {
        // Subscribe before sending so the first events cannot be missed.
        let mut rx = self.adapter.subscribe();
        self.adapter.send_message(session_id, &config.prompt).await?;

        // Tool names by call id, for labeling results.
        let mut tools: HashMap<ToolCallId, String> = HashMap::new();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Interrupted),
                event = rx.recv() => event,
            };

            let event = match event {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(task_id = %task_id, skipped, "Task event loop lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EngineError::Internal("session event stream closed".into()));
                }
            };

            if event.session_id() != session_id {
                continue;
            }

            match event {
                SessionEvent::TextDelta {
                    text, message_id, ..
                } => {
                    let _ = events.send(TaskEvent::TextDelta { text, message_id }).await;
                }
                SessionEvent::StreamComplete { message_id, .. } => {
                    let _ = events
                        .send(TaskEvent::StreamComplete {
                            message_id: message_id.clone(),
                        })
                        .await;
                    if let Some(text) = self.adapter.take_message_text(session_id, &message_id) {
                        self.batcher
                            .push(task_id.clone(), ChatMessage::assistant(text));
                    }
                }
                SessionEvent::ToolUse { tool, call_id, .. } => {
                    tools.insert(call_id, tool.clone());
                    let _ = events
                        .send(TaskEvent::Progress {
                            stage: tool,
                            status: ProgressStatus::Started,
                            message: None,
                        })
                        .await;
                }
                SessionEvent::ToolResult {
                    call_id, is_error, ..
                } => {
                    let stage = tools.remove(&call_id).unwrap_or_else(|| "tool".into());
                    let _ = events
                        .send(TaskEvent::Progress {
                            stage,
                            status: if is_error {
                                ProgressStatus::Failed
                            } else {
                                ProgressStatus::Completed
                            },
                            message: None,
                        })
                        .await;
                }
                SessionEvent::SessionStatus {
                    status, message, ..
                } => {
                    debug!(task_id = %task_id, ?status, "Session status changed");
                    if status == SessionStatusKind::Failed {
                        let _ = events
                            .send(TaskEvent::Progress {
                                stage: "session".into(),
                                status: ProgressStatus::Failed,
                                message,
                            })
                            .await;
                    }
                }
                SessionEvent::Complete { result, .. } => {
                    // Transcript must land before the terminal event.
                    self.batcher.flush_now(task_id);
                    return Ok(result);
                }
                SessionEvent::Error { message, .. } => {
                    self.batcher.flush_now(task_id);
                    return Err(EngineError::Internal(message));
                }
            }
        }
    }
}

#[async_trait]
impl TaskExecutor for AdapterExecutor {
    async fn execute(
        &self,
        task_id: &TaskId,
        config: &TaskConfig,
        events: mpsc::Sender<TaskEvent>,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, EngineError> {
        let session_id = self.resolve_session(config).await?;
        self.sessions.insert(task_id.clone(), session_id.clone());

        let result = self.run(task_id, &session_id, config, &events, &cancel).await;
        // Session state and the task mapping survive completion: the agent
        // may take a follow-up until disposal.
        self.batcher.flush_now(task_id);
        result
    }

    async fn interrupt(&self, task_id: &TaskId) -> Result<(), EngineError> {
        match self.session_for(task_id) {
            Some(session_id) => self.adapter.interrupt(&session_id).await,
            None => Err(EngineError::TaskNotRunning(task_id.clone())),
        }
    }

    async fn follow_up(&self, task_id: &TaskId, text: &str) -> Result<(), EngineError> {
        match self.session_for(task_id) {
            Some(session_id) => self.adapter.send_message(&session_id, text).await,
            None => Err(EngineError::TaskNotRunning(task_id.clone())),
        }
    }
}

/// The assembled engine.
pub struct Runtime {
    config: RuntimeConfig,
    sidecar: SidecarProcess,
    adapter: Arc<SessionAdapter>,
    executor: Arc<AdapterExecutor>,
    scheduler: Arc<TaskScheduler>,
    arbiter: Arc<PermissionArbiter>,
    approval_servers: ApprovalServers,
    router: Arc<TaskEventRouter>,
    stream_cancel: CancellationToken,
    stream_handle: tokio::task::JoinHandle<()>,
    probe_handle: tokio::task::JoinHandle<()>,
    late_router_handle: tokio::task::JoinHandle<()>,
    approval_forwarder_handle: tokio::task::JoinHandle<()>,
}

impl Runtime {
    /// Spawn the sidecar and bring every subsystem up. Fails fast when the
    /// sidecar never becomes ready.
    pub async fn start(config: RuntimeConfig) -> Result<Self, EngineError> {
        let sidecar = SidecarProcess::spawn(&config)?;
        sidecar.wait_ready().await?;
        let probe_handle = sidecar.spawn_liveness_probe(config.liveness_probe_interval);

        let adapter = Arc::new(SessionAdapter::new(
            sidecar.base_url(),
            config.stream_reconnect_backoff,
        ));
        let stream_cancel = CancellationToken::new();
        let stream_handle = adapter.run_stream(stream_cancel.clone());

        let router = TaskEventRouter::new();
        let batcher = MessageBatcher::new(router.clone(), config.message_debounce);
        let executor = AdapterExecutor::new(adapter.clone(), batcher.clone(), router.clone());
        let scheduler = TaskScheduler::new(
            executor.clone(),
            config.max_concurrent_tasks,
            config.max_queued_tasks(),
        );

        let (arbiter, late_rx) = PermissionArbiter::new(&config);
        let approval_servers = ApprovalServers::start(
            arbiter.clone(),
            config.file_permission_port,
            config.question_port,
            config.commerce_permission_port,
        )
        .await?;

        let late_router_handle = spawn_late_router(scheduler.clone(), late_rx);
        let approval_forwarder_handle = spawn_approval_forwarder(
            router.clone(),
            batcher.clone(),
            arbiter.subscribe_requests(),
        );

        info!("Runtime started");
        Ok(Self {
            config,
            sidecar,
            adapter,
            executor,
            scheduler,
            arbiter,
            approval_servers,
            router,
            stream_cancel,
            stream_handle,
            probe_handle,
            late_router_handle,
            approval_forwarder_handle,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn arbiter(&self) -> &Arc<PermissionArbiter> {
        &self.arbiter
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// UI-facing announcement channel for pending approvals.
    pub fn subscribe_approvals(&self) -> broadcast::Receiver<ApprovalRequest> {
        self.arbiter.subscribe_requests()
    }

    /// Admit a task; its lifecycle arrives on `events`.
    pub async fn start_task(
        &self,
        config: TaskConfig,
        events: mpsc::Sender<TaskEvent>,
    ) -> Result<Task, EngineError> {
        let id = TaskId::new();
        self.router.register(id.clone(), events.clone());
        let task = self.scheduler.start_task(id.clone(), config, events).await;
        if task.is_err() {
            self.router.unregister(&id);
        }
        task
    }

    pub async fn cancel_task(&self, id: &TaskId) -> bool {
        let cancelled = self.scheduler.cancel_task(id).await;
        if cancelled {
            self.executor.dispose_task(id);
        }
        cancelled
    }

    /// Graceful stop: the session stays available for one more follow-up.
    pub async fn interrupt_task(&self, id: &TaskId) -> Result<(), EngineError> {
        self.scheduler.interrupt_task(id).await
    }

    pub async fn send_follow_up(&self, id: &TaskId, text: &str) -> Result<(), EngineError> {
        self.scheduler.send_follow_up(id, text).await
    }

    /// Tear everything down: scheduler first so no task observes a dead
    /// sidecar, then the stream, the listeners, and the process itself.
    pub async fn shutdown(mut self) {
        self.scheduler.dispose().await;
        self.stream_cancel.cancel();
        self.stream_handle.abort();
        self.probe_handle.abort();
        self.late_router_handle.abort();
        self.approval_forwarder_handle.abort();
        self.approval_servers.stop();
        self.adapter.dispose();
        self.sidecar.stop().await;
        info!("Runtime stopped");
    }
}

/// Mirrors question announcements onto the owning task's event channel, so
/// a caller watching one task sees its pending questions without also
/// subscribing to the arbiter. File and commerce requests carry no task id
/// and stay on the announcement channel only.
///
/// Buffered transcript messages are flushed first: the request must never
/// overtake the messages that led up to it.
fn spawn_approval_forwarder(
    router: Arc<TaskEventRouter>,
    batcher: MessageBatcher,
    mut announce: broadcast::Receiver<ApprovalRequest>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match announce.recv().await {
                Ok(request) => {
                    if let ApprovalRequest::Question { task_id, .. } = &request {
                        batcher.flush_now(task_id);
                        match serde_json::to_value(&request) {
                            Ok(value) => router
                                .send(task_id, TaskEvent::PermissionRequest { request: value }),
                            Err(e) => warn!(error = %e, "Unserializable approval request"),
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Approval forwarder lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Forwards late answers into their owning task's retained session.
fn spawn_late_router(
    scheduler: Arc<TaskScheduler>,
    mut late_rx: mpsc::Receiver<LateAnswer>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(late) = late_rx.recv().await {
            info!(
                task_id = %late.task_id,
                request_id = %late.request_id,
                "Delivering late answer as follow-up"
            );
            if let Err(e) = scheduler
                .send_follow_up(&late.task_id, &late.answer.text)
                .await
            {
                warn!(
                    task_id = %late.task_id,
                    error = %e,
                    "Late answer could not be delivered"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::Router;
    use std::time::Duration;

    async fn mock_sidecar() -> (String, tokio::task::JoinHandle<()>) {
        let app = Router::new()
            .route(
                "/sessions",
                post(|| async { axum::Json(serde_json::json!({"session_id": "sess-exec-1"})) }),
            )
            .route("/sessions/{id}/messages", post(|| async { "ok" }))
            .route("/sessions/{id}/interrupt", post(|| async { "ok" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (format!("http://{addr}"), handle)
    }

    struct Fixture {
        adapter: Arc<SessionAdapter>,
        executor: Arc<AdapterExecutor>,
        router: Arc<TaskEventRouter>,
        _server: tokio::task::JoinHandle<()>,
    }

    async fn fixture() -> Fixture {
        let (base_url, server) = mock_sidecar().await;
        let adapter = Arc::new(SessionAdapter::new(base_url, Duration::from_millis(10)));
        let router = TaskEventRouter::new();
        let batcher = MessageBatcher::new(router.clone(), Duration::from_millis(10));
        let executor = AdapterExecutor::new(adapter.clone(), batcher.clone(), router.clone());
        Fixture {
            adapter,
            executor,
            router,
            _server: server,
        }
    }

    fn line(json: serde_json::Value) -> String {
        json.to_string()
    }

    async fn drain(rx: &mut mpsc::Receiver<TaskEvent>) -> Vec<TaskEvent> {
        let mut out = Vec::new();
        while let Ok(evt) = rx.try_recv() {
            out.push(evt);
        }
        out
    }

    #[tokio::test]
    async fn executor_translates_a_full_session_turn() {
        let fx = fixture().await;
        let task_id = TaskId::from_raw("t1");
        let (tx, mut rx) = mpsc::channel(64);
        fx.router.register(task_id.clone(), tx.clone());

        let run = {
            let executor = fx.executor.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move {
                executor
                    .execute(
                        &task_id,
                        &TaskConfig {
                            prompt: "make a banner".into(),
                            ..Default::default()
                        },
                        tx,
                        CancellationToken::new(),
                    )
                    .await
            })
        };

        // Let execute create the session and subscribe.
        tokio::time::sleep(Duration::from_millis(50)).await;

        for event in [
            serde_json::json!({"type":"message.created","properties":{"session_id":"sess-exec-1","message_id":"m1","role":"assistant"}}),
            serde_json::json!({"type":"message.content.updated","properties":{"session_id":"sess-exec-1","message_id":"m1","content":"Here"}}),
            serde_json::json!({"type":"message.content.updated","properties":{"session_id":"sess-exec-1","message_id":"m1","content":"Here you go"}}),
            serde_json::json!({"type":"tool.call.started","properties":{"session_id":"sess-exec-1","call_id":"c1","tool":"image_gen","input":{}}}),
            serde_json::json!({"type":"tool.call.completed","properties":{"session_id":"sess-exec-1","call_id":"c1","output":"done","is_error":false}}),
            serde_json::json!({"type":"message.completed","properties":{"session_id":"sess-exec-1","message_id":"m1"}}),
            serde_json::json!({"type":"session.status.changed","properties":{"session_id":"sess-exec-1","status":"idle","message":null}}),
        ] {
            fx.adapter.handle_line(&line(event));
        }

        let result = run.await.unwrap().unwrap();
        assert!(result.is_object());

        // Let the batcher flush propagate.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = drain(&mut rx).await;

        let deltas: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                TaskEvent::TextDelta { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["Here", " you go"]);

        assert!(events
            .iter()
            .any(|e| matches!(e, TaskEvent::Progress { stage, status: ProgressStatus::Started, .. } if stage == "image_gen")));
        assert!(events
            .iter()
            .any(|e| matches!(e, TaskEvent::Progress { stage, status: ProgressStatus::Completed, .. } if stage == "image_gen")));

        let batch = events.iter().find_map(|e| match e {
            TaskEvent::MessageBatch { messages } => Some(messages.clone()),
            _ => None,
        });
        assert_eq!(batch.unwrap()[0].text, "Here you go");
    }

    #[tokio::test]
    async fn executor_ignores_other_sessions_events() {
        let fx = fixture().await;
        let task_id = TaskId::from_raw("t1");
        let (tx, mut rx) = mpsc::channel(64);

        let run = {
            let executor = fx.executor.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move {
                executor
                    .execute(&task_id, &TaskConfig::default(), tx, CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        fx.adapter.handle_line(&line(serde_json::json!({
            "type":"message.content.updated",
            "properties":{"session_id":"sess-other","message_id":"m9","content":"noise"}
        })));
        fx.adapter.handle_line(&line(serde_json::json!({
            "type":"session.status.changed",
            "properties":{"session_id":"sess-exec-1","status":"idle","message":null}
        })));

        run.await.unwrap().unwrap();
        let events = drain(&mut rx).await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, TaskEvent::TextDelta { text, .. } if text == "noise")));
    }

    #[tokio::test]
    async fn cancellation_surfaces_as_interrupted() {
        let fx = fixture().await;
        let task_id = TaskId::from_raw("t1");
        let (tx, _rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let run = {
            let executor = fx.executor.clone();
            let task_id = task_id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                executor
                    .execute(&task_id, &TaskConfig::default(), tx, cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Interrupted));
    }

    #[tokio::test]
    async fn session_error_fails_the_task() {
        let fx = fixture().await;
        let task_id = TaskId::from_raw("t1");
        let (tx, _rx) = mpsc::channel(64);

        let run = {
            let executor = fx.executor.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move {
                executor
                    .execute(&task_id, &TaskConfig::default(), tx, CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        fx.adapter.handle_line(&line(serde_json::json!({
            "type":"session.error",
            "properties":{"session_id":"sess-exec-1","message":"model unavailable"}
        })));

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::Internal(m) if m.contains("model unavailable")));
    }

    #[tokio::test]
    async fn follow_up_reaches_the_retained_session() {
        let fx = fixture().await;
        let task_id = TaskId::from_raw("t1");
        let (tx, _rx) = mpsc::channel(64);

        let run = {
            let executor = fx.executor.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move {
                executor
                    .execute(&task_id, &TaskConfig::default(), tx, CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.adapter.handle_line(&line(serde_json::json!({
            "type":"session.status.changed",
            "properties":{"session_id":"sess-exec-1","status":"idle","message":null}
        })));
        run.await.unwrap().unwrap();

        // The task completed, yet its session mapping is retained.
        fx.executor.follow_up(&task_id, "one more tweak").await.unwrap();

        fx.executor.dispose_task(&task_id);
        let err = fx.executor.follow_up(&task_id, "too late").await.unwrap_err();
        assert!(matches!(err, EngineError::TaskNotRunning(_)));
    }

    #[tokio::test]
    async fn interrupt_without_session_errors() {
        let fx = fixture().await;
        let err = fx
            .executor
            .interrupt(&TaskId::from_raw("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TaskNotRunning(id) if id.as_str() == "ghost"));
    }

    #[tokio::test]
    async fn questions_surface_on_the_owning_tasks_channel() {
        use bw_approvals::QuestionRequest;
        use std::path::PathBuf;

        let (arbiter, _late) = PermissionArbiter::with_timeouts(
            false,
            PathBuf::from("/tmp"),
            Duration::from_millis(500),
            Duration::from_millis(100),
            Duration::from_secs(60),
        );
        let router = TaskEventRouter::new();
        let batcher = MessageBatcher::new(router.clone(), Duration::from_millis(10));
        let _forwarder =
            spawn_approval_forwarder(router.clone(), batcher, arbiter.subscribe_requests());

        let task_id = TaskId::from_raw("t1");
        let (tx, mut rx) = mpsc::channel(16);
        router.register(task_id.clone(), tx);

        let asker = {
            let arbiter = arbiter.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move {
                arbiter
                    .ask_question(QuestionRequest {
                        task_id,
                        question: "Which variant?".into(),
                        options: vec!["a".into(), "b".into()],
                        allow_free_text: false,
                    })
                    .await
            })
        };

        let event = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            TaskEvent::PermissionRequest { request } => {
                assert_eq!(request["kind"], "question");
                assert_eq!(request["question"], "Which variant?");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        asker.abort();
    }

    #[tokio::test]
    async fn transcript_flushes_before_a_permission_request() {
        use bw_approvals::QuestionRequest;
        use std::path::PathBuf;

        let (arbiter, _late) = PermissionArbiter::with_timeouts(
            false,
            PathBuf::from("/tmp"),
            Duration::from_millis(500),
            Duration::from_millis(100),
            Duration::from_secs(60),
        );
        let router = TaskEventRouter::new();
        // Debounce far in the future: only the forwarder can flush this.
        let batcher = MessageBatcher::new(router.clone(), Duration::from_secs(60));
        let _forwarder = spawn_approval_forwarder(
            router.clone(),
            batcher.clone(),
            arbiter.subscribe_requests(),
        );

        let task_id = TaskId::from_raw("t1");
        let (tx, mut rx) = mpsc::channel(16);
        router.register(task_id.clone(), tx);

        batcher.push(
            task_id.clone(),
            ChatMessage::assistant("I need to check something first"),
        );

        let asker = {
            let arbiter = arbiter.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move {
                arbiter
                    .ask_question(QuestionRequest {
                        task_id,
                        question: "Proceed?".into(),
                        options: vec![],
                        allow_free_text: true,
                    })
                    .await
            })
        };

        let mut events = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .unwrap()
                .unwrap();
            events.push(event);
        }

        // Buffered transcript lands first, the request last.
        assert!(matches!(
            &events[0],
            TaskEvent::MessageBatch { messages } if messages[0].text == "I need to check something first"
        ));
        assert!(matches!(&events[1], TaskEvent::Message { .. }));
        assert!(matches!(&events[2], TaskEvent::PermissionRequest { .. }));

        asker.abort();
    }

    #[tokio::test]
    async fn router_drops_events_for_unknown_tasks() {
        let router = TaskEventRouter::new();
        // No registration: delivery must be a silent no-op.
        router.deliver_batch(&TaskId::from_raw("ghost"), vec![ChatMessage::assistant("x")]);

        let (tx, mut rx) = mpsc::channel(4);
        let task_id = TaskId::from_raw("t1");
        router.register(task_id.clone(), tx);
        router.persist(&task_id, &ChatMessage::assistant("kept"));
        assert!(matches!(
            rx.try_recv().unwrap(),
            TaskEvent::Message { message } if message.text == "kept"
        ));

        router.unregister(&task_id);
        router.persist(&task_id, &ChatMessage::assistant("dropped"));
        assert!(rx.try_recv().is_err());
    }
}
