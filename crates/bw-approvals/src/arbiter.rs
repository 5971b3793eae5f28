//! Permission arbiter.
//!
//! Three request channels share one lifecycle: register the request,
//! announce it to any UI subscriber, wait for a decision with a primary
//! timeout. Questions additionally carry a late-answer marker so an
//! answer arriving after the asking channel gave up can still be routed
//! back to the owning task.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use bw_core::config::{
    ASK_CHANNEL_TIMEOUT, LATE_ANSWER_RETENTION, LATE_MARKER_GRACE, REQUEST_PRIMARY_TIMEOUT,
    RuntimeConfig,
};
use bw_core::errors::EngineError;
use bw_core::ids::{RequestId, TaskId};

use crate::pending::{PendingRegistry, ResolveOutcome};
use crate::risk::{classify, FileOperation, RiskLevel};

/// File-operation approval, as posted by the tool-side HTTP channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilePermissionRequest {
    pub operation: FileOperation,
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A clarifying question from a running task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuestionRequest {
    pub task_id: TaskId,
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub allow_free_text: bool,
}

/// Commerce-action approval (listing, purchase, price change).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommercePermissionRequest {
    pub operation: String,
    pub resource: String,
    #[serde(default)]
    pub summary: Option<String>,
}

/// The user's verdict on a permission request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub approved: bool,
    /// Commerce only: remember this (operation, resource) pair for the
    /// rest of the session.
    #[serde(default)]
    pub remember: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

impl PermissionDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            remember: false,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            remember: false,
            reason: Some(reason.into()),
        }
    }
}

/// The user's answer to a question.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
}

/// An answer that arrived after the asking channel had timed out, tagged
/// with the task it belongs to so it can be delivered as a follow-up.
#[derive(Clone, Debug)]
pub struct LateAnswer {
    pub task_id: TaskId,
    pub request_id: RequestId,
    pub answer: Answer,
}

/// What the UI sees on the announcement channel for each new request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovalRequest {
    File {
        id: RequestId,
        operation: FileOperation,
        paths: Vec<PathBuf>,
        description: Option<String>,
        risk: RiskLevel,
    },
    Question {
        id: RequestId,
        task_id: TaskId,
        question: String,
        options: Vec<String>,
        allow_free_text: bool,
    },
    Commerce {
        id: RequestId,
        operation: String,
        resource: String,
        summary: Option<String>,
        risk: RiskLevel,
    },
}

impl ApprovalRequest {
    pub fn id(&self) -> &RequestId {
        match self {
            Self::File { id, .. } | Self::Question { id, .. } | Self::Commerce { id, .. } => id,
        }
    }
}

/// Arbiter for the three approval channels.
pub struct PermissionArbiter {
    files: PendingRegistry<PermissionDecision>,
    questions: PendingRegistry<Answer>,
    commerce: PendingRegistry<PermissionDecision>,
    /// Session-scoped (operation, resource) pairs the user said to remember.
    allow_list: Mutex<HashSet<(String, String)>>,
    announce_tx: broadcast::Sender<ApprovalRequest>,
    late_tx: mpsc::Sender<LateAnswer>,
    auto_approve_low_risk: bool,
    safe_directory: PathBuf,
    primary_timeout: Duration,
    late_marker_delay: Duration,
    /// How long past the marker an unanswered question stays routable.
    unanswered_retention: Duration,
}

impl PermissionArbiter {
    /// Build the arbiter plus the receiver on which late answers surface.
    pub fn new(config: &RuntimeConfig) -> (Arc<Self>, mpsc::Receiver<LateAnswer>) {
        Self::with_timeouts(
            config.auto_approve_low_risk,
            config.safe_directory.clone(),
            REQUEST_PRIMARY_TIMEOUT,
            ASK_CHANNEL_TIMEOUT + LATE_MARKER_GRACE,
            LATE_ANSWER_RETENTION,
        )
    }

    /// Timeout-injecting constructor, used by tests to avoid multi-minute
    /// waits.
    pub fn with_timeouts(
        auto_approve_low_risk: bool,
        safe_directory: PathBuf,
        primary_timeout: Duration,
        late_marker_delay: Duration,
        unanswered_retention: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<LateAnswer>) {
        let (announce_tx, _) = broadcast::channel(256);
        let (late_tx, late_rx) = mpsc::channel(64);
        let arbiter = Arc::new(Self {
            files: PendingRegistry::new(),
            questions: PendingRegistry::new(),
            commerce: PendingRegistry::new(),
            allow_list: Mutex::new(HashSet::new()),
            announce_tx,
            late_tx,
            auto_approve_low_risk,
            safe_directory,
            primary_timeout,
            late_marker_delay,
            unanswered_retention,
        });
        (arbiter, late_rx)
    }

    /// Subscribe to request announcements. UI-facing.
    pub fn subscribe_requests(&self) -> broadcast::Receiver<ApprovalRequest> {
        self.announce_tx.subscribe()
    }

    /// Ask the user about a file operation. Low-risk requests are approved
    /// without asking when configured to.
    pub async fn request_file_permission(
        &self,
        request: FilePermissionRequest,
    ) -> Result<PermissionDecision, EngineError> {
        let risk = classify(request.operation, &request.paths, &self.safe_directory);
        if self.auto_approve_low_risk && risk == RiskLevel::Low {
            debug!(operation = ?request.operation, "Auto-approving low-risk file operation");
            return Ok(PermissionDecision::approve());
        }

        let id = RequestId::new();
        let rx = self.files.register(id.clone(), None);
        self.announce(ApprovalRequest::File {
            id: id.clone(),
            operation: request.operation,
            paths: request.paths,
            description: request.description,
            risk,
        });
        self.await_decision(&self.files, &id, rx).await
    }

    /// Ask the user a question on behalf of a task. Past the late marker
    /// the synchronous wait still runs, but an answer arriving after it is
    /// routed through the late-answer channel instead.
    pub async fn ask_question(&self, request: QuestionRequest) -> Result<Answer, EngineError> {
        let id = RequestId::new();
        let rx = self
            .questions
            .register(id.clone(), Some(request.task_id.clone()));
        self.questions
            .arm_late_marker(id.clone(), self.late_marker_delay);
        self.questions.arm_reaper(
            id.clone(),
            self.late_marker_delay + self.unanswered_retention,
        );
        self.announce(ApprovalRequest::Question {
            id: id.clone(),
            task_id: request.task_id,
            question: request.question,
            options: request.options,
            allow_free_text: request.allow_free_text,
        });
        self.await_decision(&self.questions, &id, rx).await
    }

    /// Ask the user about a commerce action. Remembered (operation,
    /// resource) pairs bypass the prompt for the rest of the session.
    pub async fn request_commerce_permission(
        &self,
        request: CommercePermissionRequest,
    ) -> Result<PermissionDecision, EngineError> {
        let key = (request.operation.clone(), request.resource.clone());
        if self.allow_list.lock().contains(&key) {
            debug!(
                operation = %request.operation,
                resource = %request.resource,
                "Commerce action pre-approved by session allow-list"
            );
            return Ok(PermissionDecision::approve());
        }

        let id = RequestId::new();
        let rx = self.commerce.register(id.clone(), None);
        self.announce(ApprovalRequest::Commerce {
            id: id.clone(),
            operation: request.operation.clone(),
            resource: request.resource.clone(),
            summary: request.summary,
            risk: RiskLevel::High,
        });
        let decision = self.await_decision(&self.commerce, &id, rx).await?;
        if decision.approved && decision.remember {
            info!(
                operation = %request.operation,
                resource = %request.resource,
                "Remembering commerce approval for this session"
            );
            self.allow_list.lock().insert(key);
        }
        Ok(decision)
    }

    /// Deliver the user's verdict on a file request.
    pub fn resolve_file(&self, id: &RequestId, decision: PermissionDecision) -> ResolveOutcome {
        let outcome = self.files.resolve(id, decision);
        if outcome == ResolveOutcome::NoOp {
            debug!(request_id = %id, "Ignoring verdict for unknown file request");
        }
        outcome
    }

    /// Deliver the user's verdict on a commerce request.
    pub fn resolve_commerce(&self, id: &RequestId, decision: PermissionDecision) -> ResolveOutcome {
        let outcome = self.commerce.resolve(id, decision);
        if outcome == ResolveOutcome::NoOp {
            debug!(request_id = %id, "Ignoring verdict for unknown commerce request");
        }
        outcome
    }

    /// Deliver the user's answer to a question. Late answers are forwarded
    /// on the late-answer channel, tagged with the owning task.
    pub async fn answer_question(&self, id: &RequestId, answer: Answer) -> ResolveOutcome {
        let outcome = self.questions.resolve(id, answer.clone());
        match &outcome {
            ResolveOutcome::Late {
                task_id: Some(task_id),
            } => {
                info!(request_id = %id, task_id = %task_id, "Routing late answer to its task");
                let late = LateAnswer {
                    task_id: task_id.clone(),
                    request_id: id.clone(),
                    answer,
                };
                if self.late_tx.send(late).await.is_err() {
                    warn!(request_id = %id, "Late-answer receiver gone; answer dropped");
                }
            }
            ResolveOutcome::Late { task_id: None } => {
                warn!(request_id = %id, "Late answer without an owning task; dropped");
            }
            ResolveOutcome::NoOp => {
                debug!(request_id = %id, "Ignoring answer for unknown question");
            }
            ResolveOutcome::Delivered => {}
        }
        outcome
    }

    fn announce(&self, request: ApprovalRequest) {
        // No subscribers just means no UI is attached yet.
        let _ = self.announce_tx.send(request);
    }

    async fn await_decision<T: Send + 'static>(
        &self,
        registry: &PendingRegistry<T>,
        id: &RequestId,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, EngineError> {
        match tokio::time::timeout(self.primary_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            // Sender dropped without a decision: treat like a timeout.
            Ok(Err(_)) => {
                registry.expire(id);
                Err(EngineError::RequestTimedOut)
            }
            Err(_) => {
                registry.expire(id);
                warn!(request_id = %id, "Request hit its primary timeout");
                Err(EngineError::RequestTimedOut)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_arbiter(
        auto_approve: bool,
    ) -> (Arc<PermissionArbiter>, mpsc::Receiver<LateAnswer>) {
        PermissionArbiter::with_timeouts(
            auto_approve,
            PathBuf::from("/tmp/brandwork"),
            Duration::from_millis(500),
            Duration::from_millis(50),
            Duration::from_secs(60),
        )
    }

    fn file_request(paths: Vec<PathBuf>) -> FilePermissionRequest {
        FilePermissionRequest {
            operation: FileOperation::Delete,
            paths,
            description: None,
        }
    }

    /// Drives one request to resolution via the announcement channel, the
    /// way the HTTP listeners do in production.
    async fn respond_to_next_file(
        arbiter: Arc<PermissionArbiter>,
        decision: PermissionDecision,
    ) -> tokio::task::JoinHandle<()> {
        let mut announce = arbiter.subscribe_requests();
        tokio::spawn(async move {
            let request = announce.recv().await.unwrap();
            arbiter.resolve_file(request.id(), decision);
        })
    }

    #[tokio::test]
    async fn file_permission_round_trip() {
        let (arbiter, _late) = test_arbiter(false);
        let responder =
            respond_to_next_file(arbiter.clone(), PermissionDecision::approve()).await;

        let decision = arbiter
            .request_file_permission(file_request(vec![PathBuf::from("/tmp/brandwork/a.png")]))
            .await
            .unwrap();
        assert!(decision.approved);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn low_risk_auto_approval_skips_the_prompt() {
        let (arbiter, _late) = test_arbiter(true);
        let mut announce = arbiter.subscribe_requests();

        let decision = arbiter
            .request_file_permission(FilePermissionRequest {
                operation: FileOperation::Create,
                paths: vec![PathBuf::from("/tmp/brandwork/new.png")],
                description: None,
            })
            .await
            .unwrap();
        assert!(decision.approved);
        // Nothing was announced.
        assert!(matches!(
            announce.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn auto_approval_never_applies_above_low_risk() {
        let (arbiter, _late) = test_arbiter(true);
        let arbiter2 = arbiter.clone();
        let mut announce = arbiter.subscribe_requests();
        tokio::spawn(async move {
            let request = announce.recv().await.unwrap();
            arbiter2.resolve_file(request.id(), PermissionDecision::deny("too risky"));
        });

        let decision = arbiter
            .request_file_permission(file_request(vec![PathBuf::from("/home/user/a.png")]))
            .await
            .unwrap();
        assert!(!decision.approved);
    }

    #[tokio::test]
    async fn primary_timeout_yields_request_timed_out() {
        let (arbiter, _late) = test_arbiter(false);
        let err = arbiter
            .request_file_permission(file_request(vec![PathBuf::from("/tmp/brandwork/a.png")]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RequestTimedOut));
    }

    #[tokio::test]
    async fn double_resolution_is_ignored() {
        let (arbiter, _late) = test_arbiter(false);
        let arbiter2 = arbiter.clone();
        let mut announce = arbiter.subscribe_requests();
        let responder = tokio::spawn(async move {
            let request = announce.recv().await.unwrap();
            let id = request.id().clone();
            assert_eq!(
                arbiter2.resolve_file(&id, PermissionDecision::approve()),
                ResolveOutcome::Delivered
            );
            assert_eq!(
                arbiter2.resolve_file(&id, PermissionDecision::deny("changed my mind")),
                ResolveOutcome::NoOp
            );
        });

        let decision = arbiter
            .request_file_permission(file_request(vec![PathBuf::from("/tmp/brandwork/a.png")]))
            .await
            .unwrap();
        assert!(decision.approved);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn question_answered_in_time_is_delivered() {
        let (arbiter, _late) = test_arbiter(false);
        let arbiter2 = arbiter.clone();
        let mut announce = arbiter.subscribe_requests();
        tokio::spawn(async move {
            let request = announce.recv().await.unwrap();
            arbiter2
                .answer_question(
                    request.id(),
                    Answer {
                        text: "blue".into(),
                    },
                )
                .await;
        });

        let answer = arbiter
            .ask_question(QuestionRequest {
                task_id: TaskId::new(),
                question: "Which color?".into(),
                options: vec!["blue".into(), "red".into()],
                allow_free_text: false,
            })
            .await
            .unwrap();
        assert_eq!(answer.text, "blue");
    }

    #[tokio::test]
    async fn late_answer_is_routed_with_its_task_id() {
        let (arbiter, mut late_rx) = test_arbiter(false);
        let task_id = TaskId::new();
        let mut announce = arbiter.subscribe_requests();

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

        let request = announce.recv().await.unwrap();
        let id = request.id().clone();

        // Let the late marker fire, then answer.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let outcome = arbiter
            .answer_question(
                &id,
                Answer {
                    text: "yes, go ahead".into(),
                },
            )
            .await;
        assert_eq!(
            outcome,
            ResolveOutcome::Late {
                task_id: Some(task_id.clone())
            }
        );

        let late = late_rx.recv().await.unwrap();
        assert_eq!(late.task_id, task_id);
        assert_eq!(late.request_id, id);
        assert_eq!(late.answer.text, "yes, go ahead");

        // The synchronous asker still times out at its primary deadline.
        assert!(matches!(
            asker.await.unwrap(),
            Err(EngineError::RequestTimedOut)
        ));
    }

    #[tokio::test]
    async fn unanswered_question_is_dropped_after_the_late_window() {
        let (arbiter, mut late_rx) = PermissionArbiter::with_timeouts(
            false,
            PathBuf::from("/tmp/brandwork"),
            Duration::from_millis(300),
            Duration::from_millis(20),
            Duration::from_millis(40),
        );
        let mut announce = arbiter.subscribe_requests();

        let asker = {
            let arbiter = arbiter.clone();
            tokio::spawn(async move {
                arbiter
                    .ask_question(QuestionRequest {
                        task_id: TaskId::new(),
                        question: "Still there?".into(),
                        options: vec![],
                        allow_free_text: true,
                    })
                    .await
            })
        };

        let request = announce.recv().await.unwrap();
        let id = request.id().clone();

        assert!(matches!(
            asker.await.unwrap(),
            Err(EngineError::RequestTimedOut)
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Past marker + retention the answer no longer routes anywhere.
        let outcome = arbiter
            .answer_question(&id, Answer { text: "here".into() })
            .await;
        assert_eq!(outcome, ResolveOutcome::NoOp);
        assert!(late_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn remembered_commerce_approval_bypasses_the_prompt() {
        let (arbiter, _late) = test_arbiter(false);
        let arbiter2 = arbiter.clone();
        let mut announce = arbiter.subscribe_requests();
        tokio::spawn(async move {
            let request = announce.recv().await.unwrap();
            arbiter2.resolve_commerce(
                request.id(),
                PermissionDecision {
                    approved: true,
                    remember: true,
                    reason: None,
                },
            );
        });

        let request = CommercePermissionRequest {
            operation: "create_listing".into(),
            resource: "shop/tees".into(),
            summary: None,
        };
        let first = arbiter
            .request_commerce_permission(request.clone())
            .await
            .unwrap();
        assert!(first.approved);

        // Same (operation, resource): no prompt, immediate approval.
        let second = arbiter.request_commerce_permission(request).await.unwrap();
        assert!(second.approved);
    }

    #[tokio::test]
    async fn allow_list_is_keyed_on_operation_and_resource() {
        let (arbiter, _late) = test_arbiter(false);
        let arbiter2 = arbiter.clone();
        let mut announce = arbiter.subscribe_requests();
        tokio::spawn(async move {
            // Approve-and-remember the first, then deny the second.
            let first = announce.recv().await.unwrap();
            arbiter2.resolve_commerce(
                first.id(),
                PermissionDecision {
                    approved: true,
                    remember: true,
                    reason: None,
                },
            );
            let second = announce.recv().await.unwrap();
            arbiter2.resolve_commerce(second.id(), PermissionDecision::deny("no"));
        });

        arbiter
            .request_commerce_permission(CommercePermissionRequest {
                operation: "create_listing".into(),
                resource: "shop/tees".into(),
                summary: None,
            })
            .await
            .unwrap();

        // Different resource must prompt again.
        let other = arbiter
            .request_commerce_permission(CommercePermissionRequest {
                operation: "create_listing".into(),
                resource: "shop/mugs".into(),
                summary: None,
            })
            .await
            .unwrap();
        assert!(!other.approved);
    }

    #[tokio::test]
    async fn denied_remember_does_not_populate_allow_list() {
        let (arbiter, _late) = test_arbiter(false);
        let arbiter2 = arbiter.clone();
        let mut announce = arbiter.subscribe_requests();
        tokio::spawn(async move {
            for _ in 0..2 {
                let request = announce.recv().await.unwrap();
                arbiter2.resolve_commerce(
                    request.id(),
                    PermissionDecision {
                        approved: false,
                        remember: true,
                        reason: Some("no".into()),
                    },
                );
            }
        });

        let request = CommercePermissionRequest {
            operation: "purchase".into(),
            resource: "supplier/ink".into(),
            summary: None,
        };
        let first = arbiter
            .request_commerce_permission(request.clone())
            .await
            .unwrap();
        assert!(!first.approved);

        // A denial is never remembered: the second call prompts again.
        let second = arbiter.request_commerce_permission(request).await.unwrap();
        assert!(!second.approved);
    }
}
