//! Task scheduler — bounded-concurrency admission with FIFO queueing.
//!
//! The `TaskExecutor` trait is the seam between scheduling policy and
//! execution: the production implementation drives the streaming session
//! adapter, and a legacy fallback executor (or a test double) plugs into
//! the same seam.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bw_core::errors::EngineError;
use bw_core::events::TaskEvent;
use bw_core::ids::TaskId;
use bw_core::task::{Task, TaskConfig, TaskStatus};

/// Executes one task against an agent session.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run the task to completion, emitting `TaskEvent`s along the way.
    /// Returns the task's result value, or `EngineError::Interrupted` when
    /// the cancellation token fired first.
    async fn execute(
        &self,
        task_id: &TaskId,
        config: &TaskConfig,
        events: mpsc::Sender<TaskEvent>,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, EngineError>;

    /// Forward a graceful interrupt to the task's session.
    async fn interrupt(&self, task_id: &TaskId) -> Result<(), EngineError>;

    /// Send a follow-up message into the task's retained session.
    async fn follow_up(&self, task_id: &TaskId, text: &str) -> Result<(), EngineError>;
}

struct RunningTask {
    cancel: CancellationToken,
    events: mpsc::Sender<TaskEvent>,
    _started_at: DateTime<Utc>,
}

struct QueuedTask {
    id: TaskId,
    config: TaskConfig,
    events: mpsc::Sender<TaskEvent>,
    _enqueued_at: DateTime<Utc>,
}

/// Bounded-concurrency task scheduler.
///
/// At most `max_concurrent` tasks run at once; excess starts queue FIFO up
/// to `max_queued`, beyond which `start_task` fails with `QueueFull`. The
/// queue drains whenever a running task reaches a terminal state.
pub struct TaskScheduler {
    executor: Arc<dyn TaskExecutor>,
    max_concurrent: usize,
    max_queued: usize,
    running: DashMap<TaskId, RunningTask>,
    queue: Mutex<VecDeque<QueuedTask>>,
}

impl TaskScheduler {
    pub fn new(executor: Arc<dyn TaskExecutor>, max_concurrent: usize, max_queued: usize) -> Arc<Self> {
        Arc::new(Self {
            executor,
            max_concurrent,
            max_queued,
            running: DashMap::new(),
            queue: Mutex::new(VecDeque::new()),
        })
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_running(&self, id: &TaskId) -> bool {
        self.running.contains_key(id)
    }

    pub fn is_queued(&self, id: &TaskId) -> bool {
        self.queue.lock().iter().any(|q| &q.id == id)
    }

    /// Admit a task. Runs immediately when a slot is free, queues otherwise.
    pub async fn start_task(
        self: &Arc<Self>,
        id: TaskId,
        config: TaskConfig,
        events: mpsc::Sender<TaskEvent>,
    ) -> Result<Task, EngineError> {
        if self.is_running(&id) || self.is_queued(&id) {
            return Err(EngineError::DuplicateTask(id));
        }

        if self.running.len() < self.max_concurrent {
            let task = Task::running(id.clone(), &config.prompt);
            self.dispatch(id, config, events);
            return Ok(task);
        }

        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.max_queued {
                return Err(EngineError::QueueFull {
                    limit: self.max_queued,
                });
            }
            queue.push_back(QueuedTask {
                id: id.clone(),
                config: config.clone(),
                events: events.clone(),
                _enqueued_at: Utc::now(),
            });
        }

        info!(task_id = %id, "Task queued");
        let _ = events
            .send(TaskEvent::StatusChanged {
                status: TaskStatus::Queued,
            })
            .await;
        Ok(Task::queued(id, config.prompt))
    }

    /// Mark the task running and spawn its execution. The status event is
    /// sent inside the spawned future, ahead of execution. Kept synchronous:
    /// an async `dispatch` awaited from `drain_queue` would make the spawned
    /// future's type cyclic through `finish`.
    fn dispatch(self: &Arc<Self>, id: TaskId, config: TaskConfig, events: mpsc::Sender<TaskEvent>) {
        let cancel = CancellationToken::new();
        self.running.insert(
            id.clone(),
            RunningTask {
                cancel: cancel.clone(),
                events: events.clone(),
                _started_at: Utc::now(),
            },
        );

        info!(task_id = %id, "Task dispatched");
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let _ = events
                .send(TaskEvent::StatusChanged {
                    status: TaskStatus::Running,
                })
                .await;
            let result = scheduler
                .executor
                .execute(&id, &config, events.clone(), cancel)
                .await;
            scheduler.finish(&id, result).await;
        });
    }

    /// Report a finished task exactly once and refill capacity.
    /// The `remove` is the idempotence guard: when cancellation already
    /// tore the task down, there is nothing left to report.
    async fn finish(self: &Arc<Self>, id: &TaskId, result: Result<serde_json::Value, EngineError>) {
        if let Some((_, run)) = self.running.remove(id) {
            match result {
                Ok(value) => {
                    let _ = run
                        .events
                        .send(TaskEvent::StatusChanged {
                            status: TaskStatus::Completed,
                        })
                        .await;
                    let _ = run.events.send(TaskEvent::Complete { result: value }).await;
                }
                Err(EngineError::Interrupted) => {
                    let _ = run
                        .events
                        .send(TaskEvent::StatusChanged {
                            status: TaskStatus::Interrupted,
                        })
                        .await;
                    let _ = run
                        .events
                        .send(TaskEvent::Complete {
                            result: serde_json::json!({ "status": "interrupted" }),
                        })
                        .await;
                }
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Task failed");
                    let _ = run
                        .events
                        .send(TaskEvent::StatusChanged {
                            status: TaskStatus::Failed,
                        })
                        .await;
                    let _ = run
                        .events
                        .send(TaskEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            }
        }
        self.drain_queue();
    }

    /// Cancel a task. Queued tasks are removed without side effects.
    /// Running tasks get an interrupt forwarded; local teardown happens
    /// regardless of whether that interrupt succeeds.
    pub async fn cancel_task(self: &Arc<Self>, id: &TaskId) -> bool {
        {
            let mut queue = self.queue.lock();
            if let Some(pos) = queue.iter().position(|q| &q.id == id) {
                queue.remove(pos);
                return true;
            }
        }

        if !self.running.contains_key(id) {
            return false;
        }

        if let Err(e) = self.executor.interrupt(id).await {
            warn!(task_id = %id, error = %e, "Interrupt failed, tearing down anyway");
        }

        // None here means natural completion won the race and was already
        // reported; nothing more to do.
        if let Some((_, run)) = self.running.remove(id) {
            run.cancel.cancel();
            let _ = run
                .events
                .send(TaskEvent::StatusChanged {
                    status: TaskStatus::Cancelled,
                })
                .await;
            let _ = run
                .events
                .send(TaskEvent::Complete {
                    result: serde_json::json!({ "status": "cancelled" }),
                })
                .await;
            self.drain_queue();
        }
        true
    }

    /// Graceful stop that keeps task bookkeeping: the session may accept
    /// one more follow-up.
    pub async fn interrupt_task(&self, id: &TaskId) -> Result<(), EngineError> {
        if !self.running.contains_key(id) {
            return Err(EngineError::TaskNotRunning(id.clone()));
        }
        self.executor.interrupt(id).await
    }

    /// Send a follow-up message into a task's retained session.
    pub async fn send_follow_up(&self, id: &TaskId, text: &str) -> Result<(), EngineError> {
        self.executor.follow_up(id, text).await
    }

    /// Clear the queue and cancel every running task. Stopping the sidecar
    /// itself is the runtime's job.
    pub async fn dispose(&self) {
        let dropped = {
            let mut queue = self.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        let cancelled = self.running.len();
        for entry in self.running.iter() {
            entry.value().cancel.cancel();
        }
        self.running.clear();
        info!(queued = dropped, running = cancelled, "Scheduler disposed");
    }

    fn drain_queue(self: &Arc<Self>) {
        loop {
            if self.running.len() >= self.max_concurrent {
                return;
            }
            let next = self.queue.lock().pop_front();
            match next {
                Some(q) => self.dispatch(q.id, q.config, q.events),
                None => return,
            }
        }
    }
}
