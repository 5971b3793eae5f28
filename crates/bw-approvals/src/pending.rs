//! Pending-request bookkeeping.
//!
//! Every approval request moves through one state machine:
//!
//!   pending → resolved            (user decided in time)
//!   pending → timed-out           (the asking channel's timeout passed)
//!   timed-out → resolved(late)    (the user answered anyway)
//!
//! A request id is in exactly one of {pending, timed-out, removed} at any
//! time. Resolution is idempotent: timers are aborted before state is
//! removed, and resolving an already-removed id is a no-op.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

use bw_core::ids::{RequestId, TaskId};

/// What happened when a resolver fired.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The waiting caller received the decision synchronously.
    Delivered,
    /// The channel had already timed out; the answer must be routed back
    /// to the owning task out of band.
    Late { task_id: Option<TaskId> },
    /// Unknown or already-resolved request id.
    NoOp,
}

enum Entry<T> {
    Pending {
        resolver: oneshot::Sender<T>,
        task_id: Option<TaskId>,
        timers: Vec<tokio::task::JoinHandle<()>>,
    },
    /// The synchronous channel gave up, but the request is retained so a
    /// subsequent answer can still be delivered late. The resolver is kept
    /// alive (unused) so the waiting future only fails at its own primary
    /// timeout, not the moment the marker fires.
    TimedOut {
        task_id: Option<TaskId>,
        _resolver: oneshot::Sender<T>,
    },
}

/// Registry of pending requests for one request kind.
pub struct PendingRegistry<T> {
    entries: Arc<DashMap<RequestId, Entry<T>>>,
}

impl<T> Clone for PendingRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T: Send + 'static> Default for PendingRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> PendingRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Register a new pending request and return the receiver the caller
    /// awaits.
    pub fn register(&self, id: RequestId, task_id: Option<TaskId>) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            id,
            Entry::Pending {
                resolver: tx,
                task_id,
                timers: Vec::new(),
            },
        );
        rx
    }

    /// Arm the late marker: after `delay`, a still-pending request becomes
    /// timed-out-but-answerable.
    pub fn arm_late_marker(&self, id: RequestId, delay: std::time::Duration) {
        let registry = self.clone();
        let timer_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.mark_timed_out(&timer_id);
        });
        if let Some(mut entry) = self.entries.get_mut(&id) {
            if let Entry::Pending { timers, .. } = entry.value_mut() {
                timers.push(handle);
            }
        } else {
            handle.abort();
        }
    }

    /// Transition pending → timed-out, retaining the owning task id for
    /// late routing.
    pub fn mark_timed_out(&self, id: &RequestId) {
        let Some(mut entry) = self.entries.get_mut(id) else {
            return;
        };
        if let Entry::Pending {
            resolver, task_id, timers,
        } = std::mem::replace(
            entry.value_mut(),
            Entry::TimedOut {
                task_id: None,
                _resolver: oneshot::channel().0,
            },
        ) {
            for timer in timers {
                timer.abort();
            }
            debug!(request_id = %id, "Request marked timed-out but answerable");
            *entry.value_mut() = Entry::TimedOut {
                task_id,
                _resolver: resolver,
            };
        }
    }

    /// Deliver a decision. Idempotent: the second resolution of the same
    /// id is a no-op.
    pub fn resolve(&self, id: &RequestId, value: T) -> ResolveOutcome {
        match self.entries.remove(id) {
            Some((_, Entry::Pending {
                resolver, timers, ..
            })) => {
                for timer in timers {
                    timer.abort();
                }
                // A dropped receiver just means the caller gave up first.
                let _ = resolver.send(value);
                ResolveOutcome::Delivered
            }
            Some((_, Entry::TimedOut { task_id, .. })) => ResolveOutcome::Late { task_id },
            None => ResolveOutcome::NoOp,
        }
    }

    /// Bound the late-answer window: after `delay`, drop the entry if it is
    /// still timed-out and unanswered. Pending and resolved entries are
    /// untouched, so the timer needs no bookkeeping in the entry itself.
    pub fn arm_reaper(&self, id: RequestId, delay: std::time::Duration) {
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if registry
                .entries
                .remove_if(&id, |_, entry| matches!(entry, Entry::TimedOut { .. }))
                .is_some()
            {
                debug!(request_id = %id, "Dropping unanswered request past its late window");
            }
        });
    }

    /// Drop a request whose primary timeout elapsed while still pending.
    /// Timed-out entries are kept: they remain answerable.
    pub fn expire(&self, id: &RequestId) {
        let is_pending = self
            .entries
            .get(id)
            .map(|e| matches!(e.value(), Entry::Pending { .. }))
            .unwrap_or(false);
        if is_pending {
            if let Some((_, Entry::Pending { timers, .. })) = self.entries.remove(id) {
                for timer in timers {
                    timer.abort();
                }
            }
        }
    }

    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.entries
            .get(id)
            .map(|e| matches!(e.value(), Entry::Pending { .. }))
            .unwrap_or(false)
    }

    pub fn is_timed_out(&self, id: &RequestId) -> bool {
        self.entries
            .get(id)
            .map(|e| matches!(e.value(), Entry::TimedOut { .. }))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
