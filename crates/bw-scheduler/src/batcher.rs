//! Message batcher.
//!
//! A burst of chat messages for one task is coalesced into a single UI
//! batch inside a short debounce window, then each message is persisted
//! individually in the same order. Callers must `flush_now` before
//! emitting a permission request, completion, or error for the same task
//! so the transcript never trails its own lifecycle events.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use bw_core::ids::TaskId;
use bw_core::task::ChatMessage;

/// Where flushed batches go: one UI delivery per batch, then one persist
/// call per message. The history store itself is the host application's.
pub trait MessageSink: Send + Sync {
    fn deliver_batch(&self, task_id: &TaskId, messages: Vec<ChatMessage>);
    fn persist(&self, task_id: &TaskId, message: &ChatMessage);
}

struct Buffer {
    messages: Vec<ChatMessage>,
    timer: Option<tokio::task::JoinHandle<()>>,
}

struct Inner {
    sink: Arc<dyn MessageSink>,
    debounce: Duration,
    buffers: DashMap<TaskId, Buffer>,
}

/// Debouncing per-task message buffer. Clone is cheap; all clones share
/// the same buffers.
#[derive(Clone)]
pub struct MessageBatcher {
    inner: Arc<Inner>,
}

impl MessageBatcher {
    pub fn new(sink: Arc<dyn MessageSink>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                debounce,
                buffers: DashMap::new(),
            }),
        }
    }

    /// Append a message; arms the debounce timer if none is pending.
    pub fn push(&self, task_id: TaskId, message: ChatMessage) {
        let mut buf = self.inner.buffers.entry(task_id.clone()).or_insert_with(|| Buffer {
            messages: Vec::new(),
            timer: None,
        });
        buf.messages.push(message);

        if buf.timer.is_none() {
            let batcher = self.clone();
            buf.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(batcher.inner.debounce).await;
                // The timer must not abort its own handle.
                batcher.flush(&task_id, false);
            }));
        }
    }

    /// Flush out of band, ahead of the debounce timer.
    pub fn flush_now(&self, task_id: &TaskId) {
        self.flush(task_id, true);
    }

    pub fn pending_count(&self, task_id: &TaskId) -> usize {
        self.inner
            .buffers
            .get(task_id)
            .map(|b| b.messages.len())
            .unwrap_or(0)
    }

    fn flush(&self, task_id: &TaskId, abort_timer: bool) {
        let Some((_, mut buf)) = self.inner.buffers.remove(task_id) else {
            return;
        };
        if abort_timer {
            if let Some(timer) = buf.timer.take() {
                timer.abort();
            }
        }
        if buf.messages.is_empty() {
            return;
        }

        debug!(task_id = %task_id, count = buf.messages.len(), "Flushing message batch");
        self.inner.sink.deliver_batch(task_id, buf.messages.clone());
        for message in &buf.messages {
            self.inner.sink.persist(task_id, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, PartialEq)]
    enum SinkCall {
        Batch(Vec<String>),
        Persist(String),
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<SinkCall>>,
    }

    impl MessageSink for RecordingSink {
        fn deliver_batch(&self, _task_id: &TaskId, messages: Vec<ChatMessage>) {
            self.calls
                .lock()
                .push(SinkCall::Batch(messages.iter().map(|m| m.text.clone()).collect()));
        }

        fn persist(&self, _task_id: &TaskId, message: &ChatMessage) {
            self.calls.lock().push(SinkCall::Persist(message.text.clone()));
        }
    }

    fn tid(s: &str) -> TaskId {
        TaskId::from_raw(s)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_produces_one_batch_then_ordered_persists() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = MessageBatcher::new(sink.clone(), Duration::from_millis(50));

        for text in ["one", "two", "three"] {
            batcher.push(tid("t1"), ChatMessage::assistant(text));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let calls = sink.calls.lock();
        assert_eq!(
            *calls,
            vec![
                SinkCall::Batch(vec!["one".into(), "two".into(), "three".into()]),
                SinkCall::Persist("one".into()),
                SinkCall::Persist("two".into()),
                SinkCall::Persist("three".into()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn flush_now_beats_the_timer() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = MessageBatcher::new(sink.clone(), Duration::from_secs(60));

        batcher.push(tid("t1"), ChatMessage::assistant("urgent"));
        batcher.flush_now(&tid("t1"));

        let calls = sink.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], SinkCall::Batch(vec!["urgent".into()]));
    }

    #[tokio::test(start_paused = true)]
    async fn flushing_empty_buffer_is_noop() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = MessageBatcher::new(sink.clone(), Duration::from_millis(50));

        batcher.flush_now(&tid("t1"));
        assert!(sink.calls.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_does_not_refire_after_flush_now() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = MessageBatcher::new(sink.clone(), Duration::from_millis(50));

        batcher.push(tid("t1"), ChatMessage::assistant("a"));
        batcher.flush_now(&tid("t1"));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let batches = sink
            .calls
            .lock()
            .iter()
            .filter(|c| matches!(c, SinkCall::Batch(_)))
            .count();
        assert_eq!(batches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn buffers_are_per_task() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = MessageBatcher::new(sink.clone(), Duration::from_millis(50));

        batcher.push(tid("t1"), ChatMessage::assistant("for t1"));
        batcher.push(tid("t2"), ChatMessage::assistant("for t2"));
        assert_eq!(batcher.pending_count(&tid("t1")), 1);
        assert_eq!(batcher.pending_count(&tid("t2")), 1);

        batcher.flush_now(&tid("t1"));
        assert_eq!(batcher.pending_count(&tid("t1")), 0);
        assert_eq!(batcher.pending_count(&tid("t2")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_after_flush_start_a_new_batch() {
        let sink = Arc::new(RecordingSink::default());
        let batcher = MessageBatcher::new(sink.clone(), Duration::from_millis(50));

        batcher.push(tid("t1"), ChatMessage::assistant("first"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        batcher.push(tid("t1"), ChatMessage::assistant("second"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let batches: Vec<_> = sink
            .calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                SinkCall::Batch(texts) => Some(texts.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(batches, vec![vec!["first".to_owned()], vec!["second".to_owned()]]);
    }
}
