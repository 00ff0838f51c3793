//! Hand-off buffer between native callback threads and the request task.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use super::StreamChunk;

/// Bounded queue that drops the oldest non-final chunk when full.
///
/// Terminal chunks are never dropped. Chunks carry accumulated text, so a
/// dropped chunk only loses its delta.
pub(crate) struct PartialBuffer {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicUsize,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<StreamChunk>,
    /// Non-final chunks currently queued.
    partials: usize,
}

impl PartialBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicUsize::new(0),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push from any thread. Never blocks on the consumer.
    pub fn push(&self, chunk: StreamChunk) {
        {
            let mut inner = self.inner();
            if !chunk.is_final {
                if inner.partials >= self.capacity {
                    if let Some(oldest) = inner.queue.iter().position(|c| !c.is_final) {
                        inner.queue.remove(oldest);
                        inner.partials -= 1;
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                inner.partials += 1;
            }
            inner.queue.push_back(chunk);
        }
        self.notify.notify_one();
    }

    /// Wait for the next chunk. Single consumer.
    pub async fn pop(&self) -> StreamChunk {
        loop {
            let next = {
                let mut inner = self.inner();
                let next = inner.queue.pop_front();
                if next.as_ref().is_some_and(|c| !c.is_final) {
                    inner.partials -= 1;
                }
                next
            };
            if let Some(chunk) = next {
                return chunk;
            }
            self.notify.notified().await;
        }
    }

    /// Non-final chunks discarded because the buffer was full.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(text: &str) -> StreamChunk {
        StreamChunk {
            text: text.to_string(),
            delta: text.to_string(),
            is_final: false,
            error: None,
        }
    }

    fn terminal(text: &str) -> StreamChunk {
        StreamChunk {
            is_final: true,
            ..partial(text)
        }
    }

    #[tokio::test]
    async fn drops_oldest_partial_when_full() {
        let buffer = PartialBuffer::new(2);
        buffer.push(partial("a"));
        buffer.push(partial("ab"));
        buffer.push(partial("abc"));

        assert_eq!(buffer.dropped(), 1);
        assert_eq!(buffer.pop().await.text, "ab");
        assert_eq!(buffer.pop().await.text, "abc");
    }

    #[tokio::test]
    async fn terminal_is_never_dropped() {
        let buffer = PartialBuffer::new(1);
        buffer.push(partial("a"));
        buffer.push(terminal("ab"));
        buffer.push(partial("late"));

        assert_eq!(buffer.pop().await.text, "ab");
        assert_eq!(buffer.pop().await.text, "late");
        assert_eq!(buffer.dropped(), 1);
    }

    #[tokio::test]
    async fn capacity_counts_only_partials() {
        let buffer = PartialBuffer::new(2);
        buffer.push(partial("a"));
        buffer.push(terminal("ab"));
        buffer.push(partial("x"));
        assert_eq!(buffer.dropped(), 0);

        buffer.push(partial("xy"));
        assert_eq!(buffer.dropped(), 1);
        assert_eq!(buffer.pop().await.text, "ab");

        // Popping a terminal leaves the partial count alone.
        buffer.push(partial("xyz"));
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.pop().await.text, "xy");

        // Popping a partial frees a slot.
        buffer.push(partial("w"));
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.pop().await.text, "xyz");
        assert_eq!(buffer.pop().await.text, "w");
    }

    #[test]
    fn pop_is_pending_until_push() {
        let buffer = PartialBuffer::new(2);
        let mut pop = tokio_test::task::spawn(buffer.pop());
        tokio_test::assert_pending!(pop.poll());

        buffer.push(terminal("x"));
        assert!(pop.is_woken());
        let chunk = tokio_test::assert_ready!(pop.poll());
        assert!(chunk.is_final);
    }

    #[tokio::test]
    async fn pop_waits_for_push_from_another_thread() {
        let buffer = std::sync::Arc::new(PartialBuffer::new(4));
        let producer = std::sync::Arc::clone(&buffer);
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            producer.push(terminal("done"));
        });

        let chunk = tokio::time::timeout(std::time::Duration::from_secs(1), buffer.pop())
            .await
            .expect("chunk delivered");
        assert!(chunk.is_final);
    }
}
