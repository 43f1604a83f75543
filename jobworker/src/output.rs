mod ring;
mod subscription;

pub use subscription::{Subscription, SubscriptionId};

use ring::{ReadSlice, RingBuffer};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Fans a single job's output out to any number of subscribers.
///
/// The multiplexer keeps the last `capacity` bytes in a ring and a set of
/// per-subscriber notification queues, both behind one lock. Ingestion never
/// waits on a subscriber: it appends, then pokes every queue with
/// `try_send`. A full queue already holds a pending wakeup, so the poke is
/// dropped and the subscriber picks up the new bytes on its next drain.
///
/// Like the other handles in this crate, `OutputMux` is cheap to clone.
#[derive(Clone)]
pub struct OutputMux {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<MuxState>,
    queue_depth: usize,
    max_chunk: usize,
}

struct MuxState {
    ring: RingBuffer,
    subscribers: HashMap<SubscriptionId, mpsc::Sender<()>>,
    next_id: u64,
    closed: bool,
}

/// A consistent view of the buffer taken for one subscriber read.
pub(crate) struct Snapshot {
    pub slice: ReadSlice,
    /// The stream is complete and `slice` reaches the end of it.
    pub finished: bool,
}

impl OutputMux {
    pub fn new(capacity: usize, queue_depth: usize, max_chunk: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(MuxState {
                    ring: RingBuffer::new(capacity),
                    subscribers: HashMap::new(),
                    next_id: 0,
                    closed: false,
                }),
                queue_depth: queue_depth.max(1),
                max_chunk: max_chunk.max(1),
            }),
        }
    }

    /// Append process output and wake every live subscriber.
    pub fn ingest(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut state = self.lock();
        if state.closed {
            tracing::warn!(bytes = data.len(), "dropping output ingested after completion");
            return;
        }
        state.ring.push(data);
        state.subscribers.retain(|_, queue| match queue.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Closed(())) => false,
        });
    }

    /// Register a new subscriber reading from the start of retained history.
    ///
    /// Subscribing to a completed stream is fine: the subscriber replays
    /// whatever is retained and then sees the terminal marker.
    pub fn subscribe(&self) -> Subscription {
        let (queue, wakeups) = mpsc::channel(self.inner.queue_depth);
        let mut state = self.lock();
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        if !state.closed {
            state.subscribers.insert(id, queue);
        }
        drop(state);
        tracing::debug!(subscription = %id, "subscribed to output");
        Subscription::new(id, self.clone(), wakeups)
    }

    /// Remove a subscriber. Unknown or already-removed ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if self.lock().subscribers.remove(&id).is_some() {
            tracing::debug!(subscription = %id, "unsubscribed from output");
        }
    }

    /// Mark the stream complete. No bytes are accepted afterwards.
    ///
    /// Dropping every queue sender is what delivers the terminal marker:
    /// each subscriber drains its remaining bytes, finds its queue closed
    /// and ends with exactly one [`LogEvent::Terminal`](crate::LogEvent::Terminal).
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn bytes_written(&self) -> u64 {
        self.lock().ring.written()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub(crate) fn snapshot(&self, from: u64) -> Snapshot {
        let state = self.lock();
        let slice = state.ring.read_from(from, self.inner.max_chunk);
        let end = slice.start + slice.data.len() as u64;
        Snapshot {
            finished: state.closed && end == state.ring.written(),
            slice,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LogEvent;
    use bytes::Bytes;

    fn data(s: &str) -> LogEvent {
        LogEvent::Data(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[tokio::test]
    async fn live_subscriber_sees_output_then_terminal() {
        let mux = OutputMux::new(64, 4, 64);
        let mut sub = mux.subscribe();
        mux.ingest(b"hello\n");
        assert_eq!(sub.next().await, Some(data("hello\n")));
        mux.close();
        assert_eq!(sub.next().await, Some(LogEvent::Terminal));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn late_subscriber_replays_history() {
        let mux = OutputMux::new(64, 4, 64);
        mux.ingest(b"one ");
        mux.ingest(b"two");
        mux.close();

        let mut sub = mux.subscribe();
        assert_eq!(mux.subscriber_count(), 0);
        assert_eq!(sub.next().await, Some(data("one two")));
        assert_eq!(sub.next().await, Some(LogEvent::Terminal));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn lagging_subscriber_gets_one_gap_then_oldest_data() {
        let mux = OutputMux::new(8, 4, 64);
        let mut sub = mux.subscribe();
        mux.ingest(b"0123456789abcdef");
        mux.close();

        assert_eq!(sub.next().await, Some(LogEvent::Gap { missed: 8 }));
        assert_eq!(sub.next().await, Some(data("89abcdef")));
        assert_eq!(sub.next().await, Some(LogEvent::Terminal));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn slow_subscriber_coalesces_wakeups_without_losing_bytes() {
        let mux = OutputMux::new(1024, 1, 1024);
        let mut sub = mux.subscribe();
        for _ in 0..100 {
            mux.ingest(b"x");
        }
        // the queue never grew past its depth but the bytes are all there
        assert_eq!(sub.next().await, Some(data(&"x".repeat(100))));
        mux.ingest(b"y");
        assert_eq!(sub.next().await, Some(data("y")));
    }

    #[tokio::test]
    async fn chunks_are_capped() {
        let mux = OutputMux::new(64, 4, 4);
        mux.ingest(b"abcdefghij");
        mux.close();
        let mut sub = mux.subscribe();
        assert_eq!(sub.next().await, Some(data("abcd")));
        assert_eq!(sub.next().await, Some(data("efgh")));
        assert_eq!(sub.next().await, Some(data("ij")));
        assert_eq!(sub.next().await, Some(LogEvent::Terminal));
    }

    #[tokio::test]
    async fn ingest_after_close_is_ignored() {
        let mux = OutputMux::new(64, 4, 64);
        mux.ingest(b"a");
        mux.close();
        mux.close();
        mux.ingest(b"b");
        assert_eq!(mux.bytes_written(), 1);
        assert!(mux.is_closed());
    }

    #[tokio::test]
    async fn dropping_a_subscription_unsubscribes() {
        let mux = OutputMux::new(64, 4, 64);
        let first = mux.subscribe();
        let second = mux.subscribe();
        assert_ne!(first.id(), second.id());
        assert_eq!(mux.subscriber_count(), 2);
        drop(first);
        assert_eq!(mux.subscriber_count(), 1);
        second.cancel();
        assert_eq!(mux.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn waiting_subscriber_is_woken_by_ingest() {
        let mux = OutputMux::new(64, 4, 64);
        let mut sub = mux.subscribe();
        let producer = mux.clone();
        let reader = tokio::spawn(async move {
            let mut events = vec![];
            while let Some(event) = sub.next().await {
                events.push(event);
            }
            events
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        producer.ingest(b"late");
        producer.close();
        let events = reader.await.expect("reader panicked");
        assert_eq!(events, vec![data("late"), LogEvent::Terminal]);
    }
}
