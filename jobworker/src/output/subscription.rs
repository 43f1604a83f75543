use super::OutputMux;
use crate::events::LogEvent;
use crate::types::OutputBlob;
use futures::Stream;
use std::fmt;
use tokio::sync::mpsc;

/// Identifies one subscription to one job's output. A single caller may hold
/// several.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(super) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A live view of a job's output.
///
/// Drain it with [`next`](Self::next) or turn it into a `Stream` with
/// [`into_stream`](Self::into_stream). The sequence is finite once the job
/// terminates: all unread bytes, then exactly one [`LogEvent::Terminal`],
/// then `None`. Dropping the subscription unsubscribes it.
pub struct Subscription {
    id: SubscriptionId,
    mux: OutputMux,
    offset: u64,
    wakeups: mpsc::Receiver<()>,
    pending: Option<OutputBlob>,
    done: bool,
}

impl Subscription {
    pub(super) fn new(id: SubscriptionId, mux: OutputMux, wakeups: mpsc::Receiver<()>) -> Self {
        Self {
            id,
            mux,
            offset: 0,
            wakeups,
            pending: None,
            done: false,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Absolute offset of the next byte this subscription will read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Wait for the next event. Returns `None` after the terminal marker.
    pub async fn next(&mut self) -> Option<LogEvent> {
        if self.done {
            return None;
        }
        if let Some(data) = self.pending.take() {
            return Some(LogEvent::Data(data));
        }
        loop {
            let snapshot = self.mux.snapshot(self.offset);
            let slice = snapshot.slice;
            self.offset = slice.start + slice.data.len() as u64;

            if slice.missed > 0 {
                // gap and the data following it come from the same snapshot
                if !slice.data.is_empty() {
                    self.pending = Some(slice.data);
                }
                return Some(LogEvent::Gap {
                    missed: slice.missed,
                });
            }
            if !slice.data.is_empty() {
                return Some(LogEvent::Data(slice.data));
            }
            if snapshot.finished {
                return Some(self.finish());
            }
            if self.wakeups.recv().await.is_none() && !self.mux.is_closed() {
                // removed from the set without completion; nothing more will come
                return Some(self.finish());
            }
        }
    }

    /// Stop receiving output. Equivalent to dropping the subscription.
    pub fn cancel(self) {}

    /// Adapt this subscription into a `Stream` of log events.
    pub fn into_stream(self) -> impl Stream<Item = LogEvent> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.next().await?;
            Some((event, sub))
        })
    }

    fn finish(&mut self) -> LogEvent {
        self.done = true;
        self.mux.unsubscribe(self.id);
        LogEvent::Terminal
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.mux.unsubscribe(self.id);
    }
}
