use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::JobState;

/// A job state transition enriched with its reporting group, as observed by
/// status subscribers.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusEvent {
    pub key: String,
    /// `"new"` for a job's first appearance.
    pub from: String,
    pub to: String,
    pub rep_group: String,
}

impl StatusEvent {
    pub fn new(
        key: impl Into<String>,
        from: Option<JobState>,
        to: JobState,
        rep_group: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            from: from.map_or_else(|| "new".to_string(), |s| s.as_str().to_string()),
            to: to.as_str().to_string(),
            rep_group: rep_group.into(),
        }
    }
}

/// Single-writer, many-reader fan-out of status events.
///
/// Publishing never blocks: each subscriber has a bounded buffer and slow
/// subscribers drop their oldest events rather than stalling the queue. A
/// lagging receiver observes `RecvError::Lagged` and continues from the
/// oldest retained event.
pub struct StatusBroadcaster {
    sender: broadcast::Sender<StatusEvent>,
    capacity: usize,
}

impl std::fmt::Debug for StatusBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusBroadcaster")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl StatusBroadcaster {
    /// Create a broadcaster retaining up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    /// Publish an event to all current subscribers.
    ///
    /// An event with no subscribers is silently dropped.
    pub fn publish(&self, event: StatusEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published after this call.
    ///
    /// Dropping the receiver releases its buffer; doing so concurrently with
    /// a publish is safe.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
