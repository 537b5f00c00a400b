//! Post-commit content events
//!
//! The lifecycle engine publishes on the bus only after its transaction
//! commits, so subscribers (the webhook dispatcher) never hear about a
//! write that was rolled back. Publishing never blocks the writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::data::{Content, ContentStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentEventKind {
    #[serde(rename = "content.published")]
    Published,
    #[serde(rename = "content.updated")]
    Updated,
    #[serde(rename = "content.deleted")]
    Deleted,
}

impl ContentEventKind {
    /// Event name used by webhook subscriptions.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ContentEventKind::Published => "content.published",
            ContentEventKind::Updated => "content.updated",
            ContentEventKind::Deleted => "content.deleted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentEvent {
    pub event: ContentEventKind,
    pub content_id: i64,
    pub slug: String,
    pub title: String,
    pub status: ContentStatus,
    pub occurred_at: DateTime<Utc>,
}

impl ContentEvent {
    pub fn new(event: ContentEventKind, content: &Content) -> Self {
        Self {
            event,
            content_id: content.id,
            slug: content.slug.clone(),
            title: content.title.clone(),
            status: content.status,
            occurred_at: Utc::now(),
        }
    }
}

const DEFAULT_CAPACITY: usize = 256;

/// In-process fan-out of [`ContentEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ContentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Send to current subscribers; dropped when there are none.
    pub fn publish(&self, event: ContentEvent) {
        tracing::debug!(
            event = event.event.as_str(),
            content_id = event.content_id,
            "Content event published"
        );
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContentEvent> {
        self.sender.subscribe()
    }

    /// Subscription as a stream; lagged gaps are logged and skipped.
    pub fn stream(&self) -> impl Stream<Item = ContentEvent> + Send + use<> {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(error) => {
                tracing::warn!(%error, "Content event subscriber lagged");
                None
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
