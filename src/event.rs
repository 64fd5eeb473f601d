//! Event system for queue lifecycle notifications

use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast;

/// Event key type
pub type EventKey = String;

/// Event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Empty,
    String(String),
    Map(HashMap<String, serde_json::Value>),
}

/// Queue lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    /// Event key (e.g., "queue.token.booked", "queue.token.called")
    pub key: EventKey,

    /// Event payload
    pub payload: EventPayload,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl QueueEvent {
    /// Create a new event
    pub fn new(key: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            key: key.into(),
            payload,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create an event with no payload
    pub fn empty(key: impl Into<String>) -> Self {
        Self::new(key, EventPayload::Empty)
    }

    /// Create an event with a map payload
    pub fn with_map(key: impl Into<String>, map: HashMap<String, serde_json::Value>) -> Self {
        Self::new(key, EventPayload::Map(map))
    }

    /// Token-scoped event carrying office id, token id and token number
    pub fn for_token(
        key: impl Into<String>,
        office_id: &str,
        token_id: &str,
        token_number: u32,
    ) -> Self {
        Self::with_map(
            key,
            HashMap::from([
                ("office_id".to_string(), serde_json::json!(office_id)),
                ("token_id".to_string(), serde_json::json!(token_id)),
                ("token_number".to_string(), serde_json::json!(token_number)),
            ]),
        )
    }

    /// Office-scoped event
    pub fn for_office(key: impl Into<String>, office_id: &str) -> Self {
        Self::with_map(
            key,
            HashMap::from([("office_id".to_string(), serde_json::json!(office_id))]),
        )
    }

    /// Office id from a map payload, if present
    pub fn office_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::Map(map) => map.get("office_id").and_then(|v| v.as_str()),
            _ => None,
        }
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<QueueEvent>>,
}

impl EventEmitter {
    /// Create a new event emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event; dropped when nobody is listening
    pub fn emit(&self, event: QueueEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to filtered events as an `EventStream` (implements `Stream`)
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&QueueEvent) -> bool + Send + Sync + 'static,
    ) -> EventStream {
        use tokio_stream::wrappers::BroadcastStream;
        use tokio_stream::StreamExt as TokioStreamExt;
        let stream = BroadcastStream::new(self.sender.subscribe())
            .filter_map(|r: Result<QueueEvent, _>| r.ok())
            .filter(move |e| filter(e));
        EventStream {
            inner: Box::pin(stream),
        }
    }

    /// Subscribe to all events as an `EventStream`
    pub fn subscribe_stream(&self) -> EventStream {
        self.subscribe_filtered(|_| true)
    }
}

/// Event stream, implements `futures_core::Stream<Item = QueueEvent>`.
///
/// Lagged events are skipped silently.
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = QueueEvent> + Send>>,
}

impl Stream for EventStream {
    type Item = QueueEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl EventStream {
    /// Receive the next matching event
    pub async fn recv(&mut self) -> Option<QueueEvent> {
        use tokio_stream::StreamExt;
        self.next().await
    }
}

/// Event catalog - predefined event keys
pub mod events {
    pub const OFFICE_REGISTERED: &str = "queue.office.registered";
    pub const OFFICE_CAPACITY_UPDATED: &str = "queue.office.capacity_updated";
    pub const OFFICE_PAUSED: &str = "queue.office.paused";
    pub const OFFICE_RESUMED: &str = "queue.office.resumed";
    pub const TOKEN_BOOKED: &str = "queue.token.booked";
    pub const TOKEN_ALLOCATED: &str = "queue.token.allocated";
    pub const TOKEN_CALLED: &str = "queue.token.called";
    pub const TOKEN_COMPLETED: &str = "queue.token.completed";
    pub const TOKEN_CANCELLED: &str = "queue.token.cancelled";
    pub const TOKEN_NO_SHOW: &str = "queue.token.no_show";
    pub const TOKEN_REQUEUED: &str = "queue.token.requeued";
    pub const RECALCULATION_FAILED: &str = "queue.recalculation.failed";
}
