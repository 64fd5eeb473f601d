//! Queue snapshots and the per-office subscriber registry
//!
//! Every recalculation ends with a [`QueueSnapshot`] published to whoever is
//! watching that office. Subscribing registers a broadcast channel for the
//! office; dropping the last [`SnapshotSubscription`] unregisters it.
//! Publishing never waits on subscribers: a slow one lags and skips ahead.

use crate::capacity::CapacityPolicy;
use crate::model::{Office, OfficeId, Token, TokenStatus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast;

/// Summary counts published with every snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub wait: usize,
    pub allocated: usize,
    pub called: usize,
    /// Engaged cap (M)
    pub max_allocated: u32,
    /// Counters (N)
    pub counters: u32,
    pub avg_service_minutes: u32,
}

impl QueueSummary {
    /// Tokens counting against the engaged cap
    pub fn engaged(&self) -> usize {
        self.allocated + self.called
    }
}

/// Full active-token view of one office
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub office_id: OfficeId,
    /// Active tokens in queue order
    pub tokens: Vec<Token>,
    pub summary: QueueSummary,
    pub is_paused: bool,
    pub generated_at: DateTime<Utc>,
}

impl QueueSnapshot {
    /// Build from the active tokens of `office`; terminal tokens are dropped
    pub fn build(
        office: &Office,
        policy: CapacityPolicy,
        tokens: Vec<Token>,
        generated_at: DateTime<Utc>,
    ) -> Self {
        let mut tokens: Vec<Token> = tokens.into_iter().filter(|t| !t.is_terminal()).collect();
        tokens.sort_by_key(|t| t.fifo_key());

        let mut summary = QueueSummary {
            max_allocated: policy.max_engaged,
            counters: policy.counters,
            avg_service_minutes: office.avg_service_minutes,
            ..QueueSummary::default()
        };
        for token in &tokens {
            match token.status {
                TokenStatus::Wait => summary.wait += 1,
                TokenStatus::Allocated => summary.allocated += 1,
                TokenStatus::Called => summary.called += 1,
                _ => {}
            }
        }

        Self {
            office_id: office.id.clone(),
            tokens,
            summary,
            is_paused: office.is_paused(),
            generated_at,
        }
    }

    pub fn token(&self, token_id: &str) -> Option<&Token> {
        self.tokens.iter().find(|t| t.id == token_id)
    }

    /// Tokens in the given status, in queue order
    pub fn tokens_with_status(&self, status: TokenStatus) -> impl Iterator<Item = &Token> {
        self.tokens.iter().filter(move |t| t.status == status)
    }
}

struct Registry {
    channels: DashMap<OfficeId, broadcast::Sender<Arc<QueueSnapshot>>>,
    capacity: usize,
}

/// Per-office snapshot broadcaster
#[derive(Clone)]
pub struct SnapshotPublisher {
    registry: Arc<Registry>,
}

impl SnapshotPublisher {
    /// `capacity` snapshots are buffered per office before subscribers lag
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                channels: DashMap::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Broadcast to the office's subscribers; returns how many received it
    pub fn publish(&self, office_id: &str, snapshot: QueueSnapshot) -> usize {
        match self.registry.channels.get(office_id) {
            Some(sender) => sender.send(Arc::new(snapshot)).unwrap_or(0),
            None => 0,
        }
    }

    /// Watch an office; the subscription unregisters itself on drop
    pub fn subscribe(&self, office_id: &str) -> SnapshotSubscription {
        let receiver = self
            .registry
            .channels
            .entry(office_id.to_string())
            .or_insert_with(|| broadcast::channel(self.registry.capacity).0)
            .subscribe();

        use tokio_stream::wrappers::BroadcastStream;
        use tokio_stream::StreamExt as TokioStreamExt;
        let stream = BroadcastStream::new(receiver).filter_map(|r| r.ok());

        SnapshotSubscription {
            office_id: office_id.to_string(),
            registry: Arc::clone(&self.registry),
            inner: Box::pin(stream),
        }
    }

    pub fn subscriber_count(&self, office_id: &str) -> usize {
        self.registry
            .channels
            .get(office_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Offices with at least one registered channel
    pub fn watched_offices(&self) -> usize {
        self.registry.channels.len()
    }
}

/// Live stream of snapshots for one office
pub struct SnapshotSubscription {
    office_id: OfficeId,
    registry: Arc<Registry>,
    inner: Pin<Box<dyn Stream<Item = Arc<QueueSnapshot>> + Send>>,
}

impl SnapshotSubscription {
    pub fn office_id(&self) -> &str {
        &self.office_id
    }

    /// Next snapshot; `None` once the publisher is gone
    pub async fn recv(&mut self) -> Option<Arc<QueueSnapshot>> {
        use tokio_stream::StreamExt;
        self.next().await
    }
}

impl Stream for SnapshotSubscription {
    type Item = Arc<QueueSnapshot>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for SnapshotSubscription {
    fn drop(&mut self) {
        // Our own receiver is still alive here, so "<= 1" means we are the last one
        self.registry
            .channels
            .remove_if(&self.office_id, |_, sender| sender.receiver_count() <= 1);
    }
}
