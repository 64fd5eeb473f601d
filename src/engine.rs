//! Queue engine: promotion, FIFO ordering and ETA for one office
//!
//! A recalculation pass restores three properties for an office:
//! - at most M tokens are engaged (ALLOCATED or CALLED)
//! - active tokens are positioned in FIFO order of their queue key
//! - every active token carries a fresh position and ETA
//!
//! The maths lives in [`plan_recalculation`], a pure function over the loaded
//! tokens. [`QueueEngine::recalculate`] loads state, writes each promotion on
//! its own (announcing it as soon as it is durable), refreshes the remaining
//! tokens in one batched write and publishes the resulting snapshot. Callers
//! are responsible for serializing passes per office.

use crate::capacity::CapacityPolicy;
use crate::error::{QueueError, Result};
use crate::event::{events, EventEmitter, QueueEvent};
use crate::metrics::{metric_names, QueueMetrics};
use crate::model::{Token, TokenId, TokenStatus, TokenUpdate};
use crate::notify::{NotificationKind, Notifier, UserNotification};
use crate::snapshot::{QueueSnapshot, SnapshotPublisher};
use crate::storage::{OfficeStore, Storage, TokenStore};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::time::Instant;

/// Position and ETA decided for one active token
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub token_id: TokenId,
    pub status: TokenStatus,
    /// 1-based
    pub position: u32,
    pub eta_minutes: u32,
    pub predicted_start: DateTime<Utc>,
    /// WAIT token promoted to ALLOCATED in this pass
    pub promote: bool,
}

/// Outcome of the planning step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecalculationPlan {
    /// Active tokens in queue order
    pub assignments: Vec<Assignment>,
}

impl RecalculationPlan {
    pub fn promoted(&self) -> impl Iterator<Item = &Assignment> {
        self.assignments.iter().filter(|a| a.promote)
    }

    pub fn get(&self, token_id: &str) -> Option<&Assignment> {
        self.assignments.iter().find(|a| a.token_id == token_id)
    }
}

/// Whole counter-cycles a token at `position` waits behind: `ceil(position / N) - 1`
pub fn wait_units(position: u32, counters: u32) -> u32 {
    let counters = counters.max(1);
    position.div_ceil(counters).saturating_sub(1)
}

/// Decide promotions, positions and ETAs for an office's tokens.
///
/// Terminal tokens are ignored. The earliest WAIT tokens fill the open engaged
/// slots; then every active token is ordered by its FIFO key (stable, ties in
/// token-number order) and given `eta = wait_units(position) x avg_service_minutes`.
pub fn plan_recalculation(
    policy: CapacityPolicy,
    avg_service_minutes: u32,
    tokens: &[Token],
    now: DateTime<Utc>,
) -> RecalculationPlan {
    let mut queue: Vec<&Token> = tokens.iter().filter(|t| !t.is_terminal()).collect();
    queue.sort_by_key(|t| t.fifo_key());

    let engaged = queue.iter().filter(|t| t.status.is_engaged()).count();
    let mut slots = policy.open_slots(engaged);

    let assignments = queue
        .into_iter()
        .enumerate()
        .map(|(idx, token)| {
            // Queue order is FIFO, so the first WAIT tokens seen are the earliest
            let promote = token.status == TokenStatus::Wait && slots > 0;
            if promote {
                slots -= 1;
            }
            let position = (idx + 1) as u32;
            let eta_minutes = wait_units(position, policy.counters).saturating_mul(avg_service_minutes);
            Assignment {
                token_id: token.id.clone(),
                status: if promote {
                    TokenStatus::Allocated
                } else {
                    token.status
                },
                position,
                eta_minutes,
                predicted_start: now + Duration::minutes(i64::from(eta_minutes)),
                promote,
            }
        })
        .collect();

    RecalculationPlan { assignments }
}

/// Recomputes and publishes office queue state
pub struct QueueEngine {
    storage: Arc<dyn Storage>,
    publisher: SnapshotPublisher,
    notifier: Arc<dyn Notifier>,
    events: EventEmitter,
    metrics: Option<QueueMetrics>,
    engaged_multiplier: u32,
}

impl QueueEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        publisher: SnapshotPublisher,
        notifier: Arc<dyn Notifier>,
        events: EventEmitter,
        engaged_multiplier: u32,
    ) -> Self {
        Self {
            storage,
            publisher,
            notifier,
            events,
            metrics: None,
            engaged_multiplier,
        }
    }

    /// Attach a metrics collector (builder pattern)
    pub fn with_metrics(mut self, metrics: QueueMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn publisher(&self) -> &SnapshotPublisher {
        &self.publisher
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn metrics(&self) -> Option<&QueueMetrics> {
        self.metrics.as_ref()
    }

    pub fn engaged_multiplier(&self) -> u32 {
        self.engaged_multiplier
    }

    /// Run one recalculation pass for `office_id`.
    ///
    /// Returns `Ok(None)` when the office does not exist. Any failure is
    /// reported as `RecalculationFailure`; token writes already made stay
    /// durable.
    pub async fn recalculate(&self, office_id: &str) -> Result<Option<QueueSnapshot>> {
        let started = Instant::now();
        match self.run_pass(office_id).await {
            Ok(Some((snapshot, promoted))) => {
                if let Some(metrics) = &self.metrics {
                    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                    metrics
                        .record_recalculation(office_id, &snapshot.summary, promoted, latency_ms)
                        .await;
                }
                self.publisher.publish(office_id, snapshot.clone());
                Ok(Some(snapshot))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                tracing::error!(
                    office_id = %office_id,
                    error = %err,
                    "a3s.queue.recalculate: pass failed"
                );
                self.events
                    .emit(QueueEvent::for_office(events::RECALCULATION_FAILED, office_id));
                if let Some(metrics) = &self.metrics {
                    metrics
                        .count(metric_names::RECALCULATION_FAILURES, office_id, 1)
                        .await;
                }
                Err(match err {
                    QueueError::RecalculationFailure { .. } => err,
                    other => QueueError::RecalculationFailure {
                        office_id: office_id.to_string(),
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    async fn run_pass(&self, office_id: &str) -> Result<Option<(QueueSnapshot, usize)>> {
        let office = match self.storage.get_office(office_id).await? {
            Some(office) => office,
            None => {
                tracing::debug!(office_id = %office_id, "a3s.queue.recalculate: unknown office, skipping");
                return Ok(None);
            }
        };
        let policy = CapacityPolicy::for_office(&office, self.engaged_multiplier)?;
        let tokens = self.storage.list_active_for_office(office_id).await?;

        let now = Utc::now();
        let plan = plan_recalculation(policy, office.avg_service_minutes, &tokens, now);

        let mut updated = Vec::with_capacity(plan.assignments.len());
        let mut refresh = Vec::new();
        let mut promoted = 0;
        for assignment in &plan.assignments {
            let mut update = TokenUpdate::new()
                .position(Some(assignment.position))
                .eta_minutes(Some(assignment.eta_minutes));
            // A called token keeps its actual start time
            if assignment.status != TokenStatus::Called {
                update = update.service_start_time(Some(assignment.predicted_start));
            }

            if assignment.promote {
                update = update
                    .status(TokenStatus::Allocated)
                    .allocation_time(Some(now));
                let token = self.storage.update_token(&assignment.token_id, update).await?;
                self.announce_promotion(office_id, &token);
                promoted += 1;
                updated.push(token);
            } else {
                refresh.push((assignment.token_id.clone(), update));
            }
        }
        if !refresh.is_empty() {
            updated.extend(self.storage.update_tokens(refresh).await?);
        }

        let snapshot = QueueSnapshot::build(&office, policy, updated, now);
        tracing::debug!(
            office_id = %office_id,
            wait = snapshot.summary.wait,
            allocated = snapshot.summary.allocated,
            called = snapshot.summary.called,
            promoted,
            "a3s.queue.recalculate: pass complete"
        );
        Ok(Some((snapshot, promoted)))
    }

    fn announce_promotion(&self, office_id: &str, token: &Token) {
        tracing::info!(
            office_id = %office_id,
            token_id = %token.id,
            token_number = token.token_number,
            "a3s.queue.promote: token allocated"
        );
        self.events.emit(QueueEvent::for_token(
            events::TOKEN_ALLOCATED,
            office_id,
            &token.id,
            token.token_number,
        ));
        if let Some(notification) = UserNotification::for_token(token, NotificationKind::Allocated) {
            self.notifier.notify_user(notification);
        }
    }

    /// Read-only snapshot from stored state; no promotion, no writes
    pub async fn current_snapshot(&self, office_id: &str) -> Result<QueueSnapshot> {
        let office = self
            .storage
            .get_office(office_id)
            .await?
            .ok_or_else(|| QueueError::OfficeNotFound(office_id.to_string()))?;
        let policy = CapacityPolicy::for_office(&office, self.engaged_multiplier)?;
        let tokens = self.storage.list_active_for_office(office_id).await?;
        Ok(QueueSnapshot::build(&office, policy, tokens, Utc::now()))
    }
}
