//! "Call next" protocol on top of the queue engine
//!
//! Counters are physical: at most N tokens may be CALLED at once unless the
//! caller forces it. The dispatcher recalculates before choosing, so freshly
//! promoted tokens are eligible, and again afterwards so the remaining queue
//! reflects the new occupancy.
//!
//! Selection prefers the earliest ALLOCATED token. When none exists it takes
//! the earliest WAIT token directly. This skips the promotion step and is the
//! one sanctioned exception to "only ALLOCATED tokens are called": it only
//! happens when the engaged cap is already full of CALLED tokens (forced calls)
//! or the queue was never recalculated.

use crate::capacity::CapacityPolicy;
use crate::engine::QueueEngine;
use crate::error::{QueueError, Result};
use crate::event::{events, QueueEvent};
use crate::model::{Office, Token, TokenStatus, TokenUpdate};
use crate::notify::{NotificationKind, UserNotification};
use crate::storage::{OfficeStore, TokenStore};
use chrono::Utc;
use std::sync::Arc;

/// Calls tokens to counters
pub struct CallDispatcher {
    engine: Arc<QueueEngine>,
}

impl CallDispatcher {
    pub fn new(engine: Arc<QueueEngine>) -> Self {
        Self { engine }
    }

    /// Call the next eligible token of an office.
    ///
    /// Must run under the office's serialization point.
    pub async fn call_next(&self, office_id: &str, force: bool) -> Result<Token> {
        let office = self.load_office(office_id).await?;
        self.check_can_call(&office, force).await?;

        self.engine.recalculate(office_id).await?;

        let active = self.engine.storage().list_active_for_office(office_id).await?;
        let candidate = earliest_with_status(&active, TokenStatus::Allocated)
            .or_else(|| earliest_with_status(&active, TokenStatus::Wait))
            .ok_or_else(|| QueueError::QueueEmpty(office_id.to_string()))?;

        if candidate.status == TokenStatus::Wait {
            tracing::debug!(
                office_id = %office_id,
                token_id = %candidate.id,
                "a3s.queue.call: no allocated token, calling from wait"
            );
        }

        let token_id = candidate.id.clone();
        self.mark_called(&office, &token_id).await
    }

    /// Call a specific WAIT or ALLOCATED token out of order.
    ///
    /// Must run under the office's serialization point.
    pub async fn call_token(&self, token: &Token, force: bool) -> Result<Token> {
        if !matches!(token.status, TokenStatus::Wait | TokenStatus::Allocated) {
            return Err(QueueError::InvalidTransition {
                token_id: token.id.clone(),
                from: token.status,
                action: "call",
            });
        }
        let office = self.load_office(&token.office_id).await?;
        self.check_can_call(&office, force).await?;
        if token.status == TokenStatus::Wait && !force {
            self.check_engaged_slot(&office).await?;
        }

        self.mark_called(&office, &token.id).await
    }

    async fn load_office(&self, office_id: &str) -> Result<Office> {
        self.engine
            .storage()
            .get_office(office_id)
            .await?
            .ok_or_else(|| QueueError::OfficeNotFound(office_id.to_string()))
    }

    async fn check_can_call(&self, office: &Office, force: bool) -> Result<()> {
        if force {
            return Ok(());
        }
        if office.is_paused() {
            return Err(QueueError::OfficePaused(office.id.clone()));
        }
        let policy = CapacityPolicy::for_office(office, self.engine.engaged_multiplier())?;
        let called = self
            .engine
            .storage()
            .list_active_for_office(&office.id)
            .await?
            .iter()
            .filter(|t| t.status == TokenStatus::Called)
            .count();
        if !policy.can_call(called) {
            return Err(QueueError::CapacityExceeded {
                counters: policy.counters,
            });
        }
        Ok(())
    }

    /// A WAIT token called directly becomes engaged, so it needs an open slot under M
    async fn check_engaged_slot(&self, office: &Office) -> Result<()> {
        let policy = CapacityPolicy::for_office(office, self.engine.engaged_multiplier())?;
        let engaged = self
            .engine
            .storage()
            .list_active_for_office(&office.id)
            .await?
            .iter()
            .filter(|t| t.status.is_engaged())
            .count();
        if policy.open_slots(engaged) == 0 {
            return Err(QueueError::EngagedCapReached {
                max_engaged: policy.max_engaged,
            });
        }
        Ok(())
    }

    async fn mark_called(&self, office: &Office, token_id: &str) -> Result<Token> {
        let now = Utc::now();
        let update = TokenUpdate::new()
            .status(TokenStatus::Called)
            .called_at(Some(now))
            .service_start_time(Some(now))
            .eta_minutes(Some(0));
        let called = self.engine.storage().update_token(token_id, update).await?;

        tracing::info!(
            office_id = %office.id,
            token_id = %called.id,
            token_number = called.token_number,
            "a3s.queue.call: token called"
        );

        self.engine.recalculate(&office.id).await?;

        self.engine.events().emit(QueueEvent::for_token(
            events::TOKEN_CALLED,
            &office.id,
            &called.id,
            called.token_number,
        ));
        if let Some(notification) = UserNotification::for_token(&called, NotificationKind::Called) {
            self.engine.notifier().notify_user(notification);
        }
        if let Some(metrics) = self.engine.metrics() {
            let waited = (now - called.created_at).num_seconds().max(0) as f64 / 60.0;
            metrics.record_call_wait(&office.id, waited).await;
        }

        Ok(self
            .engine
            .storage()
            .get_token(token_id)
            .await?
            .unwrap_or(called))
    }
}

fn earliest_with_status(tokens: &[Token], status: TokenStatus) -> Option<&Token> {
    tokens
        .iter()
        .filter(|t| t.status == status)
        .min_by_key(|t| t.fifo_key())
}
