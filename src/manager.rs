//! Queue manager provides the booking and admin surface
//!
//! Every mutating operation takes the office's lock, writes, then runs the
//! engine before releasing it, so promotions and positions are never decided
//! on a stale read. Operations on different offices proceed in parallel.

use crate::capacity::CapacityPolicy;
use crate::config::{EngineConfig, RequeuePolicy};
use crate::dispatcher::CallDispatcher;
use crate::distance::{DistanceEstimator, GeoPoint};
use crate::engine::QueueEngine;
use crate::error::{QueueError, Result};
use crate::event::{events, EventEmitter, EventStream, QueueEvent};
use crate::metrics::{metric_names, QueueMetrics};
use crate::model::{
    CapacityUpdate, CustomerInfo, Office, OfficeId, PauseState, Token, TokenStatus, TokenUpdate,
    UserId,
};
use crate::notify::{Notifier, TracingNotifier};
use crate::snapshot::{QueueSnapshot, SnapshotPublisher, SnapshotSubscription};
use crate::storage::{MemoryStorage, OfficeStore, Storage, TokenStore};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Input for registering an office
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OfficeRegistration {
    pub name: String,
    pub counter_count: u32,
    #[serde(default)]
    pub max_allocated: Option<u32>,
    /// Falls back to the engine default when absent
    #[serde(default)]
    pub avg_service_minutes: Option<u32>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
}

impl OfficeRegistration {
    pub fn new(name: impl Into<String>, counter_count: u32) -> Self {
        Self {
            name: name.into(),
            counter_count,
            ..Self::default()
        }
    }

    pub fn with_max_allocated(mut self, max_allocated: u32) -> Self {
        self.max_allocated = Some(max_allocated);
        self
    }

    pub fn with_avg_service_minutes(mut self, minutes: u32) -> Self {
        self.avg_service_minutes = Some(minutes);
        self
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }
}

/// Input for booking a token
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub customer: CustomerInfo,
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub service_type: Option<String>,
}

impl BookingRequest {
    pub fn new(customer_name: impl Into<String>) -> Self {
        Self {
            customer: CustomerInfo::new(customer_name),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_service_type(mut self, service_type: impl Into<String>) -> Self {
        self.service_type = Some(service_type.into());
        self
    }
}

/// Queue manager
pub struct QueueManager {
    config: EngineConfig,
    engine: Arc<QueueEngine>,
    dispatcher: CallDispatcher,
    estimator: DistanceEstimator,
    office_locks: DashMap<OfficeId, Arc<Mutex<()>>>,
}

impl QueueManager {
    fn new(config: EngineConfig, engine: Arc<QueueEngine>) -> Self {
        Self {
            estimator: config.distance_estimator(),
            dispatcher: CallDispatcher::new(Arc::clone(&engine)),
            config,
            engine,
            office_locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<QueueEngine> {
        &self.engine
    }

    fn storage(&self) -> &Arc<dyn Storage> {
        self.engine.storage()
    }

    fn events(&self) -> &EventEmitter {
        self.engine.events()
    }

    /// Get the metrics collector (if configured)
    pub fn metrics(&self) -> Option<&QueueMetrics> {
        self.engine.metrics()
    }

    /// The office's serialization point
    fn office_lock(&self, office_id: &str) -> Arc<Mutex<()>> {
        self.office_locks
            .entry(office_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn require_office(&self, office_id: &str) -> Result<Office> {
        self.storage()
            .get_office(office_id)
            .await?
            .ok_or_else(|| QueueError::OfficeNotFound(office_id.to_string()))
    }

    async fn require_token(&self, token_id: &str) -> Result<Token> {
        self.storage()
            .get_token(token_id)
            .await?
            .ok_or_else(|| QueueError::TokenNotFound(token_id.to_string()))
    }

    async fn count(&self, name: &str, office_id: &str) {
        if let Some(metrics) = self.metrics() {
            metrics.count(name, office_id, 1).await;
        }
    }

    // ========================================================================
    // Office administration
    // ========================================================================

    /// Register a new office
    pub async fn register_office(&self, registration: OfficeRegistration) -> Result<Office> {
        let name = registration.name.trim();
        if name.is_empty() {
            return Err(QueueError::InvalidInput("office name is required".to_string()));
        }
        CapacityPolicy::new(
            registration.counter_count,
            registration.max_allocated,
            self.config.engaged_multiplier,
        )?;
        let avg_service_minutes = registration
            .avg_service_minutes
            .unwrap_or(self.config.default_avg_service_minutes);
        validate_service_minutes(avg_service_minutes)?;
        if let Some(location) = &registration.location {
            location.validate()?;
        }

        let now = Utc::now();
        let office = Office {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            counter_count: registration.counter_count,
            max_allocated: registration.max_allocated,
            avg_service_minutes,
            location: registration.location,
            pause: PauseState::running(),
            created_at: now,
            updated_at: now,
        };
        self.storage().insert_office(office.clone()).await?;

        tracing::info!(
            office_id = %office.id,
            counters = office.counter_count,
            "a3s.queue.office: registered"
        );
        self.events()
            .emit(QueueEvent::for_office(events::OFFICE_REGISTERED, &office.id));
        Ok(office)
    }

    /// Change counters, engaged cap override and service time, then recalculate
    pub async fn update_capacity(&self, office_id: &str, update: CapacityUpdate) -> Result<Office> {
        CapacityPolicy::new(
            update.counter_count,
            update.max_allocated,
            self.config.engaged_multiplier,
        )?;
        if let Some(minutes) = update.avg_service_minutes {
            validate_service_minutes(minutes)?;
        }

        let lock = self.office_lock(office_id);
        let _guard = lock.lock().await;

        self.require_office(office_id).await?;
        let office = self.storage().update_capacity_config(office_id, update).await?;
        self.engine.recalculate(office_id).await?;

        tracing::info!(
            office_id = %office_id,
            counters = office.counter_count,
            max_allocated = ?office.max_allocated,
            "a3s.queue.office: capacity updated"
        );
        self.events()
            .emit(QueueEvent::for_office(events::OFFICE_CAPACITY_UPDATED, office_id));
        Ok(office)
    }

    /// Suspend calling; positions and ETAs keep updating
    pub async fn pause(
        &self,
        office_id: &str,
        reason: Option<String>,
        message: Option<String>,
    ) -> Result<Office> {
        self.set_pause(office_id, PauseState::paused(reason, message, Utc::now()))
            .await
    }

    /// Resume calling
    pub async fn resume(&self, office_id: &str) -> Result<Office> {
        self.set_pause(office_id, PauseState::running()).await
    }

    async fn set_pause(&self, office_id: &str, pause: PauseState) -> Result<Office> {
        let lock = self.office_lock(office_id);
        let _guard = lock.lock().await;

        self.require_office(office_id).await?;
        let paused = pause.is_paused;
        let office = self.storage().update_pause_state(office_id, pause).await?;
        self.engine.recalculate(office_id).await?;

        tracing::info!(office_id = %office_id, paused, "a3s.queue.office: pause state changed");
        self.events().emit(QueueEvent::for_office(
            if paused {
                events::OFFICE_PAUSED
            } else {
                events::OFFICE_RESUMED
            },
            office_id,
        ));
        Ok(office)
    }

    // ========================================================================
    // Booking
    // ========================================================================

    /// Book a token; recalculation failure after the insert is logged, not returned
    pub async fn book(&self, office_id: &str, request: BookingRequest) -> Result<Token> {
        if request.customer.name.trim().is_empty() {
            return Err(QueueError::InvalidInput("customer name is required".to_string()));
        }
        if let Some(location) = &request.location {
            location.validate()?;
        }

        let lock = self.office_lock(office_id);
        let _guard = lock.lock().await;

        let office = self.require_office(office_id).await?;
        let travel_time_minutes = self
            .estimator
            .travel_minutes(request.location, office.location);

        let token_number = self.storage().next_token_number(office_id).await?;
        let now = Utc::now();
        let token = Token {
            id: Uuid::new_v4().to_string(),
            office_id: office_id.to_string(),
            token_number,
            user_id: request.user_id,
            customer: request.customer,
            location: request.location,
            service_type: request.service_type,
            travel_time_minutes,
            status: TokenStatus::Wait,
            created_at: now,
            queued_at: now,
            allocation_time: None,
            called_at: None,
            completed_at: None,
            cancelled_at: None,
            service_start_time: None,
            eta_minutes: None,
            position: None,
            last_updated_at: now,
        };
        self.storage().insert_token(token.clone()).await?;

        tracing::info!(
            office_id = %office_id,
            token_id = %token.id,
            token_number,
            travel_time_minutes,
            "a3s.queue.book: token booked"
        );
        self.events().emit(QueueEvent::for_token(
            events::TOKEN_BOOKED,
            office_id,
            &token.id,
            token_number,
        ));
        self.count(metric_names::TOKENS_BOOKED, office_id).await;

        if let Err(err) = self.engine.recalculate(office_id).await {
            tracing::warn!(
                office_id = %office_id,
                token_id = %token.id,
                error = %err,
                "a3s.queue.book: recalculation failed, booking kept"
            );
            return Ok(token);
        }

        match self.storage().get_token(&token.id).await {
            Ok(Some(fresh)) => Ok(fresh),
            _ => Ok(token),
        }
    }

    // ========================================================================
    // Calling
    // ========================================================================

    /// Call the next token to a counter
    pub async fn call_next(&self, office_id: &str, force: bool) -> Result<Token> {
        let lock = self.office_lock(office_id);
        let _guard = lock.lock().await;

        self.dispatcher.call_next(office_id, force).await
    }

    /// Call a specific token, bypassing FIFO selection
    pub async fn call_token(&self, token_id: &str, force: bool) -> Result<Token> {
        let office_id = self.require_token(token_id).await?.office_id;
        let lock = self.office_lock(&office_id);
        let _guard = lock.lock().await;

        let token = self.require_token(token_id).await?;
        self.dispatcher.call_token(&token, force).await
    }

    // ========================================================================
    // Terminal transitions
    // ========================================================================

    /// Finish serving a token; one served without a formal call may be completed too
    pub async fn complete(&self, token_id: &str) -> Result<Token> {
        self.transition(
            token_id,
            "complete",
            |status| !status.is_terminal(),
            |now| {
                TokenUpdate::new()
                    .status(TokenStatus::Completed)
                    .completed_at(Some(now))
                    .eta_minutes(Some(0))
                    .position(None)
            },
            events::TOKEN_COMPLETED,
            metric_names::TOKENS_COMPLETED,
        )
        .await
    }

    /// Withdraw any active token
    pub async fn cancel(&self, token_id: &str) -> Result<Token> {
        self.transition(
            token_id,
            "cancel",
            |status| !status.is_terminal(),
            |now| {
                TokenUpdate::new()
                    .status(TokenStatus::Cancelled)
                    .cancelled_at(Some(now))
                    .position(None)
            },
            events::TOKEN_CANCELLED,
            metric_names::TOKENS_CANCELLED,
        )
        .await
    }

    /// Mark a token whose customer did not turn up
    pub async fn no_show(&self, token_id: &str) -> Result<Token> {
        self.transition(
            token_id,
            "mark no-show",
            |status| !status.is_terminal(),
            |now| {
                TokenUpdate::new()
                    .status(TokenStatus::NoShow)
                    .cancelled_at(Some(now))
                    .position(None)
            },
            events::TOKEN_NO_SHOW,
            metric_names::TOKENS_NO_SHOW,
        )
        .await
    }

    /// Return a no-show token to WAIT.
    ///
    /// With [`RequeuePolicy::Back`] the token queues behind everyone currently
    /// waiting; with [`RequeuePolicy::Original`] it regains its booking order.
    /// `created_at` is never modified.
    pub async fn requeue(&self, token_id: &str) -> Result<Token> {
        let policy = self.config.requeue_policy;
        self.transition(
            token_id,
            "requeue",
            |status| status == TokenStatus::NoShow,
            move |now| {
                let update = TokenUpdate::new()
                    .status(TokenStatus::Wait)
                    .allocation_time(None)
                    .called_at(None)
                    .cancelled_at(None)
                    .service_start_time(None);
                match policy {
                    RequeuePolicy::Back => update.queued_at(now),
                    RequeuePolicy::Original => update,
                }
            },
            events::TOKEN_REQUEUED,
            metric_names::TOKENS_REQUEUED,
        )
        .await
    }

    /// Shared shape of every status transition: validate under the office lock,
    /// write, recalculate (surfacing failure), then report.
    async fn transition(
        &self,
        token_id: &str,
        action: &'static str,
        allowed: impl Fn(TokenStatus) -> bool,
        update: impl FnOnce(chrono::DateTime<Utc>) -> TokenUpdate,
        event_key: &'static str,
        metric: &'static str,
    ) -> Result<Token> {
        let office_id = self.require_token(token_id).await?.office_id;
        let lock = self.office_lock(&office_id);
        let _guard = lock.lock().await;

        let token = self.require_token(token_id).await?;
        if !allowed(token.status) {
            return Err(QueueError::InvalidTransition {
                token_id: token_id.to_string(),
                from: token.status,
                action,
            });
        }

        let updated = self
            .storage()
            .update_token(token_id, update(Utc::now()))
            .await?;
        tracing::info!(
            office_id = %office_id,
            token_id = %token_id,
            from = %token.status,
            to = %updated.status,
            "a3s.queue.transition: {}",
            action
        );

        self.engine.recalculate(&office_id).await?;

        self.events().emit(QueueEvent::for_token(
            event_key,
            &office_id,
            token_id,
            updated.token_number,
        ));
        self.count(metric, &office_id).await;

        Ok(self.storage().get_token(token_id).await?.unwrap_or(updated))
    }

    // ========================================================================
    // Views and subscriptions
    // ========================================================================

    /// Run a recalculation pass under the office lock
    pub async fn recalculate(&self, office_id: &str) -> Result<Option<QueueSnapshot>> {
        let lock = self.office_lock(office_id);
        let _guard = lock.lock().await;
        self.engine.recalculate(office_id).await
    }

    /// Current stored state of an office, without recalculating
    pub async fn snapshot(&self, office_id: &str) -> Result<QueueSnapshot> {
        self.engine.current_snapshot(office_id).await
    }

    pub async fn get_token(&self, token_id: &str) -> Result<Token> {
        self.require_token(token_id).await
    }

    pub async fn get_office(&self, office_id: &str) -> Result<Office> {
        self.require_office(office_id).await
    }

    /// Live snapshots for one office; dropping the subscription unsubscribes
    pub fn subscribe(&self, office_id: &str) -> SnapshotSubscription {
        self.engine.publisher().subscribe(office_id)
    }

    /// Subscribe to all lifecycle events
    pub fn subscribe_events(&self) -> EventStream {
        self.events().subscribe_stream()
    }

    /// Subscribe to lifecycle events of one office
    pub fn subscribe_office_events(&self, office_id: &str) -> EventStream {
        let office_id = office_id.to_string();
        self.events()
            .subscribe_filtered(move |e| e.office_id() == Some(office_id.as_str()))
    }
}

fn validate_service_minutes(minutes: u32) -> Result<()> {
    if minutes == 0 {
        return Err(QueueError::InvalidInput(
            "average service minutes must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Queue manager builder
pub struct QueueManagerBuilder {
    event_emitter: EventEmitter,
    config: EngineConfig,
    storage: Option<Arc<dyn Storage>>,
    notifier: Option<Arc<dyn Notifier>>,
    metrics: Option<QueueMetrics>,
}

impl QueueManagerBuilder {
    /// Create a new queue manager builder
    pub fn new(event_emitter: EventEmitter) -> Self {
        Self {
            event_emitter,
            config: EngineConfig::default(),
            storage: None,
            notifier: None,
            metrics: None,
        }
    }

    /// Builder whose event emitter is sized by `config.event_capacity`
    pub fn from_config(config: EngineConfig) -> Self {
        Self::new(EventEmitter::new(config.event_capacity)).with_config(config)
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Storage backend; defaults to [`MemoryStorage`]
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Notification sink; defaults to [`TracingNotifier`]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_metrics(mut self, metrics: QueueMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the queue manager
    pub async fn build(self) -> anyhow::Result<QueueManager> {
        if self.config.engaged_multiplier == 0 {
            anyhow::bail!("engaged multiplier must be at least 1");
        }
        if self.config.default_avg_service_minutes == 0 {
            anyhow::bail!("default average service minutes must be positive");
        }
        if !(self.config.travel_minutes_per_km.is_finite() && self.config.travel_minutes_per_km >= 0.0) {
            anyhow::bail!("travel minutes per km must be a non-negative number");
        }

        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier));
        let publisher = SnapshotPublisher::new(self.config.snapshot_capacity);

        let mut engine = QueueEngine::new(
            storage,
            publisher,
            notifier,
            self.event_emitter,
            self.config.engaged_multiplier,
        );
        if let Some(metrics) = self.metrics {
            engine = engine.with_metrics(metrics);
        }

        Ok(QueueManager::new(self.config, Arc::new(engine)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsBackend;
    use crate::notify::{BroadcastNotifier, NotificationKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Helper: manager over in-memory storage
    async fn make_manager() -> QueueManager {
        QueueManagerBuilder::new(EventEmitter::new(256))
            .build()
            .await
            .unwrap()
    }

    async fn office_with(manager: &QueueManager, counters: u32, avg: u32) -> Office {
        manager
            .register_office(
                OfficeRegistration::new("Main branch", counters).with_avg_service_minutes(avg),
            )
            .await
            .unwrap()
    }

    async fn book_n(manager: &QueueManager, office_id: &str, n: usize) -> Vec<Token> {
        let mut tokens = Vec::new();
        for i in 0..n {
            let request = BookingRequest::new(format!("Customer {}", i + 1))
                .with_user(format!("user-{}", i + 1));
            tokens.push(manager.book(office_id, request).await.unwrap());
        }
        tokens
    }

    /// Wraps memory storage and fails token updates on demand
    struct FlakyStorage {
        inner: MemoryStorage,
        fail_updates: AtomicBool,
    }

    impl FlakyStorage {
        fn new() -> Self {
            Self {
                inner: MemoryStorage::new(),
                fail_updates: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl TokenStore for FlakyStorage {
        async fn get_token(&self, id: &str) -> Result<Option<Token>> {
            self.inner.get_token(id).await
        }
        async fn list_active_for_office(&self, office_id: &str) -> Result<Vec<Token>> {
            self.inner.list_active_for_office(office_id).await
        }
        async fn insert_token(&self, token: Token) -> Result<()> {
            self.inner.insert_token(token).await
        }
        async fn update_token(&self, id: &str, update: TokenUpdate) -> Result<Token> {
            // Lifecycle writes go through; engine refresh and promotion writes fail
            let engine_write = matches!(update.status, None | Some(TokenStatus::Allocated));
            if self.fail_updates.load(Ordering::SeqCst) && engine_write {
                return Err(QueueError::Storage("write timed out".to_string()));
            }
            self.inner.update_token(id, update).await
        }
        async fn next_token_number(&self, office_id: &str) -> Result<u32> {
            self.inner.next_token_number(office_id).await
        }
    }

    #[async_trait]
    impl OfficeStore for FlakyStorage {
        async fn get_office(&self, id: &str) -> Result<Option<Office>> {
            self.inner.get_office(id).await
        }
        async fn insert_office(&self, office: Office) -> Result<()> {
            self.inner.insert_office(office).await
        }
        async fn update_capacity_config(&self, id: &str, config: CapacityUpdate) -> Result<Office> {
            self.inner.update_capacity_config(id, config).await
        }
        async fn update_pause_state(&self, id: &str, pause: PauseState) -> Result<Office> {
            self.inner.update_pause_state(id, pause).await
        }
    }

    // ========================================================================
    // Builder Tests
    // ========================================================================

    #[tokio::test]
    async fn test_builder_rejects_bad_config() {
        let result = QueueManagerBuilder::new(EventEmitter::new(8))
            .with_config(EngineConfig::new().with_engaged_multiplier(0))
            .build()
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_builder_from_config() {
        let config = EngineConfig::new()
            .with_event_capacity(4)
            .with_default_avg_service_minutes(7);
        let manager = QueueManagerBuilder::from_config(config.clone())
            .build()
            .await
            .unwrap();
        assert_eq!(manager.config(), &config);

        let office = manager
            .register_office(OfficeRegistration::new("Branch", 1))
            .await
            .unwrap();
        assert_eq!(office.avg_service_minutes, 7);
    }

    #[tokio::test]
    async fn test_builder_with_metrics() {
        let manager = QueueManagerBuilder::new(EventEmitter::new(8))
            .with_metrics(QueueMetrics::local())
            .build()
            .await
            .unwrap();
        let office = office_with(&manager, 1, 10).await;
        book_n(&manager, &office.id, 2).await;

        let backend = manager.metrics().unwrap().backend();
        assert_eq!(backend.get_counter(metric_names::TOKENS_BOOKED).await, Some(2));
        assert_eq!(backend.get_counter(metric_names::TOKENS_PROMOTED).await, Some(2));
    }

    // ========================================================================
    // Office Tests
    // ========================================================================

    #[tokio::test]
    async fn test_register_office_validation() {
        let manager = make_manager().await;

        let err = manager
            .register_office(OfficeRegistration::new("  ", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidInput(_)));

        let err = manager
            .register_office(OfficeRegistration::new("Branch", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidInput(_)));

        let office = manager
            .register_office(OfficeRegistration::new("Branch", 2))
            .await
            .unwrap();
        assert_eq!(office.avg_service_minutes, 10);
        assert_eq!(manager.get_office(&office.id).await.unwrap(), office);
    }

    #[tokio::test]
    async fn test_update_capacity_promotes_more() {
        let manager = make_manager().await;
        let office = office_with(&manager, 1, 10).await;
        book_n(&manager, &office.id, 7).await;
        assert_eq!(manager.snapshot(&office.id).await.unwrap().summary.allocated, 3);

        let updated = manager
            .update_capacity(
                &office.id,
                CapacityUpdate {
                    counter_count: 2,
                    max_allocated: None,
                    avg_service_minutes: Some(5),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.counter_count, 2);

        let snap = manager.snapshot(&office.id).await.unwrap();
        assert_eq!(snap.summary.allocated, 6);
        assert_eq!(snap.summary.wait, 1);
        assert_eq!(snap.summary.avg_service_minutes, 5);
        // Position 7 with two counters: ceil(7/2)-1 = 3 units of 5 minutes
        assert_eq!(snap.tokens[6].eta_minutes, Some(15));
    }

    #[tokio::test]
    async fn test_update_capacity_validation() {
        let manager = make_manager().await;
        let office = office_with(&manager, 1, 10).await;

        let bad = CapacityUpdate {
            counter_count: 0,
            max_allocated: None,
            avg_service_minutes: None,
        };
        let err = manager.update_capacity(&office.id, bad).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidInput(_)));

        let ok = CapacityUpdate {
            counter_count: 1,
            max_allocated: None,
            avg_service_minutes: None,
        };
        let err = manager.update_capacity("ghost", ok).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_pause_suppresses_calling_but_not_eta() {
        let manager = make_manager().await;
        let office = office_with(&manager, 1, 10).await;

        let paused = manager
            .pause(&office.id, Some("lunch".into()), Some("Back at 2pm".into()))
            .await
            .unwrap();
        assert!(paused.is_paused());
        assert!(paused.pause.paused_at.is_some());

        let tokens = book_n(&manager, &office.id, 2).await;
        assert_eq!(tokens[1].eta_minutes, Some(10));
        assert!(manager.snapshot(&office.id).await.unwrap().is_paused);

        let err = manager.call_next(&office.id, false).await.unwrap_err();
        assert_eq!(err, QueueError::OfficePaused(office.id.clone()));

        let resumed = manager.resume(&office.id).await.unwrap();
        assert!(!resumed.is_paused());
        assert!(resumed.pause.reason.is_none());
        assert!(manager.call_next(&office.id, false).await.is_ok());
    }

    // ========================================================================
    // Booking Tests
    // ========================================================================

    #[tokio::test]
    async fn test_book_validation() {
        let manager = make_manager().await;
        let office = office_with(&manager, 1, 10).await;

        let err = manager
            .book(&office.id, BookingRequest::new(" "))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidInput(_)));

        let err = manager
            .book("ghost", BookingRequest::new("Ada"))
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::OfficeNotFound("ghost".to_string()));

        let err = manager
            .book(
                &office.id,
                BookingRequest::new("Ada").with_location(GeoPoint::new(100.0, 0.0)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_book_assigns_sequential_numbers() {
        let manager = make_manager().await;
        let office = office_with(&manager, 1, 10).await;
        let other = office_with(&manager, 1, 10).await;

        let tokens = book_n(&manager, &office.id, 3).await;
        let numbers: Vec<u32> = tokens.iter().map(|t| t.token_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);

        let first_other = book_n(&manager, &other.id, 1).await;
        assert_eq!(first_other[0].token_number, 1);
    }

    #[tokio::test]
    async fn test_book_keeps_optional_fields() {
        let manager = make_manager().await;
        let office = office_with(&manager, 1, 10).await;
        let token = manager
            .book(
                &office.id,
                BookingRequest::new("Ada")
                    .with_user("u-1")
                    .with_service_type("passport"),
            )
            .await
            .unwrap();
        assert_eq!(token.user_id.as_deref(), Some("u-1"));
        assert_eq!(token.service_type.as_deref(), Some("passport"));
        assert_eq!(token.created_at, token.queued_at);
    }

    #[tokio::test]
    async fn test_book_survives_recalculation_failure() {
        let storage = Arc::new(FlakyStorage::new());
        let manager = QueueManagerBuilder::new(EventEmitter::new(8))
            .with_storage(storage.clone())
            .build()
            .await
            .unwrap();
        let office = office_with(&manager, 1, 10).await;

        storage.fail_updates.store(true, Ordering::SeqCst);
        let token = manager
            .book(&office.id, BookingRequest::new("Ada"))
            .await
            .unwrap();
        assert_eq!(token.status, TokenStatus::Wait);
        assert!(manager.get_token(&token.id).await.is_ok());
    }

    // ========================================================================
    // Scenario Tests
    // ========================================================================

    #[tokio::test]
    async fn test_scenario_single_counter_four_tokens() {
        let manager = make_manager().await;
        let office = office_with(&manager, 1, 10).await;
        let booked = book_n(&manager, &office.id, 4).await;

        let snap = manager.recalculate(&office.id).await.unwrap().unwrap();
        let statuses: Vec<TokenStatus> = snap.tokens.iter().map(|t| t.status).collect();
        assert_eq!(
            statuses,
            vec![
                TokenStatus::Allocated,
                TokenStatus::Allocated,
                TokenStatus::Allocated,
                TokenStatus::Wait
            ]
        );

        let t1 = snap.token(&booked[0].id).unwrap();
        assert_eq!(t1.position, Some(1));
        assert_eq!(t1.eta_minutes, Some(0));

        let t4 = snap.token(&booked[3].id).unwrap();
        assert_eq!(t4.position, Some(4));
        assert_eq!(t4.eta_minutes, Some(30));
    }

    #[tokio::test]
    async fn test_scenario_two_counters_eta() {
        let manager = make_manager().await;
        let office = office_with(&manager, 2, 10).await;
        let booked = book_n(&manager, &office.id, 5).await;

        let snap = manager.snapshot(&office.id).await.unwrap();
        assert_eq!(snap.token(&booked[2].id).unwrap().position, Some(3));
        assert_eq!(snap.token(&booked[2].id).unwrap().eta_minutes, Some(10));
        assert_eq!(snap.token(&booked[4].id).unwrap().position, Some(5));
        assert_eq!(snap.token(&booked[4].id).unwrap().eta_minutes, Some(20));
    }

    #[tokio::test]
    async fn test_scenario_call_next_capacity() {
        let manager = make_manager().await;
        let office = office_with(&manager, 1, 10).await;
        book_n(&manager, &office.id, 3).await;

        manager.call_next(&office.id, false).await.unwrap();
        let err = manager.call_next(&office.id, false).await.unwrap_err();
        assert_eq!(err, QueueError::CapacityExceeded { counters: 1 });
        assert!(err.to_string().contains('1'));

        let forced = manager.call_next(&office.id, true).await.unwrap();
        assert_eq!(forced.status, TokenStatus::Called);
        assert_eq!(manager.snapshot(&office.id).await.unwrap().summary.called, 2);
    }

    #[tokio::test]
    async fn test_scenario_travel_time() {
        let manager = make_manager().await;
        let office = office_with(&manager, 1, 10).await;
        let token = manager
            .book(&office.id, BookingRequest::new("Ada"))
            .await
            .unwrap();
        assert_eq!(token.travel_time_minutes, 15);

        let located = manager
            .register_office(
                OfficeRegistration::new("Equator", 1).with_location(GeoPoint::new(1.0, 0.0)),
            )
            .await
            .unwrap();
        let token = manager
            .book(
                &located.id,
                BookingRequest::new("Ada").with_location(GeoPoint::new(0.0, 0.0)),
            )
            .await
            .unwrap();
        // 111.19 km at 2 min/km, rounded up
        assert_eq!(token.travel_time_minutes, 223);
    }

    #[tokio::test]
    async fn test_scenario_completion_promotes_waiting() {
        let manager = QueueManagerBuilder::new(EventEmitter::new(8))
            .with_config(EngineConfig::new().with_engaged_multiplier(1))
            .build()
            .await
            .unwrap();
        let office = office_with(&manager, 1, 10).await;
        let booked = book_n(&manager, &office.id, 2).await;

        let called = manager.call_next(&office.id, false).await.unwrap();
        assert_eq!(called.id, booked[0].id);
        let waiting = manager.get_token(&booked[1].id).await.unwrap();
        assert_eq!(waiting.status, TokenStatus::Wait);

        let done = manager.complete(&called.id).await.unwrap();
        assert_eq!(done.status, TokenStatus::Completed);
        assert!(done.completed_at.is_some());

        let promoted = manager.get_token(&booked[1].id).await.unwrap();
        assert_eq!(promoted.status, TokenStatus::Allocated);
        assert!(promoted.allocation_time.is_some());
        assert_eq!(promoted.position, Some(1));
    }

    // ========================================================================
    // Transition Tests
    // ========================================================================

    #[tokio::test]
    async fn test_complete_rejections() {
        let manager = make_manager().await;
        let office = office_with(&manager, 1, 10).await;
        let booked = book_n(&manager, &office.id, 1).await;

        let err = manager.complete("ghost").await.unwrap_err();
        assert_eq!(err, QueueError::TokenNotFound("ghost".to_string()));

        manager.call_next(&office.id, false).await.unwrap();
        manager.complete(&booked[0].id).await.unwrap();
        let err = manager.complete(&booked[0].id).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: TokenStatus::Completed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_complete_without_call() {
        let manager = QueueManagerBuilder::new(EventEmitter::new(8))
            .with_config(EngineConfig::new().with_engaged_multiplier(1))
            .build()
            .await
            .unwrap();
        let office = office_with(&manager, 1, 10).await;
        let booked = book_n(&manager, &office.id, 3).await;

        // Allocated, served without a formal call
        let done = manager.complete(&booked[0].id).await.unwrap();
        assert_eq!(done.status, TokenStatus::Completed);
        assert!(done.completed_at.is_some());
        assert!(done.called_at.is_none());

        // Still waiting
        let waiting = manager.get_token(&booked[2].id).await.unwrap();
        assert_eq!(waiting.status, TokenStatus::Wait);
        let done = manager.complete(&booked[2].id).await.unwrap();
        assert_eq!(done.status, TokenStatus::Completed);

        let next = manager.get_token(&booked[1].id).await.unwrap();
        assert_eq!(next.status, TokenStatus::Allocated);
        assert_eq!(next.position, Some(1));
    }

    #[tokio::test]
    async fn test_terminal_tokens_are_final() {
        let manager = make_manager().await;
        let office = office_with(&manager, 1, 10).await;
        let booked = book_n(&manager, &office.id, 3).await;

        let cancelled = manager.cancel(&booked[1].id).await.unwrap();
        assert_eq!(cancelled.status, TokenStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());

        manager.call_next(&office.id, false).await.unwrap();
        manager.recalculate(&office.id).await.unwrap();

        let after = manager.get_token(&booked[1].id).await.unwrap();
        assert_eq!(after, cancelled);
        assert!(manager.call_token(&booked[1].id, true).await.is_err());
        assert!(manager.cancel(&booked[1].id).await.is_err());
        assert!(manager.no_show(&booked[1].id).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_reflows_positions() {
        let manager = make_manager().await;
        let office = office_with(&manager, 1, 10).await;
        let booked = book_n(&manager, &office.id, 3).await;

        manager.cancel(&booked[0].id).await.unwrap();
        let t3 = manager.get_token(&booked[2].id).await.unwrap();
        assert_eq!(t3.position, Some(2));
        assert_eq!(t3.eta_minutes, Some(10));
    }

    #[tokio::test]
    async fn test_no_show_frees_slot() {
        let manager = QueueManagerBuilder::new(EventEmitter::new(8))
            .with_config(EngineConfig::new().with_engaged_multiplier(1))
            .build()
            .await
            .unwrap();
        let office = office_with(&manager, 1, 10).await;
        let booked = book_n(&manager, &office.id, 3).await;

        let marked = manager.no_show(&booked[0].id).await.unwrap();
        assert_eq!(marked.status, TokenStatus::NoShow);
        assert!(marked.cancelled_at.is_some());
        // Freed slot goes to the earliest waiting token
        let next = manager.get_token(&booked[1].id).await.unwrap();
        assert_eq!(next.status, TokenStatus::Allocated);

        let waiting = manager.no_show(&booked[2].id).await.unwrap();
        assert_eq!(waiting.status, TokenStatus::NoShow);

        let err = manager.no_show(&booked[0].id).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { from: TokenStatus::NoShow, .. }));
    }

    #[tokio::test]
    async fn test_requeue_goes_to_back_by_default() {
        let manager = make_manager().await;
        let office = office_with(&manager, 1, 10).await;
        let booked = book_n(&manager, &office.id, 3).await;

        let called = manager.call_next(&office.id, false).await.unwrap();
        manager.no_show(&called.id).await.unwrap();
        let requeued = manager.requeue(&called.id).await.unwrap();

        assert_eq!(requeued.created_at, booked[0].created_at);
        assert!(requeued.queued_at > booked[2].queued_at);
        assert!(requeued.called_at.is_none());
        assert!(requeued.cancelled_at.is_none());
        assert_eq!(requeued.position, Some(3));

        let err = manager.requeue(&booked[1].id).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { action: "requeue", .. }));
    }

    #[tokio::test]
    async fn test_requeue_original_keeps_booking_order() {
        let manager = QueueManagerBuilder::new(EventEmitter::new(8))
            .with_config(EngineConfig::new().with_requeue_policy(RequeuePolicy::Original))
            .build()
            .await
            .unwrap();
        let office = office_with(&manager, 1, 10).await;
        let booked = book_n(&manager, &office.id, 3).await;

        let called = manager.call_next(&office.id, false).await.unwrap();
        manager.no_show(&called.id).await.unwrap();
        let requeued = manager.requeue(&called.id).await.unwrap();

        assert_eq!(requeued.queued_at, booked[0].queued_at);
        assert_eq!(requeued.position, Some(1));
        // The slot freed by the no-show is still open
        assert_eq!(requeued.status, TokenStatus::Allocated);
    }

    #[tokio::test]
    async fn test_call_surfaces_recalculation_failure() {
        let storage = Arc::new(FlakyStorage::new());
        let manager = QueueManagerBuilder::new(EventEmitter::new(8))
            .with_storage(storage.clone())
            .build()
            .await
            .unwrap();
        let office = office_with(&manager, 1, 10).await;
        let booked = book_n(&manager, &office.id, 2).await;

        storage.fail_updates.store(true, Ordering::SeqCst);
        let err = manager.call_next(&office.id, false).await.unwrap_err();
        assert!(matches!(err, QueueError::RecalculationFailure { .. }));

        storage.fail_updates.store(false, Ordering::SeqCst);
        manager.call_next(&office.id, false).await.unwrap();
        storage.fail_updates.store(true, Ordering::SeqCst);
        let err = manager.complete(&booked[0].id).await.unwrap_err();
        assert!(matches!(err, QueueError::RecalculationFailure { .. }));
        // The status write itself is durable
        let stored = manager.get_token(&booked[0].id).await.unwrap();
        assert_eq!(stored.status, TokenStatus::Completed);
    }

    // ========================================================================
    // Invariant Tests
    // ========================================================================

    #[tokio::test]
    async fn test_engaged_cap_and_fifo_hold_through_mixed_operations() {
        let manager = make_manager().await;
        let office = office_with(&manager, 2, 10).await;
        let booked = book_n(&manager, &office.id, 12).await;

        manager.call_next(&office.id, false).await.unwrap();
        manager.call_next(&office.id, false).await.unwrap();
        manager.cancel(&booked[5].id).await.unwrap();
        manager.complete(&booked[0].id).await.unwrap();
        manager.call_next(&office.id, false).await.unwrap();
        book_n(&manager, &office.id, 3).await;

        let snap = manager.snapshot(&office.id).await.unwrap();
        assert!(snap.summary.engaged() <= snap.summary.max_allocated as usize);
        assert!(snap.summary.called <= snap.summary.counters as usize);

        for pair in snap.tokens.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
            assert!(pair[0].position < pair[1].position);
        }
        let positions: Vec<u32> = snap.tokens.iter().filter_map(|t| t.position).collect();
        let expected: Vec<u32> = (1..=snap.tokens.len() as u32).collect();
        assert_eq!(positions, expected);
    }

    #[tokio::test]
    async fn test_concurrent_bookings_get_distinct_numbers() {
        let manager = Arc::new(make_manager().await);
        let office = office_with(&manager, 2, 10).await;

        let mut handles = Vec::new();
        for i in 0..50 {
            let manager = Arc::clone(&manager);
            let office_id = office.id.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .book(&office_id, BookingRequest::new(format!("C{}", i)))
                    .await
                    .unwrap()
                    .token_number
            }));
        }

        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap());
        }
        numbers.sort_unstable();
        let expected: Vec<u32> = (1..=50).collect();
        assert_eq!(numbers, expected);

        let snap = manager.snapshot(&office.id).await.unwrap();
        assert_eq!(snap.summary.engaged(), 6);
        assert_eq!(snap.summary.wait, 44);
    }

    #[tokio::test]
    async fn test_concurrent_calls_completions_and_bookings_keep_caps() {
        let manager = Arc::new(
            QueueManagerBuilder::new(EventEmitter::new(1024))
                .with_config(EngineConfig::new().with_snapshot_capacity(4096))
                .build()
                .await
                .unwrap(),
        );
        let office = office_with(&manager, 2, 10).await;
        let mut sub = manager.subscribe(&office.id);
        book_n(&manager, &office.id, 10).await;

        let mut handles = Vec::new();
        for i in 0..20 {
            let manager = Arc::clone(&manager);
            let office_id = office.id.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .book(&office_id, BookingRequest::new(format!("Late {}", i)))
                    .await
                    .unwrap();
            }));
        }
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            let office_id = office.id.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..4 {
                    match manager.call_next(&office_id, false).await {
                        Ok(token) => {
                            tokio::task::yield_now().await;
                            manager.complete(&token.id).await.unwrap();
                        }
                        Err(err) => assert!(matches!(
                            err,
                            QueueError::CapacityExceeded { .. } | QueueError::QueueEmpty(_)
                        )),
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut seen = 0;
        while let Ok(Some(snap)) = tokio::time::timeout(Duration::from_millis(20), sub.recv()).await {
            assert!(snap.summary.called <= snap.summary.counters as usize);
            assert!(snap.summary.engaged() <= snap.summary.max_allocated as usize);
            seen += 1;
        }
        assert!(seen > 0);

        let snap = manager.snapshot(&office.id).await.unwrap();
        assert!(snap.summary.called <= 2);
        assert!(snap.summary.engaged() <= 6);
        let positions: Vec<u32> = snap.tokens.iter().filter_map(|t| t.position).collect();
        let expected: Vec<u32> = (1..=snap.tokens.len() as u32).collect();
        assert_eq!(positions, expected);
    }

    // ========================================================================
    // Subscription Tests
    // ========================================================================

    #[tokio::test]
    async fn test_subscribers_see_every_mutation() {
        let manager = make_manager().await;
        let office = office_with(&manager, 1, 10).await;
        let mut sub = manager.subscribe(&office.id);

        book_n(&manager, &office.id, 1).await;
        let snap = tokio::time::timeout(Duration::from_millis(200), sub.recv())
            .await
            .expect("Timeout")
            .expect("Stream ended");
        assert_eq!(snap.summary.allocated, 1);

        manager.call_next(&office.id, false).await.unwrap();
        // Pre-call and post-call passes both publish
        let mut last = None;
        for _ in 0..2 {
            last = tokio::time::timeout(Duration::from_millis(200), sub.recv())
                .await
                .expect("Timeout");
        }
        assert_eq!(last.unwrap().summary.called, 1);
    }

    #[tokio::test]
    async fn test_office_event_stream() {
        let manager = make_manager().await;
        let office = office_with(&manager, 1, 10).await;
        let other = office_with(&manager, 1, 10).await;
        let mut stream = manager.subscribe_office_events(&office.id);

        book_n(&manager, &other.id, 1).await;
        book_n(&manager, &office.id, 1).await;

        let booked = tokio::time::timeout(Duration::from_millis(200), stream.recv())
            .await
            .expect("Timeout")
            .expect("Stream ended");
        assert_eq!(booked.key, events::TOKEN_BOOKED);
        assert_eq!(booked.office_id(), Some(office.id.as_str()));
    }

    #[tokio::test]
    async fn test_notifications_on_allocation_and_call() {
        let notifier = Arc::new(BroadcastNotifier::new(32));
        let manager = QueueManagerBuilder::new(EventEmitter::new(8))
            .with_notifier(notifier.clone())
            .build()
            .await
            .unwrap();
        let office = office_with(&manager, 1, 10).await;
        let mut rx = notifier.subscribe();

        book_n(&manager, &office.id, 1).await;
        assert_eq!(rx.recv().await.unwrap().kind, NotificationKind::Allocated);

        manager.call_next(&office.id, false).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, NotificationKind::Called);

        // Anonymous bookings produce no notification
        manager
            .book(&office.id, BookingRequest::new("Walk-in"))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }
}
