//! # A3S Token Queue
//!
//! Walk-in token queues for offices with a fixed number of service counters.
//!
//! - Per-office FIFO queue with WAIT -> ALLOCATED promotion under an engaged cap
//! - ETA and position recalculation after every mutation
//! - "Call next" protocol bounded by the counter count, with force override
//! - Pause/resume, capacity reconfiguration, no-show and re-queue handling
//! - Live per-office snapshots and lifecycle events for subscribers
//! - Persistent storage (pluggable `Storage` trait, `LocalStorage` included)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use a3s_token_queue::{BookingRequest, EventEmitter, OfficeRegistration, QueueManagerBuilder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = QueueManagerBuilder::new(EventEmitter::new(100))
//!         .build()
//!         .await?;
//!
//!     let office = manager
//!         .register_office(OfficeRegistration::new("Main branch", 2))
//!         .await?;
//!     let mut live = manager.subscribe(&office.id);
//!
//!     let token = manager
//!         .book(&office.id, BookingRequest::new("Ada").with_user("user-1"))
//!         .await?;
//!     println!("Token #{} eta {:?} min", token.token_number, token.eta_minutes);
//!
//!     let called = manager.call_next(&office.id, false).await?;
//!     manager.complete(&called.id).await?;
//!
//!     if let Some(snapshot) = live.recv().await {
//!         println!("{} waiting", snapshot.summary.wait);
//!     }
//!     Ok(())
//! }
//! ```

pub mod capacity;
pub mod config;
pub mod dispatcher;
pub mod distance;
pub mod engine;
pub mod error;
pub mod event;
pub mod manager;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod snapshot;
pub mod storage;

pub use capacity::CapacityPolicy;
pub use config::{EngineConfig, RequeuePolicy};
pub use dispatcher::CallDispatcher;
pub use distance::{haversine_km, DistanceEstimator, GeoPoint};
pub use engine::{plan_recalculation, Assignment, QueueEngine, RecalculationPlan};
pub use error::{QueueError, Result};
pub use event::{events, EventEmitter, EventPayload, EventStream, QueueEvent};
pub use manager::{BookingRequest, OfficeRegistration, QueueManager, QueueManagerBuilder};
pub use metrics::{
    metric_names, HistogramStats, LocalMetrics, MetricsBackend, MetricsSnapshot, QueueMetrics,
};
pub use model::{
    CapacityUpdate, CustomerInfo, Office, OfficeId, PauseState, Token, TokenId, TokenStatus,
    TokenUpdate, UserId,
};
pub use notify::{BroadcastNotifier, NotificationKind, Notifier, TracingNotifier, UserNotification};
pub use snapshot::{QueueSnapshot, QueueSummary, SnapshotPublisher, SnapshotSubscription};
pub use storage::{LocalStorage, MemoryStorage, OfficeStore, Storage, TokenStore};
