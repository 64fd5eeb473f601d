//! Engine configuration types

use crate::distance::{DistanceEstimator, DEFAULT_TRAVEL_MINUTES, TRAVEL_MINUTES_PER_KM};
use crate::model::DEFAULT_AVG_SERVICE_MINUTES;
use serde::{Deserialize, Serialize};

/// Where a re-queued no-show token lands in the FIFO order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequeuePolicy {
    /// Behind every token currently queued
    #[default]
    Back,
    /// At its original booking position
    Original,
}

/// Engine-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// M = multiplier x N when an office has no explicit override
    pub engaged_multiplier: u32,
    /// Service minutes given to offices registered without one
    pub default_avg_service_minutes: u32,
    /// Travel estimate when a position is unknown
    pub default_travel_minutes: u32,
    /// Travel minutes per kilometre of great-circle distance
    pub travel_minutes_per_km: f64,
    /// Buffered snapshots per office before slow subscribers start lagging
    pub snapshot_capacity: usize,
    /// Buffered lifecycle events before slow subscribers start lagging
    pub event_capacity: usize,
    #[serde(default)]
    pub requeue_policy: RequeuePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engaged_multiplier: 3,
            default_avg_service_minutes: DEFAULT_AVG_SERVICE_MINUTES,
            default_travel_minutes: DEFAULT_TRAVEL_MINUTES,
            travel_minutes_per_km: TRAVEL_MINUTES_PER_KM,
            snapshot_capacity: 64,
            event_capacity: 256,
            requeue_policy: RequeuePolicy::Back,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the engaged-token multiplier (builder pattern)
    pub fn with_engaged_multiplier(mut self, multiplier: u32) -> Self {
        self.engaged_multiplier = multiplier;
        self
    }

    /// Set the default service minutes (builder pattern)
    pub fn with_default_avg_service_minutes(mut self, minutes: u32) -> Self {
        self.default_avg_service_minutes = minutes;
        self
    }

    /// Set travel estimation parameters (builder pattern)
    pub fn with_travel_estimate(mut self, default_minutes: u32, minutes_per_km: f64) -> Self {
        self.default_travel_minutes = default_minutes;
        self.travel_minutes_per_km = minutes_per_km;
        self
    }

    /// Set snapshot channel capacity (builder pattern)
    pub fn with_snapshot_capacity(mut self, capacity: usize) -> Self {
        self.snapshot_capacity = capacity;
        self
    }

    /// Set event channel capacity (builder pattern)
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set requeue policy (builder pattern)
    pub fn with_requeue_policy(mut self, policy: RequeuePolicy) -> Self {
        self.requeue_policy = policy;
        self
    }

    pub fn distance_estimator(&self) -> DistanceEstimator {
        DistanceEstimator::new(self.default_travel_minutes, self.travel_minutes_per_km)
    }
}
