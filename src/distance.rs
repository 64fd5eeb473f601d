//! Travel-time estimate from great-circle distance
//!
//! The estimate is advisory: it is stored on the token for display and never
//! influences queue order.

use crate::error::{QueueError, Result};
use serde::{Deserialize, Serialize};

/// Mean Earth radius in kilometres
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Travel time used when either endpoint is unknown
pub const DEFAULT_TRAVEL_MINUTES: u32 = 15;

/// Minutes of travel assumed per kilometre
pub const TRAVEL_MINUTES_PER_KM: f64 = 2.0;

/// A (latitude, longitude) pair in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Reject non-finite or out-of-range coordinates
    pub fn validate(&self) -> Result<()> {
        let lat_ok = self.latitude.is_finite() && (-90.0..=90.0).contains(&self.latitude);
        let lon_ok = self.longitude.is_finite() && (-180.0..=180.0).contains(&self.longitude);
        if lat_ok && lon_ok {
            Ok(())
        } else {
            Err(QueueError::InvalidInput(format!(
                "coordinates out of range: ({}, {})",
                self.latitude, self.longitude
            )))
        }
    }
}

/// Haversine distance between two points, in kilometres
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// Converts customer/office positions into a travel-time estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceEstimator {
    default_minutes: u32,
    minutes_per_km: f64,
}

impl Default for DistanceEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_TRAVEL_MINUTES, TRAVEL_MINUTES_PER_KM)
    }
}

impl DistanceEstimator {
    pub fn new(default_minutes: u32, minutes_per_km: f64) -> Self {
        Self {
            default_minutes,
            minutes_per_km,
        }
    }

    /// Estimated travel minutes, rounded up.
    ///
    /// Falls back to the default when either point is missing.
    pub fn travel_minutes(&self, customer: Option<GeoPoint>, office: Option<GeoPoint>) -> u32 {
        match (customer, office) {
            (Some(from), Some(to)) => {
                let minutes = (haversine_km(from, to) * self.minutes_per_km).ceil();
                if minutes.is_finite() && minutes >= 0.0 {
                    minutes.min(u32::MAX as f64) as u32
                } else {
                    self.default_minutes
                }
            }
            _ => self.default_minutes,
        }
    }
}
