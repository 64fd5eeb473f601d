//! Office capacity policy
//!
//! Derives the two constants the engine schedules against:
//! - `counters` (N): physical service points, bounds CALLED tokens
//! - `max_engaged` (M): cap on ALLOCATED + CALLED tokens, `3 x N` unless overridden

use crate::error::{QueueError, Result};
use crate::model::Office;
use serde::{Deserialize, Serialize};

/// Capacity constants for one office
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityPolicy {
    pub counters: u32,
    pub max_engaged: u32,
}

impl CapacityPolicy {
    /// Validate raw settings and derive the engaged cap
    pub fn new(counter_count: u32, max_allocated: Option<u32>, multiplier: u32) -> Result<Self> {
        if counter_count < 1 {
            return Err(QueueError::InvalidInput(
                "counter count must be at least 1".to_string(),
            ));
        }
        let max_engaged = match max_allocated {
            Some(0) => {
                return Err(QueueError::InvalidInput(
                    "max allocated must be at least 1".to_string(),
                ))
            }
            Some(m) => m,
            None => counter_count.saturating_mul(multiplier.max(1)),
        };
        Ok(Self {
            counters: counter_count,
            max_engaged,
        })
    }

    pub fn for_office(office: &Office, multiplier: u32) -> Result<Self> {
        Self::new(office.counter_count, office.max_allocated, multiplier)
    }

    /// Promotion slots left given the current engaged count
    pub fn open_slots(&self, engaged: usize) -> usize {
        (self.max_engaged as usize).saturating_sub(engaged)
    }

    /// Whether another token may be called without overriding the counter limit
    pub fn can_call(&self, called: usize) -> bool {
        called < self.counters as usize
    }
}
