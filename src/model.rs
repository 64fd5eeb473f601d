//! Office and token records
//!
//! These are the records the storage layer persists and the engine reads.
//! Timing fields are `chrono::DateTime<Utc>`; identifiers are strings (UUID v4
//! when generated by the manager).

use crate::distance::GeoPoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Office identifier
pub type OfficeId = String;

/// Token identifier
pub type TokenId = String;

/// Registered user identifier
pub type UserId = String;

/// Default average service time per counter, in minutes
pub const DEFAULT_AVG_SERVICE_MINUTES: u32 = 10;

/// Token lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenStatus {
    Wait,
    Allocated,
    Called,
    Completed,
    Cancelled,
    NoShow,
}

impl TokenStatus {
    /// Terminal states are final: the engine never writes to them again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::NoShow)
    }

    /// Engaged tokens count against the office's M cap
    pub fn is_engaged(self) -> bool {
        matches!(self, Self::Allocated | Self::Called)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wait => "WAIT",
            Self::Allocated => "ALLOCATED",
            Self::Called => "CALLED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::NoShow => "NO_SHOW",
        }
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pause metadata for an office
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PauseState {
    pub is_paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
}

impl PauseState {
    /// Paused since `at`
    pub fn paused(reason: Option<String>, message: Option<String>, at: DateTime<Utc>) -> Self {
        Self {
            is_paused: true,
            reason,
            message,
            paused_at: Some(at),
        }
    }

    /// Not paused, metadata cleared
    pub fn running() -> Self {
        Self::default()
    }
}

/// An organization operating one queue with N service counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Office {
    pub id: OfficeId,
    pub name: String,
    /// Number of service counters (N)
    pub counter_count: u32,
    /// Explicit engaged-token cap; `None` derives it from the counter count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_allocated: Option<u32>,
    pub avg_service_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub pause: PauseState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Office {
    pub fn is_paused(&self) -> bool {
        self.pause.is_paused
    }
}

/// Customer identity and contact details captured at booking
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl CustomerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phone: None,
            email: None,
        }
    }
}

/// A customer's place in an office's queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub office_id: OfficeId,
    /// Per-office sequence number, starting at 1
    pub token_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub customer: CustomerInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    pub travel_time_minutes: u32,
    pub status: TokenStatus,
    /// Immutable booking time
    pub created_at: DateTime<Utc>,
    /// FIFO ordering key; equals `created_at` unless the token was re-queued to the back
    pub queued_at: DateTime<Utc>,
    pub allocation_time: Option<DateTime<Utc>>,
    pub called_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Predicted call time while waiting, actual call time once called
    pub service_start_time: Option<DateTime<Utc>>,
    pub eta_minutes: Option<u32>,
    /// 1-based position in the office queue
    pub position: Option<u32>,
    pub last_updated_at: DateTime<Utc>,
}

impl Token {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// FIFO sort key; the token number breaks timestamp ties in insertion order
    pub fn fifo_key(&self) -> (DateTime<Utc>, u32) {
        (self.queued_at, self.token_number)
    }
}

/// Partial update of a token's status and timing fields.
///
/// Fields left as `None` are not touched. Nullable timestamps use a nested
/// `Option`: `Some(None)` clears the stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenUpdate {
    pub status: Option<TokenStatus>,
    pub queued_at: Option<DateTime<Utc>>,
    pub allocation_time: Option<Option<DateTime<Utc>>>,
    pub called_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub cancelled_at: Option<Option<DateTime<Utc>>>,
    pub service_start_time: Option<Option<DateTime<Utc>>>,
    pub eta_minutes: Option<Option<u32>>,
    pub position: Option<Option<u32>>,
}

impl TokenUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TokenStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn queued_at(mut self, at: DateTime<Utc>) -> Self {
        self.queued_at = Some(at);
        self
    }

    pub fn allocation_time(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.allocation_time = Some(at);
        self
    }

    pub fn called_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.called_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn cancelled_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.cancelled_at = Some(at);
        self
    }

    pub fn service_start_time(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.service_start_time = Some(at);
        self
    }

    pub fn eta_minutes(mut self, eta: Option<u32>) -> Self {
        self.eta_minutes = Some(eta);
        self
    }

    pub fn position(mut self, position: Option<u32>) -> Self {
        self.position = Some(position);
        self
    }

    /// Apply the passed fields to `token` and stamp `last_updated_at`
    pub fn apply_to(&self, token: &mut Token, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            token.status = status;
        }
        if let Some(at) = self.queued_at {
            token.queued_at = at;
        }
        if let Some(at) = self.allocation_time {
            token.allocation_time = at;
        }
        if let Some(at) = self.called_at {
            token.called_at = at;
        }
        if let Some(at) = self.completed_at {
            token.completed_at = at;
        }
        if let Some(at) = self.cancelled_at {
            token.cancelled_at = at;
        }
        if let Some(at) = self.service_start_time {
            token.service_start_time = at;
        }
        if let Some(eta) = self.eta_minutes {
            token.eta_minutes = eta;
        }
        if let Some(position) = self.position {
            token.position = position;
        }
        token.last_updated_at = now;
    }
}

/// Capacity configuration written by the admin surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityUpdate {
    pub counter_count: u32,
    /// `None` removes the override and falls back to the derived cap
    pub max_allocated: Option<u32>,
    /// `None` keeps the current value
    pub avg_service_minutes: Option<u32>,
}


#[cfg(test)]
mod tests {
    use super::fixtures::token;
    use super::*;

    #[test]
    fn test_status_classes() {
        assert!(TokenStatus::Completed.is_terminal());
        assert!(TokenStatus::Cancelled.is_terminal());
        assert!(TokenStatus::NoShow.is_terminal());
        assert!(!TokenStatus::Wait.is_terminal());

        assert!(TokenStatus::Allocated.is_engaged());
        assert!(TokenStatus::Called.is_engaged());
        assert!(!TokenStatus::Wait.is_engaged());
        assert!(!TokenStatus::Completed.is_engaged());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TokenStatus::NoShow).unwrap();
        assert_eq!(json, "\"NO_SHOW\"");
        let parsed: TokenStatus = serde_json::from_str("\"ALLOCATED\"").unwrap();
        assert_eq!(parsed, TokenStatus::Allocated);
        assert_eq!(TokenStatus::Wait.to_string(), "WAIT");
    }

    #[test]
    fn test_update_touches_only_passed_fields() {
        let mut t = token("o", 1, TokenStatus::Allocated, 0);
        let allocated_at = Utc::now();
        t.allocation_time = Some(allocated_at);

        let now = Utc::now();
        TokenUpdate::new()
            .eta_minutes(Some(20))
            .position(Some(3))
            .apply_to(&mut t, now);

        assert_eq!(t.status, TokenStatus::Allocated);
        assert_eq!(t.allocation_time, Some(allocated_at));
        assert_eq!(t.eta_minutes, Some(20));
        assert_eq!(t.position, Some(3));
        assert_eq!(t.last_updated_at, now);
    }

    #[test]
    fn test_update_can_clear_nullable_fields() {
        let mut t = token("o", 1, TokenStatus::NoShow, 0);
        t.called_at = Some(Utc::now());
        t.cancelled_at = Some(Utc::now());

        TokenUpdate::new()
            .status(TokenStatus::Wait)
            .called_at(None)
            .cancelled_at(None)
            .apply_to(&mut t, Utc::now());

        assert_eq!(t.status, TokenStatus::Wait);
        assert!(t.called_at.is_none());
        assert!(t.cancelled_at.is_none());
    }

    #[test]
    fn test_fifo_key_breaks_ties_by_number() {
        let a = token("o", 1, TokenStatus::Wait, 0);
        let b = token("o", 2, TokenStatus::Wait, 0);
        assert!(a.fifo_key() < b.fifo_key());
    }

    #[test]
    fn test_token_serialization() {
        let t = token("o", 7, TokenStatus::Wait, 30);
        let json = serde_json::to_string(&t).unwrap();
        assert!(json.contains("\"status\":\"WAIT\""));
        let parsed: Token = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, t);
    }
}
