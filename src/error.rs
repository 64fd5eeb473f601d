//! Error types for the token queue
//!
//! All errors implement the `std::error::Error` trait via `thiserror::Error`.
//!
//! # Error Handling
//!
//! The [`QueueError`] enum covers every rejected operation:
//! - Lookup failures (office or token absent)
//! - Input validation (missing customer name, non-positive counter count)
//! - Dispatch refusals (counter bank full, nothing to call, office paused)
//! - Lifecycle violations (mutating a token that already reached a terminal state)
//! - Recalculation failures (the engine could not persist a consistent view)
//!
//! # Example
//!
//! ```rust,ignore
//! use a3s_token_queue::{QueueManager, QueueError};
//!
//! match manager.call_next(&office_id, false).await {
//!     Ok(token) => println!("Now serving #{}", token.token_number),
//!     Err(QueueError::CapacityExceeded { counters }) => {
//!         eprintln!("All {} counters are busy", counters);
//!     }
//!     Err(QueueError::QueueEmpty(_)) => println!("Nobody waiting"),
//!     Err(e) => eprintln!("Unexpected error: {}", e),
//! }
//! ```

use crate::model::TokenStatus;
use thiserror::Error;

/// Token queue error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    /// Office not found
    #[error("Office not found: {0}")]
    OfficeNotFound(String),

    /// Token not found
    #[error("Token not found: {0}")]
    TokenNotFound(String),

    /// Missing or malformed input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Every counter is already serving a called token
    #[error("All {counters} counters are busy")]
    CapacityExceeded { counters: u32 },

    /// Calling a waiting token would push the office past its engaged cap
    #[error("All {max_engaged} engaged slots are taken")]
    EngagedCapReached { max_engaged: u32 },

    /// Nothing eligible to call
    #[error("Queue is empty for office {0}")]
    QueueEmpty(String),

    /// Calling is suspended while the office is paused
    #[error("Office {0} is paused")]
    OfficePaused(String),

    /// Token cannot take the requested transition from its current status
    #[error("Cannot {action} token {token_id} in status {from}")]
    InvalidTransition {
        token_id: String,
        from: TokenStatus,
        action: &'static str,
    },

    /// The engine could not persist a consistent queue view
    #[error("Recalculation failed for office {office_id}: {reason}")]
    RecalculationFailure { office_id: String, reason: String },

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),
}

impl QueueError {
    /// True for the lookup failures (`OfficeNotFound`, `TokenNotFound`)
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::OfficeNotFound(_) | Self::TokenNotFound(_))
    }
}

/// Result type alias using QueueError
pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_office_not_found_error() {
        let error = QueueError::OfficeNotFound("o-1".to_string());
        assert_eq!(error.to_string(), "Office not found: o-1");
        assert!(error.is_not_found());
    }

    #[test]
    fn test_token_not_found_error() {
        let error = QueueError::TokenNotFound("t-9".to_string());
        assert_eq!(error.to_string(), "Token not found: t-9");
        assert!(error.is_not_found());
    }

    #[test]
    fn test_capacity_exceeded_names_counters() {
        let error = QueueError::CapacityExceeded { counters: 4 };
        assert_eq!(error.to_string(), "All 4 counters are busy");
        assert!(!error.is_not_found());
    }

    #[test]
    fn test_engaged_cap_error() {
        let error = QueueError::EngagedCapReached { max_engaged: 3 };
        assert_eq!(error.to_string(), "All 3 engaged slots are taken");
    }

    #[test]
    fn test_invalid_transition_error() {
        let error = QueueError::InvalidTransition {
            token_id: "t-1".to_string(),
            from: TokenStatus::Completed,
            action: "complete",
        };
        assert_eq!(
            error.to_string(),
            "Cannot complete token t-1 in status COMPLETED"
        );
    }

    #[test]
    fn test_recalculation_failure_error() {
        let error = QueueError::RecalculationFailure {
            office_id: "o-1".to_string(),
            reason: "disk full".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Recalculation failed for office o-1: disk full"
        );
    }

    #[test]
    fn test_queue_empty_and_paused() {
        assert_eq!(
            QueueError::QueueEmpty("o-2".to_string()).to_string(),
            "Queue is empty for office o-2"
        );
        assert_eq!(
            QueueError::OfficePaused("o-2".to_string()).to_string(),
            "Office o-2 is paused"
        );
    }

    #[test]
    fn test_error_debug() {
        let error = QueueError::InvalidInput("customer name is required".to_string());
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("InvalidInput"));
    }
}
