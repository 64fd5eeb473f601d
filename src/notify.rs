//! Best-effort user notifications
//!
//! The engine tells a token's owner when they should start travelling
//! (allocation) and when a counter is waiting for them (call). Delivery content
//! and transport live outside this crate; implementations of [`Notifier`] must
//! return immediately.

use crate::model::{OfficeId, Token, TokenId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Why a user is being notified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Token promoted to ALLOCATED: proceed toward the office
    Allocated,
    /// Token called to a counter
    Called,
}

/// Notification addressed to one registered user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserNotification {
    pub user_id: UserId,
    pub office_id: OfficeId,
    pub token_id: TokenId,
    pub token_number: u32,
    pub kind: NotificationKind,
    pub message: String,
}

impl UserNotification {
    /// Build a notification for the token's owner; `None` for anonymous tokens
    pub fn for_token(token: &Token, kind: NotificationKind) -> Option<Self> {
        let user_id = token.user_id.clone()?;
        let message = match kind {
            NotificationKind::Allocated => format!(
                "Token #{} is allocated, please proceed to the office",
                token.token_number
            ),
            NotificationKind::Called => {
                format!("Token #{}: it's your turn now", token.token_number)
            }
        };
        Some(Self {
            user_id,
            office_id: token.office_id.clone(),
            token_id: token.id.clone(),
            token_number: token.token_number,
            kind,
            message,
        })
    }
}

/// Notification sink
pub trait Notifier: Send + Sync {
    /// Deliver without blocking; failures are the sink's concern
    fn notify_user(&self, notification: UserNotification);
}

/// Logs notifications through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify_user(&self, notification: UserNotification) {
        tracing::info!(
            user_id = %notification.user_id,
            token_id = %notification.token_id,
            kind = ?notification.kind,
            "a3s.queue.notify: {}",
            notification.message
        );
    }
}

/// Fans notifications out to in-process subscribers
#[derive(Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<UserNotification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UserNotification> {
        self.sender.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn notify_user(&self, notification: UserNotification) {
        let _ = self.sender.send(notification);
    }
}
