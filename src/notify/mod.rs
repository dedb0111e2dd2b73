//! Trade notifications.
//!
//! Delivery is fire-and-forget: the engine logs the outcome and never lets
//! it touch a recorded trade.

mod format;
mod telegram;

pub use format::format_trade_notification;
pub use telegram::TelegramNotifier;

use async_trait::async_trait;
use serde::Serialize;

/// What happened to a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum NotificationOutcome {
    Sent,
    Skipped { reason: String },
    Failed { error: String },
}

/// Sink for human-readable trade alerts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> NotificationOutcome;
}

/// Notifier that drops every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, _message: &str) -> NotificationOutcome {
        NotificationOutcome::Skipped {
            reason: "notifications disabled".to_string(),
        }
    }
}
