//! Telegram Bot API notifier.

use super::{NotificationOutcome, Notifier};
use crate::config::TelegramConfig;
use crate::utils::mask_secret;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const TELEGRAM_API_URL: &str = "https://api.telegram.org";

/// Sends alerts through `sendMessage`.
pub struct TelegramNotifier {
    http: Client,
    base_url: String,
    token: Option<String>,
    chat_id: Option<String>,
}

impl TelegramNotifier {
    /// Create a notifier from configuration. Missing credentials are allowed;
    /// sends are then skipped.
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        debug!(
            token = %mask_secret(config.token.as_deref()),
            chat_id = %mask_secret(config.chat_id.as_deref()),
            "Telegram notifier configured"
        );

        Ok(Self {
            http,
            base_url: TELEGRAM_API_URL.to_string(),
            token: config.token.clone(),
            chat_id: config.chat_id.clone(),
        })
    }

    /// Point the client at another API host.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Token and chat id, unless missing or still the sample placeholders.
    fn credentials(&self) -> Option<(&str, &str)> {
        let token = self.token.as_deref().filter(|t| !t.trim().is_empty())?;
        let chat_id = self.chat_id.as_deref().filter(|c| !c.trim().is_empty())?;

        let placeholder = |v: &str| v.to_lowercase().contains("your_telegram");
        if placeholder(token) || placeholder(chat_id) {
            return None;
        }
        Some((token, chat_id))
    }
}

/// Numeric chat ids go out as integers, `@channel` names as strings.
fn chat_id_value(chat_id: &str) -> Value {
    chat_id
        .parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(chat_id))
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, message: &str) -> NotificationOutcome {
        let Some((token, chat_id)) = self.credentials() else {
            warn!("Telegram credentials not configured; skipping notification");
            return NotificationOutcome::Skipped {
                reason: "Telegram credentials not configured".to_string(),
            };
        };

        let url = format!("{}/bot{}/sendMessage", self.base_url, token);
        let payload = json!({
            "chat_id": chat_id_value(chat_id),
            "text": message,
        });

        let response = match self.http.post(&url).json(&payload).send().await {
            Ok(response) => response,
            Err(e) => {
                // The request URL carries the bot token
                let e = e.without_url();
                error!(error = %e, "Failed to send Telegram notification");
                return NotificationOutcome::Failed {
                    error: e.to_string(),
                };
            }
        };

        let status = response.status();
        if status.is_success() {
            info!(chat_id = %chat_id, "Telegram notification sent");
            return NotificationOutcome::Sent;
        }

        let description = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|body| body.get("description").and_then(Value::as_str).map(String::from))
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_string());

        let error = if status == StatusCode::BAD_REQUEST {
            format!("Bad Request: {description}")
        } else {
            format!("HTTP {}: {description}", status.as_u16())
        };
        error!(%error, "Telegram API error");
        NotificationOutcome::Failed { error }
    }
}
