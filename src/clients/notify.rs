// Notification sinks: tracing log and Telegram bot

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::clients::{NotificationSink, NotifyError};
use crate::config::NotificationConfig;
use crate::core::monitoring::Alert;

pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";

/// Writes alerts to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        info!(target: "grid_trading_engine::alerts", "{}", alert.headline());
        Ok(())
    }
}

/// Posts alerts to a Telegram chat through the Bot API
pub struct TelegramNotifier {
    client: reqwest::Client,
    base_url: String,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, chat_id: &str) -> Self {
        Self::with_base_url(TELEGRAM_API_URL, bot_token, chat_id)
    }

    pub fn with_base_url(base_url: &str, bot_token: &str, chat_id: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
        }
    }

    /// Build from the notification section, failing when credentials are missing
    pub fn from_config(config: &NotificationConfig) -> Result<Self, NotifyError> {
        match (&config.telegram_bot_token, &config.telegram_chat_id) {
            (Some(token), Some(chat)) if !token.is_empty() && !chat.is_empty() => Ok(Self::new(token, chat)),
            _ => Err(NotifyError::NotConfigured(
                "notification.telegram_bot_token and telegram_chat_id are required".to_string(),
            )),
        }
    }

    fn render(alert: &Alert) -> String {
        let mut text = format!("<b>{}</b>", escape_html(&alert.headline()));
        text.push_str(&format!("\n{}", alert.timestamp.format("%Y-%m-%d %H:%M:%S UTC")));
        if !alert.context.risk_level.is_empty() {
            text.push_str(&format!(
                "\nrisk: {} | daily P&L: {:.2} | drawdown: {:.2}% | open: {}",
                escape_html(&alert.context.risk_level),
                alert.context.daily_pnl,
                alert.context.drawdown_pct,
                alert.context.open_positions
            ));
        }
        text
    }
}

/// Telegram's HTML parse mode rejects messages with bare `<`, `>` or `&`
fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[async_trait]
impl NotificationSink for TelegramNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.bot_token);
        let payload = json!({
            "chat_id": self.chat_id,
            "text": Self::render(alert),
            "parse_mode": "HTML",
        });

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError::Transport(format!("Telegram returned HTTP {}", response.status().as_u16())));
        }
        Ok(())
    }
}
