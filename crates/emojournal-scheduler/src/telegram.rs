//! Telegram Bot API transport: `sendMessage` with an inline keyboard for
//! pings, plain HTML for summaries. Failures are classified into
//! [`DeliveryError`] so the dispatcher can decide between pause and retry.

use async_trait::async_trait;
use std::time::Duration;

use emojournal_core::config::TelegramConfig;
use emojournal_core::error::{DeliveryError, EmoJournalError, Result};
use emojournal_core::traits::Notifier;

const PING_TEXT: &str = "🌟 Как ты сейчас?\n\n\
Если хочется — выбери 1-2 слова или просто опиши своими словами.\n\n\
<i>Сам факт, что ты это заметишь и назовёшь, — уже шаг к ясности.</i>";

pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl TelegramNotifier {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        if config.bot_token.is_empty() {
            return Err(EmoJournalError::Config("telegram.bot_token is empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EmoJournalError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone(),
        })
    }

    async fn send_message(&self, body: serde_json::Value) -> std::result::Result<(), DeliveryError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("Telegram send failed: {}", e.without_url())))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        let description = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v["description"].as_str().map(str::to_string))
            .unwrap_or(text);
        Err(classify(status.as_u16(), &description))
    }
}

/// Map a Bot API error to a delivery outcome.
pub fn classify(status: u16, description: &str) -> DeliveryError {
    let lower = description.to_lowercase();
    let detail = format!("{status}: {description}");
    match status {
        403 if lower.contains("blocked") || lower.contains("deactivated") || lower.contains("kicked") => {
            DeliveryError::Blocked(detail)
        }
        400 if lower.contains("chat not found") || lower.contains("user not found") => DeliveryError::ChatGone(detail),
        _ => DeliveryError::Transient(detail),
    }
}

/// Reply markup for the check-in prompt.
pub fn ping_keyboard(user_id: i64) -> serde_json::Value {
    serde_json::json!({
        "inline_keyboard": [
            [{"text": "Ответить", "callback_data": format!("respond_{user_id}")}],
            [{"text": "Отложить на 15 мин", "callback_data": format!("snooze_{user_id}")}],
            [{"text": "Пропустить сегодня", "callback_data": format!("skip_{user_id}")}],
        ]
    })
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_ping(&self, user_id: i64, chat_id: i64) -> std::result::Result<(), DeliveryError> {
        self.send_message(serde_json::json!({
            "chat_id": chat_id,
            "text": PING_TEXT,
            "parse_mode": "HTML",
            "reply_markup": ping_keyboard(user_id),
        }))
        .await
    }

    async fn send_summary(&self, _user_id: i64, chat_id: i64, text: &str) -> std::result::Result<(), DeliveryError> {
        self.send_message(serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_blocked() {
        let e = classify(403, "Forbidden: bot was blocked by the user");
        assert!(matches!(e, DeliveryError::Blocked(_)));
        let e = classify(403, "Forbidden: user is deactivated");
        assert!(e.is_permanent());
    }

    #[test]
    fn test_classify_chat_gone() {
        assert!(matches!(classify(400, "Bad Request: chat not found"), DeliveryError::ChatGone(_)));
    }

    #[test]
    fn test_classify_transient() {
        assert!(matches!(classify(429, "Too Many Requests: retry after 5"), DeliveryError::Transient(_)));
        assert!(matches!(classify(502, "Bad Gateway"), DeliveryError::Transient(_)));
        assert!(matches!(classify(400, "Bad Request: message is too long"), DeliveryError::Transient(_)));
    }

    #[test]
    fn test_ping_keyboard_callbacks() {
        let kb = ping_keyboard(7);
        let rows = kb["inline_keyboard"].as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1][0]["callback_data"], "snooze_7");
        assert_eq!(rows[2][0]["callback_data"], "skip_7");
    }

    #[test]
    fn test_empty_token_rejected() {
        let config = TelegramConfig {
            bot_token: String::new(),
            api_base: "https://api.telegram.org".into(),
            timeout_secs: 10,
        };
        assert!(TelegramNotifier::new(&config).is_err());
    }
}
