use crate::utils::{split_message, MAX_MESSAGE_LEN};
use crate::{NotifyError, Transport};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicI64, Ordering};

const POLL_TIMEOUT_SECS: u32 = 2;

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    text: Option<String>,
    chat: Chat,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

/// Telegram Bot API transport: `sendMessage` outbound, long-polled
/// `getUpdates` inbound. Messages longer than the platform cap are split
/// at line boundaries.
pub struct TelegramTransport {
    client: reqwest::Client,
    base_url: String,
    chat_id: String,
    last_update_id: AtomicI64,
}

impl TelegramTransport {
    pub fn new(bot_token: &str, chat_id: &str) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            base_url: format!("https://api.telegram.org/bot{bot_token}"),
            chat_id: chat_id.to_string(),
            last_update_id: AtomicI64::new(0),
        })
    }

    async fn send_chunk(&self, text: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(format!("{}/sendMessage", self.base_url))
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": text,
                "parse_mode": "Markdown",
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        for chunk in split_message(text, MAX_MESSAGE_LEN) {
            self.send_chunk(&chunk).await?;
        }
        Ok(())
    }

    async fn poll_commands(&self) -> Result<Vec<String>, NotifyError> {
        let offset = self.last_update_id.load(Ordering::Relaxed);
        let mut request = self
            .client
            .get(format!("{}/getUpdates", self.base_url))
            .query(&[("timeout", POLL_TIMEOUT_SECS)]);
        if offset > 0 {
            request = request.query(&[("offset", offset + 1)]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::ApiError {
                status: status.as_u16(),
                body,
            });
        }

        let updates: UpdatesResponse = response.json().await?;
        if !updates.ok {
            return Err(NotifyError::Other("getUpdates returned ok=false".into()));
        }

        let mut texts = Vec::new();
        for update in updates.result {
            self.last_update_id.fetch_max(update.update_id, Ordering::Relaxed);
            let Some(message) = update.message else {
                continue;
            };
            // Only our configured chat may drive the bot.
            if message.chat.id.to_string() != self.chat_id {
                continue;
            }
            if let Some(text) = message.text {
                texts.push(text);
            }
        }
        Ok(texts)
    }

    fn name(&self) -> &str {
        "telegram"
    }
}
