use crate::models::{ChatMessage, ChatRequest, ChatResponse};
use crate::{prompt, Advisor, Classification, QuotaState, CLASSIFY_DEADLINE_SECS};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use telewatch_common::types::LogRecord;

const THROTTLE_SECS: i64 = 60;

#[derive(Default)]
struct QuotaTracker {
    throttled_until: Option<DateTime<Utc>>,
    exhausted_until: Option<DateTime<Utc>>,
}

/// OpenAI-compatible chat-completions provider. Works against OpenAI, Groq,
/// and a local Ollama with the same request shape.
pub struct OpenAiProvider {
    provider: String,
    api_key: String,
    model: String,
    base_url: String,
    client: Client,
    quota: Mutex<QuotaTracker>,
}

impl OpenAiProvider {
    pub fn new(provider: &str, api_key: String, model: String, base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(CLASSIFY_DEADLINE_SECS))
            .build()?;
        Ok(Self {
            provider: provider.to_string(),
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            quota: Mutex::new(QuotaTracker::default()),
        })
    }

    async fn call_api(&self, user_prompt: &str) -> Result<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: prompt::SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            temperature: Some(0.3),
            max_tokens: Some(500),
        };

        tracing::debug!(
            model = %self.model,
            prompt_length = user_prompt.len(),
            "Calling advisor API"
        );

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json");
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = builder
            .json(&request)
            .send()
            .await
            .context("failed to reach advisor API")?;

        let status = response.status();
        if status.as_u16() == 429 {
            let body = response.text().await.unwrap_or_default();
            self.note_rate_limited(&body);
            anyhow::bail!("advisor API rate limited: {body}");
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "Advisor API request failed");
            anyhow::bail!("advisor API error {status}: {body}");
        }

        let chat: ChatResponse = response
            .json()
            .await
            .context("failed to parse advisor API response")?;
        chat.choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| anyhow::anyhow!("empty response from advisor API"))
    }

    fn note_rate_limited(&self, body: &str) {
        let mut quota = self.quota.lock();
        let lower = body.to_lowercase();
        if lower.contains("quota") || lower.contains("billing") || lower.contains("exceeded your") {
            // Out of quota for the day, not just momentarily throttled.
            let midnight = (Utc::now() + chrono::Duration::days(1))
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .unwrap()
                .and_utc();
            quota.exhausted_until = Some(midnight);
            tracing::warn!("Advisor quota exhausted, disabled until midnight UTC");
        } else {
            quota.throttled_until = Some(Utc::now() + chrono::Duration::seconds(THROTTLE_SECS));
            tracing::info!("Advisor throttled for {THROTTLE_SECS}s");
        }
    }
}

#[async_trait]
impl Advisor for OpenAiProvider {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn classify(&self, record: &LogRecord, context: &[String]) -> Result<Classification> {
        let user_prompt = prompt::build_classification_prompt(record, context);
        let reply = self.call_api(&user_prompt).await?;
        prompt::parse_classification(&reply)
    }

    fn quota(&self) -> QuotaState {
        let now = Utc::now();
        let quota = self.quota.lock();
        if quota.exhausted_until.is_some_and(|t| now < t) {
            QuotaState::Exhausted
        } else if quota.throttled_until.is_some_and(|t| now < t) {
            QuotaState::Throttled
        } else {
            QuotaState::Ok
        }
    }
}
