//! The language-model advisor boundary.
//!
//! The classifier depends only on the [`Advisor`] trait: a provider-agnostic
//! severity classifier that must answer within a hard deadline and report
//! its quota state. Any backend satisfying the contract is valid; the
//! built-in provider speaks the OpenAI-compatible chat-completions dialect
//! shared by OpenAI, Groq, and Ollama.

pub mod models;
pub mod prompt;
pub mod providers;

pub use providers::openai::OpenAiProvider;

use anyhow::Result;
use async_trait::async_trait;
use telewatch_common::config::LlmConfig;
use telewatch_common::types::{LogRecord, Severity};

/// Hard deadline on a single classify call.
pub const CLASSIFY_DEADLINE_SECS: u64 = 10;
/// Longest summary the contract admits; longer ones are truncated on parse.
pub const MAX_SUMMARY_CHARS: usize = 280;
/// Longest suggested action relayed to the operator.
pub const MAX_ACTION_CHARS: usize = 300;

/// A validated advisor verdict.
#[derive(Debug, Clone)]
pub struct Classification {
    pub severity: Severity,
    pub summary: String,
    /// Optional concrete next step, relayed verbatim in the notification.
    pub suggested_action: Option<String>,
    /// Optional regex the advisor taught us; the classifier injects it into
    /// the local pattern list so the next similar record never calls out.
    pub generated_pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaState {
    Ok,
    /// Temporarily rate limited; degrade for 60 seconds.
    Throttled,
    /// Out of quota; unavailable for the rest of the calendar day.
    Exhausted,
}

#[async_trait]
pub trait Advisor: Send + Sync {
    fn provider(&self) -> &str;

    fn model_name(&self) -> &str;

    /// Classify a record given up to five preceding lines from the same
    /// source. Errors (timeout, transport, 5xx, schema violation) mean the
    /// caller must take the degraded path for this record.
    async fn classify(&self, record: &LogRecord, context: &[String]) -> Result<Classification>;

    fn quota(&self) -> QuotaState;
}

/// Build the advisor selected by configuration. Unknown providers are a
/// configuration error; an absent `llm` section disables the advisor
/// entirely (callers pass `None`).
pub fn create_advisor(config: &LlmConfig) -> Result<std::sync::Arc<dyn Advisor>> {
    let provider = config.provider.to_lowercase();
    let (default_base, default_model): (&str, &str) = match provider.as_str() {
        "openai" => ("https://api.openai.com/v1", "gpt-4o-mini"),
        "groq" => ("https://api.groq.com/openai/v1", "llama-3.3-70b-versatile"),
        "ollama" => ("http://localhost:11434/v1", "llama3.2"),
        "openai-compatible" => {
            let base = config
                .base_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("openai-compatible provider requires base_url"))?;
            let model = config
                .model
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("openai-compatible provider requires model"))?;
            (base, model)
        }
        other => anyhow::bail!("unknown llm provider: {other}"),
    };

    let advisor = OpenAiProvider::new(
        &provider,
        config.api_key.clone(),
        config
            .model
            .clone()
            .unwrap_or_else(|| default_model.to_string()),
        config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base.to_string()),
    )?;
    Ok(std::sync::Arc::new(advisor))
}
