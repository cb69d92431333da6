//! Prompt building and strict parsing of the advisor's reply.

use crate::{Classification, MAX_ACTION_CHARS, MAX_SUMMARY_CHARS};
use anyhow::{Context, Result};
use serde::Deserialize;
use telewatch_common::types::{LogRecord, Severity};

pub const SYSTEM_PROMPT: &str =
    "You are a log analysis expert helping monitor long-running processes.";

/// Build the classification prompt: recent context first, then the record
/// under judgment, then the required response schema.
pub fn build_classification_prompt(record: &LogRecord, context: &[String]) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(
        "Classify the following log event.\n\n\
         Recent context (previous lines from the same source):\n",
    );
    if context.is_empty() {
        prompt.push_str("(no previous context)\n");
    } else {
        for line in context {
            prompt.push_str(line);
            prompt.push('\n');
        }
    }

    prompt.push_str("\nCurrent event:\n");
    prompt.push_str(record.message());
    prompt.push_str(
        "\n\nRespond ONLY with a JSON object of this exact shape:\n\
         {\n\
         \x20 \"severity\": \"critical\" | \"warning\" | \"info\",\n\
         \x20 \"summary\": \"one line, at most 280 characters\",\n\
         \x20 \"suggested_action\": \"concrete next step for the operator, or null\",\n\
         \x20 \"generated_pattern\": \"optional regex matching future occurrences of this event, or null\"\n\
         }\n",
    );
    prompt
}

#[derive(Deserialize)]
struct RawClassification {
    severity: String,
    summary: String,
    #[serde(default)]
    suggested_action: Option<String>,
    #[serde(default)]
    generated_pattern: Option<String>,
}

/// Parse and validate the advisor's reply. Tolerates a markdown code fence
/// around the JSON; anything else that deviates from the schema is an
/// error, which the caller treats as advisor-unavailable.
pub fn parse_classification(reply: &str) -> Result<Classification> {
    let body = strip_code_fence(reply.trim());
    let raw: RawClassification =
        serde_json::from_str(body).context("advisor reply is not the expected JSON shape")?;

    let severity: Severity = raw
        .severity
        .parse()
        .map_err(|e: String| anyhow::anyhow!("advisor reply has invalid severity: {e}"))?;

    let mut summary = raw.summary.trim().to_string();
    if summary.is_empty() {
        anyhow::bail!("advisor reply has an empty summary");
    }
    if summary.chars().count() > MAX_SUMMARY_CHARS {
        summary = summary.chars().take(MAX_SUMMARY_CHARS).collect();
    }

    let suggested_action = raw
        .suggested_action
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .map(|a| {
            if a.chars().count() > MAX_ACTION_CHARS {
                a.chars().take(MAX_ACTION_CHARS).collect()
            } else {
                a
            }
        });

    let generated_pattern = raw
        .generated_pattern
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());

    Ok(Classification {
        severity,
        summary,
        suggested_action,
        generated_pattern,
    })
}

fn strip_code_fence(text: &str) -> &str {
    let Some(start) = text.find("```") else {
        return text;
    };
    let after = &text[start + 3..];
    let after = after.strip_prefix("json").unwrap_or(after);
    match after.find("```") {
        Some(end) => after[..end].trim(),
        None => after.trim(),
    }
}
