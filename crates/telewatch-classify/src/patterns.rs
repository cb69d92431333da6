//! Ordered severity patterns checked before the advisor is ever consulted.
//!
//! Two tiers: patterns injected at runtime (advisor teaching) are checked
//! first, then the configured list. First match wins. When the config
//! supplies no patterns a built-in library covers the usual failure
//! vocabulary.

use regex::{Regex, RegexBuilder};
use telewatch_common::config::PatternConfig;
use telewatch_common::types::Severity;

pub struct Pattern {
    pub regex: Regex,
    pub severity: Severity,
    pub summary: String,
    pub enabled: bool,
}

impl Pattern {
    fn compile(pattern: &str, severity: Severity, summary: &str) -> Option<Self> {
        match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(regex) => Some(Self {
                regex,
                severity,
                summary: summary.to_string(),
                enabled: true,
            }),
            Err(e) => {
                tracing::warn!(pattern, error = %e, "Skipping invalid severity pattern");
                None
            }
        }
    }
}

pub struct PatternSet {
    /// Advisor-taught patterns, consulted first.
    runtime: Vec<Pattern>,
    configured: Vec<Pattern>,
}

impl PatternSet {
    /// Build from configuration; an empty config falls back to the default
    /// library. Invalid regexes are logged and skipped.
    pub fn from_config(configs: &[PatternConfig]) -> Self {
        let configured = if configs.is_empty() {
            default_patterns()
        } else {
            configs
                .iter()
                .filter_map(|c| Pattern::compile(&c.pattern, c.severity, &c.summary))
                .collect()
        };
        Self {
            runtime: Vec::new(),
            configured,
        }
    }

    /// First enabled match wins, runtime patterns ahead of configured ones.
    pub fn first_match(&self, text: &str) -> Option<(Severity, &str)> {
        self.runtime
            .iter()
            .chain(self.configured.iter())
            .filter(|p| p.enabled)
            .find(|p| p.regex.is_match(text))
            .map(|p| (p.severity, p.summary.as_str()))
    }

    /// Inject an advisor-generated pattern at runtime. Returns false (and
    /// logs) when the regex does not compile; teaching failures never
    /// degrade the advisor itself.
    pub fn inject(&mut self, pattern: &str, severity: Severity, summary: &str) -> bool {
        if self.runtime.iter().any(|p| p.regex.as_str() == pattern) {
            return false;
        }
        match Pattern::compile(pattern, severity, summary) {
            Some(compiled) => {
                tracing::info!(pattern, severity = %severity, "Learned new severity pattern");
                self.runtime.push(compiled);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.runtime.len() + self.configured.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Built-in severity vocabulary used when the config supplies no patterns.
pub fn default_patterns() -> Vec<Pattern> {
    let table: &[(&str, Severity, &str)] = &[
        // Critical
        (r"segmentation fault|segfault", Severity::Critical, "segmentation fault"),
        (r"out of memory|oom[- ]kill|memory exhausted", Severity::Critical, "out of memory"),
        (r"kernel panic|panic", Severity::Critical, "panic"),
        (r"fatal\s+error", Severity::Critical, "fatal error"),
        (r"(database|db)\s+(connection\s+)?(failed|refused|lost)", Severity::Critical, "database connection failure"),
        (r"core dumped", Severity::Critical, "core dump"),
        (r"stack overflow", Severity::Critical, "stack overflow"),
        (r"deadlock detected", Severity::Critical, "deadlock"),
        (r"unrecoverable\s+error", Severity::Critical, "unrecoverable error"),
        // Warning
        (r"deprecat(ed|ion)", Severity::Warning, "deprecation notice"),
        (r"retry(ing)?\b", Severity::Warning, "operation retried"),
        (r"time[d]?\s*out|timeout", Severity::Warning, "timeout"),
        (r"connection\s+(lost|dropped|closed|reset)", Severity::Warning, "connection interrupted"),
        (r"disk\s+space\s+low|no space left", Severity::Warning, "disk space low"),
        (r"rate limit", Severity::Warning, "rate limited"),
        (r"quota exceeded", Severity::Warning, "quota exceeded"),
        // Info
        (r"start(ed|ing)\b", Severity::Info, "startup activity"),
        (r"complet(ed|ion)\b", Severity::Info, "completion activity"),
        (r"listening on", Severity::Info, "listener up"),
        (r"shutdown", Severity::Info, "shutdown activity"),
    ];
    table
        .iter()
        .filter_map(|(pattern, severity, summary)| Pattern::compile(pattern, *severity, summary))
        .collect()
}
