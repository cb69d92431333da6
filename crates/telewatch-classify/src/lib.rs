//! The classification decision core.
//!
//! For every candidate record the classifier tries, in order: the analysis
//! cache, the local pattern list, the advisor (within quota and budget),
//! and finally a heuristic derived from the extracted level and stock
//! alarm tokens. Advisor verdicts worth remembering are written back to
//! the cache; advisor-taught patterns are injected ahead of the
//! configured ones.
//!
//! The classifier runs on a single pipeline task and owns the cache and
//! pattern list outright, so no locking is involved.

pub mod cache;
pub mod fingerprint;
pub mod patterns;

#[cfg(test)]
mod tests;

pub use fingerprint::fingerprint;

use cache::{AnalysisCache, CacheStats};
use chrono::{DateTime, Duration, Utc};
use patterns::PatternSet;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use telewatch_advisor::{Advisor, QuotaState, CLASSIFY_DEADLINE_SECS};
use telewatch_common::types::{EventReason, LogRecord, Severity};

/// Soft cap on advisor calls per trailing hour.
pub const DEFAULT_ADVISOR_BUDGET_PER_HOUR: usize = 60;
/// Previous records from the same source handed to the advisor.
const CONTEXT_LINES: usize = 5;
const THROTTLE_SECS: i64 = 60;
const DEGRADED_SUMMARY_LEN: usize = 100;

#[derive(Debug, Clone)]
pub struct Decision {
    pub severity: Severity,
    pub summary: String,
    /// Advisor-suggested next step, if one was given (or cached).
    pub suggested_action: Option<String>,
    /// The verdict came from the advisor (directly or via a cached advisor
    /// entry).
    pub via_advisor: bool,
    pub cached: bool,
}

pub struct Classifier {
    cache: AnalysisCache,
    patterns: PatternSet,
    advisor: Option<Arc<dyn Advisor>>,
    budget_per_hour: usize,
    advisor_calls: VecDeque<DateTime<Utc>>,
    throttled_until: Option<DateTime<Utc>>,
    disabled_until: Option<DateTime<Utc>>,
    context: HashMap<String, VecDeque<String>>,
}

impl Classifier {
    pub fn new(
        patterns: PatternSet,
        advisor: Option<Arc<dyn Advisor>>,
        budget_per_hour: usize,
    ) -> Self {
        Self {
            cache: AnalysisCache::with_defaults(),
            patterns,
            advisor,
            budget_per_hour,
            advisor_calls: VecDeque::new(),
            throttled_until: None,
            disabled_until: None,
            context: HashMap::new(),
        }
    }

    /// Should this record be classified at all, and under which reason?
    /// A keyword hit outranks novelty so that repeats of a keyword-matched
    /// line keep an identical (severity, reason, fingerprint) triple and
    /// coalesce in the dispatcher.
    pub fn candidate_reason(
        &self,
        record: &LogRecord,
        keyword_hit: bool,
        novel: bool,
    ) -> Option<EventReason> {
        if keyword_hit {
            Some(EventReason::Keyword)
        } else if novel {
            Some(EventReason::Novelty)
        } else if self.patterns.first_match(record.message()).is_some() {
            Some(EventReason::Pattern)
        } else {
            None
        }
    }

    /// Classify one candidate. Call [`Classifier::note_record`] afterwards
    /// so the context window only ever contains *preceding* records.
    pub async fn classify(
        &mut self,
        record: &LogRecord,
        fp: &str,
        now: DateTime<Utc>,
    ) -> Decision {
        if let Some(entry) = self.cache.get(fp, now) {
            return Decision {
                severity: entry.severity,
                summary: entry.summary,
                suggested_action: entry.action,
                via_advisor: entry.from_advisor,
                cached: true,
            };
        }

        if let Some((severity, summary)) = self.patterns.first_match(record.message()) {
            let summary = summary.to_string();
            self.cache.insert(fp, severity, &summary, None, false, now);
            return Decision {
                severity,
                summary,
                suggested_action: None,
                via_advisor: false,
                cached: false,
            };
        }

        if let Some(advisor) = self.advisor.clone() {
            if self.advisor_ready(advisor.as_ref(), now) {
                self.advisor_calls.push_back(now);
                let context: Vec<String> = self
                    .context
                    .get(&record.source_id)
                    .map(|ring| ring.iter().cloned().collect())
                    .unwrap_or_default();

                let deadline = std::time::Duration::from_secs(CLASSIFY_DEADLINE_SECS);
                match tokio::time::timeout(deadline, advisor.classify(record, &context)).await {
                    Ok(Ok(verdict)) => {
                        if verdict.severity >= Severity::Warning {
                            self.cache.insert(
                                fp,
                                verdict.severity,
                                &verdict.summary,
                                verdict.suggested_action.as_deref(),
                                true,
                                now,
                            );
                        }
                        if let Some(pattern) = &verdict.generated_pattern {
                            self.patterns
                                .inject(pattern, verdict.severity, &verdict.summary);
                        }
                        return Decision {
                            severity: verdict.severity,
                            summary: verdict.summary,
                            suggested_action: verdict.suggested_action,
                            via_advisor: true,
                            cached: false,
                        };
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "Advisor call failed, degrading");
                    }
                    Err(_) => {
                        tracing::warn!(
                            deadline_secs = CLASSIFY_DEADLINE_SECS,
                            "Advisor call exceeded deadline, degrading"
                        );
                    }
                }
            }
        }

        // Degraded path: local heuristic, still recorded to the cache so a
        // repeat of the same line stays cheap.
        let severity = heuristic_severity(record);
        let summary = truncate_chars(record.message(), DEGRADED_SUMMARY_LEN);
        self.cache.insert(fp, severity, &summary, None, false, now);
        Decision {
            severity,
            summary,
            suggested_action: None,
            via_advisor: false,
            cached: false,
        }
    }

    /// Feed the per-source context window. Call after `classify`.
    pub fn note_record(&mut self, record: &LogRecord) {
        let ring = self.context.entry(record.source_id.clone()).or_default();
        if ring.len() >= CONTEXT_LINES {
            ring.pop_front();
        }
        let mut line = String::new();
        if let Some(level) = &record.fields.level {
            line.push('[');
            line.push_str(level);
            line.push_str("] ");
        }
        line.push_str(record.message());
        ring.push_back(line);
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    fn advisor_ready(&mut self, advisor: &dyn Advisor, now: DateTime<Utc>) -> bool {
        if self.disabled_until.is_some_and(|t| now < t) {
            return false;
        }
        if self.throttled_until.is_some_and(|t| now < t) {
            return false;
        }

        match advisor.quota() {
            QuotaState::Ok => {}
            QuotaState::Throttled => {
                self.throttled_until = Some(now + Duration::seconds(THROTTLE_SECS));
                return false;
            }
            QuotaState::Exhausted => {
                let midnight = (now + Duration::days(1))
                    .date_naive()
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
                    .and_utc();
                tracing::warn!("Advisor quota exhausted, degrading until midnight UTC");
                self.disabled_until = Some(midnight);
                return false;
            }
        }

        let hour_ago = now - Duration::hours(1);
        while self.advisor_calls.front().is_some_and(|t| *t < hour_ago) {
            self.advisor_calls.pop_front();
        }
        if self.advisor_calls.len() >= self.budget_per_hour {
            tracing::debug!(
                budget = self.budget_per_hour,
                "Advisor call budget exhausted for this hour, degrading"
            );
            return false;
        }
        true
    }
}

/// Severity from the extracted level, falling back to alarm vocabulary in
/// the raw line.
pub fn heuristic_severity(record: &LogRecord) -> Severity {
    if let Some(level) = record.fields.level.as_deref() {
        match level {
            "FATAL" | "CRITICAL" => return Severity::Critical,
            "ERROR" => return Severity::Warning,
            _ => {}
        }
    }
    let upper = record.line.to_uppercase();
    if ["FATAL", "CRITICAL", "SEGFAULT", "PANIC"]
        .iter()
        .any(|w| upper.contains(w))
    {
        Severity::Critical
    } else if ["ERROR", "EXCEPTION", "FAILED", "TRACEBACK"]
        .iter()
        .any(|w| upper.contains(w))
    {
        Severity::Warning
    } else {
        Severity::Info
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
