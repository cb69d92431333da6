use crate::patterns::PatternSet;
use crate::{fingerprint, heuristic_severity, Classifier, DEFAULT_ADVISOR_BUDGET_PER_HOUR};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use telewatch_advisor::{Advisor, Classification, QuotaState};
use telewatch_common::types::{EventReason, LogRecord, Severity};

/// Scripted advisor that counts its calls.
struct ScriptedAdvisor {
    calls: AtomicUsize,
    severity: Severity,
    summary: &'static str,
    suggested_action: Option<&'static str>,
    generated_pattern: Option<&'static str>,
    quota: QuotaState,
}

impl ScriptedAdvisor {
    fn new(severity: Severity, summary: &'static str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            severity,
            summary,
            suggested_action: None,
            generated_pattern: None,
            quota: QuotaState::Ok,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Advisor for ScriptedAdvisor {
    fn provider(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted-1"
    }

    async fn classify(&self, _record: &LogRecord, _context: &[String]) -> Result<Classification> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Classification {
            severity: self.severity,
            summary: self.summary.to_string(),
            suggested_action: self.suggested_action.map(|a| a.to_string()),
            generated_pattern: self.generated_pattern.map(|p| p.to_string()),
        })
    }

    fn quota(&self) -> QuotaState {
        self.quota
    }
}

struct FailingAdvisor;

#[async_trait]
impl Advisor for FailingAdvisor {
    fn provider(&self) -> &str {
        "failing"
    }

    fn model_name(&self) -> &str {
        "failing-1"
    }

    async fn classify(&self, _record: &LogRecord, _context: &[String]) -> Result<Classification> {
        anyhow::bail!("transport error")
    }

    fn quota(&self) -> QuotaState {
        QuotaState::Ok
    }
}

fn record(seq: u64, line: &str) -> LogRecord {
    let mut rec = LogRecord::new(seq, "src-0", line.to_string());
    rec.fields.message = Some(line.to_string());
    rec
}

fn empty_patterns() -> PatternSet {
    // A configured pattern that can never match keeps the default library
    // out of the way for advisor-focused tests.
    PatternSet::from_config(&[telewatch_common::config::PatternConfig {
        pattern: "x^".into(),
        severity: Severity::Info,
        summary: "never".into(),
    }])
}

#[tokio::test]
async fn second_identical_record_is_a_cache_hit_with_no_advisor_call() {
    let mut scripted = ScriptedAdvisor::new(Severity::Critical, "db unreachable");
    scripted.suggested_action = Some("check database connectivity");
    let advisor = Arc::new(scripted);
    let mut classifier = Classifier::new(
        empty_patterns(),
        Some(advisor.clone()),
        DEFAULT_ADVISOR_BUDGET_PER_HOUR,
    );

    let now = Utc::now();
    let first = record(1, "failed to connect to db");
    let fp = fingerprint(first.message());

    let d1 = classifier.classify(&first, &fp, now).await;
    assert!(d1.via_advisor);
    assert!(!d1.cached);
    assert_eq!(d1.suggested_action.as_deref(), Some("check database connectivity"));
    assert_eq!(advisor.calls(), 1);

    // Same message five minutes later: cache must answer, advisor must not,
    // and the suggested action must survive the cache.
    let second = record(2, "failed to connect to db");
    let d2 = classifier
        .classify(&second, &fp, now + Duration::minutes(5))
        .await;
    assert!(d2.cached);
    assert_eq!(d2.severity, Severity::Critical);
    assert_eq!(d2.suggested_action.as_deref(), Some("check database connectivity"));
    assert_eq!(advisor.calls(), 1);
}

#[tokio::test]
async fn pattern_match_short_circuits_the_advisor() {
    let advisor = Arc::new(ScriptedAdvisor::new(Severity::Info, "unused"));
    let patterns = PatternSet::from_config(&[telewatch_common::config::PatternConfig {
        pattern: "checkpoint saved".into(),
        severity: Severity::Info,
        summary: "checkpoint".into(),
    }]);
    let mut classifier = Classifier::new(patterns, Some(advisor.clone()), 60);

    let rec = record(1, "checkpoint saved to /data/ckpt-9");
    let fp = fingerprint(rec.message());
    let decision = classifier.classify(&rec, &fp, Utc::now()).await;

    assert_eq!(decision.severity, Severity::Info);
    assert_eq!(decision.summary, "checkpoint");
    assert_eq!(advisor.calls(), 0);
}

#[tokio::test]
async fn advisor_failure_takes_the_degraded_path() {
    let mut classifier = Classifier::new(empty_patterns(), Some(Arc::new(FailingAdvisor)), 60);

    let mut rec = record(1, "ERROR disk write failed");
    rec.fields.level = Some("ERROR".into());
    let fp = fingerprint(rec.message());
    let decision = classifier.classify(&rec, &fp, Utc::now()).await;

    assert!(!decision.via_advisor);
    assert_eq!(decision.severity, Severity::Warning);
}

#[tokio::test]
async fn hourly_budget_degrades_but_still_caches() {
    let advisor = Arc::new(ScriptedAdvisor::new(Severity::Warning, "advised"));
    let mut classifier = Classifier::new(empty_patterns(), Some(advisor.clone()), 2);

    let now = Utc::now();
    for i in 0..4 {
        let rec = record(i, &format!("unique failure mode variant alpha-{}", ['a', 'b', 'c', 'd'][i as usize]));
        let fp = fingerprint(rec.message());
        classifier.classify(&rec, &fp, now).await;
    }
    // Only the first two consults fit the budget.
    assert_eq!(advisor.calls(), 2);

    // An hour later the budget window has rolled over.
    let later = now + Duration::minutes(61);
    let rec = record(10, "unique failure mode variant epsilon");
    let fp = fingerprint(rec.message());
    let decision = classifier.classify(&rec, &fp, later).await;
    assert!(decision.via_advisor);
    assert_eq!(advisor.calls(), 3);
}

#[tokio::test]
async fn exhausted_quota_disables_the_advisor() {
    let mut advisor = ScriptedAdvisor::new(Severity::Warning, "advised");
    advisor.quota = QuotaState::Exhausted;
    let advisor = Arc::new(advisor);
    let mut classifier = Classifier::new(empty_patterns(), Some(advisor.clone()), 60);

    let rec = record(1, "something novel broke");
    let fp = fingerprint(rec.message());
    let decision = classifier.classify(&rec, &fp, Utc::now()).await;

    assert!(!decision.via_advisor);
    assert_eq!(advisor.calls(), 0);
}

#[tokio::test]
async fn generated_pattern_is_taught_and_reused() {
    let mut advisor = ScriptedAdvisor::new(Severity::Critical, "raft quorum lost");
    advisor.generated_pattern = Some("quorum lost");
    let advisor = Arc::new(advisor);
    let mut classifier = Classifier::new(empty_patterns(), Some(advisor.clone()), 60);

    let now = Utc::now();
    let first = record(1, "node-3 reports quorum lost in shard 12");
    let fp1 = fingerprint(first.message());
    classifier.classify(&first, &fp1, now).await;
    assert_eq!(advisor.calls(), 1);

    // A *different* fingerprint matching the taught pattern stays local.
    let second = record(2, "standby reports quorum lost during failover");
    let fp2 = fingerprint(second.message());
    assert_ne!(fp1, fp2);
    let decision = classifier.classify(&second, &fp2, now).await;
    assert!(!decision.via_advisor);
    assert_eq!(decision.severity, Severity::Critical);
    assert_eq!(advisor.calls(), 1);
}

#[tokio::test]
async fn context_window_holds_only_preceding_records() {
    struct ContextProbe {
        seen: std::sync::Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Advisor for ContextProbe {
        fn provider(&self) -> &str {
            "probe"
        }
        fn model_name(&self) -> &str {
            "probe"
        }
        async fn classify(
            &self,
            _record: &LogRecord,
            context: &[String],
        ) -> Result<Classification> {
            self.seen.lock().unwrap().push(context.len());
            Ok(Classification {
                severity: Severity::Warning,
                summary: "probed".into(),
                suggested_action: None,
                generated_pattern: None,
            })
        }
        fn quota(&self) -> QuotaState {
            QuotaState::Ok
        }
    }

    let probe = Arc::new(ContextProbe {
        seen: std::sync::Mutex::new(Vec::new()),
    });
    let mut classifier = Classifier::new(empty_patterns(), Some(probe.clone()), 60);

    let now = Utc::now();
    for i in 0..8u64 {
        let rec = record(i, &format!("distinct event body number {}", ["zero","one","two","three","four","five","six","seven"][i as usize]));
        let fp = fingerprint(rec.message());
        classifier.classify(&rec, &fp, now).await;
        classifier.note_record(&rec);
    }

    let seen = probe.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 8);
    assert_eq!(seen[0], 0); // nothing before the first record
    assert_eq!(seen[1], 1);
    assert_eq!(*seen.last().unwrap(), 5); // capped at five
}

#[test]
fn candidate_reason_prefers_keyword_hits() {
    let classifier = Classifier::new(PatternSet::from_config(&[]), None, 60);
    let rec = record(1, "fatal error in scheduler");

    assert_eq!(
        classifier.candidate_reason(&rec, true, true),
        Some(EventReason::Keyword)
    );
    assert_eq!(
        classifier.candidate_reason(&rec, false, true),
        Some(EventReason::Novelty)
    );
    // No keyword, not novel, but the default patterns recognize it.
    assert_eq!(
        classifier.candidate_reason(&rec, false, false),
        Some(EventReason::Pattern)
    );

    let boring = record(2, "nothing to see");
    assert_eq!(classifier.candidate_reason(&boring, false, false), None);
}

#[test]
fn heuristic_severity_maps_levels_and_tokens() {
    let mut rec = record(1, "plain");
    rec.fields.level = Some("FATAL".into());
    assert_eq!(heuristic_severity(&rec), Severity::Critical);

    let mut rec = record(2, "plain");
    rec.fields.level = Some("ERROR".into());
    assert_eq!(heuristic_severity(&rec), Severity::Warning);

    let rec = record(3, "worker hit a segfault");
    assert_eq!(heuristic_severity(&rec), Severity::Critical);

    let rec = record(4, "upload failed, will not retry");
    assert_eq!(heuristic_severity(&rec), Severity::Warning);

    let rec = record(5, "heartbeat ok");
    assert_eq!(heuristic_severity(&rec), Severity::Info);
}
