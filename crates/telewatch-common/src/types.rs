use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "critical" | "fatal" => Ok(Severity::Critical),
            _ => Err(format!("unknown severity: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Pid,
    Journal,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKind::File => write!(f, "file"),
            SourceKind::Pid => write!(f, "pid"),
            SourceKind::Journal => write!(f, "journal"),
        }
    }
}

/// A monitored observable: a tailed file, a process ID, or a journald unit.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub id: String,
    pub kind: SourceKind,
    /// Path, PID, or unit name depending on `kind`.
    pub location: String,
    /// Case-insensitive substring filter; empty means pass everything.
    pub keywords: Vec<String>,
    pub display_name: String,
}

impl SourceDescriptor {
    /// Whether `line` contains at least one filter keyword. Always true for
    /// an empty keyword set.
    pub fn keyword_hit(&self, line: &str) -> bool {
        if self.keywords.is_empty() {
            return true;
        }
        let lower = line.to_lowercase();
        self.keywords.iter().any(|k| lower.contains(&k.to_lowercase()))
    }
}

/// Fields the profiler extracted from a raw line, all best-effort.
#[derive(Debug, Clone, Default)]
pub struct ExtractedFields {
    pub timestamp: Option<DateTime<Utc>>,
    pub level: Option<String>,
    pub message: Option<String>,
}

/// One line (or synthetic observation) from a source, immutable once built.
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Strictly increasing within one source.
    pub seq: u64,
    pub arrived_at: DateTime<Utc>,
    pub source_id: String,
    pub line: String,
    pub fields: ExtractedFields,
}

impl LogRecord {
    pub fn new(seq: u64, source_id: &str, line: String) -> Self {
        Self {
            seq,
            arrived_at: Utc::now(),
            source_id: source_id.to_string(),
            line,
            fields: ExtractedFields::default(),
        }
    }

    /// The message portion if the profiler isolated one, else the raw line.
    pub fn message(&self) -> &str {
        self.fields.message.as_deref().unwrap_or(&self.line)
    }

    /// Extracted timestamp, falling back to arrival time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.fields.timestamp.unwrap_or(self.arrived_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventReason {
    Keyword,
    Pattern,
    Spike,
    Stall,
    Novelty,
    Progress,
    Stage,
    Completion,
    Drift,
    SourceLost,
    Overflow,
}

impl std::fmt::Display for EventReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventReason::Keyword => "keyword",
            EventReason::Pattern => "pattern",
            EventReason::Spike => "spike",
            EventReason::Stall => "stall",
            EventReason::Novelty => "novelty",
            EventReason::Progress => "progress",
            EventReason::Stage => "stage",
            EventReason::Completion => "completion",
            EventReason::Drift => "drift",
            EventReason::SourceLost => "source-lost",
            EventReason::Overflow => "overflow",
        };
        write!(f, "{s}")
    }
}

/// A classified occurrence on its way to the dispatcher.
#[derive(Debug, Clone)]
pub struct Event {
    pub source_id: String,
    pub severity: Severity,
    pub summary: String,
    pub reason: EventReason,
    pub detail: Option<String>,
    /// Advisor-suggested next step, rendered as the action line.
    pub action: Option<String>,
    /// Canonical fingerprint when the event came from a concrete record;
    /// used as the debounce key.
    pub fingerprint: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(
        source_id: &str,
        severity: Severity,
        reason: EventReason,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            severity,
            summary: summary.into(),
            reason,
            detail: None,
            action: None,
            fingerprint: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_fingerprint(mut self, fp: impl Into<String>) -> Self {
        self.fingerprint = Some(fp.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_by_urgency() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
    }

    #[test]
    fn severity_round_trips_through_strings() {
        for sev in [Severity::Info, Severity::Warning, Severity::Critical] {
            let parsed: Severity = sev.to_string().parse().unwrap();
            assert_eq!(parsed, sev);
        }
        assert!("verbose".parse::<Severity>().is_err());
    }

    #[test]
    fn keyword_filter_is_case_insensitive_substring() {
        let desc = SourceDescriptor {
            id: "s1".into(),
            kind: SourceKind::File,
            location: "/var/log/app.log".into(),
            keywords: vec!["ERROR".into(), "Timeout".into()],
            display_name: "app".into(),
        };
        assert!(desc.keyword_hit("2024-01-01 error: db down"));
        assert!(desc.keyword_hit("request TIMEOUT after 30s"));
        assert!(!desc.keyword_hit("all good"));
    }

    #[test]
    fn empty_keywords_pass_everything() {
        let desc = SourceDescriptor {
            id: "s1".into(),
            kind: SourceKind::File,
            location: "/tmp/x".into(),
            keywords: vec![],
            display_name: "x".into(),
        };
        assert!(desc.keyword_hit("anything at all"));
    }

    #[test]
    fn record_falls_back_to_raw_line_and_arrival() {
        let rec = LogRecord::new(1, "s1", "plain text".into());
        assert_eq!(rec.message(), "plain text");
        assert_eq!(rec.timestamp(), rec.arrived_at);
    }
}
