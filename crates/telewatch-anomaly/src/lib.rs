//! Temporal and structural anomaly detection over the post-profile record
//! stream.
//!
//! Two orthogonal detectors: [`temporal::TemporalDetector`] watches the
//! record rate for spikes and stalls, [`novelty::NoveltyDetector`] watches
//! for fingerprints absent from recent structural memory. Both are driven
//! by the pipeline worker; `tick` must be called periodically so stalls are
//! noticed while no records arrive.

pub mod novelty;
pub mod temporal;


use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use telewatch_common::types::{Event, LogRecord};

/// Tokens that make a never-seen line worth classifying even without a
/// keyword hit or an alarming extracted level.
static ALARM_TOKENS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Exception|Traceback|panic|segfault|OOM").unwrap());

pub fn has_alarm_token(line: &str) -> bool {
    ALARM_TOKENS_RE.is_match(line)
}

fn level_is_alarming(level: Option<&str>) -> bool {
    matches!(level, Some("ERROR") | Some("FATAL") | Some("CRITICAL"))
}

pub struct AnomalyDetector {
    temporal: temporal::TemporalDetector,
    novelty: novelty::NoveltyDetector,
}

/// Outcome of feeding one record through both detectors.
pub struct Assessment {
    /// Spike events, ready for the dispatcher.
    pub events: Vec<Event>,
    /// The record should be classified with reason=novelty.
    pub novel: bool,
}

impl AnomalyDetector {
    pub fn new(spike_threshold: f64, stall_seconds: u64) -> Self {
        Self {
            temporal: temporal::TemporalDetector::new(spike_threshold, stall_seconds),
            novelty: novelty::NoveltyDetector::new(novelty::DEFAULT_MEMORY),
        }
    }

    pub fn set_baseline(&mut self, records_per_sec: f64) {
        self.temporal.set_baseline(records_per_sec);
    }

    pub fn rate_per_minute(&self) -> f64 {
        self.temporal.ewma_per_sec() * 60.0
    }

    /// Feed one record. `keyword_hit` reflects the source filter; the
    /// fingerprint must be the canonical form of the record's message.
    pub fn observe(
        &mut self,
        record: &LogRecord,
        fingerprint: &str,
        keyword_hit: bool,
        now: DateTime<Utc>,
    ) -> Assessment {
        let events = self.temporal.observe(record, now);

        let unseen = self.novelty.observe(fingerprint);
        let interesting = level_is_alarming(record.fields.level.as_deref())
            || keyword_hit
            || has_alarm_token(&record.line);

        Assessment {
            events,
            novel: unseen && interesting,
        }
    }

    /// Periodic stall check; call even when no records arrive.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Event> {
        self.temporal.check_stalls(now)
    }
}
