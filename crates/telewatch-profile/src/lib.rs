//! Online log-stream profiling.
//!
//! The profiler is always on. It bootstraps a [`Profile`] from the first
//! records of a stream (format, timestamp pattern, baseline rate), then
//! watches every subsequent record for structural drift. Sustained drift
//! resets the profile and re-runs the bootstrap.
//!
//! While bootstrap is running the shared `profiling` flag is held set so
//! source adapters bypass their keyword filters and the sample stays
//! representative; the flag is cleared when a profile locks.

pub mod patterns;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use telewatch_common::types::ExtractedFields;

use patterns::{
    parse_timestamp, CSV_DELIMITERS, JSON_LEVEL_KEYS, JSON_MESSAGE_KEYS, KV_RE, LEVEL_TOKEN_RE,
    SYSLOG_RE, TIMESTAMP_PATTERNS,
};

/// Bootstrap ends after this many records...
pub const BOOTSTRAP_SAMPLE_LIMIT: usize = 100;
/// ...or this many seconds, whichever comes first.
pub const BOOTSTRAP_WINDOW_SECS: i64 = 60;
/// Trailing window over which the drift ratio is judged.
const DRIFT_WINDOW: f64 = 100.0;
/// Re-profile when more than this fraction of the trailing window deviates.
const DRIFT_RATIO: f64 = 0.20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Csv,
    Syslog,
    Kv,
    Plain,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogFormat::Json => "json",
            LogFormat::Csv => "csv",
            LogFormat::Syslog => "syslog",
            LogFormat::Kv => "kv",
            LogFormat::Plain => "plain",
        };
        write!(f, "{s}")
    }
}

/// The inferred structure of one source's stream.
#[derive(Debug, Clone)]
pub struct Profile {
    pub format: LogFormat,
    pub delimiter: Option<char>,
    /// Index into [`patterns::TIMESTAMP_PATTERNS`], if one locked.
    pub timestamp_pattern: Option<usize>,
    /// Records per second over the bootstrap window.
    pub baseline_rate: f64,
    pub sample_count: usize,
}

/// What the profiler learned from one record.
pub struct Observation {
    pub fields: ExtractedFields,
    /// Set on the record that pushed the drift ratio over the threshold.
    pub drift: bool,
}

pub struct Profiler {
    profiling: Arc<AtomicBool>,
    samples: Vec<String>,
    bootstrap_started: Option<DateTime<Utc>>,
    profile: Option<Profile>,
    drift: f64,
}

impl Profiler {
    pub fn new(profiling: Arc<AtomicBool>) -> Self {
        profiling.store(true, Ordering::Relaxed);
        Self {
            profiling,
            samples: Vec::with_capacity(BOOTSTRAP_SAMPLE_LIMIT),
            bootstrap_started: None,
            profile: None,
            drift: 0.0,
        }
    }

    pub fn profile(&self) -> Option<&Profile> {
        self.profile.as_ref()
    }

    pub fn baseline_rate(&self) -> f64 {
        self.profile.as_ref().map(|p| p.baseline_rate).unwrap_or(0.0)
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.profile.is_none()
    }

    /// Feed one record. Returns the extracted fields plus whether this
    /// record triggered re-profiling.
    pub fn observe(&mut self, line: &str, now: DateTime<Utc>) -> Observation {
        if self.profile.is_none() {
            self.bootstrap_started.get_or_insert(now);
            if self.samples.len() < BOOTSTRAP_SAMPLE_LIMIT {
                self.samples.push(line.trim_end().to_string());
            }
            let elapsed = now - self.bootstrap_started.unwrap();
            if self.samples.len() >= BOOTSTRAP_SAMPLE_LIMIT
                || elapsed.num_seconds() >= BOOTSTRAP_WINDOW_SECS
            {
                self.lock_profile(now);
            }
            return Observation {
                fields: self.extract(line),
                drift: false,
            };
        }

        let drifted = if self.matches_profile(line) {
            self.drift = (self.drift - 1.0).max(0.0);
            false
        } else {
            self.drift += 1.0;
            self.drift / DRIFT_WINDOW > DRIFT_RATIO
        };

        if drifted {
            tracing::warn!(
                format = %self.profile.as_ref().unwrap().format,
                "Structural drift detected, re-profiling stream"
            );
            self.reset(now);
            self.samples.push(line.trim_end().to_string());
            return Observation {
                fields: self.extract(line),
                drift: true,
            };
        }

        Observation {
            fields: self.extract(line),
            drift: false,
        }
    }

    fn reset(&mut self, now: DateTime<Utc>) {
        self.samples.clear();
        self.profile = None;
        self.drift = 0.0;
        self.bootstrap_started = Some(now);
        self.profiling.store(true, Ordering::Relaxed);
    }

    fn lock_profile(&mut self, now: DateTime<Utc>) {
        let format = classify_format(&self.samples);
        let delimiter = if format == LogFormat::Csv {
            detect_delimiter(&self.samples)
        } else {
            None
        };
        let timestamp_pattern = detect_timestamp(&self.samples);

        let elapsed = (now - self.bootstrap_started.unwrap())
            .num_milliseconds()
            .max(1) as f64
            / 1000.0;
        let baseline_rate = self.samples.len() as f64 / elapsed.max(1.0);

        tracing::info!(
            format = %format,
            timestamp = timestamp_pattern
                .map(|i| TIMESTAMP_PATTERNS[i].name)
                .unwrap_or("none"),
            baseline_rate,
            samples = self.samples.len(),
            "Stream profile locked"
        );

        self.profile = Some(Profile {
            format,
            delimiter,
            timestamp_pattern,
            baseline_rate,
            sample_count: self.samples.len(),
        });
        self.drift = 0.0;
        self.profiling.store(false, Ordering::Relaxed);
    }

    fn matches_profile(&self, line: &str) -> bool {
        let Some(profile) = &self.profile else {
            return true;
        };
        let format_ok = match profile.format {
            LogFormat::Json => parses_as_json_object(line),
            LogFormat::Csv => profile
                .delimiter
                .map(|d| line.matches(d).count() >= 3)
                .unwrap_or(true),
            LogFormat::Syslog => SYSLOG_RE.is_match(line),
            LogFormat::Kv => KV_RE.is_match(line),
            LogFormat::Plain => true,
        };
        if !format_ok {
            return false;
        }
        match profile.timestamp_pattern {
            Some(idx) => TIMESTAMP_PATTERNS[idx].regex.is_match(line),
            None => true,
        }
    }

    /// Extracted timestamp (or nothing, caller falls back to arrival time),
    /// severity string, and the message portion with timestamp/level
    /// prefixes stripped.
    pub fn extract(&self, line: &str) -> ExtractedFields {
        let line = line.trim_end();
        if let Some(profile) = &self.profile {
            if profile.format == LogFormat::Json {
                if let Some(fields) = extract_json(line) {
                    return fields;
                }
                // Fall through for records that drifted away from JSON.
            }
        }
        extract_textual(line, self.profile.as_ref().and_then(|p| p.timestamp_pattern))
    }
}

fn parses_as_json_object(line: &str) -> bool {
    matches!(
        serde_json::from_str::<serde_json::Value>(line),
        Ok(serde_json::Value::Object(_))
    )
}

fn csv_like(line: &str) -> Option<char> {
    CSV_DELIMITERS
        .iter()
        .copied()
        .find(|&d| line.matches(d).count() >= 3)
}

fn classify_format(samples: &[String]) -> LogFormat {
    let mut counts = [0usize; 5]; // json, csv, syslog, kv, plain
    for sample in samples {
        let idx = if parses_as_json_object(sample) {
            0
        } else if csv_like(sample).is_some() {
            1
        } else if SYSLOG_RE.is_match(sample) {
            2
        } else if KV_RE.is_match(sample) {
            3
        } else {
            4
        };
        counts[idx] += 1;
    }
    let winner = counts
        .iter()
        .enumerate()
        .max_by_key(|(_, c)| **c)
        .map(|(i, _)| i)
        .unwrap_or(4);
    [
        LogFormat::Json,
        LogFormat::Csv,
        LogFormat::Syslog,
        LogFormat::Kv,
        LogFormat::Plain,
    ][winner]
}

fn detect_delimiter(samples: &[String]) -> Option<char> {
    let mut best: Option<(char, usize)> = None;
    for &delim in &CSV_DELIMITERS {
        let count = samples
            .iter()
            .filter(|s| s.matches(delim).count() >= 3)
            .count();
        if count > best.map(|(_, c)| c).unwrap_or(0) {
            best = Some((delim, count));
        }
    }
    best.map(|(d, _)| d)
}

fn detect_timestamp(samples: &[String]) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (idx, pattern) in TIMESTAMP_PATTERNS.iter().enumerate() {
        let count = samples.iter().filter(|s| pattern.regex.is_match(s)).count();
        if count > best.map(|(_, c)| c).unwrap_or(0) {
            best = Some((idx, count));
        }
    }
    // Lock only when the winner covers at least half the sample.
    best.filter(|(_, count)| *count * 2 >= samples.len().max(1))
        .map(|(idx, _)| idx)
}

fn extract_json(line: &str) -> Option<ExtractedFields> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let obj = value.as_object()?;

    let level = JSON_LEVEL_KEYS
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(|v| v.as_str())
        .map(|s| s.to_uppercase());

    let message = JSON_MESSAGE_KEYS
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| line.to_string());

    let timestamp = ["timestamp", "time", "ts", "@timestamp"]
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(|v| match v {
            serde_json::Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            serde_json::Value::Number(n) => n.as_i64().and_then(|secs| {
                use chrono::TimeZone;
                if secs > 10_000_000_000 {
                    Utc.timestamp_millis_opt(secs).single()
                } else {
                    Utc.timestamp_opt(secs, 0).single()
                }
            }),
            _ => None,
        });

    Some(ExtractedFields {
        timestamp,
        level,
        message: Some(message),
    })
}

fn extract_textual(line: &str, locked_pattern: Option<usize>) -> ExtractedFields {
    let mut timestamp = None;
    let mut rest = line.to_string();

    let candidates: Vec<usize> = match locked_pattern {
        Some(idx) => vec![idx],
        None => (0..TIMESTAMP_PATTERNS.len()).collect(),
    };
    for idx in candidates {
        let pattern = &TIMESTAMP_PATTERNS[idx];
        if let Some(m) = pattern.regex.find(&rest) {
            timestamp = parse_timestamp(pattern.name, m.as_str());
            let mut stripped = String::with_capacity(rest.len());
            stripped.push_str(&rest[..m.start()]);
            stripped.push_str(&rest[m.end()..]);
            rest = stripped;
            break;
        }
    }

    // Level: the first whitespace token anywhere on the line that is a bare
    // severity word. Only a *leading* level token is stripped from the
    // message portion.
    let mut level = None;
    for token in rest.split_whitespace() {
        let bare = token.trim_matches(|c: char| !c.is_ascii_alphanumeric());
        if LEVEL_TOKEN_RE.is_match(bare) {
            level = Some(bare.to_uppercase());
            break;
        }
    }
    if level.is_some() {
        let trimmed = rest.trim_start();
        if let Some(first) = trimmed.split_whitespace().next() {
            let bare = first.trim_matches(|c: char| !c.is_ascii_alphanumeric());
            if LEVEL_TOKEN_RE.is_match(bare) {
                rest = trimmed[first.len()..].to_string();
            }
        }
    }

    let message = rest.trim().to_string();
    ExtractedFields {
        timestamp,
        level,
        message: if message.is_empty() {
            Some(line.to_string())
        } else {
            Some(message)
        },
    }
}
