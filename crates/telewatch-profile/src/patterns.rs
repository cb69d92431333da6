//! Fixed pattern library used by format bootstrap and field extraction.

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

pub struct TimestampPattern {
    pub name: &'static str,
    pub regex: Regex,
}

/// Timestamp shapes seen in real-world logs, most specific first. Bootstrap
/// locks the most frequent match over the sample window.
pub static TIMESTAMP_PATTERNS: Lazy<Vec<TimestampPattern>> = Lazy::new(|| {
    let table: &[(&str, &str)] = &[
        ("iso8601", r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?"),
        ("iso8601-space", r"\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(?:[.,]\d+)?"),
        ("bracketed-iso", r"\[\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?\]"),
        ("rfc3164", r"[A-Z][a-z]{2}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2}"),
        ("clf", r"\d{2}/[A-Z][a-z]{2}/\d{4}:\d{2}:\d{2}:\d{2}(?:\s+[+-]\d{4})?"),
        ("slashed-date", r"\d{4}/\d{2}/\d{2}[ T]\d{2}:\d{2}:\d{2}"),
        ("us-date", r"\d{2}/\d{2}/\d{4}[ T]\d{2}:\d{2}:\d{2}"),
        ("bracketed-epoch", r"\[\d{10}(?:\.\d+)?\]"),
        ("epoch-millis", r"\b1\d{12}\b"),
        ("epoch-secs", r"\b1\d{9}\b"),
        ("time-only", r"^\d{2}:\d{2}:\d{2}(?:[.,]\d+)?"),
        ("bracketed-time", r"\[\d{2}:\d{2}:\d{2}(?:[.,]\d+)?\]"),
    ];
    table
        .iter()
        .map(|(name, pattern)| TimestampPattern {
            name,
            regex: Regex::new(pattern).unwrap(),
        })
        .collect()
});

pub static LEVEL_TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(DEBUG|INFO|WARN|WARNING|ERROR|FATAL|CRITICAL|TRACE)$").unwrap()
});

pub static SYSLOG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Z][a-z]{2}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2}\s+\S+\s+\S+:\s").unwrap()
});

pub static KV_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\w+=\S+(\s+\w+=\S+)+").unwrap());

pub const CSV_DELIMITERS: [char; 4] = [',', '|', ';', '\t'];

/// JSON keys probed for a severity value, in order.
pub const JSON_LEVEL_KEYS: [&str; 3] = ["level", "severity", "lvl"];

/// JSON keys probed for the human message, in order.
pub const JSON_MESSAGE_KEYS: [&str; 3] = ["message", "msg", "text"];

/// Parse the matched timestamp text into a concrete instant where the
/// format allows it; other formats matched for drift purposes only.
pub fn parse_timestamp(name: &str, text: &str) -> Option<DateTime<Utc>> {
    match name {
        "iso8601" => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| {
                chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
                    .ok()
                    .map(|naive| Utc.from_utc_datetime(&naive))
            }),
        "iso8601-space" => {
            let cleaned = text.replace(',', ".");
            chrono::NaiveDateTime::parse_from_str(&cleaned, "%Y-%m-%d %H:%M:%S%.f")
                .or_else(|_| {
                    chrono::NaiveDateTime::parse_from_str(&cleaned, "%Y-%m-%d %H:%M:%S")
                })
                .ok()
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        "epoch-secs" => text
            .parse::<i64>()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        "epoch-millis" => text
            .parse::<i64>()
            .ok()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}
