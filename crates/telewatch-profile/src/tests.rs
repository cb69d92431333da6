use crate::{LogFormat, Profiler, BOOTSTRAP_SAMPLE_LIMIT};
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn profiler() -> (Profiler, Arc<AtomicBool>) {
    let flag = Arc::new(AtomicBool::new(false));
    let profiler = Profiler::new(flag.clone());
    (profiler, flag)
}

#[test]
fn bootstrap_holds_profiling_flag_until_locked() {
    let (mut profiler, flag) = profiler();
    assert!(flag.load(Ordering::Relaxed));

    let now = Utc::now();
    for i in 0..BOOTSTRAP_SAMPLE_LIMIT {
        profiler.observe(&format!("plain line number {i}"), now);
    }

    assert!(!profiler.is_bootstrapping());
    assert!(!flag.load(Ordering::Relaxed));
}

#[test]
fn bootstrap_ends_on_time_window_with_few_records() {
    let (mut profiler, _) = profiler();
    let start = Utc::now();
    profiler.observe("only line", start);
    assert!(profiler.is_bootstrapping());

    profiler.observe("second line", start + Duration::seconds(61));
    assert!(!profiler.is_bootstrapping());
}

#[test]
fn json_stream_is_classified_as_json() {
    let (mut profiler, _) = profiler();
    let now = Utc::now();
    for i in 0..BOOTSTRAP_SAMPLE_LIMIT {
        profiler.observe(
            &format!(r#"{{"level":"info","message":"request {i} handled"}}"#),
            now,
        );
    }
    assert_eq!(profiler.profile().unwrap().format, LogFormat::Json);
}

#[test]
fn json_extraction_pulls_level_and_message() {
    let (mut profiler, _) = profiler();
    let now = Utc::now();
    for _ in 0..BOOTSTRAP_SAMPLE_LIMIT {
        profiler.observe(r#"{"level":"error","message":"db down"}"#, now);
    }

    let fields = profiler.extract(r#"{"level":"error","message":"db down"}"#);
    assert_eq!(fields.level.as_deref(), Some("ERROR"));
    assert_eq!(fields.message.as_deref(), Some("db down"));
}

#[test]
fn timestamp_and_level_prefix_are_stripped_from_message() {
    let (mut profiler, _) = profiler();
    let now = Utc::now();
    for i in 0..BOOTSTRAP_SAMPLE_LIMIT {
        profiler.observe(
            &format!("2024-01-01T10:00:{:02}Z ERROR failed to connect to db", i % 60),
            now,
        );
    }

    let fields = profiler.extract("2024-01-01T10:05:00Z ERROR failed to connect to db");
    assert_eq!(fields.level.as_deref(), Some("ERROR"));
    assert_eq!(fields.message.as_deref(), Some("failed to connect to db"));
    assert!(fields.timestamp.is_some());
}

#[test]
fn csv_stream_locks_delimiter() {
    let (mut profiler, _) = profiler();
    let now = Utc::now();
    for i in 0..BOOTSTRAP_SAMPLE_LIMIT {
        profiler.observe(&format!("2024-01-01,host-{i},GET,/index,200"), now);
    }
    let profile = profiler.profile().unwrap();
    assert_eq!(profile.format, LogFormat::Csv);
    assert_eq!(profile.delimiter, Some(','));
}

#[test]
fn kv_stream_is_classified() {
    let (mut profiler, _) = profiler();
    let now = Utc::now();
    for i in 0..BOOTSTRAP_SAMPLE_LIMIT {
        profiler.observe(&format!("level=info msg=served port=8080 req={i}"), now);
    }
    assert_eq!(profiler.profile().unwrap().format, LogFormat::Kv);
}

#[test]
fn sustained_drift_triggers_reprofile() {
    let (mut profiler, flag) = profiler();
    let now = Utc::now();

    for i in 0..150 {
        let obs = profiler.observe(&format!(r#"{{"level":"info","n":{i}}}"#), now);
        assert!(!obs.drift);
    }
    assert_eq!(profiler.profile().unwrap().format, LogFormat::Json);

    // Switch the stream to plain text; the drift ratio crosses 20% of the
    // trailing window after 21 deviating records.
    let mut drift_seen = 0;
    for i in 0..121 {
        let obs = profiler.observe(&format!("plain text line {i}"), now);
        if obs.drift {
            drift_seen += 1;
        }
    }

    assert_eq!(drift_seen, 1);
    assert_eq!(profiler.profile().unwrap().format, LogFormat::Plain);
    assert!(!flag.load(Ordering::Relaxed));
}

#[test]
fn matching_records_cool_the_drift_counter() {
    let (mut profiler, _) = profiler();
    let now = Utc::now();
    for i in 0..BOOTSTRAP_SAMPLE_LIMIT {
        profiler.observe(&format!(r#"{{"n":{i}}}"#, ), now);
    }

    // Alternate good and bad records; the counter never accumulates.
    for i in 0..200 {
        let obs = if i % 2 == 0 {
            profiler.observe("not json", now)
        } else {
            profiler.observe(r#"{"n":1}"#, now)
        };
        assert!(!obs.drift);
    }
    assert_eq!(profiler.profile().unwrap().format, LogFormat::Json);
}

#[test]
fn baseline_rate_reflects_bootstrap_window() {
    let (mut profiler, _) = profiler();
    let start = Utc::now();
    for i in 0..BOOTSTRAP_SAMPLE_LIMIT {
        // 100 records over 50 seconds: 2 records/sec.
        profiler.observe("line", start + Duration::milliseconds(i as i64 * 500));
    }
    let rate = profiler.baseline_rate();
    assert!((1.5..=2.5).contains(&rate), "rate was {rate}");
}
