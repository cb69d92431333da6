use crate::history::HistoryStore;
use crate::tracker::{format_duration, ProgressTracker};
use chrono::{DateTime, Duration, Utc};
use telewatch_common::config::{ProcessConfig, StageConfig};
use telewatch_common::types::EventReason;

fn history() -> (HistoryStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = HistoryStore::load(&dir.path().join("history.json"));
    (store, dir)
}

fn process_config(stages: Vec<StageConfig>) -> ProcessConfig {
    ProcessConfig {
        name: "train".into(),
        stages,
        expected_duration_minutes: None,
        progress_patterns: vec![],
        completion_patterns: vec![],
        milestone_percent: 10,
    }
}

fn stage(name: &str, weight: u32, pattern: &str) -> StageConfig {
    StageConfig {
        name: name.into(),
        weight,
        start_pattern: pattern.into(),
    }
}

#[test]
fn weighted_stage_transition_moves_the_fraction() {
    let (store, _dir) = history();
    let config = process_config(vec![
        stage("A", 1, "phase A"),
        stage("B", 3, "phase B"),
    ]);
    let mut tracker = ProgressTracker::new(&config, store);

    let t0 = Utc::now();
    let events = tracker.observe_line("entering phase A", t0);
    assert_eq!(events.iter().filter(|e| e.reason == EventReason::Stage).count(), 1);
    assert_eq!(tracker.fraction(), 0.0);
    assert_eq!(tracker.active_stage(), Some("A"));

    let events = tracker.observe_line("entering phase B", t0 + Duration::seconds(30));
    assert_eq!(events.iter().filter(|e| e.reason == EventReason::Stage).count(), 1);
    assert!((tracker.fraction() - 0.25).abs() < 1e-9);
    assert_eq!(tracker.active_stage(), Some("B"));
}

#[test]
fn stage_regression_is_ignored() {
    let (store, _dir) = history();
    let config = process_config(vec![
        stage("A", 1, "phase A"),
        stage("B", 1, "phase B"),
    ]);
    let mut tracker = ProgressTracker::new(&config, store);

    let t0 = Utc::now();
    tracker.observe_line("phase B begins", t0);
    assert_eq!(tracker.active_stage(), Some("B"));

    // A late line matching an earlier stage must not move anything.
    let events = tracker.observe_line("phase A retry text", t0 + Duration::seconds(5));
    assert!(events.iter().all(|e| e.reason != EventReason::Stage));
    assert_eq!(tracker.active_stage(), Some("B"));
}

#[test]
fn explicit_percent_lines_drive_progress() {
    let (store, _dir) = history();
    let mut tracker = ProgressTracker::new(&process_config(vec![]), store);

    let t0 = Utc::now();
    tracker.observe_line("progress: 25%", t0);
    assert!((tracker.fraction() - 0.25).abs() < 1e-9);

    tracker.observe_line("progress: 60%", t0 + Duration::seconds(120));
    assert!((tracker.fraction() - 0.60).abs() < 1e-9);
}

#[test]
fn fraction_is_monotone_within_a_run() {
    let (store, _dir) = history();
    let mut tracker = ProgressTracker::new(&process_config(vec![]), store);

    let t0 = Utc::now();
    tracker.observe_line("completed 80/100 items", t0);
    assert!((tracker.fraction() - 0.8).abs() < 1e-9);

    // A smaller reading later (counter reset, noisy log) never regresses.
    tracker.observe_line("completed 10/100 items", t0 + Duration::seconds(10));
    assert!((tracker.fraction() - 0.8).abs() < 1e-9);
}

#[test]
fn epoch_style_lines_parse_as_fractions() {
    let (store, _dir) = history();
    let mut tracker = ProgressTracker::new(&process_config(vec![]), store);

    tracker.observe_line("starting epoch 3 of 10", Utc::now());
    assert!((tracker.fraction() - 0.3).abs() < 1e-9);
}

#[test]
fn milestones_fire_at_most_every_minute() {
    let (store, _dir) = history();
    let mut tracker = ProgressTracker::new(&process_config(vec![]), store);

    let t0 = Utc::now();
    let events = tracker.observe_line("10% done", t0);
    assert_eq!(events.iter().filter(|e| e.reason == EventReason::Progress).count(), 1);

    // Crossing 20% only seconds later is clamped by the spacing rule.
    let events = tracker.observe_line("20% done", t0 + Duration::seconds(5));
    assert_eq!(events.iter().filter(|e| e.reason == EventReason::Progress).count(), 0);

    // After a minute the next crossing reports.
    let events = tracker.observe_line("30% done", t0 + Duration::seconds(70));
    assert_eq!(events.iter().filter(|e| e.reason == EventReason::Progress).count(), 1);
}

#[test]
fn completion_records_duration_to_history() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.json");

    {
        let store = HistoryStore::load(&path);
        let mut tracker = ProgressTracker::new(&process_config(vec![]), store);
        let t0 = Utc::now();
        tracker.observe_line("warming up", t0);
        let events = tracker.observe_line(
            "job completed successfully",
            t0 + Duration::seconds(90),
        );
        assert_eq!(events.last().unwrap().reason, EventReason::Completion);
        assert!(tracker.is_completed());
        assert_eq!(tracker.fraction(), 1.0);
    }

    let store = HistoryStore::load(&path);
    let median = store.median_duration("train").unwrap();
    assert!((median - 90.0).abs() < 1.0);
}

#[test]
fn history_median_seeds_time_interpolation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.json");
    {
        let mut store = HistoryStore::load(&path);
        for _ in 0..3 {
            store.record("train", 600.0).unwrap();
        }
    }

    let store = HistoryStore::load(&path);
    let config = process_config(vec![
        stage("A", 1, "phase A"),
        stage("B", 1, "phase B"),
    ]);
    let mut tracker = ProgressTracker::new(&config, store);

    let t0 = Utc::now();
    tracker.observe_line("phase A", t0);

    // Stage A's budget is 300s (weight 1 of 2 against a 600s median); at
    // 150s in, the stage is half done and the run a quarter done.
    tracker.poll(t0 + Duration::seconds(150));
    assert!((tracker.fraction() - 0.25).abs() < 0.01);

    // Interpolation caps at the stage's share until the next stage starts.
    tracker.poll(t0 + Duration::seconds(10_000));
    assert!((tracker.fraction() - 0.5).abs() < 0.01);
}

#[test]
fn expected_duration_without_stages_interpolates_over_time() {
    let (store, _dir) = history();
    let mut config = process_config(vec![]);
    config.expected_duration_minutes = Some(10);
    let mut tracker = ProgressTracker::new(&config, store);

    let t0 = Utc::now();
    tracker.observe_line("working", t0);
    tracker.poll(t0 + Duration::seconds(300));
    assert!((tracker.fraction() - 0.5).abs() < 0.01);

    // Never reports done from time alone.
    tracker.poll(t0 + Duration::seconds(6000));
    assert!(tracker.fraction() < 1.0);
}

#[test]
fn explicit_completion_signal_ends_the_run() {
    let (store, _dir) = history();
    let mut config = process_config(vec![]);
    // Custom completion patterns must not disable the explicit signal.
    config.completion_patterns = vec!["deploy finished cleanly".into()];
    let mut tracker = ProgressTracker::new(&config, store);

    let t0 = Utc::now();
    tracker.observe_line("working", t0);
    let event = tracker.mark_completed(t0 + Duration::seconds(10)).unwrap();
    assert_eq!(event.reason, EventReason::Completion);
    assert!(tracker.is_completed());
    assert_eq!(tracker.fraction(), 1.0);

    // A second signal is a no-op.
    assert!(tracker.mark_completed(t0 + Duration::seconds(20)).is_none());
}

#[test]
fn duration_formatting() {
    assert_eq!(format_duration(42.0), "42s");
    assert_eq!(format_duration(150.0), "2m");
    assert_eq!(format_duration(3720.0), "1h 2m");
}
