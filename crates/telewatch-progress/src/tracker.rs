use crate::history::HistoryStore;
use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use telewatch_common::config::ProcessConfig;
use telewatch_common::types::{Event, EventReason, Severity};

/// No two progress events inside this window.
const MIN_PROGRESS_EVENT_SECS: i64 = 60;
/// Source id used on progress events (they describe the run, not a stream).
const PROGRESS_SOURCE: &str = "progress";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageStatus {
    Pending,
    Active,
    Done,
}

struct StageState {
    name: String,
    weight: u32,
    start_re: Regex,
    status: StageStatus,
    started_at: Option<DateTime<Utc>>,
}

enum ProgressKind {
    /// Two capture groups: current and total.
    Fraction,
    /// One capture group: percentage.
    Percent,
}

struct ProgressPattern {
    regex: Regex,
    kind: ProgressKind,
}

/// Derives a monotone completion fraction for one monitored process from
/// explicit progress lines, weighted stage transitions, and (when stages
/// and history allow it) linear time interpolation inside the active
/// stage.
pub struct ProgressTracker {
    process_name: String,
    stages: Vec<StageState>,
    active: Option<usize>,
    fraction: f64,
    started_at: Option<DateTime<Utc>>,
    /// Seconds; from config override or history median.
    expected_duration: Option<f64>,
    progress_patterns: Vec<ProgressPattern>,
    completion_patterns: Vec<Regex>,
    milestone_step: f64,
    last_reported: f64,
    last_progress_event: Option<DateTime<Utc>>,
    completed: bool,
    history: HistoryStore,
}

impl ProgressTracker {
    pub fn new(config: &ProcessConfig, history: HistoryStore) -> Self {
        let expected_duration = config
            .expected_duration_minutes
            .map(|m| m as f64 * 60.0)
            .or_else(|| history.median_duration(&config.name));

        let stages = config
            .stages
            .iter()
            .filter_map(|s| {
                match RegexBuilder::new(&s.start_pattern).case_insensitive(true).build() {
                    Ok(start_re) => Some(StageState {
                        name: s.name.clone(),
                        weight: s.weight,
                        start_re,
                        status: StageStatus::Pending,
                        started_at: None,
                    }),
                    Err(e) => {
                        tracing::warn!(stage = %s.name, error = %e, "Skipping stage with invalid start pattern");
                        None
                    }
                }
            })
            .collect();

        Self {
            process_name: config.name.clone(),
            stages,
            active: None,
            fraction: 0.0,
            started_at: None,
            expected_duration,
            progress_patterns: compile_progress_patterns(&config.progress_patterns),
            completion_patterns: compile_completion_patterns(&config.completion_patterns),
            milestone_step: (config.milestone_percent.clamp(1, 100) as f64) / 100.0,
            last_reported: 0.0,
            last_progress_event: None,
            completed: false,
            history,
        }
    }

    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    pub fn active_stage(&self) -> Option<&str> {
        self.active.map(|i| self.stages[i].name.as_str())
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<f64> {
        self.started_at
            .map(|s| (now - s).num_milliseconds().max(0) as f64 / 1000.0)
    }

    /// Extrapolated seconds remaining, once some progress exists.
    pub fn eta_seconds(&self, now: DateTime<Utc>) -> Option<f64> {
        if self.completed || self.fraction <= 0.0 {
            return None;
        }
        let elapsed = self.elapsed(now)?;
        let total = elapsed / self.fraction;
        Some((total - elapsed).max(0.0))
    }

    /// Feed one post-profile line. Returns stage/progress/completion events.
    pub fn observe_line(&mut self, line: &str, now: DateTime<Utc>) -> Vec<Event> {
        self.started_at.get_or_insert(now);
        if self.completed {
            return Vec::new();
        }

        let mut events = Vec::new();

        if let Some(event) = self.advance_stages(line, now) {
            events.push(event);
        }

        for pattern in &self.progress_patterns {
            if let Some(value) = pattern_fraction(pattern, line) {
                // Monotone within a run: regressions in the log are noise.
                self.fraction = self.fraction.max(value.clamp(0.0, 1.0));
                break;
            }
        }

        self.fraction = self.fraction.max(self.stage_fraction(now));

        if self.completion_patterns.iter().any(|re| re.is_match(line)) {
            events.push(self.complete(now));
            return events;
        }

        if let Some(event) = self.milestone_event(now) {
            events.push(event);
        }
        events
    }

    /// Periodic re-evaluation so time-based interpolation advances while
    /// the log is quiet.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<Event> {
        if self.completed || self.started_at.is_none() {
            return None;
        }

        self.fraction = self.fraction.max(self.stage_fraction(now));

        // With no stages, fall back to pure time interpolation against the
        // expected duration, capped shy of done until a completion marker.
        if self.stages.is_empty() {
            if let (Some(expected), Some(elapsed)) = (self.expected_duration, self.elapsed(now)) {
                if expected > 0.0 {
                    let estimate = (elapsed / expected).min(0.999);
                    self.fraction = self.fraction.max(estimate);
                }
            }
        }

        self.milestone_event(now)
    }

    /// Explicit completion signal from outside the log stream: the watched
    /// process left the process table. Fires regardless of any configured
    /// completion patterns.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> Option<Event> {
        if self.completed {
            return None;
        }
        self.started_at.get_or_insert(now);
        Some(self.complete(now))
    }

    fn advance_stages(&mut self, line: &str, now: DateTime<Utc>) -> Option<Event> {
        // Later stage definitions win when one line matches several; a
        // match for an already-passed stage is ignored.
        let matched = self
            .stages
            .iter()
            .rposition(|s| s.start_re.is_match(line))?;
        if self.active.is_some_and(|current| matched <= current) {
            return None;
        }

        for earlier in self.stages[..matched].iter_mut() {
            earlier.status = StageStatus::Done;
        }
        let stage = &mut self.stages[matched];
        stage.status = StageStatus::Active;
        stage.started_at = Some(now);
        self.active = Some(matched);

        tracing::info!(process = %self.process_name, stage = %stage.name, "Stage started");
        Some(
            Event::new(
                PROGRESS_SOURCE,
                Severity::Info,
                EventReason::Stage,
                format!("{}: stage '{}' started", self.process_name, stage.name),
            )
            .with_detail(format!("stage {} of {}", matched + 1, self.stages.len())),
        )
    }

    /// Σ(done weights + active interpolation × active weight) / Σ(weights).
    fn stage_fraction(&self, now: DateTime<Utc>) -> f64 {
        if self.stages.is_empty() {
            return 0.0;
        }
        let total: f64 = self.stages.iter().map(|s| s.weight as f64).sum();
        if total <= 0.0 {
            return 0.0;
        }
        let done: f64 = self
            .stages
            .iter()
            .filter(|s| s.status == StageStatus::Done)
            .map(|s| s.weight as f64)
            .sum();

        let mut active_part = 0.0;
        if let Some(idx) = self.active {
            let stage = &self.stages[idx];
            if stage.status == StageStatus::Active {
                let weight = stage.weight as f64;
                // Interpolate inside the stage against its share of the
                // expected total duration; without history the stage only
                // contributes once the next one starts.
                if let (Some(expected), Some(started)) = (self.expected_duration, stage.started_at)
                {
                    let stage_budget = expected * weight / total;
                    if stage_budget > 0.0 {
                        let in_stage = (now - started).num_milliseconds().max(0) as f64 / 1000.0;
                        active_part = (in_stage / stage_budget).min(1.0) * weight;
                    }
                }
            }
        }

        (done + active_part) / total
    }

    fn milestone_event(&mut self, now: DateTime<Utc>) -> Option<Event> {
        let step_now = (self.fraction / self.milestone_step).floor() as i64;
        let step_last = (self.last_reported / self.milestone_step).floor() as i64;
        if step_now <= step_last {
            return None;
        }
        if self
            .last_progress_event
            .is_some_and(|t| (now - t).num_seconds() < MIN_PROGRESS_EVENT_SECS)
        {
            return None;
        }

        self.last_reported = self.fraction;
        self.last_progress_event = Some(now);

        let mut summary = format!(
            "{}: {:.0}% complete",
            self.process_name,
            self.fraction * 100.0
        );
        if let Some(eta) = self.eta_seconds(now) {
            summary.push_str(&format!(", about {} left", format_duration(eta)));
        }
        Some(Event::new(
            PROGRESS_SOURCE,
            Severity::Info,
            EventReason::Progress,
            summary,
        ))
    }

    fn complete(&mut self, now: DateTime<Utc>) -> Event {
        self.completed = true;
        self.fraction = 1.0;
        let duration = self.elapsed(now).unwrap_or(0.0);

        if let Err(e) = self.history.record(&self.process_name, duration) {
            tracing::warn!(error = %e, "Failed to persist run duration");
        }
        tracing::info!(
            process = %self.process_name,
            duration_secs = duration,
            "Run completed"
        );

        Event::new(
            PROGRESS_SOURCE,
            Severity::Info,
            EventReason::Completion,
            format!(
                "{} completed in {}",
                self.process_name,
                format_duration(duration)
            ),
        )
    }
}

fn compile_progress_patterns(configured: &[String]) -> Vec<ProgressPattern> {
    let sources: Vec<String> = if configured.is_empty() {
        vec![
            r"(\d+(?:\.\d+)?)%".to_string(),
            r"epoch\s+(\d+)\s+of\s+(\d+)".to_string(),
            r"(\d+)\s*/\s*(\d+)".to_string(),
        ]
    } else {
        configured.to_vec()
    };

    sources
        .iter()
        .filter_map(|src| match RegexBuilder::new(src).case_insensitive(true).build() {
            Ok(regex) => {
                let kind = if regex.captures_len() >= 3 {
                    ProgressKind::Fraction
                } else {
                    ProgressKind::Percent
                };
                Some(ProgressPattern { regex, kind })
            }
            Err(e) => {
                tracing::warn!(pattern = %src, error = %e, "Skipping invalid progress pattern");
                None
            }
        })
        .collect()
}

fn compile_completion_patterns(configured: &[String]) -> Vec<Regex> {
    let sources: Vec<String> = if configured.is_empty() {
        vec![
            r"completed successfully".to_string(),
            r"finished successfully".to_string(),
            r"run complete\b".to_string(),
        ]
    } else {
        configured.to_vec()
    };
    sources
        .iter()
        .filter_map(|src| match RegexBuilder::new(src).case_insensitive(true).build() {
            Ok(regex) => Some(regex),
            Err(e) => {
                tracing::warn!(pattern = %src, error = %e, "Skipping invalid completion pattern");
                None
            }
        })
        .collect()
}

fn pattern_fraction(pattern: &ProgressPattern, line: &str) -> Option<f64> {
    let caps = pattern.regex.captures(line)?;
    match pattern.kind {
        ProgressKind::Percent => {
            let pct: f64 = caps.get(1)?.as_str().parse().ok()?;
            (0.0..=100.0).contains(&pct).then_some(pct / 100.0)
        }
        ProgressKind::Fraction => {
            let current: f64 = caps.get(1)?.as_str().parse().ok()?;
            let total: f64 = caps.get(2)?.as_str().parse().ok()?;
            (total > 0.0 && current <= total).then_some(current / total)
        }
    }
}

/// `XhYm` / `Ym` / `Zs` formatting used in progress and status messages.
pub fn format_duration(seconds: f64) -> String {
    let secs = seconds.max(0.0) as u64;
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m")
    } else {
        format!("{secs}s")
    }
}
