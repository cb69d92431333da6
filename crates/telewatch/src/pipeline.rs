//! The per-record analysis pipeline: profile → anomaly → progress →
//! classify. One worker task owns all of it, so records from one source
//! are processed strictly in arrival order and no stage needs a lock.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use telewatch_anomaly::AnomalyDetector;
use telewatch_classify::{fingerprint, Classifier};
use telewatch_common::status::StatusBoard;
use telewatch_common::types::{Event, EventReason, LogRecord, Severity};
use telewatch_notify::utils::truncate_string;
use telewatch_profile::Profiler;
use telewatch_progress::ProgressTracker;
use telewatch_source::pid;
use tokio::sync::mpsc;

pub struct Pipeline {
    status: Arc<StatusBoard>,
    events: mpsc::Sender<Event>,
    turbo: bool,
    /// One profile per source stream.
    profilers: HashMap<String, Profiler>,
    /// Lowercased keyword sets per source, for candidacy checks.
    keywords: HashMap<String, Vec<String>>,
    /// Sources backed by a PID watcher; their exit records end the run.
    pid_sources: HashSet<String>,
    anomaly: AnomalyDetector,
    progress: Option<ProgressTracker>,
    classifier: Classifier,
    /// Sources whose bootstrap already contributed to the anomaly baseline.
    baselined: HashSet<String>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        status: Arc<StatusBoard>,
        events: mpsc::Sender<Event>,
        turbo: bool,
        source_flags: HashMap<String, Arc<AtomicBool>>,
        keywords: HashMap<String, Vec<String>>,
        pid_sources: HashSet<String>,
        anomaly: AnomalyDetector,
        progress: Option<ProgressTracker>,
        classifier: Classifier,
    ) -> Self {
        // Turbo leaves the profiling flags untouched (false), so source
        // keyword filters apply from the first record.
        let profilers = if turbo {
            HashMap::new()
        } else {
            source_flags
                .into_iter()
                .map(|(source_id, flag)| (source_id, Profiler::new(flag)))
                .collect()
        };
        Self {
            status,
            events,
            turbo,
            profilers,
            keywords,
            pid_sources,
            anomaly,
            progress,
            classifier,
            baselined: HashSet::new(),
        }
    }

    pub async fn handle_record(&mut self, mut record: LogRecord) {
        let now = Utc::now();
        self.status.note_line(&record.source_id, &record.line);

        let keyword_hit = self.keywords.get(&record.source_id).is_some_and(|kws| {
            let lower = record.line.to_lowercase();
            !kws.is_empty() && kws.iter().any(|k| lower.contains(k))
        });

        let mut novel = false;
        if !self.turbo {
            let mut drifted = false;
            let mut just_locked = false;
            if let Some(profiler) = self.profilers.get_mut(&record.source_id) {
                let was_bootstrapping = profiler.is_bootstrapping();
                let observation = profiler.observe(&record.line, now);
                // Adapter-extracted fields (pid/journal synthetics) win over
                // re-parsing the line.
                if record.fields.message.is_none() {
                    record.fields = observation.fields;
                }
                drifted = observation.drift;
                just_locked = was_bootstrapping && !profiler.is_bootstrapping();
            }
            if drifted {
                self.baselined.remove(&record.source_id);
                self.emit(Event::new(
                    &record.source_id,
                    Severity::Warning,
                    EventReason::Drift,
                    "log format drifted, re-learning stream structure",
                ))
                .await;
            }
            if just_locked {
                self.refresh_baseline(&record.source_id);
            }

            let fp = fingerprint(record.message());
            let assessment = self.anomaly.observe(&record, &fp, keyword_hit, now);
            for event in assessment.events {
                self.emit(event).await;
            }
            novel = assessment.novel;
        }

        let mut progress_events = Vec::new();
        let mut progress_view = None;
        if let Some(progress) = self.progress.as_mut() {
            progress_events = progress.observe_line(&record.line, now);
            // A watched process leaving the process table ends the run,
            // independent of any configured completion patterns.
            if self.pid_sources.contains(&record.source_id) && pid::is_exit_record(&record) {
                if let Some(event) = progress.mark_completed(now) {
                    progress_events.push(event);
                }
            }
            progress_view = Some((
                progress.fraction(),
                progress.active_stage().map(|s| s.to_string()),
            ));
        }
        for event in progress_events {
            self.emit(event).await;
        }
        if let Some((fraction, stage)) = progress_view {
            self.status.set_progress(fraction, stage);
        }

        if let Some(reason) = self.classifier.candidate_reason(&record, keyword_hit, novel) {
            let fp = fingerprint(record.message());
            let decision = self.classifier.classify(&record, &fp, now).await;
            let stats = self.classifier.cache_stats();
            self.status.set_cache_stats(stats.hits, stats.misses);

            self.emit(Event {
                source_id: record.source_id.clone(),
                severity: decision.severity,
                summary: decision.summary,
                reason,
                detail: Some(truncate_string(&record.line, 300)),
                action: decision.suggested_action,
                fingerprint: Some(fp),
                timestamp: now,
            })
            .await;
        }
        self.classifier.note_record(&record);
    }

    /// Periodic work: stall checks, time-based progress, status rate.
    pub async fn tick(&mut self) {
        let now = Utc::now();
        if !self.turbo {
            for event in self.anomaly.tick(now) {
                self.emit(event).await;
            }
            self.status.set_rate(self.anomaly.rate_per_minute());
        }

        let mut poll_event = None;
        let mut progress_view = None;
        if let Some(progress) = self.progress.as_mut() {
            poll_event = progress.poll(now);
            progress_view = Some((
                progress.fraction(),
                progress.active_stage().map(|s| s.to_string()),
            ));
        }
        if let Some(event) = poll_event {
            self.emit(event).await;
        }
        if let Some((fraction, stage)) = progress_view {
            self.status.set_progress(fraction, stage);
        }
    }

    /// The anomaly baseline is the combined locked rate of every profiled
    /// source.
    fn refresh_baseline(&mut self, source_id: &str) {
        self.baselined.insert(source_id.to_string());
        let total: f64 = self
            .profilers
            .iter()
            .filter(|(id, _)| self.baselined.contains(*id))
            .map(|(_, p)| p.baseline_rate())
            .sum();
        self.anomaly.set_baseline(total);
        tracing::debug!(baseline_per_sec = total, "Anomaly baseline updated");
    }

    async fn emit(&self, event: Event) {
        if self.events.send(event).await.is_err() {
            tracing::debug!("Event channel closed, dispatcher is gone");
        }
    }
}
