use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use telewatch_common::types::{Event, EventReason, LogRecord, Severity};

/// Decay constant for the exponentially weighted rate.
const EWMA_TAU_SECS: f64 = 30.0;
/// Width of the instantaneous-rate window.
const SPIKE_WINDOW_SECS: i64 = 5;
/// Quiet period after a spike fires.
const SPIKE_SILENCE_SECS: i64 = 60;
/// No spike verdicts until the rate estimate has had time to settle.
const WARMUP_SECS: i64 = 60;
/// A stalled source must have produced at least one record per minute over
/// this lookback to be worth alerting on.
const STALL_LOOKBACK_SECS: i64 = 600;
const STALL_MIN_RECORDS: usize = 10;
/// Upper bound on remembered per-source timestamps.
const ACTIVITY_CAP: usize = 1200;

struct SourceActivity {
    timestamps: VecDeque<DateTime<Utc>>,
    last_record: DateTime<Utc>,
    stalled: bool,
}

/// Rate-based anomaly detection: spikes against an exponentially weighted
/// rate (or the profiler baseline, whichever is higher) and per-source
/// stalls.
pub struct TemporalDetector {
    spike_threshold: f64,
    stall_seconds: i64,
    baseline: f64,
    ewma: f64,
    last_update: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    window: VecDeque<DateTime<Utc>>,
    last_spike: Option<DateTime<Utc>>,
    sources: HashMap<String, SourceActivity>,
}

impl TemporalDetector {
    pub fn new(spike_threshold: f64, stall_seconds: u64) -> Self {
        Self {
            spike_threshold,
            stall_seconds: stall_seconds as i64,
            baseline: 0.0,
            ewma: 0.0,
            last_update: None,
            started_at: None,
            window: VecDeque::new(),
            last_spike: None,
            sources: HashMap::new(),
        }
    }

    /// Baseline rate (records/sec) learned by the profiler bootstrap.
    pub fn set_baseline(&mut self, records_per_sec: f64) {
        self.baseline = records_per_sec;
    }

    pub fn ewma_per_sec(&self) -> f64 {
        self.ewma
    }

    pub fn observe(&mut self, record: &LogRecord, now: DateTime<Utc>) -> Vec<Event> {
        self.started_at.get_or_insert(now);

        // Instantaneous rate over the trailing window.
        self.window.push_back(now);
        let cutoff = now - Duration::seconds(SPIKE_WINDOW_SECS);
        while self.window.front().is_some_and(|t| *t < cutoff) {
            self.window.pop_front();
        }
        let instant_rate = self.window.len() as f64 / SPIKE_WINDOW_SECS as f64;

        let reference = self.ewma.max(self.baseline);

        // Blend the instantaneous rate into the EWMA.
        if let Some(last) = self.last_update {
            let dt = (now - last).num_milliseconds().max(0) as f64 / 1000.0;
            let alpha = 1.0 - (-dt / EWMA_TAU_SECS).exp();
            self.ewma += alpha * (instant_rate - self.ewma);
        } else {
            self.ewma = instant_rate;
        }
        self.last_update = Some(now);

        let mut events = Vec::new();
        if self.spike_fires(instant_rate, reference, now) {
            self.last_spike = Some(now);
            tracing::info!(
                rate = instant_rate,
                reference,
                "Record rate spike detected"
            );
            events.push(
                Event::new(
                    &record.source_id,
                    Severity::Warning,
                    EventReason::Spike,
                    format!(
                        "log rate spiked to {instant_rate:.1}/s ({:.1}x the recent rate)",
                        instant_rate / reference.max(0.01)
                    ),
                )
                .with_detail(format!(
                    "current {instant_rate:.2}/s, recent {:.2}/s, baseline {:.2}/s",
                    self.ewma, self.baseline
                )),
            );
        }

        // Per-source activity for stall detection.
        let activity = self
            .sources
            .entry(record.source_id.clone())
            .or_insert_with(|| SourceActivity {
                timestamps: VecDeque::new(),
                last_record: now,
                stalled: false,
            });
        activity.last_record = now;
        activity.stalled = false;
        activity.timestamps.push_back(now);
        if activity.timestamps.len() > ACTIVITY_CAP {
            activity.timestamps.pop_front();
        }
        let lookback = now - Duration::seconds(STALL_LOOKBACK_SECS);
        while activity.timestamps.front().is_some_and(|t| *t < lookback) {
            activity.timestamps.pop_front();
        }

        events
    }

    fn spike_fires(&self, instant_rate: f64, reference: f64, now: DateTime<Utc>) -> bool {
        if reference <= 0.0 {
            return false;
        }
        let warmed_up = self
            .started_at
            .is_some_and(|s| (now - s).num_seconds() >= WARMUP_SECS);
        if !warmed_up {
            return false;
        }
        let silenced = self
            .last_spike
            .is_some_and(|t| (now - t).num_seconds() < SPIKE_SILENCE_SECS);
        if silenced {
            return false;
        }
        instant_rate > self.spike_threshold * reference
    }

    /// Emits one critical stall event per silent source; suppressed until
    /// that source produces a record again.
    pub fn check_stalls(&mut self, now: DateTime<Utc>) -> Vec<Event> {
        let stall_seconds = self.stall_seconds;
        let mut events = Vec::new();

        for (source_id, activity) in &mut self.sources {
            if activity.stalled {
                continue;
            }
            let silent_for = (now - activity.last_record).num_seconds();
            if silent_for < stall_seconds {
                continue;
            }
            // Only alert on sources that were actually producing: at least
            // one record per minute over the lookback ending at the last
            // record.
            let lookback = activity.last_record - Duration::seconds(STALL_LOOKBACK_SECS);
            let recent = activity
                .timestamps
                .iter()
                .filter(|t| **t >= lookback)
                .count();
            if recent < STALL_MIN_RECORDS {
                continue;
            }

            activity.stalled = true;
            tracing::warn!(source_id = %source_id, silent_secs = silent_for, "Source stalled");
            events.push(
                Event::new(
                    source_id,
                    Severity::Critical,
                    EventReason::Stall,
                    format!("no log output for {silent_for}s from a previously active source"),
                )
                .with_detail(format!(
                    "{recent} records in the 10 minutes before the stream went quiet"
                )),
            );
        }

        events
    }
}
