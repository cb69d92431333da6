use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

const RECENT_LINES_PER_SOURCE: usize = 100;

/// Point-in-time view of the runtime, rendered by `/status`.
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    pub started_at: Option<DateTime<Utc>>,
    pub progress_fraction: f64,
    pub active_stage: Option<String>,
    pub lines_per_minute: f64,
    pub paused: bool,
    pub last_event: Option<String>,
    pub dropped_sends: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl StatusSnapshot {
    pub fn uptime_seconds(&self, now: DateTime<Utc>) -> i64 {
        self.started_at
            .map(|s| (now - s).num_seconds().max(0))
            .unwrap_or(0)
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64 * 100.0
        }
    }
}

#[derive(Default)]
struct StatusInner {
    snapshot: StatusSnapshot,
    recent: HashMap<String, VecDeque<String>>,
    last_active_source: Option<String>,
}

/// Shared board the pipeline stages write to and the control channel reads.
/// Writers hold the lock only for short field updates.
#[derive(Default)]
pub struct StatusBoard {
    inner: Mutex<StatusInner>,
}

impl StatusBoard {
    pub fn new() -> Self {
        let board = Self::default();
        board.inner.lock().snapshot.started_at = Some(Utc::now());
        board
    }

    pub fn note_line(&self, source_id: &str, line: &str) {
        let mut inner = self.inner.lock();
        let ring = inner.recent.entry(source_id.to_string()).or_default();
        if ring.len() >= RECENT_LINES_PER_SOURCE {
            ring.pop_front();
        }
        ring.push_back(line.to_string());
        inner.last_active_source = Some(source_id.to_string());
    }

    /// Last `n` raw lines from the most recently active source.
    pub fn tail(&self, n: usize) -> (Option<String>, Vec<String>) {
        let inner = self.inner.lock();
        let Some(source) = inner.last_active_source.clone() else {
            return (None, Vec::new());
        };
        let lines = inner
            .recent
            .get(&source)
            .map(|ring| ring.iter().rev().take(n).rev().cloned().collect())
            .unwrap_or_default();
        (Some(source), lines)
    }

    pub fn set_rate(&self, lines_per_minute: f64) {
        self.inner.lock().snapshot.lines_per_minute = lines_per_minute;
    }

    pub fn set_progress(&self, fraction: f64, active_stage: Option<String>) {
        let mut inner = self.inner.lock();
        inner.snapshot.progress_fraction = fraction;
        inner.snapshot.active_stage = active_stage;
    }

    pub fn set_paused(&self, paused: bool) {
        self.inner.lock().snapshot.paused = paused;
    }

    pub fn set_last_event(&self, summary: &str) {
        self.inner.lock().snapshot.last_event = Some(summary.to_string());
    }

    pub fn add_dropped_sends(&self, n: u64) {
        self.inner.lock().snapshot.dropped_sends += n;
    }

    pub fn set_cache_stats(&self, hits: u64, misses: u64) {
        let mut inner = self.inner.lock();
        inner.snapshot.cache_hits = hits;
        inner.snapshot.cache_misses = misses;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.lock().snapshot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_follows_most_recent_source() {
        let board = StatusBoard::new();
        board.note_line("src-0", "a1");
        board.note_line("src-1", "b1");
        board.note_line("src-1", "b2");

        let (source, lines) = board.tail(15);
        assert_eq!(source.as_deref(), Some("src-1"));
        assert_eq!(lines, vec!["b1", "b2"]);
    }

    #[test]
    fn tail_is_bounded() {
        let board = StatusBoard::new();
        for i in 0..250 {
            board.note_line("src-0", &format!("line {i}"));
        }
        let (_, lines) = board.tail(15);
        assert_eq!(lines.len(), 15);
        assert_eq!(lines.last().unwrap(), "line 249");
    }

    #[test]
    fn snapshot_reflects_updates() {
        let board = StatusBoard::new();
        board.set_progress(0.25, Some("train".into()));
        board.set_paused(true);
        board.add_dropped_sends(3);
        board.set_cache_stats(7, 3);

        let snap = board.snapshot();
        assert_eq!(snap.progress_fraction, 0.25);
        assert_eq!(snap.active_stage.as_deref(), Some("train"));
        assert!(snap.paused);
        assert_eq!(snap.dropped_sends, 3);
        assert_eq!(snap.cache_hit_rate(), 70.0);
    }
}
