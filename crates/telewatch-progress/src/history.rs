//! Completion-duration history.
//!
//! The only state that survives a restart: a JSON object mapping process
//! name to the trailing ten completion durations in seconds. The median
//! seeds the expected duration for stage interpolation. Writes go through
//! a temp file in the same directory and a rename so a crash can never
//! leave a half-written file behind.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Durations kept per process name.
pub const KEEP_RUNS: usize = 10;

pub struct HistoryStore {
    path: PathBuf,
    runs: HashMap<String, Vec<f64>>,
}

impl HistoryStore {
    /// Loads existing history. A corrupt or unreadable file is reported
    /// and treated as empty; it will be rewritten on the next completion.
    pub fn load(path: &Path) -> Self {
        let runs = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<HashMap<String, Vec<f64>>>(&content) {
                Ok(runs) => runs,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "History file is corrupt, starting with empty history"
                    );
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "History file unreadable, starting with empty history"
                );
                HashMap::new()
            }
        };
        Self {
            path: path.to_path_buf(),
            runs,
        }
    }

    /// Default location: `~/.telewatch/history.json`.
    pub fn default_path() -> PathBuf {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        home.join(".telewatch").join("history.json")
    }

    pub fn median_duration(&self, process_name: &str) -> Option<f64> {
        let runs = self.runs.get(process_name)?;
        if runs.is_empty() {
            return None;
        }
        let mut sorted = runs.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = sorted.len() / 2;
        Some(if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        })
    }

    /// Append one completed run and rewrite the file atomically.
    pub fn record(&mut self, process_name: &str, duration_seconds: f64) -> Result<()> {
        let runs = self.runs.entry(process_name.to_string()).or_default();
        runs.push(duration_seconds);
        if runs.len() > KEEP_RUNS {
            let excess = runs.len() - KEEP_RUNS;
            runs.drain(..excess);
        }
        self.save()
    }

    fn save(&self) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .context("failed to create temp file for history")?;
        let body = serde_json::to_string_pretty(&self.runs)?;
        tmp.write_all(body.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        let mut store = HistoryStore::load(&path);
        for secs in [120.0, 130.0, 110.0] {
            store.record("train", secs).unwrap();
        }
        store.record("export", 15.5).unwrap();

        let reloaded = HistoryStore::load(&path);
        assert_eq!(reloaded.runs.get("train").unwrap(), &vec![120.0, 130.0, 110.0]);
        assert_eq!(reloaded.runs.get("export").unwrap(), &vec![15.5]);
    }

    #[test]
    fn keeps_only_trailing_ten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        let mut store = HistoryStore::load(&path);
        for i in 0..15 {
            store.record("job", i as f64).unwrap();
        }

        let reloaded = HistoryStore::load(&path);
        let runs = reloaded.runs.get("job").unwrap();
        assert_eq!(runs.len(), KEEP_RUNS);
        assert_eq!(runs[0], 5.0);
        assert_eq!(runs[9], 14.0);
    }

    #[test]
    fn median_of_odd_and_even_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        let mut store = HistoryStore::load(&path);
        store.record("job", 100.0).unwrap();
        store.record("job", 300.0).unwrap();
        store.record("job", 200.0).unwrap();
        assert_eq!(store.median_duration("job"), Some(200.0));

        store.record("job", 400.0).unwrap();
        assert_eq!(store.median_duration("job"), Some(250.0));

        assert_eq!(store.median_duration("unknown"), None);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "{ not json at all").unwrap();

        let mut store = HistoryStore::load(&path);
        assert_eq!(store.median_duration("anything"), None);

        // And it recovers on the next write.
        store.record("job", 60.0).unwrap();
        let reloaded = HistoryStore::load(&path);
        assert_eq!(reloaded.median_duration("job"), Some(60.0));
    }
}
