//! Source adapters that turn observables (tailed files, process IDs,
//! journald units) into an ordered stream of [`LogRecord`]s.
//!
//! Each adapter implements [`SourceAdapter`]; [`run_adapter`] drives one
//! adapter on its own task, applies the per-source keyword filter, and
//! delivers records into the shared [`RecordQueue`]. A source that
//! disappears mid-run produces a single warning event and is retried with
//! exponential backoff.

pub mod file;
pub mod journal;
pub mod pid;
mod queue;

pub use queue::{RecordQueue, DEFAULT_HIGH_WATER};

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telewatch_common::types::{Event, EventReason, LogRecord, Severity, SourceDescriptor};
use tokio::sync::{mpsc, watch};

/// Longest line accepted from a source; longer lines are truncated.
pub const MAX_LINE_LEN: usize = 8192;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Produces records from one observable.
///
/// `next_record` blocks for at most one poll interval and returns `Ok(None)`
/// when nothing arrived, so the driver can observe shutdown between polls.
#[async_trait]
pub trait SourceAdapter: Send {
    fn descriptor(&self) -> &SourceDescriptor;

    async fn next_record(&mut self) -> Result<Option<LogRecord>>;

    /// Called after a failure once the backoff delay has elapsed.
    async fn reopen(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Drives one adapter until shutdown. While `profiling` is set the keyword
/// filter is bypassed so the profiler sees representative traffic.
pub async fn run_adapter(
    mut adapter: Box<dyn SourceAdapter>,
    queue: Arc<RecordQueue>,
    events: mpsc::Sender<Event>,
    profiling: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let desc = adapter.descriptor().clone();
    tracing::info!(source = %desc.display_name, kind = %desc.kind, "Source adapter started");
    let mut last_overflow_warn: Option<std::time::Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = adapter.next_record() => match result {
                Ok(Some(record)) => {
                    let bypass_filter = profiling.load(Ordering::Relaxed);
                    if !bypass_filter && !desc.keyword_hit(&record.line) {
                        continue;
                    }
                    if queue.push(record) {
                        let warn_due = last_overflow_warn
                            .map(|t| t.elapsed() >= Duration::from_secs(30))
                            .unwrap_or(true);
                        if warn_due {
                            last_overflow_warn = Some(std::time::Instant::now());
                            let _ = events
                                .send(
                                    Event::new(
                                        &desc.id,
                                        Severity::Warning,
                                        EventReason::Overflow,
                                        "record queue at high-water mark, oldest records dropped",
                                    )
                                    .with_detail(format!(
                                        "{} records dropped so far",
                                        queue.dropped()
                                    )),
                                )
                                .await;
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(source = %desc.display_name, error = %e, "Source unavailable");
                    let _ = events
                        .send(
                            Event::new(
                                &desc.id,
                                Severity::Warning,
                                EventReason::SourceLost,
                                format!("source {} became unavailable", desc.display_name),
                            )
                            .with_detail(e.to_string()),
                        )
                        .await;
                    if !retry_with_backoff(adapter.as_mut(), &mut shutdown).await {
                        break;
                    }
                    tracing::info!(source = %desc.display_name, "Source recovered");
                }
            }
        }
    }

    tracing::debug!(source = %desc.display_name, "Source adapter stopped");
}

/// Retries `reopen` with 1s, 2s, 4s... delays capped at 60s.
/// Returns false if shutdown was requested while waiting.
async fn retry_with_backoff(
    adapter: &mut dyn SourceAdapter,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let mut delay = BACKOFF_INITIAL;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return false,
            _ = tokio::time::sleep(delay) => {}
        }
        match adapter.reopen().await {
            Ok(()) => return true,
            Err(e) => {
                tracing::debug!(error = %e, delay_secs = delay.as_secs(), "Reopen failed, backing off");
                delay = (delay * 2).min(BACKOFF_CAP);
            }
        }
    }
}

pub(crate) fn bound_line(mut line: String) -> String {
    if line.len() > MAX_LINE_LEN {
        let mut cut = MAX_LINE_LEN;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        line.truncate(cut);
    }
    line
}
