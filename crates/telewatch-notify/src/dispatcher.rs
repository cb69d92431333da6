use crate::control::Command;
use crate::{utils, Transport};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use telewatch_common::status::StatusBoard;
use telewatch_common::types::{Event, EventReason, Severity};
use telewatch_progress::format_duration;

/// Events held while paused; oldest beyond this are dropped.
const PAUSED_QUEUE_CAP: usize = 50;
/// Minimum spacing between rate-limit bypasses for critical events.
const CRITICAL_BYPASS_SECS: i64 = 60;
/// Outbound send retry schedule: 1s, 2s, 4s, 8s, 16s.
const SEND_MAX_ATTEMPTS: u32 = 5;
/// Lines returned by `/logs`.
const LOGS_TAIL_LINES: usize = 15;

type DebounceKey = (Severity, EventReason, u64);

struct DebounceEntry {
    first_at: DateTime<Utc>,
    suppressed: u64,
    summary: String,
}

/// The rate-limited, debouncing sink between event producers and the chat
/// transport. Owns every piece of send-side state; single consumer task.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    status: Arc<StatusBoard>,
    rate_limit_per_hour: usize,
    debounce_window: Duration,
    allowed: Vec<Severity>,
    /// Send instants counted against the hourly cap.
    sent_times: VecDeque<DateTime<Utc>>,
    last_critical_bypass: Option<DateTime<Utc>>,
    paused: bool,
    paused_queue: VecDeque<Event>,
    paused_dropped: u64,
    pending: HashMap<DebounceKey, DebounceEntry>,
    /// Events eaten by the rate limiter since the last successful send.
    rate_dropped: u64,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        status: Arc<StatusBoard>,
        rate_limit_per_hour: usize,
        debounce_seconds: u64,
        allowed: Vec<Severity>,
    ) -> Self {
        Self {
            transport,
            status,
            rate_limit_per_hour,
            debounce_window: Duration::seconds(debounce_seconds as i64),
            allowed,
            sent_times: VecDeque::new(),
            last_critical_bypass: None,
            paused: false,
            paused_queue: VecDeque::new(),
            paused_dropped: 0,
            pending: HashMap::new(),
            rate_dropped: 0,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub async fn handle_event(&mut self, event: Event, now: DateTime<Utc>) {
        self.status.set_last_event(&event.summary);

        if !self.allowed.contains(&event.severity) {
            return;
        }

        if self.paused {
            if self.paused_queue.len() >= PAUSED_QUEUE_CAP {
                self.paused_queue.pop_front();
                self.paused_dropped += 1;
            }
            self.paused_queue.push_back(event);
            return;
        }

        let key = debounce_key(&event);
        if let Some(entry) = self.pending.get_mut(&key) {
            if now - entry.first_at < self.debounce_window {
                entry.suppressed += 1;
                return;
            }
        }
        // Window lapsed with this arrival: settle the old entry, then treat
        // this event as the start of a fresh window.
        if let Some(entry) = self.pending.remove(&key) {
            self.flush_entry(entry, now).await;
        }

        self.pending.insert(
            key,
            DebounceEntry {
                first_at: now,
                suppressed: 0,
                summary: event.summary.clone(),
            },
        );
        self.send_event(&event, now).await;
    }

    /// Close lapsed debounce windows, sending "plus N similar" follow-ups.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        let lapsed: Vec<DebounceKey> = self
            .pending
            .iter()
            .filter(|(_, e)| now - e.first_at >= self.debounce_window)
            .map(|(k, _)| *k)
            .collect();
        for key in lapsed {
            if let Some(entry) = self.pending.remove(&key) {
                self.flush_entry(entry, now).await;
            }
        }
    }

    async fn flush_entry(&mut self, entry: DebounceEntry, now: DateTime<Utc>) {
        if entry.suppressed == 0 {
            return;
        }
        let minutes = (self.debounce_window.num_seconds() + 59) / 60;
        let text = format!(
            "{}\nplus {} similar in the last {} minutes",
            entry.summary, entry.suppressed, minutes
        );
        // Follow-ups are bookkeeping; they never ride the critical bypass.
        if self.rate_gate(Severity::Info, now) {
            self.deliver(&text).await;
        }
    }

    async fn send_event(&mut self, event: &Event, now: DateTime<Utc>) {
        if !self.rate_gate(event.severity, now) {
            tracing::debug!(summary = %event.summary, "Event dropped by rate limit");
            return;
        }
        let text = format_event(event);
        self.deliver(&text).await;
    }

    /// Sliding-window rate limiting. Critical severity may bypass a full
    /// window at most once per minute; everything else is dropped and
    /// surfaced via the dropped counter on the next message.
    fn rate_gate(&mut self, severity: Severity, now: DateTime<Utc>) -> bool {
        let hour_ago = now - Duration::hours(1);
        while self.sent_times.front().is_some_and(|t| *t < hour_ago) {
            self.sent_times.pop_front();
        }

        if self.sent_times.len() < self.rate_limit_per_hour {
            self.sent_times.push_back(now);
            return true;
        }

        if severity == Severity::Critical {
            let cooled = self
                .last_critical_bypass
                .map(|t| (now - t).num_seconds() >= CRITICAL_BYPASS_SECS)
                .unwrap_or(true);
            if cooled {
                self.last_critical_bypass = Some(now);
                tracing::info!("Critical event bypassing the hourly rate limit");
                return true;
            }
        }

        self.rate_dropped += 1;
        self.status.add_dropped_sends(1);
        false
    }

    /// Send with exponential backoff; a message that still fails after the
    /// last attempt is dropped and counted.
    async fn deliver(&mut self, text: &str) {
        let mut text = text.to_string();
        if self.rate_dropped > 0 {
            text.push_str(&format!(
                "\n({} earlier events were dropped by the rate limit)",
                self.rate_dropped
            ));
            self.rate_dropped = 0;
        }

        for attempt in 0..SEND_MAX_ATTEMPTS {
            match self.transport.send(&text).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "Transport send failed");
                    if attempt + 1 < SEND_MAX_ATTEMPTS {
                        let delay = std::time::Duration::from_secs(1u64 << attempt);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        tracing::error!("Message dropped after {SEND_MAX_ATTEMPTS} send attempts");
        self.status.add_dropped_sends(1);
    }

    /// Direct reply to an inbound command; solicited, so not rate limited.
    async fn reply(&self, text: &str) {
        if let Err(e) = self.transport.send(text).await {
            tracing::warn!(error = %e, "Failed to send command reply");
        }
    }

    pub async fn handle_command(&mut self, command: Command, now: DateTime<Utc>) {
        match command {
            Command::Status => {
                let text = self.render_status(now);
                self.reply(&text).await;
            }
            Command::Pause => {
                self.paused = true;
                self.status.set_paused(true);
                tracing::info!("Notifications paused by operator");
                self.reply("⏸ Notifications paused. Events are still analyzed; /resume for a digest.")
                    .await;
            }
            Command::Resume => {
                if self.paused {
                    self.paused = false;
                    self.status.set_paused(false);
                    tracing::info!("Notifications resumed by operator");
                    self.send_resume_digest(now).await;
                } else {
                    self.reply("Not paused.").await;
                }
            }
            Command::Logs => {
                let (source, lines) = self.status.tail(LOGS_TAIL_LINES);
                let text = match source {
                    Some(source) if !lines.is_empty() => {
                        // Fenced so raw log content cannot be parsed as
                        // Markdown; backticks would terminate the fence.
                        let body = utils::truncate_string(
                            &lines.join("\n").replace('`', "'"),
                            utils::MAX_MESSAGE_LEN - 64,
                        );
                        format!(
                            "Last {} lines from {}:\n```\n{}\n```",
                            lines.len(),
                            source,
                            body
                        )
                    }
                    _ => "No log lines observed yet.".to_string(),
                };
                self.reply(&text).await;
            }
        }
    }

    async fn send_resume_digest(&mut self, now: DateTime<Utc>) {
        let events: Vec<Event> = self.paused_queue.drain(..).collect();
        let dropped = std::mem::take(&mut self.paused_dropped);

        if events.is_empty() && dropped == 0 {
            self.reply("▶ Resumed. Nothing happened while paused.").await;
            return;
        }

        let critical = events.iter().filter(|e| e.severity == Severity::Critical).count();
        let warning = events.iter().filter(|e| e.severity == Severity::Warning).count();
        let info = events.len() - critical - warning;

        let mut text = format!(
            "▶ Resumed. While paused: {} events ({} critical, {} warning, {} info)",
            events.len(),
            critical,
            warning,
            info
        );
        if dropped > 0 {
            text.push_str(&format!(", {dropped} older ones dropped from the queue"));
        }
        for event in &events {
            text.push_str(&format!(
                "\n{} {}: {}",
                severity_emoji(event.severity),
                event.severity,
                event.summary
            ));
        }

        let highest = events
            .iter()
            .map(|e| e.severity)
            .max()
            .unwrap_or(Severity::Info);
        if self.rate_gate(highest, now) {
            self.deliver(&utils::truncate_string(&text, utils::MAX_MESSAGE_LEN - 16))
                .await;
        }
    }

    fn render_status(&self, now: DateTime<Utc>) -> String {
        let snap = self.status.snapshot();
        let uptime = format_duration(snap.uptime_seconds(now) as f64);
        let mut text = format!(
            "TeleWatch status\n\
             uptime: {uptime}\n\
             progress: {:.0}%{}\n\
             rate: {:.1} lines/min\n\
             paused: {}",
            snap.progress_fraction * 100.0,
            snap.active_stage
                .as_deref()
                .map(|s| format!(" (stage: {s})"))
                .unwrap_or_default(),
            snap.lines_per_minute,
            if snap.paused { "yes" } else { "no" },
        );
        let total = snap.cache_hits + snap.cache_misses;
        if total > 0 {
            text.push_str(&format!(
                "\nanalysis cache: {:.0}% hit rate over {} lookups",
                snap.cache_hit_rate(),
                total
            ));
        }
        if snap.dropped_sends > 0 {
            text.push_str(&format!("\ndropped sends: {}", snap.dropped_sends));
        }
        if let Some(last) = &snap.last_event {
            text.push_str(&format!("\nlast event: {last}"));
        }
        text
    }

    /// Settle every open debounce window immediately; used at shutdown so
    /// suppressed counts are not lost.
    pub async fn flush_all(&mut self, now: DateTime<Utc>) {
        let keys: Vec<DebounceKey> = self.pending.keys().copied().collect();
        for key in keys {
            if let Some(entry) = self.pending.remove(&key) {
                self.flush_entry(entry, now).await;
            }
        }
    }

    /// Final farewell on shutdown, bounded by a short deadline.
    pub async fn send_stopped_notice(&self) {
        let send = self.transport.send("🛑 TeleWatch stopped.");
        if tokio::time::timeout(std::time::Duration::from_secs(2), send)
            .await
            .is_err()
        {
            tracing::warn!("Shutdown notice timed out");
        }
    }
}

fn debounce_key(event: &Event) -> DebounceKey {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    event
        .fingerprint
        .as_deref()
        .unwrap_or(&event.summary)
        .hash(&mut hasher);
    (event.severity, event.reason, hasher.finish())
}

pub fn severity_emoji(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "🔴",
        Severity::Warning => "🟡",
        Severity::Info => "🟢",
    }
}

/// Render one event as the outbound Markdown message: bolded headline,
/// source and time lines, the original content in a code fence, and an
/// action line when the advisor suggested one.
pub fn format_event(event: &Event) -> String {
    let mut text = format!(
        "{} *{}: {}*\n\n*Source:* {} ({})\n*Time:* {}",
        severity_emoji(event.severity),
        event.severity.to_string().to_uppercase(),
        event.summary,
        event.source_id,
        event.reason,
        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
    );
    if let Some(detail) = &event.detail {
        // Backticks inside the fence would terminate it early.
        let content = utils::truncate_string(detail, 300).replace('`', "'");
        text.push_str(&format!("\n\n*Event:*\n```\n{content}\n```"));
    }
    if let Some(action) = &event.action {
        text.push_str(&format!("\n\n*Action:* {action}"));
    }
    text
}
