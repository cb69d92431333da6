use crate::SourceAdapter;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use telewatch_common::types::{LogRecord, SourceDescriptor};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Fraction of the configured memory cap that triggers a warning record.
const RSS_WARN_FRACTION: f64 = 0.8;

/// True for the synthetic record a [`PidWatcher`] emits when its process
/// left the process table. The pipeline uses this to end the tracked run;
/// do not match on the record text anywhere else.
pub fn is_exit_record(record: &LogRecord) -> bool {
    record.line.starts_with("process ") && record.line.ends_with(" exited")
}

/// Watches one process by PID and emits synthetic records on state
/// transitions: started monitoring, stopped, resident memory crossing 80%
/// of the configured cap. Produces no per-line records.
pub struct PidWatcher {
    descriptor: SourceDescriptor,
    pid: Pid,
    system: System,
    check_interval: Duration,
    rss_cap_bytes: Option<u64>,
    alive: bool,
    rss_flagged: bool,
    announced: bool,
    pending: VecDeque<(String, &'static str)>,
    seq: u64,
}

impl PidWatcher {
    /// Fails fast if the process does not exist at startup.
    pub fn new(
        descriptor: SourceDescriptor,
        check_interval: Duration,
        rss_cap_mb: Option<u64>,
    ) -> Result<Self> {
        let pid = Pid::from_u32(
            descriptor
                .location
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid pid: {}", descriptor.location))?,
        );
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        if system.process(pid).is_none() {
            bail!("process {pid} does not exist");
        }
        Ok(Self {
            descriptor,
            pid,
            system,
            check_interval,
            rss_cap_bytes: rss_cap_mb.map(|mb| mb * 1024 * 1024),
            alive: true,
            rss_flagged: false,
            announced: false,
            pending: VecDeque::new(),
            seq: 0,
        })
    }

    fn make_record(&mut self, line: String, level: &'static str) -> LogRecord {
        self.seq += 1;
        let mut record = LogRecord::new(self.seq, &self.descriptor.id, line);
        record.fields.level = Some(level.to_string());
        record.fields.message = Some(record.line.clone());
        record
    }

    fn check(&mut self) {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);

        match self.system.process(self.pid) {
            Some(process) => {
                if !self.announced {
                    self.announced = true;
                    let name = process.name().to_string_lossy().into_owned();
                    self.pending.push_back((
                        format!("process {} ({name}) started", self.pid),
                        "INFO",
                    ));
                }
                if let Some(cap) = self.rss_cap_bytes {
                    let rss = process.memory();
                    let fraction = rss as f64 / cap as f64;
                    if fraction >= RSS_WARN_FRACTION && !self.rss_flagged {
                        self.rss_flagged = true;
                        self.pending.push_back((
                            format!(
                                "process {} memory at {:.0}% of cap ({} MiB / {} MiB)",
                                self.pid,
                                fraction * 100.0,
                                rss / (1024 * 1024),
                                cap / (1024 * 1024),
                            ),
                            "WARNING",
                        ));
                    } else if fraction < RSS_WARN_FRACTION {
                        self.rss_flagged = false;
                    }
                }
            }
            None => {
                if self.alive {
                    self.alive = false;
                    // The process table does not expose another process's
                    // exit status; report the stop without one.
                    self.pending.push_back((
                        format!("process {} exited", self.pid),
                        "CRITICAL",
                    ));
                }
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for PidWatcher {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn next_record(&mut self) -> Result<Option<LogRecord>> {
        if let Some((line, level)) = self.pending.pop_front() {
            return Ok(Some(self.make_record(line, level)));
        }

        if !self.alive {
            // Nothing more will ever come from this process; idle until
            // shutdown rather than reporting an error.
            tokio::time::sleep(self.check_interval).await;
            return Ok(None);
        }

        tokio::time::sleep(self.check_interval).await;
        self.check();
        match self.pending.pop_front() {
            Some((line, level)) => Ok(Some(self.make_record(line, level))),
            None => Ok(None),
        }
    }
}
