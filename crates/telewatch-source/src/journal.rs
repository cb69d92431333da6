use crate::{bound_line, SourceAdapter};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use telewatch_common::types::{LogRecord, SourceDescriptor};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Follows a systemd unit through `journalctl -f -o json`, one JSON entry
/// per output line. Journal priority is mapped onto the extracted level:
/// 0-2 critical, 3-4 warning, 5-7 info.
pub struct JournalReader {
    descriptor: SourceDescriptor,
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    seq: u64,
}

impl JournalReader {
    /// Fails fast if the follower process cannot be spawned.
    pub fn new(descriptor: SourceDescriptor) -> Result<Self> {
        let (child, lines) = spawn_follower(&descriptor.location)?;
        Ok(Self {
            descriptor,
            child,
            lines,
            seq: 0,
        })
    }

    fn make_record(&mut self, entry: &str) -> Option<LogRecord> {
        let parsed: serde_json::Value = match serde_json::from_str(entry) {
            Ok(v) => v,
            Err(_) => return None, // skip malformed entries, keep following
        };
        let message = parsed.get("MESSAGE")?.as_str()?.to_string();
        let priority: u8 = parsed
            .get("PRIORITY")
            .and_then(|p| p.as_str())
            .and_then(|p| p.parse().ok())
            .unwrap_or(6);

        self.seq += 1;
        let mut record = LogRecord::new(self.seq, &self.descriptor.id, bound_line(message));
        record.fields.level = Some(priority_level(priority).to_string());
        record.fields.message = Some(record.line.clone());
        Some(record)
    }
}

#[async_trait]
impl SourceAdapter for JournalReader {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn next_record(&mut self) -> Result<Option<LogRecord>> {
        let next = tokio::time::timeout(POLL_INTERVAL, self.lines.next_line()).await;
        match next {
            Err(_) => Ok(None), // poll interval elapsed with no entry
            Ok(Ok(Some(line))) => Ok(self.make_record(&line)),
            Ok(Ok(None)) => {
                anyhow::bail!("journalctl follower for {} exited", self.descriptor.location)
            }
            Ok(Err(e)) => Err(e).context("reading journalctl output"),
        }
    }

    async fn reopen(&mut self) -> Result<()> {
        let _ = self.child.kill().await;
        let (child, lines) = spawn_follower(&self.descriptor.location)?;
        self.child = child;
        self.lines = lines;
        Ok(())
    }
}

fn spawn_follower(unit: &str) -> Result<(Child, Lines<BufReader<ChildStdout>>)> {
    let mut child = Command::new("journalctl")
        .args(["-u", unit, "-f", "-o", "json", "--since", "now"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start journalctl for unit {unit}"))?;
    let stdout = child
        .stdout
        .take()
        .context("journalctl spawned without stdout")?;
    Ok((child, BufReader::new(stdout).lines()))
}

fn priority_level(priority: u8) -> &'static str {
    match priority {
        0..=2 => "CRITICAL",
        3..=4 => "WARNING",
        _ => "INFO",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_maps_to_level() {
        assert_eq!(priority_level(0), "CRITICAL");
        assert_eq!(priority_level(2), "CRITICAL");
        assert_eq!(priority_level(3), "WARNING");
        assert_eq!(priority_level(4), "WARNING");
        assert_eq!(priority_level(6), "INFO");
        assert_eq!(priority_level(7), "INFO");
    }
}
