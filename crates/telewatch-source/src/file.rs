use crate::{bound_line, SourceAdapter};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use telewatch_common::types::{LogRecord, SourceDescriptor};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const PARTIAL_LINE_TIMEOUT: Duration = Duration::from_secs(2);

/// Tails a log file in append mode.
///
/// Truncation and rotation are detected by inode change or size regression;
/// either one reopens the file and resumes from offset 0. A partial line at
/// EOF is buffered until its newline arrives or the partial-line timeout
/// flushes it.
pub struct FileTailer {
    descriptor: SourceDescriptor,
    path: PathBuf,
    offset: u64,
    inode: Option<u64>,
    partial: String,
    partial_since: Option<Instant>,
    replay_existing: bool,
    attached: bool,
    pending: VecDeque<String>,
    seq: u64,
}

impl FileTailer {
    /// Fails fast if the file does not exist at startup.
    pub fn new(descriptor: SourceDescriptor, replay_existing: bool) -> Result<Self> {
        let path = PathBuf::from(&descriptor.location);
        std::fs::metadata(&path)
            .with_context(|| format!("cannot open log file {}", path.display()))?;
        Ok(Self {
            descriptor,
            path,
            offset: 0,
            inode: None,
            partial: String::new(),
            partial_since: None,
            replay_existing,
            attached: false,
            pending: VecDeque::new(),
            seq: 0,
        })
    }

    fn make_record(&mut self, line: String) -> LogRecord {
        self.seq += 1;
        LogRecord::new(self.seq, &self.descriptor.id, bound_line(line))
    }

    async fn poll_file(&mut self) -> Result<()> {
        let meta = tokio::fs::metadata(&self.path)
            .await
            .with_context(|| format!("log file {} disappeared", self.path.display()))?;
        let inode = file_inode(&meta);
        let size = meta.len();

        if !self.attached {
            self.attached = true;
            self.inode = inode;
            self.offset = if self.replay_existing { 0 } else { size };
            if self.offset == size {
                return Ok(());
            }
        }

        let rotated = inode != self.inode || size < self.offset;
        if rotated {
            tracing::info!(path = %self.path.display(), "Log file rotated or truncated, resuming from start");
            self.inode = inode;
            self.offset = 0;
            self.partial.clear();
            self.partial_since = None;
        }

        if size == self.offset {
            return Ok(());
        }

        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::with_capacity((size - self.offset).min(64 * 1024) as usize);
        let read = file.take(size - self.offset).read_to_end(&mut buf).await?;
        self.offset += read as u64;

        let chunk = String::from_utf8_lossy(&buf);
        self.consume(&chunk);
        Ok(())
    }

    fn consume(&mut self, chunk: &str) {
        for ch in chunk.chars() {
            if ch == '\n' {
                let line = std::mem::take(&mut self.partial);
                self.partial_since = None;
                let line = line.strip_suffix('\r').unwrap_or(&line).to_string();
                if !line.is_empty() {
                    self.pending.push_back(line);
                }
            } else {
                if self.partial.is_empty() {
                    self.partial_since = Some(Instant::now());
                }
                self.partial.push(ch);
            }
        }
    }

    fn flush_stale_partial(&mut self) {
        if self.partial.is_empty() {
            return;
        }
        if let Some(since) = self.partial_since {
            if since.elapsed() >= PARTIAL_LINE_TIMEOUT {
                let line = std::mem::take(&mut self.partial);
                self.partial_since = None;
                self.pending.push_back(line);
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for FileTailer {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn next_record(&mut self) -> Result<Option<LogRecord>> {
        if let Some(line) = self.pending.pop_front() {
            return Ok(Some(self.make_record(line)));
        }

        tokio::time::sleep(POLL_INTERVAL).await;
        self.poll_file().await?;
        self.flush_stale_partial();

        match self.pending.pop_front() {
            Some(line) => Ok(Some(self.make_record(line))),
            None => Ok(None),
        }
    }

    async fn reopen(&mut self) -> Result<()> {
        tokio::fs::metadata(&self.path)
            .await
            .with_context(|| format!("log file {} still missing", self.path.display()))?;
        // Treat reappearance like rotation: start over from offset 0.
        self.attached = true;
        self.inode = None;
        self.offset = 0;
        self.partial.clear();
        self.partial_since = None;
        Ok(())
    }
}

#[cfg(unix)]
fn file_inode(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_inode(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use telewatch_common::types::SourceKind;

    fn descriptor(path: &std::path::Path) -> SourceDescriptor {
        SourceDescriptor {
            id: "src-0".into(),
            kind: SourceKind::File,
            location: path.to_string_lossy().into_owned(),
            keywords: vec![],
            display_name: "test-file".into(),
        }
    }

    #[test]
    fn missing_file_fails_fast() {
        let desc = SourceDescriptor {
            id: "src-0".into(),
            kind: SourceKind::File,
            location: "/nonexistent/definitely/missing.log".into(),
            keywords: vec![],
            display_name: "missing".into(),
        };
        assert!(FileTailer::new(desc, false).is_err());
    }

    #[tokio::test]
    async fn reads_appended_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "old line\n").unwrap();

        let mut tailer = FileTailer::new(descriptor(&path), false).unwrap();
        // First poll attaches at end; the pre-existing line is skipped.
        assert!(tailer.next_record().await.unwrap().is_none());

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "first").unwrap();
        writeln!(f, "second").unwrap();
        f.flush().unwrap();

        let r1 = tailer.next_record().await.unwrap().unwrap();
        let r2 = tailer.next_record().await.unwrap().unwrap();
        assert_eq!(r1.line, "first");
        assert_eq!(r2.line, "second");
        assert!(r1.seq < r2.seq);
    }

    #[tokio::test]
    async fn replay_existing_reads_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "historic\n").unwrap();

        let mut tailer = FileTailer::new(descriptor(&path), true).unwrap();
        let rec = tailer.next_record().await.unwrap().unwrap();
        assert_eq!(rec.line, "historic");
    }

    #[tokio::test]
    async fn truncation_resumes_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "aaaa\nbbbb\n").unwrap();

        let mut tailer = FileTailer::new(descriptor(&path), false).unwrap();
        assert!(tailer.next_record().await.unwrap().is_none());

        // Truncate to something shorter than the old offset.
        std::fs::write(&path, "new\n").unwrap();
        let rec = tailer.next_record().await.unwrap().unwrap();
        assert_eq!(rec.line, "new");
    }

    #[tokio::test]
    async fn partial_line_held_until_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "").unwrap();

        let mut tailer = FileTailer::new(descriptor(&path), false).unwrap();
        assert!(tailer.next_record().await.unwrap().is_none());

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, "incomple").unwrap();
        f.flush().unwrap();
        assert!(tailer.next_record().await.unwrap().is_none());

        write!(f, "te line\n").unwrap();
        f.flush().unwrap();
        let rec = tailer.next_record().await.unwrap().unwrap();
        assert_eq!(rec.line, "incomplete line");
    }
}
