use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use telewatch_common::types::LogRecord;
use tokio::sync::Notify;

/// Default high-water mark for the shared record channel.
pub const DEFAULT_HIGH_WATER: usize = 10_000;

/// Bounded multi-producer record channel. At the high-water mark the oldest
/// record whose extracted level is not critical is dropped; critical records
/// are only displaced once nothing else is left to evict.
pub struct RecordQueue {
    inner: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl RecordQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns true if an older record had to be dropped to make room.
    pub fn push(&self, record: LogRecord) -> bool {
        let dropped = {
            let mut inner = self.inner.lock().unwrap();
            let dropped = if inner.len() >= self.capacity {
                let victim = inner.iter().position(|r| !is_critical(r)).unwrap_or(0);
                inner.remove(victim);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            } else {
                false
            };
            inner.push_back(record);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    pub async fn pop(&self) -> LogRecord {
        loop {
            let notified = self.notify.notified();
            if let Some(record) = self.inner.lock().unwrap().pop_front() {
                return record;
            }
            notified.await;
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_critical(record: &LogRecord) -> bool {
    matches!(
        record.fields.level.as_deref(),
        Some("CRITICAL") | Some("FATAL")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use telewatch_common::types::LogRecord;

    fn record(seq: u64, line: &str) -> LogRecord {
        LogRecord::new(seq, "src-0", line.to_string())
    }

    #[tokio::test]
    async fn push_pop_preserves_order() {
        let queue = RecordQueue::new(10);
        queue.push(record(1, "a"));
        queue.push(record(2, "b"));
        assert_eq!(queue.pop().await.line, "a");
        assert_eq!(queue.pop().await.line, "b");
    }

    #[tokio::test]
    async fn overflow_drops_oldest_non_critical() {
        let queue = RecordQueue::new(3);
        let mut critical = record(1, "fatal thing");
        critical.fields.level = Some("CRITICAL".into());
        queue.push(critical);
        queue.push(record(2, "info 1"));
        queue.push(record(3, "info 2"));

        let dropped = queue.push(record(4, "info 3"));
        assert!(dropped);
        assert_eq!(queue.dropped(), 1);

        // The critical record survived; "info 1" was the victim.
        assert_eq!(queue.pop().await.line, "fatal thing");
        assert_eq!(queue.pop().await.line, "info 2");
        assert_eq!(queue.pop().await.line, "info 3");
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = std::sync::Arc::new(RecordQueue::new(10));
        let q2 = queue.clone();
        let handle = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.push(record(1, "wake"));
        let got = handle.await.unwrap();
        assert_eq!(got.line, "wake");
    }
}
