//! Bounded log of notable media transport operations.
//!
//! Records are appended as they happen and drained as one batch when a
//! report is sent upstream. A batch that could not be delivered is handed
//! back with [`TraceLog::rollback`] and ends up in front of anything recorded
//! since, so the log keeps its original order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

pub const DEFAULT_TRACE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub tag: String,
    pub id: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl TraceRecord {
    pub fn new(tag: impl Into<String>, id: Option<String>, payload: Value) -> Self {
        Self {
            tag: tag.into(),
            id,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Records drained from a [`TraceLog`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceBatch {
    pub records: Vec<TraceRecord>,
}

impl TraceBatch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug)]
struct Buffer {
    records: VecDeque<TraceRecord>,
    capacity: usize,
    dropped: u64,
}

impl Buffer {
    fn trim(&mut self) {
        while self.records.len() > self.capacity {
            self.records.pop_front();
            self.dropped += 1;
        }
    }
}

/// A shareable, per-peer trace buffer. Clones refer to the same buffer.
#[derive(Debug, Clone)]
pub struct TraceLog {
    id: Option<String>,
    inner: Arc<Mutex<Buffer>>,
}

impl TraceLog {
    pub fn new(id: Option<String>, capacity: usize) -> Self {
        Self {
            id,
            inner: Arc::new(Mutex::new(Buffer {
                records: VecDeque::new(),
                capacity: capacity.max(1),
                dropped: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buffer> {
        // A panic while holding the lock cannot leave the deque inconsistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Appends a record tagged with this log's subject id.
    pub fn trace(&self, tag: impl Into<String>, payload: Value) {
        self.push(TraceRecord::new(tag, self.id.clone(), payload));
    }

    pub fn push(&self, record: TraceRecord) {
        let mut buffer = self.lock();
        buffer.records.push_back(record);
        buffer.trim();
    }

    /// Empties the log and returns everything it held.
    pub fn take(&self) -> TraceBatch {
        let mut buffer = self.lock();
        TraceBatch {
            records: buffer.records.drain(..).collect(),
        }
    }

    /// Puts an undelivered batch back in front of newer records.
    pub fn rollback(&self, batch: TraceBatch) {
        let mut buffer = self.lock();
        for record in batch.records.into_iter().rev() {
            buffer.records.push_front(record);
        }
        // Oldest records go first when the restored batch overflows.
        buffer.trim();
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many records were evicted because the log was full.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tags(batch: &TraceBatch) -> Vec<&str> {
        batch.records.iter().map(|r| r.tag.as_str()).collect()
    }

    #[test]
    fn take_drains_in_order() {
        let log = TraceLog::new(Some("pub".into()), 10);
        log.trace("createOffer", json!(null));
        log.trace("setLocalDescription", json!({"type": "offer"}));

        let batch = log.take();
        assert_eq!(tags(&batch), vec!["createOffer", "setLocalDescription"]);
        assert_eq!(batch.records[0].id.as_deref(), Some("pub"));
        assert!(log.is_empty());
        assert!(log.take().is_empty());
    }

    #[test]
    fn rollback_restores_batch_before_newer_records() {
        let log = TraceLog::new(None, 10);
        log.trace("a", json!(1));
        log.trace("b", json!(2));
        let batch = log.take();
        log.trace("c", json!(3));

        log.rollback(batch);
        assert_eq!(tags(&log.take()), vec!["a", "b", "c"]);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let log = TraceLog::new(None, 2);
        log.trace("a", json!(1));
        log.trace("b", json!(2));
        let batch = log.take();
        log.trace("c", json!(3));
        log.trace("d", json!(4));

        log.rollback(batch);
        assert_eq!(tags(&log.take()), vec!["c", "d"]);
        assert_eq!(log.dropped(), 2);
    }

    #[test]
    fn clones_share_the_buffer() {
        let log = TraceLog::new(None, 4);
        let other = log.clone();
        other.trace("ontrack", json!({"kind": "video"}));
        assert_eq!(log.len(), 1);
    }
}
