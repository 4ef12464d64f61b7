//! Write/read histories and their checker.
//!
//! Clients record every write invocation and its outcome, and every read with
//! the value it observed. The checker then verifies, per key, that each read
//! returned either the value of the last write acknowledged before the read
//! began, or the value of a write that could still be ordered after it: one
//! that was invoked before the read finished and was not definitely
//! rejected. Acknowledged writes are therefore never lost, and reads never
//! return a value nobody wrote.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use zkstore_core::StoreError;

/// How a write ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// No outcome recorded yet.
    Pending,
    /// The store acknowledged the write.
    Acked,
    /// The store rejected the write before applying it.
    Failed,
    /// The write failed in a way that leaves its effect unknown.
    Indeterminate,
}

/// Identifies a recorded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteId(usize);

#[derive(Debug, Clone)]
struct WriteRecord {
    key: String,
    value: Vec<u8>,
    invoked: u64,
    completed: Option<u64>,
    outcome: WriteOutcome,
}

#[derive(Debug, Clone)]
struct ReadRecord {
    key: String,
    observed: Option<Vec<u8>>,
    invoked: u64,
    completed: u64,
}

/// A read that returned something it should not have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// The key read.
    pub key: String,
    /// What the read returned (`None` for not found).
    pub observed: Option<Vec<u8>>,
    /// What it was allowed to return.
    pub allowed: Vec<Option<Vec<u8>>>,
}

/// Result of [`WriteHistory::check`].
#[derive(Debug, Clone, Default)]
pub struct HistoryReport {
    /// Reads examined.
    pub reads_checked: usize,
    /// Writes the store acknowledged.
    pub writes_acked: usize,
    /// Writes whose outcome is unknown.
    pub writes_indeterminate: usize,
    /// Writes rejected outright.
    pub writes_failed: usize,
    /// Reads that broke the rules.
    pub violations: Vec<Violation>,
}

impl HistoryReport {
    /// True when no read broke the rules.
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

#[derive(Debug, Default)]
struct Inner {
    clock: u64,
    writes: Vec<WriteRecord>,
    reads: Vec<ReadRecord>,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Concurrent history of writes and reads over a set of keys.
#[derive(Debug, Default)]
pub struct WriteHistory {
    inner: Mutex<Inner>,
}

impl WriteHistory {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the start of a write.
    pub fn invoke_write(&self, key: &str, value: &[u8]) -> WriteId {
        let mut inner = self.inner.lock();
        let invoked = inner.tick();
        inner.writes.push(WriteRecord {
            key: key.to_string(),
            value: value.to_vec(),
            invoked,
            completed: None,
            outcome: WriteOutcome::Pending,
        });
        WriteId(inner.writes.len() - 1)
    }

    /// Records the acknowledgement of a write.
    pub fn ack(&self, id: WriteId) {
        self.complete(id, WriteOutcome::Acked);
    }

    /// Records a failed write. Retryable errors leave the outcome unknown.
    pub fn fail(&self, id: WriteId, err: &StoreError) {
        let outcome = if err.is_retryable() {
            WriteOutcome::Indeterminate
        } else {
            WriteOutcome::Failed
        };
        self.complete(id, outcome);
    }

    /// Records the result of a write.
    pub fn record_write(&self, id: WriteId, result: &Result<(), StoreError>) {
        match result {
            Ok(()) => self.ack(id),
            Err(e) => self.fail(id, e),
        }
    }

    fn complete(&self, id: WriteId, outcome: WriteOutcome) {
        let mut inner = self.inner.lock();
        let completed = inner.tick();
        if let Some(write) = inner.writes.get_mut(id.0) {
            write.completed = Some(completed);
            write.outcome = outcome;
        }
    }

    /// Records the start of a read; pass the stamp to [`WriteHistory::read_ok`].
    pub fn invoke_read(&self) -> u64 {
        self.inner.lock().tick()
    }

    /// Records a completed read. `observed` is `None` when the key was not
    /// found.
    pub fn read_ok(&self, key: &str, invoked: u64, observed: Option<Vec<u8>>) {
        let mut inner = self.inner.lock();
        let completed = inner.tick();
        inner.reads.push(ReadRecord {
            key: key.to_string(),
            observed,
            invoked,
            completed,
        });
    }

    /// Writes recorded so far.
    pub fn write_count(&self) -> usize {
        self.inner.lock().writes.len()
    }

    /// Keys written so far, sorted.
    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut keys: Vec<String> = inner.writes.iter().map(|w| w.key.clone()).collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Checks every recorded read.
    pub fn check(&self) -> HistoryReport {
        let inner = self.inner.lock();
        let mut by_key: BTreeMap<&str, Vec<&WriteRecord>> = BTreeMap::new();
        for write in &inner.writes {
            by_key.entry(write.key.as_str()).or_default().push(write);
        }

        let mut report = HistoryReport {
            reads_checked: inner.reads.len(),
            ..Default::default()
        };
        for write in &inner.writes {
            match write.outcome {
                WriteOutcome::Acked => report.writes_acked += 1,
                WriteOutcome::Indeterminate | WriteOutcome::Pending => {
                    report.writes_indeterminate += 1
                }
                WriteOutcome::Failed => report.writes_failed += 1,
            }
        }

        for read in &inner.reads {
            let writes = by_key.get(read.key.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            let allowed = allowed_values(writes, read);
            if !allowed.contains(&read.observed) {
                report.violations.push(Violation {
                    key: read.key.clone(),
                    observed: read.observed.clone(),
                    allowed,
                });
            }
        }
        report
    }
}

fn allowed_values(writes: &[&WriteRecord], read: &ReadRecord) -> Vec<Option<Vec<u8>>> {
    let last_acked = writes
        .iter()
        .filter(|w| w.outcome == WriteOutcome::Acked)
        .filter(|w| w.completed.map_or(false, |c| c < read.invoked))
        .max_by_key(|w| w.completed);
    let floor = last_acked.and_then(|w| w.completed).unwrap_or(0);

    let mut allowed = vec![last_acked.map(|w| w.value.clone())];
    for write in writes {
        if write.outcome == WriteOutcome::Failed || write.invoked > read.completed {
            continue;
        }
        let later = write.completed.map_or(true, |c| c > floor);
        let value = Some(write.value.clone());
        if later && !allowed.contains(&value) {
            allowed.push(value);
        }
    }
    allowed
}

#[cfg(test)]
mod tests {
    use super::*;
    use zkstore_core::ConnectionError;

    fn lost() -> StoreError {
        StoreError::Connection(ConnectionError::Lost)
    }

    #[test]
    fn test_read_of_last_ack_is_valid() {
        let history = WriteHistory::new();
        let w = history.invoke_write("k", b"1");
        history.ack(w);
        let r = history.invoke_read();
        history.read_ok("k", r, Some(b"1".to_vec()));

        let report = history.check();
        assert!(report.is_valid());
        assert_eq!(report.writes_acked, 1);
        assert_eq!(report.reads_checked, 1);
    }

    #[test]
    fn test_lost_ack_is_a_violation() {
        let history = WriteHistory::new();
        let w = history.invoke_write("k", b"1");
        history.ack(w);
        let r = history.invoke_read();
        history.read_ok("k", r, None);

        let report = history.check();
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].allowed, vec![Some(b"1".to_vec())]);
    }

    #[test]
    fn test_stale_read_is_a_violation() {
        let history = WriteHistory::new();
        let w1 = history.invoke_write("k", b"1");
        history.ack(w1);
        let w2 = history.invoke_write("k", b"2");
        history.ack(w2);
        let r = history.invoke_read();
        history.read_ok("k", r, Some(b"1".to_vec()));
        assert!(!history.check().is_valid());
    }

    #[test]
    fn test_indeterminate_write_may_be_visible() {
        let history = WriteHistory::new();
        let w1 = history.invoke_write("k", b"1");
        history.ack(w1);
        let w2 = history.invoke_write("k", b"2");
        history.fail(w2, &lost());

        let r = history.invoke_read();
        history.read_ok("k", r, Some(b"2".to_vec()));
        let r = history.invoke_read();
        history.read_ok("k", r, Some(b"1".to_vec()));

        let report = history.check();
        assert!(report.is_valid(), "{:?}", report.violations);
        assert_eq!(report.writes_indeterminate, 1);
    }

    #[test]
    fn test_rejected_write_must_not_be_visible() {
        let history = WriteHistory::new();
        let w = history.invoke_write("k", b"big");
        history.fail(
            w,
            &StoreError::PayloadTooLarge {
                size: 3,
                max_size: 2,
            },
        );
        let r = history.invoke_read();
        history.read_ok("k", r, Some(b"big".to_vec()));
        assert!(!history.check().is_valid());
    }

    #[test]
    fn test_concurrent_write_may_be_seen() {
        let history = WriteHistory::new();
        let w1 = history.invoke_write("k", b"1");
        history.ack(w1);
        let r = history.invoke_read();
        let w2 = history.invoke_write("k", b"2");
        history.read_ok("k", r, Some(b"2".to_vec()));
        history.ack(w2);
        assert!(history.check().is_valid());
    }

    #[test]
    fn test_write_invoked_after_read_is_not_allowed() {
        let history = WriteHistory::new();
        let r = history.invoke_read();
        history.read_ok("k", r, Some(b"future".to_vec()));
        let w = history.invoke_write("k", b"future");
        history.ack(w);
        assert!(!history.check().is_valid());
    }

    #[test]
    fn test_keys_are_independent() {
        let history = WriteHistory::new();
        let a = history.invoke_write("a", b"1");
        history.ack(a);
        let r = history.invoke_read();
        history.read_ok("b", r, Some(b"1".to_vec()));
        assert!(!history.check().is_valid());
        assert_eq!(history.keys(), vec!["a"]);
    }
}
