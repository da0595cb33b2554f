//! The single structured error sink.
//!
//! Every failure the orchestrator absorbs lands here: a capped ring of
//! [`ErrorRecord`]s, the set of distinct fatal sources, and a queue of
//! user-facing [`Notice`]s that a UI drains.

use std::collections::{BTreeSet, HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    /// Event-loop time of the failure
    pub timestamp_ms: f64,
    /// Module id, `renderer`, or `master.<stage>`
    pub source: String,
    pub message: String,
    pub fatal: bool,
}

pub struct ErrorLog {
    records: VecDeque<ErrorRecord>,
    capacity: usize,
    fatal_sources: BTreeSet<String>,
}

impl ErrorLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            fatal_sources: BTreeSet::new(),
        }
    }

    /// Append a record, dropping the oldest when full. Returns the number of
    /// distinct fatal sources afterwards.
    pub fn record(&mut self, timestamp_ms: f64, source: &str, message: impl Into<String>, fatal: bool) -> usize {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        if fatal {
            self.fatal_sources.insert(source.to_string());
        }
        self.records.push_back(ErrorRecord {
            timestamp_ms,
            source: source.to_string(),
            message: message.into(),
            fatal,
        });
        self.fatal_sources.len()
    }

    /// Up to `n` records, newest last.
    pub fn recent(&self, n: usize) -> Vec<ErrorRecord> {
        let skip = self.records.len().saturating_sub(n);
        self.records.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn fatal_count(&self) -> usize {
        self.fatal_sources.len()
    }

    pub fn fatal_sources(&self) -> Vec<String> {
        self.fatal_sources.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Something the user should be told about, once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub source: String,
    pub message: String,
}

/// Notices waiting to be shown. A source that already raised a notice stays
/// quiet until [`NoticeQueue::forget`] is called for it.
#[derive(Default)]
pub struct NoticeQueue {
    pending: Vec<Notice>,
    raised: HashSet<String>,
}

impl NoticeQueue {
    /// Returns false if `source` was already notified.
    pub fn push(&mut self, level: NoticeLevel, source: &str, message: impl Into<String>) -> bool {
        if !self.raised.insert(source.to_string()) {
            return false;
        }
        self.pending.push(Notice {
            level,
            source: source.to_string(),
            message: message.into(),
        });
        true
    }

    /// Allow `source` to raise a notice again.
    pub fn forget(&mut self, source: &str) {
        self.raised.remove(source);
    }

    pub fn take(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.pending)
    }
}
