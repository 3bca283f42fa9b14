//! Bounded in-memory history of canonical error records

use crate::diagnostics::record::{CanonicalErrorRecord, ErrorType, Fingerprint};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Ring buffer of recent records; the oldest entry is evicted when full
pub struct ErrorHistory {
    entries: Mutex<VecDeque<Arc<CanonicalErrorRecord>>>,
    capacity: usize,
    evicted: AtomicU64,
}

impl ErrorHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            evicted: AtomicU64::new(0),
        }
    }

    pub fn push(&self, record: Arc<CanonicalErrorRecord>) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        entries.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Most recent `limit` records, newest last
    pub fn recent(&self, limit: usize) -> Vec<Arc<CanonicalErrorRecord>> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Records stamped within `window` of `now`
    pub fn since(&self, now: DateTime<Utc>, window: ChronoDuration) -> Vec<Arc<CanonicalErrorRecord>> {
        let cutoff = now - window;
        self.entries
            .lock()
            .iter()
            .filter(|r| r.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn count_since(&self, now: DateTime<Utc>, window: ChronoDuration) -> usize {
        let cutoff = now - window;
        self.entries
            .lock()
            .iter()
            .filter(|r| r.timestamp >= cutoff)
            .count()
    }

    pub fn count_matching(&self, fingerprint: &Fingerprint) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|r| &r.fingerprint == fingerprint)
            .count()
    }

    pub fn count_of_type(&self, error_type: ErrorType) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|r| r.error_type == error_type)
            .count()
    }

    /// Drop everything but the newest `keep` entries; returns how many were removed
    pub fn trim_to(&self, keep: usize) -> usize {
        let mut entries = self.entries.lock();
        let excess = entries.len().saturating_sub(keep);
        entries.drain(..excess);
        excess
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::record::{ErrorInfo, Severity};

    fn record_at(message: &str, timestamp: DateTime<Utc>) -> Arc<CanonicalErrorRecord> {
        Arc::new(CanonicalErrorRecord::from_info(
            ErrorInfo::new(ErrorType::Network, Severity::Error, message),
            timestamp,
        ))
    }

    #[test]
    fn test_evicts_oldest_first() {
        let history = ErrorHistory::new(3);
        let now = Utc::now();
        for i in 0..5 {
            history.push(record_at(&format!("e{i}"), now));
        }

        let recent = history.recent(10);
        assert_eq!(history.len(), 3);
        assert_eq!(history.evicted(), 2);
        assert_eq!(recent[0].message, "e2");
        assert_eq!(recent[2].message, "e4");
    }

    #[test]
    fn test_window_queries() {
        let history = ErrorHistory::new(10);
        let now = Utc::now();
        history.push(record_at("old", now - ChronoDuration::minutes(10)));
        history.push(record_at("new", now - ChronoDuration::seconds(30)));
        history.push(record_at("new", now));

        assert_eq!(history.count_since(now, ChronoDuration::minutes(5)), 2);
        assert_eq!(history.since(now, ChronoDuration::minutes(5))[0].message, "new");

        let fingerprint = history.recent(1)[0].fingerprint.clone();
        assert_eq!(history.count_matching(&fingerprint), 2);
        assert_eq!(history.count_of_type(ErrorType::Network), 3);
    }

    #[test]
    fn test_trim_to() {
        let history = ErrorHistory::new(10);
        for i in 0..6 {
            history.push(record_at(&format!("e{i}"), Utc::now()));
        }

        assert_eq!(history.trim_to(2), 4);
        assert_eq!(history.len(), 2);
        assert_eq!(history.trim_to(5), 0);
    }
}
