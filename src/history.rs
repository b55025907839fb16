//! Query history ring and derived server statistics.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct QueryRecord {
    pub id: String,
    pub session_id: String,
    /// The statement as executed, post-translation.
    pub text: String,
    pub submitted_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub rowcount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Bounded ring of the most recent queries plus monotone counters.
pub struct History {
    records: Mutex<VecDeque<QueryRecord>>,
    capacity: usize,
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    duration_ms_sum: AtomicU64,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            duration_ms_sum: AtomicU64::new(0),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }

    pub fn record(&self, rec: QueryRecord) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if rec.success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.duration_ms_sum.fetch_add(rec.duration_ms, Ordering::Relaxed);

        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(rec);
    }

    /// Newest-first snapshot, at most `limit` entries.
    pub fn snapshot(&self, limit: usize) -> Vec<QueryRecord> {
        self.records.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self, active_sessions: usize) -> Stats {
        let total = self.total.load(Ordering::Relaxed);
        let sum = self.duration_ms_sum.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let average = if total == 0 { 0.0 } else { sum as f64 / total as f64 };
        Stats {
            uptime_seconds: self.started.elapsed().as_secs(),
            active_sessions,
            total_queries: total,
            successful_queries: self.succeeded.load(Ordering::Relaxed),
            failed_queries: self.failed.load(Ordering::Relaxed),
            average_query_duration_ms: average,
            server_start_time: self.started_at,
        }
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub uptime_seconds: u64,
    pub active_sessions: usize,
    pub total_queries: u64,
    pub successful_queries: u64,
    pub failed_queries: u64,
    pub average_query_duration_ms: f64,
    pub server_start_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: u32, success: bool, duration_ms: u64) -> QueryRecord {
        QueryRecord {
            id: id.to_string(),
            session_id: "s".into(),
            text: "SELECT 1".into(),
            submitted_at: Utc::now(),
            duration_ms,
            success,
            rowcount: 1,
            error: if success { None } else { Some("boom".into()) },
        }
    }

    #[test]
    fn ring_is_bounded_and_newest_first() {
        let h = History::new(3);
        for i in 0..5 {
            h.record(rec(i, true, 1));
        }
        let snap = h.snapshot(10);
        let ids: Vec<&str> = snap.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["4", "3", "2"]);
    }

    #[test]
    fn counters_survive_eviction() {
        let h = History::new(2);
        h.record(rec(0, true, 10));
        h.record(rec(1, false, 20));
        h.record(rec(2, true, 30));
        let stats = h.stats(1);
        assert_eq!(stats.total_queries, 3);
        assert_eq!(stats.successful_queries, 2);
        assert_eq!(stats.failed_queries, 1);
        assert!((stats.average_query_duration_ms - 20.0).abs() < f64::EPSILON);
    }
}
