//! Lightweight connection/error counters. Deliberately not the full
//! Prometheus exporter the teacher ships for its connection pool — there
//! are no pools, backends, or queries-per-second to export here, just a
//! handful of atomics useful for a startup/shutdown log line (SPEC_FULL
//! ambient-stack supplement).

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

#[derive(Default)]
pub struct Stats {
    pub accepted_total: AtomicU64,
    pub live_connections: AtomicU64,
    pub errors_total: AtomicU64,
    pub cancel_requests_total: AtomicU64,
    /// Error counts keyed by `Error::code()` (SPEC_FULL §A.6: "error counts
    /// by category").
    errors_by_code: DashMap<&'static str, AtomicU64>,
}

impl Stats {
    pub fn on_accept(&self) {
        self.accepted_total.fetch_add(1, Ordering::Relaxed);
        self.live_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_disconnect(&self) {
        self.live_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn on_error(&self, code: &'static str) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        self.errors_by_code
            .entry(code)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_cancel_request(&self) {
        self.cancel_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mut errors_by_code: Vec<(&'static str, u64)> = self
            .errors_by_code
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
            .collect();
        errors_by_code.sort_unstable_by_key(|(code, _)| *code);

        StatsSnapshot {
            accepted_total: self.accepted_total.load(Ordering::Relaxed),
            live_connections: self.live_connections.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            cancel_requests_total: self.cancel_requests_total.load(Ordering::Relaxed),
            errors_by_code,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub accepted_total: u64,
    pub live_connections: u64,
    pub errors_total: u64,
    pub cancel_requests_total: u64,
    pub errors_by_code: Vec<(&'static str, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_accept_and_disconnect() {
        let stats = Stats::default();
        stats.on_accept();
        stats.on_accept();
        stats.on_disconnect();
        let snap = stats.snapshot();
        assert_eq!(snap.accepted_total, 2);
        assert_eq!(snap.live_connections, 1);
    }

    #[test]
    fn tracks_errors_by_category() {
        let stats = Stats::default();
        stats.on_error("42601");
        stats.on_error("42601");
        stats.on_error("08P01");
        let snap = stats.snapshot();
        assert_eq!(snap.errors_total, 3);
        assert_eq!(
            snap.errors_by_code,
            vec![("08P01", 1), ("42601", 2)]
        );
    }
}
