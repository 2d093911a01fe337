//! Statistics tracking for the PAC gateway.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for PAC serving and list refreshes.
pub struct Stats {
    pub requests: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub failed_requests: AtomicU64,
    pub list_updates: AtomicU64,
    pub failed_updates: AtomicU64,
    /// Cumulative response time in microseconds for averaging.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            list_updates: AtomicU64::new(0),
            failed_updates: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
        }
    }

    pub fn record_hit(&self, response_time_ms: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.add_time(response_time_ms);
    }

    pub fn record_miss(&self, response_time_ms: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.add_time(response_time_ms);
    }

    pub fn record_failed_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_list_update(&self) {
        self.list_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_update(&self) {
        self.failed_updates.fetch_add(1, Ordering::Relaxed);
    }

    fn add_time(&self, response_time_ms: f64) {
        self.total_response_time_us
            .fetch_add((response_time_ms * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let cache_hits = self.cache_hits.swap(0, Ordering::Relaxed);
        let cache_misses = self.cache_misses.swap(0, Ordering::Relaxed);
        let failed_requests = self.failed_requests.swap(0, Ordering::Relaxed);
        let list_updates = self.list_updates.swap(0, Ordering::Relaxed);
        let failed_updates = self.failed_updates.swap(0, Ordering::Relaxed);
        let total_us = self.total_response_time_us.swap(0, Ordering::Relaxed);

        let served = cache_hits + cache_misses;
        let avg_response_ms = if served > 0 {
            (total_us as f64 / served as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            requests,
            cache_hits,
            cache_misses,
            failed_requests,
            list_updates,
            failed_updates,
            avg_response_ms,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub failed_requests: u64,
    pub list_updates: u64,
    pub failed_updates: u64,
    pub avg_response_ms: f64,
}
