//! Aggregate transfer statistics.
//!
//! Lock-free atomic counters written by file tasks, snapshotted on demand
//! for the embedder. Raw bytes are what crossed the wire; decoded bytes
//! are what landed on disk, so the two diverge exactly when compression
//! negotiation paid off.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::transport::Protocol;

/// Shared counters for one engine.
#[derive(Default)]
pub struct TransferMetrics {
    raw_bytes: AtomicU64,
    decoded_bytes: AtomicU64,
    h1_requests: AtomicU64,
    h2_requests: AtomicU64,
    origins: Mutex<HashSet<String>>,
    run_started: Mutex<Option<Instant>>,
}

impl TransferMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the beginning of a run; elapsed time counts from the first call.
    pub fn run_started(&self) {
        let mut started = self.run_started.lock();
        if started.is_none() {
            *started = Some(Instant::now());
        }
    }

    pub fn add_raw_bytes(&self, n: u64) {
        self.raw_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_decoded_bytes(&self, n: u64) {
        self.decoded_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_request(&self, protocol: Protocol, origin: &str) {
        match protocol {
            Protocol::Http1 => self.h1_requests.fetch_add(1, Ordering::Relaxed),
            Protocol::Http2 => self.h2_requests.fetch_add(1, Ordering::Relaxed),
        };
        let mut origins = self.origins.lock();
        if !origins.contains(origin) {
            origins.insert(origin.to_string());
        }
    }

    /// Point-in-time copy for display. `by_state` comes from the state
    /// store, which owns the authoritative records.
    pub fn snapshot(&self, by_state: BTreeMap<&'static str, usize>) -> StatsSnapshot {
        let raw = self.raw_bytes.load(Ordering::Relaxed);
        let decoded = self.decoded_bytes.load(Ordering::Relaxed);
        let h1 = self.h1_requests.load(Ordering::Relaxed);
        let h2 = self.h2_requests.load(Ordering::Relaxed);
        let requests = h1 + h2;
        let origins = self.origins.lock().len() as u64;

        StatsSnapshot {
            raw_bytes: raw,
            decoded_bytes: decoded,
            elapsed: self
                .run_started
                .lock()
                .map(|t| t.elapsed())
                .unwrap_or_default(),
            h1_requests: h1,
            h2_requests: h2,
            compression_ratio: crate::policy::compression_ratio(raw, decoded),
            // Estimate: every request beyond the first to an origin rode an
            // existing pool connection.
            connection_reuse_ratio: if requests == 0 {
                0.0
            } else {
                (requests.saturating_sub(origins)) as f64 / requests as f64
            },
            by_state,
        }
    }
}

/// Read-only statistics snapshot.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub raw_bytes: u64,
    pub decoded_bytes: u64,
    pub elapsed: Duration,
    pub h1_requests: u64,
    pub h2_requests: u64,
    /// Raw over decoded; below 1.0 means compression saved transfer.
    pub compression_ratio: f64,
    pub connection_reuse_ratio: f64,
    /// Record counts keyed by status name.
    pub by_state: BTreeMap<&'static str, usize>,
}

/// Human-readable byte count, e.g. `3.42 MB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = TransferMetrics::new();
        metrics.add_raw_bytes(100);
        metrics.add_raw_bytes(20);
        metrics.add_decoded_bytes(400);
        metrics.record_request(Protocol::Http2, "https://a");
        metrics.record_request(Protocol::Http2, "https://a");
        metrics.record_request(Protocol::Http1, "https://b");

        let snapshot = metrics.snapshot(BTreeMap::new());
        assert_eq!(snapshot.raw_bytes, 120);
        assert_eq!(snapshot.decoded_bytes, 400);
        assert_eq!(snapshot.h2_requests, 2);
        assert_eq!(snapshot.h1_requests, 1);
        assert_eq!(snapshot.compression_ratio, 0.3);
    }

    #[test]
    fn reuse_ratio_counts_repeat_origin_requests() {
        let metrics = TransferMetrics::new();
        for _ in 0..4 {
            metrics.record_request(Protocol::Http1, "https://cdn");
        }
        let snapshot = metrics.snapshot(BTreeMap::new());
        assert_eq!(snapshot.connection_reuse_ratio, 0.75);
    }

    #[test]
    fn empty_metrics_snapshot_is_neutral() {
        let snapshot = TransferMetrics::new().snapshot(BTreeMap::new());
        assert_eq!(snapshot.raw_bytes, 0);
        assert_eq!(snapshot.connection_reuse_ratio, 0.0);
        assert_eq!(snapshot.compression_ratio, 1.0);
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(10 * 1024 * 1024), "10.00 MB");
    }
}
