//! Engine-wide observability counters.
//!
//! Per-flow failures are reported here (and logged) instead of being
//! propagated to the packet loop, so a single bad flow can never take
//! the engine down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Atomic counters shared by the dispatcher, session table and engine.
#[derive(Default)]
pub struct EngineMetrics {
    pub packets_in: AtomicU64,
    pub packets_out: AtomicU64,
    pub malformed_dropped: AtomicU64,
    pub sessions_created: AtomicU64,
    pub sessions_evicted: AtomicU64,
    pub sessions_drained: AtomicU64,
    pub connect_failures: AtomicU64,
    pub backend_errors: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub rx_bytes: AtomicU64,
    error_codes: Mutex<HashMap<&'static str, u64>>,
}

/// Point-in-time copy of the counters, safe to hand to the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_in: u64,
    pub packets_out: u64,
    pub malformed_dropped: u64,
    pub sessions_created: u64,
    pub sessions_evicted: u64,
    pub sessions_drained: u64,
    pub connect_failures: u64,
    pub backend_errors: u64,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the per-code error counter.
    pub fn record_error(&self, code: &'static str) {
        let mut map = match self.error_codes.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *map.entry(code).or_insert(0) += 1;
    }

    pub fn error_count(&self, code: &str) -> u64 {
        let map = match self.error_codes.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(code).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_evicted: self.sessions_evicted.load(Ordering::Relaxed),
            sessions_drained: self.sessions_drained.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Increment helper so call sites stay one-liners.
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Add helper for byte counters.
pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}
