//! Process-wide counters and the metrics snapshot.
//!
//! Counters are plain atomics: incremented from any task, copied into the
//! snapshot with no lock.  They are monotonically non-decreasing for the
//! lifetime of the process (the reconnect-attempt gauge is the one exception;
//! it resets to zero after a successful re-dial).

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counters {
    processed: AtomicU64,
    dropped: AtomicU64,
    reconnect_attempts: AtomicU32,
}

impl Counters {
    pub fn new() -> Self {
        Counters::default()
    }

    /// Increment `processed_total`; returns the new total.
    pub fn record_processed(&self) -> u64 {
        self.processed.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Increment `dropped_total`; returns the new total.
    pub fn record_dropped(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Increment the reconnect-attempt gauge; returns the new value.
    pub fn record_reconnect_attempt(&self) -> u32 {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_reconnect_attempts(&self) {
        self.reconnect_attempts.store(0, Ordering::Relaxed);
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }
}

/// Gate for rate-limited log lines shared across tasks.
///
/// Returns true (and claims the slot) when at least `interval_ms` has passed
/// since the last claim.  `gate` holds the epoch-millisecond timestamp of the
/// last claim; 0 means never claimed.
pub(crate) fn throttle_gate(gate: &AtomicU64, interval_ms: u64, now_ms: u64) -> bool {
    let last = gate.load(Ordering::Relaxed);
    if last != 0 && now_ms.saturating_sub(last) < interval_ms {
        return false;
    }
    gate.compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Read-only metrics snapshot consumed by the external health endpoint.
///
/// All primitives are copied atomically; no field can observe a partially
/// updated counter.  Timestamps are UNIX epoch seconds; 0.0 means never.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub is_connected: bool,
    pub is_running: bool,
    pub connection_status: &'static str,
    pub reconnect_attempts: u32,
    pub processed_messages: u64,
    pub dropped_messages: u64,
    pub stream_count: usize,
    pub streams: Vec<String>,
    pub uptime_seconds: f64,
    pub queue_size: usize,
    pub last_message_time: f64,
    pub last_ping: f64,
    pub websocket_state: &'static str,
    pub nats_state: &'static str,
    pub messages_per_second: f64,
    pub queue_utilization_percent: f64,
    /// None if no frame has ever been received.
    pub time_since_last_message: Option<f64>,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval_s: u64,
}
