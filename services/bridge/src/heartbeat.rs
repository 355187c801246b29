//! Heartbeat reporter: one structured statistics record per interval.
//!
//! Reads every figure from the shared atomics; the delta math is a pure
//! function so the arithmetic is testable without running the task.

use crate::client::Shared;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, PartialEq)]
pub(crate) struct HeartbeatDelta {
    pub processed_delta: u64,
    pub dropped_delta: u64,
    /// Processed per second over the last interval.
    pub interval_rate: f64,
    /// Processed per second over the whole uptime.
    pub overall_rate: f64,
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn compute_delta(
    processed: u64,
    dropped: u64,
    last_processed: u64,
    last_dropped: u64,
    interval_s: f64,
    uptime_s: f64,
) -> HeartbeatDelta {
    let processed_delta = processed.saturating_sub(last_processed);
    let dropped_delta = dropped.saturating_sub(last_dropped);
    HeartbeatDelta {
        processed_delta,
        dropped_delta,
        interval_rate: if interval_s > 0.0 {
            processed_delta as f64 / interval_s
        } else {
            0.0
        },
        overall_rate: if uptime_s > 0.0 {
            processed as f64 / uptime_s
        } else {
            0.0
        },
    }
}

pub(crate) async fn run_heartbeat(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    debug!("heartbeat reporter started");
    let mut last_processed = shared.counters.processed();
    let mut last_dropped = shared.counters.dropped();
    loop {
        let cfg = shared.config();
        let interval_s = cfg.heartbeat.interval_s;
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            () = tokio::time::sleep(std::time::Duration::from_secs(interval_s)) => {}
        }
        // Re-check after the sleep so a stop() mid-interval does not produce
        // a final emission.
        if !shared.running() {
            break;
        }

        let processed = shared.counters.processed();
        let dropped = shared.counters.dropped();
        let uptime_s = shared.uptime_seconds();
        #[allow(clippy::cast_precision_loss)]
        let delta = compute_delta(
            processed,
            dropped,
            last_processed,
            last_dropped,
            interval_s as f64,
            uptime_s,
        );
        let queue_len = shared.queue_len();
        #[allow(clippy::cast_precision_loss)]
        let queue_pct = {
            let capacity = cfg.queue.capacity;
            if capacity > 0 {
                queue_len as f64 / capacity as f64 * 100.0
            } else {
                0.0
            }
        };

        info!(
            websocket_state = shared.websocket_state(),
            broker_state = shared.broker_state(),
            processed_total = processed,
            dropped_total = dropped,
            processed_delta = delta.processed_delta,
            dropped_delta = delta.dropped_delta,
            rate_per_s = delta.interval_rate,
            overall_rate_per_s = delta.overall_rate,
            queue_len,
            queue_pct,
            since_last_message_s = ?shared.time_since_last_message(),
            since_last_ping_s = ?shared.seconds_since_last_ping(),
            reconnect_attempts = shared.counters.reconnect_attempts(),
            uptime_s,
            "bridge heartbeat"
        );

        last_processed = processed;
        last_dropped = dropped;
    }
    debug!("heartbeat reporter exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_and_rates() {
        let delta = compute_delta(150, 10, 100, 4, 10.0, 300.0);
        assert_eq!(delta.processed_delta, 50);
        assert_eq!(delta.dropped_delta, 6);
        assert!((delta.interval_rate - 5.0).abs() < f64::EPSILON);
        assert!((delta.overall_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_uptime_and_interval_do_not_divide() {
        let delta = compute_delta(5, 0, 0, 0, 0.0, 0.0);
        assert_eq!(delta.processed_delta, 5);
        assert_eq!(delta.interval_rate, 0.0);
        assert_eq!(delta.overall_rate, 0.0);
    }

    #[test]
    fn counters_never_go_backwards_in_deltas() {
        // A snapshot raced with a reset would otherwise underflow.
        let delta = compute_delta(3, 1, 10, 2, 1.0, 1.0);
        assert_eq!(delta.processed_delta, 0);
        assert_eq!(delta.dropped_delta, 0);
    }
}
