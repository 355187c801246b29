//! Processor pool: N fungible workers draining the hand-off queue.
//!
//! Each frame ends in exactly one of: a successful publish (processed),
//! a counted drop (no broker, breaker open, publish failure), or a logged
//! discard (unclassifiable).  Publish errors never propagate upward.

use crate::client::Shared;
use sb_protocol::{Envelope, classify_stream};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

/// One worker.  The dequeue timeout is the shutdown polling period: on
/// timeout the run flag is re-checked and the loop continues.
pub(crate) async fn run_processor(
    shared: Arc<Shared>,
    queue_rx: Arc<Mutex<mpsc::Receiver<Value>>>,
    worker: usize,
) {
    debug!(worker, "processor started");
    loop {
        if !shared.running() {
            break;
        }
        let batch_timeout = shared.config().queue.batch_timeout();
        let frame = {
            // The lock is held only while waiting; processing happens outside
            // it so the other workers can dequeue in parallel.
            let mut rx = queue_rx.lock().await;
            tokio::time::timeout(batch_timeout, rx.recv()).await
        };
        match frame {
            Err(_) => {}
            Ok(None) => break,
            Ok(Some(frame)) => process_frame(&shared, frame).await,
        }
    }
    debug!(worker, "processor exited");
}

/// Classify, envelope, and publish one dequeued frame.
pub(crate) async fn process_frame(shared: &Arc<Shared>, frame: Value) {
    let cfg = shared.config();

    // The queue carries decoded frames, but re-check the shape before
    // classification.
    if !frame.is_object() {
        warn!("discarding non-object frame");
        return;
    }
    let Some(stream) = classify_stream(&frame, &cfg.websocket.streams) else {
        warn!("could not determine stream name, discarding frame");
        return;
    };

    let envelope = Envelope::new(stream, frame);
    let payload = match envelope.to_json() {
        Ok(json) => json.into_bytes(),
        Err(e) => {
            shared.counters.record_dropped();
            error!(error = %e, "failed to serialize envelope");
            return;
        }
    };

    let broker = shared.broker_handle().filter(|b| b.is_open());
    let Some(broker) = broker else {
        shared.counters.record_dropped();
        warn!("broker not connected, dropping message");
        return;
    };

    let subject = cfg.broker.subject.as_str();
    match shared
        .broker_breaker
        .call(|| broker.publish(subject, payload))
        .await
    {
        Ok(()) => {
            shared.counters.record_processed();
            if shared.should_log_stats(cfg.stats.log_interval_s) {
                info!(
                    processed = shared.counters.processed(),
                    dropped = shared.counters.dropped(),
                    "message processing stats"
                );
            }
        }
        Err(e) => {
            shared.counters.record_dropped();
            error!(error = %e, "failed to publish to broker");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::broker::{BrokerError, BrokerPublisher};
    use crate::config::BridgeConfig;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    struct StubBroker {
        open: AtomicBool,
        fail_next: AtomicU32,
        published: StdMutex<Vec<(String, Vec<u8>)>>,
    }

    impl StubBroker {
        fn new() -> Arc<Self> {
            Arc::new(StubBroker {
                open: AtomicBool::new(true),
                fail_next: AtomicU32::new(0),
                published: StdMutex::new(Vec::new()),
            })
        }

        fn published(&self) -> Vec<(String, Value)> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|(subject, payload)| {
                    (subject.clone(), serde_json::from_slice(payload).unwrap())
                })
                .collect()
        }
    }

    #[async_trait]
    impl BrokerPublisher for StubBroker {
        async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
            let remaining = self.fail_next.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_next.store(remaining - 1, Ordering::SeqCst);
                return Err(BrokerError::Publish("injected failure".to_owned()));
            }
            self.published.lock().unwrap().push((subject.to_owned(), payload));
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        async fn flush(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn test_shared(broker: Option<Arc<StubBroker>>) -> Arc<Shared> {
        let mut cfg = BridgeConfig::default();
        cfg.websocket.streams = vec!["btcusdt@trade".to_owned()];
        cfg.breakers.broker.failure_threshold = 2;
        cfg.breakers.broker.recovery_timeout_s = 0.05;
        let shared = Arc::new(Shared::new(cfg));
        if let Some(broker) = broker {
            shared.set_broker_for_tests(broker);
        }
        shared
    }

    fn trade_frame() -> Value {
        json!({"e": "trade", "E": 123_456_789, "s": "BTCUSDT", "t": 12345, "p": "0.001", "q": "100"})
    }

    #[tokio::test]
    async fn publishes_classified_frame_and_counts_processed() {
        let broker = StubBroker::new();
        let shared = test_shared(Some(Arc::clone(&broker)));

        process_frame(&shared, trade_frame()).await;

        assert_eq!(shared.counters.processed(), 1);
        assert_eq!(shared.counters.dropped(), 0);
        let published = broker.published();
        assert_eq!(published.len(), 1);
        let (subject, envelope) = &published[0];
        assert_eq!(subject, "binance.websocket.data");
        assert_eq!(envelope["stream"], "btcusdt@trade");
        assert_eq!(envelope["source"], "binance-websocket");
        assert_eq!(envelope["version"], "1.0");
        assert_eq!(envelope["data"]["s"], "BTCUSDT");
    }

    #[tokio::test]
    async fn unclassifiable_frame_is_discarded_without_counters() {
        let broker = StubBroker::new();
        let shared = test_shared(Some(Arc::clone(&broker)));

        process_frame(&shared, json!({"foo": "bar"})).await;

        assert_eq!(shared.counters.processed(), 0);
        assert_eq!(shared.counters.dropped(), 0);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn non_object_frame_is_discarded_without_counters() {
        let shared = test_shared(Some(StubBroker::new()));
        process_frame(&shared, json!([1, 2, 3])).await;
        assert_eq!(shared.counters.processed(), 0);
        assert_eq!(shared.counters.dropped(), 0);
    }

    #[tokio::test]
    async fn missing_broker_counts_a_drop() {
        let shared = test_shared(None);
        process_frame(&shared, trade_frame()).await;
        assert_eq!(shared.counters.dropped(), 1);
        assert_eq!(shared.counters.processed(), 0);
    }

    #[tokio::test]
    async fn closed_broker_counts_a_drop() {
        let broker = StubBroker::new();
        broker.open.store(false, Ordering::SeqCst);
        let shared = test_shared(Some(Arc::clone(&broker)));

        process_frame(&shared, trade_frame()).await;

        assert_eq!(shared.counters.dropped(), 1);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_counts_a_drop() {
        let broker = StubBroker::new();
        broker.fail_next.store(1, Ordering::SeqCst);
        let shared = test_shared(Some(Arc::clone(&broker)));

        process_frame(&shared, trade_frame()).await;
        assert_eq!(shared.counters.dropped(), 1);

        process_frame(&shared, trade_frame()).await;
        assert_eq!(shared.counters.processed(), 1);
    }

    /// Two consecutive publish failures trip the broker breaker (threshold
    /// 2); the next frame is dropped fast without reaching the broker; after
    /// the recovery window a success closes the breaker again.
    #[tokio::test]
    async fn breaker_trips_on_publish_failures_then_recovers() {
        let broker = StubBroker::new();
        broker.fail_next.store(2, Ordering::SeqCst);
        let shared = test_shared(Some(Arc::clone(&broker)));

        process_frame(&shared, trade_frame()).await;
        process_frame(&shared, trade_frame()).await;
        assert_eq!(shared.counters.dropped(), 2);
        assert_eq!(shared.broker_breaker.state(), BreakerState::Open);

        // Rejected by the open breaker: counted as a drop, broker untouched.
        process_frame(&shared, trade_frame()).await;
        assert_eq!(shared.counters.dropped(), 3);
        assert!(broker.published().is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        process_frame(&shared, trade_frame()).await;
        assert_eq!(shared.counters.processed(), 1);
        assert_eq!(shared.broker_breaker.state(), BreakerState::Closed);
        assert_eq!(shared.broker_breaker.failure_count(), 0);
    }
}
