#![allow(dead_code)]

// Shared fixtures for the bridge integration suites: a capture broker that
// stands in for NATS, and a config tuned for fast test timings.

use async_trait::async_trait;
use bridge::broker::{BrokerConnector, BrokerError, BrokerPublisher};
use bridge::config::{BridgeConfig, ReconnectSettings};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The literal trade frame from the upstream wire contract.
pub const TRADE_FRAME: &str =
    r#"{"e":"trade","E":123456789,"s":"BTCUSDT","t":12345,"p":"0.001","q":"100"}"#;

/// A depth snapshot without an explicit symbol.
pub const DEPTH_FRAME: &str =
    r#"{"lastUpdateId":160,"bids":[["0.001","100"]],"asks":[["0.0011","150"]]}"#;

// ---------------------------------------------------------------------------
// Capture broker
// ---------------------------------------------------------------------------

/// Records every publish; can be closed or told to fail upcoming publishes.
pub struct CaptureBroker {
    open: AtomicBool,
    fail_publishes: AtomicU32,
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl CaptureBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(CaptureBroker {
            open: AtomicBool::new(true),
            fail_publishes: AtomicU32::new(0),
            published: Mutex::new(Vec::new()),
        })
    }

    /// Published envelopes as (subject, decoded JSON body).
    pub fn published(&self) -> Vec<(String, Value)> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(subject, payload)| (subject.clone(), serde_json::from_slice(payload).unwrap()))
            .collect()
    }

    pub fn publish_count(&self) -> usize {
        self.published.lock().unwrap().len()
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn fail_next_publishes(&self, count: u32) {
        self.fail_publishes.store(count, Ordering::SeqCst);
    }

    pub async fn wait_for_publishes(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Result<(), String> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.publish_count() >= count {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(format!(
            "timed out waiting for {count} publishes, saw {}",
            self.publish_count()
        ))
    }
}

#[async_trait]
impl BrokerPublisher for CaptureBroker {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let remaining = self.fail_publishes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_publishes.store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::Publish("injected failure".to_owned()));
        }
        self.published
            .lock()
            .unwrap()
            .push((subject.to_owned(), payload));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn flush(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Hands out the capture broker; can fail a number of connect attempts first.
pub struct CaptureConnector {
    broker: Arc<CaptureBroker>,
    fail_connects: AtomicU32,
}

impl CaptureConnector {
    pub fn new(broker: Arc<CaptureBroker>) -> Arc<Self> {
        Arc::new(CaptureConnector {
            broker,
            fail_connects: AtomicU32::new(0),
        })
    }

    pub fn failing(broker: Arc<CaptureBroker>, fail_connects: u32) -> Arc<Self> {
        Arc::new(CaptureConnector {
            broker,
            fail_connects: AtomicU32::new(fail_connects),
        })
    }
}

#[async_trait]
impl BrokerConnector for CaptureConnector {
    async fn connect(
        &self,
        _settings: &bridge::config::BrokerSettings,
    ) -> Result<Arc<dyn BrokerPublisher>, BrokerError> {
        let remaining = self.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::Connect("injected connect failure".to_owned()));
        }
        Ok(Arc::clone(&self.broker) as Arc<dyn BrokerPublisher>)
    }
}

// ---------------------------------------------------------------------------
// Config fixture
// ---------------------------------------------------------------------------

/// Default config pointed at a mock server, with timings tuned for tests.
/// The websocket breaker threshold is 0 (never trip) so reconnect tests
/// exercise the backoff loop alone.
pub fn test_config(ws_url: String) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.websocket.url = ws_url;
    config.websocket.streams = vec!["btcusdt@trade".to_owned()];
    config.websocket.ping_interval_s = 1;
    config.queue.capacity = 100;
    config.queue.batch_timeout_s = 0.1;
    config.queue.processors = 2;
    config.reconnect = ReconnectSettings {
        initial_delay_s: 0.05,
        max_attempts: 5,
        backoff_multiplier: 2.0,
    };
    config.breakers.websocket.failure_threshold = 0;
    config.heartbeat.interval_s = 1;
    config
}
