//! Client facade and reconnect supervisor.
//!
//! `SocketBridge` owns the whole pipeline: it dials the broker and the
//! market WebSocket (each through its own circuit breaker), launches the
//! processor pool, ingress, ping keeper and heartbeat reporter, and runs the
//! supervisor task that re-dials with exponential backoff after a disconnect.
//!
//! Lifecycle: `Initial -> Connecting -> Running -> Reconnecting -> Running`,
//! terminating on dial failure at start, reconnect exhaustion, or `stop()`.

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::broker::{BrokerConnector, BrokerError, BrokerPublisher, NatsConnector};
use crate::config::BridgeConfig;
use crate::heartbeat::run_heartbeat;
use crate::ingress::{run_ingress, subscribe_frame};
use crate::keepalive::run_ping_keeper;
use crate::metrics::{Counters, MetricsSnapshot, throttle_gate};
use crate::processor::run_processor;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as TokioMutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};
use tracing::{debug, error, info, warn};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type WsSink = SplitSink<WsStream, Message>;
pub(crate) type WsRead = SplitStream<WsStream>;

/// How long `stop()` waits for tasks to drain before aborting them.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Minimum spacing of the queue-full warning.
const DROP_WARN_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("broker: {0}")]
    Broker(#[from] BrokerError),
    #[error("websocket: {0}")]
    WebSocket(String),
    #[error("circuit breaker '{0}' is open")]
    BreakerOpen(&'static str),
}

/// Overall client state, driven by the facade and the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Initial,
    Connecting,
    Running,
    Reconnecting,
    Terminated,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared by every task the bridge owns.
///
/// Flags and counters are atomics readable from any task; the connection
/// handles are swapped by the supervisor under short lock sections so no
/// task can use a handle after it is closed.
pub(crate) struct Shared {
    config: StdRwLock<Arc<BridgeConfig>>,
    running: AtomicBool,
    connected: AtomicBool,
    state: StdMutex<BridgeState>,
    pub(crate) counters: Counters,
    /// Epoch milliseconds of the last received frame; 0 = never.
    last_message_ms: AtomicU64,
    /// Epoch milliseconds of the last sent ping; 0 = never.
    last_ping_ms: AtomicU64,
    started_at: StdMutex<Option<Instant>>,
    queue_tx: StdMutex<Option<mpsc::Sender<Value>>>,
    ws_writer: TokioMutex<Option<WsSink>>,
    broker: StdRwLock<Option<Arc<dyn BrokerPublisher>>>,
    pub(crate) ws_breaker: CircuitBreaker,
    pub(crate) broker_breaker: CircuitBreaker,
    last_drop_warn_ms: AtomicU64,
    last_stats_log_ms: AtomicU64,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn new(config: BridgeConfig) -> Self {
        let ws_breaker = CircuitBreaker::new(
            "websocket",
            config.breakers.websocket.failure_threshold,
            config.breakers.websocket.recovery_timeout(),
        );
        let broker_breaker = CircuitBreaker::new(
            "broker",
            config.breakers.broker.failure_threshold,
            config.breakers.broker.recovery_timeout(),
        );
        Shared {
            config: StdRwLock::new(Arc::new(config)),
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            state: StdMutex::new(BridgeState::Initial),
            counters: Counters::new(),
            last_message_ms: AtomicU64::new(0),
            last_ping_ms: AtomicU64::new(0),
            started_at: StdMutex::new(None),
            queue_tx: StdMutex::new(None),
            ws_writer: TokioMutex::new(None),
            broker: StdRwLock::new(None),
            ws_breaker,
            broker_breaker,
            last_drop_warn_ms: AtomicU64::new(0),
            last_stats_log_ms: AtomicU64::new(0),
            tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Current config snapshot; re-read at every (re)connect cycle.
    pub(crate) fn config(&self) -> Arc<BridgeConfig> {
        match self.config.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub(crate) fn set_config(&self, config: BridgeConfig) {
        let mut guard = match self.config.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(config);
    }

    pub(crate) fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn set_state(&self, state: BridgeState) {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard != state {
            debug!(from = ?*guard, to = ?state, "client state transition");
            *guard = state;
        }
    }

    fn state(&self) -> BridgeState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub(crate) fn touch_last_message(&self) {
        self.last_message_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn touch_last_ping(&self) {
        self.last_ping_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn time_since_last_message(&self) -> Option<f64> {
        seconds_since(self.last_message_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn seconds_since_last_ping(&self) -> Option<f64> {
        seconds_since(self.last_ping_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn uptime_seconds(&self) -> f64 {
        let guard = match self.started_at.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.map_or(0.0, |at| at.elapsed().as_secs_f64())
    }

    fn mark_started(&self) {
        let mut guard = match self.started_at.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(Instant::now());
    }

    // -- hand-off queue --

    pub(crate) fn install_queue(&self, tx: mpsc::Sender<Value>) {
        let mut guard = match self.queue_tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(tx);
    }

    fn take_queue(&self) {
        let mut guard = match self.queue_tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = None;
    }

    fn queue_sender(&self) -> Option<mpsc::Sender<Value>> {
        match self.queue_tx.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Non-blocking enqueue; a full queue turns the frame into a counted
    /// drop with a rate-limited warning.
    pub(crate) fn enqueue(&self, frame: Value) {
        let Some(tx) = self.queue_sender() else {
            self.counters.record_dropped();
            return;
        };
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.counters.record_dropped();
                if throttle_gate(&self.last_drop_warn_ms, DROP_WARN_INTERVAL_MS, now_ms()) {
                    warn!(dropped_total = dropped, "message queue full, dropping frames");
                }
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.record_dropped();
            }
        }
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.queue_sender()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }

    pub(crate) fn should_log_stats(&self, interval_s: u64) -> bool {
        throttle_gate(&self.last_stats_log_ms, interval_s * 1000, now_ms())
    }

    // -- connection handles --

    pub(crate) fn broker_handle(&self) -> Option<Arc<dyn BrokerPublisher>> {
        match self.broker.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_broker_for_tests(&self, handle: Arc<dyn BrokerPublisher>) {
        self.set_broker(Some(handle));
    }

    fn set_broker(&self, handle: Option<Arc<dyn BrokerPublisher>>) {
        let mut guard = match self.broker.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = handle;
    }

    pub(crate) async fn send_ping(&self) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let mut guard = self.ws_writer.lock().await;
        match guard.as_mut() {
            Some(writer) => writer.send(Message::Ping(Vec::new().into())).await,
            None => Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed),
        }
    }

    pub(crate) async fn send_pong(&self, payload: tokio_tungstenite::tungstenite::Bytes) {
        let mut guard = self.ws_writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            let _ = writer.send(Message::Pong(payload)).await;
        }
    }

    pub(crate) fn websocket_state(&self) -> &'static str {
        if self.connected() { "connected" } else { "disconnected" }
    }

    pub(crate) fn broker_state(&self) -> &'static str {
        match self.broker_handle() {
            Some(handle) if handle.is_open() => "connected",
            _ => "disconnected",
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut guard = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push(handle);
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        let mut guard = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::take(&mut *guard)
    }
}

pub(crate) fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Seconds since an epoch-millisecond timestamp; None for the 0 sentinel.
#[allow(clippy::cast_precision_loss)]
fn seconds_since(epoch_ms: u64) -> Option<f64> {
    if epoch_ms == 0 {
        return None;
    }
    Some(now_ms().saturating_sub(epoch_ms) as f64 / 1000.0)
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

/// Start/stop entry point for the bridge; wires ingress, pool, keep-alive,
/// heartbeat and the reconnect supervisor, and exposes the metrics snapshot.
pub struct SocketBridge {
    shared: Arc<Shared>,
    connector: Arc<dyn BrokerConnector>,
    shutdown_tx: StdMutex<Option<watch::Sender<bool>>>,
    terminated_tx: watch::Sender<bool>,
}

impl SocketBridge {
    /// A bridge publishing to NATS.
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_connector(config, Arc::new(NatsConnector))
    }

    /// A bridge with a custom broker connector (used by tests).
    pub fn with_connector(config: BridgeConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        let (terminated_tx, _) = watch::channel(false);
        SocketBridge {
            shared: Arc::new(Shared::new(config)),
            connector,
            shutdown_tx: StdMutex::new(None),
            terminated_tx,
        }
    }

    /// Fires once when the client terminates (reconnect exhaustion or stop).
    pub fn terminated(&self) -> watch::Receiver<bool> {
        self.terminated_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected()
    }

    pub fn state(&self) -> BridgeState {
        self.shared.state()
    }

    /// Swap in a new config snapshot; consumed on the next reconnect cycle.
    pub fn reload(&self, config: BridgeConfig) {
        info!(
            streams = config.websocket.streams.len(),
            "bridge configuration reloaded"
        );
        self.shared.set_config(config);
    }

    /// Start the bridge.  Idempotent: a second call while running is a no-op.
    ///
    /// Dial failures for either dependency are fatal: the client transitions
    /// to `Terminated` and the error is returned.
    pub async fn start(&self) -> Result<(), BridgeError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            debug!("start called while already running");
            return Ok(());
        }
        self.shared.set_state(BridgeState::Connecting);
        self.terminated_tx.send_replace(false);
        let cfg = self.shared.config();
        info!(
            ws_url = %cfg.websocket.url,
            streams = cfg.websocket.streams.len(),
            subject = %cfg.broker.subject,
            processors = cfg.queue.processors,
            "starting socket bridge"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut guard = match self.shutdown_tx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = Some(shutdown_tx);
        }

        // Broker first: workers are useless without a publish target.
        let broker = match self
            .shared
            .broker_breaker
            .call(|| self.connector.connect(&cfg.broker))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                let e = match e {
                    BreakerError::Open(name) => BridgeError::BreakerOpen(name),
                    BreakerError::Service(err) => BridgeError::Broker(err),
                };
                error!(error = %e, "failed to connect to broker");
                self.stop().await;
                return Err(e);
            }
        };
        self.shared.set_broker(Some(broker));

        // Processor pool; workers idle on the empty queue until frames flow.
        let (queue_tx, queue_rx) = mpsc::channel::<Value>(cfg.queue.capacity);
        self.shared.install_queue(queue_tx);
        let queue_rx = Arc::new(TokioMutex::new(queue_rx));
        for worker in 0..cfg.queue.processors {
            let handle = tokio::spawn(run_processor(
                Arc::clone(&self.shared),
                Arc::clone(&queue_rx),
                worker,
            ));
            self.shared.track(handle);
        }

        let (disconnect_tx, disconnect_rx) = mpsc::channel::<()>(4);
        if let Err(e) =
            connect_websocket(&self.shared, shutdown_rx.clone(), disconnect_tx.clone()).await
        {
            error!(error = %e, "failed to connect to websocket");
            self.stop().await;
            return Err(e);
        }

        if cfg.heartbeat.enabled {
            let handle = tokio::spawn(run_heartbeat(
                Arc::clone(&self.shared),
                shutdown_rx.clone(),
            ));
            self.shared.track(handle);
        }

        let handle = tokio::spawn(run_supervisor(
            Arc::clone(&self.shared),
            shutdown_rx,
            disconnect_rx,
            disconnect_tx,
            self.terminated_tx.clone(),
        ));
        self.shared.track(handle);

        self.shared.mark_started();
        self.shared.set_state(BridgeState::Running);
        info!("socket bridge started");
        Ok(())
    }

    /// Stop the bridge.  Safe to call repeatedly and before a successful
    /// start; tasks drain cooperatively and are aborted after a grace period.
    pub async fn stop(&self) {
        info!("stopping socket bridge");
        self.shared.running.store(false, Ordering::SeqCst);
        let sender = {
            let mut guard = match self.shutdown_tx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(sender) = sender {
            let _ = sender.send(true);
        }

        // Close the WebSocket writer so the peer sees a clean shutdown.
        {
            let mut guard = self.shared.ws_writer.lock().await;
            if let Some(mut writer) = guard.take() {
                let _ = writer.send(Message::Close(None)).await;
            }
        }
        self.shared.set_connected(false);

        // Stop accepting frames, then let workers drain.
        self.shared.take_queue();

        for mut handle in self.shared.take_tasks() {
            if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        // Flush buffered publishes before dropping the handle.
        if let Some(broker) = self.shared.broker_handle() {
            if let Err(e) = broker.flush().await {
                warn!(error = %e, "broker flush during shutdown failed");
            }
        }
        self.shared.set_broker(None);

        self.shared.set_state(BridgeState::Terminated);
        let _ = self.terminated_tx.send(true);
        info!("socket bridge stopped");
    }

    /// Read-only metrics snapshot for the external health endpoint.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let shared = &self.shared;
        let cfg = shared.config();
        let connected = shared.connected();
        let processed = shared.counters.processed();
        let dropped = shared.counters.dropped();
        let uptime = shared.uptime_seconds();
        let queue_size = shared.queue_len();
        let capacity = cfg.queue.capacity;
        #[allow(clippy::cast_precision_loss)]
        let messages_per_second = if uptime > 0.0 {
            processed as f64 / uptime
        } else {
            0.0
        };
        #[allow(clippy::cast_precision_loss)]
        let queue_utilization_percent = if capacity > 0 {
            queue_size as f64 / capacity as f64 * 100.0
        } else {
            0.0
        };
        #[allow(clippy::cast_precision_loss)]
        let last_message_time = shared.last_message_ms.load(Ordering::Relaxed) as f64 / 1000.0;
        #[allow(clippy::cast_precision_loss)]
        let last_ping = shared.last_ping_ms.load(Ordering::Relaxed) as f64 / 1000.0;
        MetricsSnapshot {
            is_connected: connected,
            is_running: shared.running(),
            connection_status: if connected { "connected" } else { "disconnected" },
            reconnect_attempts: shared.counters.reconnect_attempts(),
            processed_messages: processed,
            dropped_messages: dropped,
            stream_count: cfg.websocket.streams.len(),
            streams: cfg.websocket.streams.clone(),
            uptime_seconds: uptime,
            queue_size,
            last_message_time,
            last_ping,
            websocket_state: shared.websocket_state(),
            nats_state: shared.broker_state(),
            messages_per_second,
            queue_utilization_percent,
            time_since_last_message: shared.time_since_last_message(),
            heartbeat_enabled: cfg.heartbeat.enabled,
            heartbeat_interval_s: cfg.heartbeat.interval_s,
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket dialing
// ---------------------------------------------------------------------------

/// Dial the upstream WebSocket through the breaker, send the SUBSCRIBE
/// control frame, store the writer half, and launch ingress + ping keeper
/// for the new connection.
async fn connect_websocket(
    shared: &Arc<Shared>,
    shutdown: watch::Receiver<bool>,
    disconnect_tx: mpsc::Sender<()>,
) -> Result<(), BridgeError> {
    let cfg = shared.config();
    let ws = shared
        .ws_breaker
        .call(|| dial_websocket(&cfg))
        .await
        .map_err(|e| match e {
            BreakerError::Open(name) => BridgeError::BreakerOpen(name),
            BreakerError::Service(err) => BridgeError::WebSocket(err.to_string()),
        })?;

    let (mut writer, reader) = ws.split();
    let subscribe = subscribe_frame(&cfg.websocket.streams);
    writer
        .send(Message::Text(subscribe.into()))
        .await
        .map_err(|e| BridgeError::WebSocket(e.to_string()))?;
    *shared.ws_writer.lock().await = Some(writer);
    shared.set_connected(true);

    let handle = tokio::spawn(run_ingress(
        Arc::clone(shared),
        reader,
        shutdown.clone(),
        disconnect_tx,
    ));
    shared.track(handle);
    let handle = tokio::spawn(run_ping_keeper(Arc::clone(shared), shutdown));
    shared.track(handle);

    info!(
        url = %cfg.websocket.url,
        streams = cfg.websocket.streams.len(),
        "connected to market websocket"
    );
    Ok(())
}

async fn dial_websocket(
    cfg: &BridgeConfig,
) -> Result<WsStream, tokio_tungstenite::tungstenite::Error> {
    let ws_config =
        WebSocketConfig::default().max_message_size(Some(cfg.websocket.max_message_size));
    let (ws, _response) =
        connect_async_with_config(cfg.websocket.url.as_str(), Some(ws_config), false).await?;
    Ok(ws)
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

enum ReconnectOutcome {
    Reconnected,
    Exhausted,
    Cancelled,
}

/// Waits for ingress disconnect signals and runs the backoff re-dial loop;
/// the only task allowed to terminate the client.
async fn run_supervisor(
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    mut disconnect_rx: mpsc::Receiver<()>,
    disconnect_tx: mpsc::Sender<()>,
    terminated_tx: watch::Sender<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            signal = disconnect_rx.recv() => {
                if signal.is_none() || !shared.running() {
                    break;
                }
                warn!("websocket disconnected, attempting reconnection");
                shared.set_state(BridgeState::Reconnecting);
                match reconnect_loop(&shared, &mut shutdown, &disconnect_tx).await {
                    ReconnectOutcome::Reconnected => {
                        shared.set_state(BridgeState::Running);
                    }
                    ReconnectOutcome::Exhausted => {
                        error!("max reconnection attempts reached, stopping client");
                        shared.running.store(false, Ordering::SeqCst);
                        shared.set_state(BridgeState::Terminated);
                        let _ = terminated_tx.send(true);
                        break;
                    }
                    ReconnectOutcome::Cancelled => break,
                }
            }
        }
    }
    debug!("supervisor exited");
}

/// Exponential-backoff re-dial loop.
///
/// The attempt counter is bumped only on failures and reset to zero by the
/// first successful re-dial; the total across one disconnect episode never
/// exceeds `reconnect.max_attempts`.
async fn reconnect_loop(
    shared: &Arc<Shared>,
    shutdown: &mut watch::Receiver<bool>,
    disconnect_tx: &mpsc::Sender<()>,
) -> ReconnectOutcome {
    loop {
        if !shared.running() {
            return ReconnectOutcome::Cancelled;
        }
        // Fresh config snapshot each cycle so live stream updates apply.
        let cfg = shared.config();
        let attempts = shared.counters.reconnect_attempts();
        if attempts >= cfg.reconnect.max_attempts {
            return ReconnectOutcome::Exhausted;
        }

        let delay = cfg.reconnect.initial_delay_s
            * cfg.reconnect.backoff_multiplier.powi(i32::try_from(attempts).unwrap_or(i32::MAX));
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return ReconnectOutcome::Cancelled;
                }
            }
            () = tokio::time::sleep(Duration::from_secs_f64(delay)) => {}
        }

        info!(
            attempt = attempts + 1,
            max_attempts = cfg.reconnect.max_attempts,
            "attempting websocket reconnection"
        );
        match connect_websocket(shared, shutdown.clone(), disconnect_tx.clone()).await {
            Ok(()) => {
                shared.counters.reset_reconnect_attempts();
                return ReconnectOutcome::Reconnected;
            }
            Err(e) => {
                let failed = shared.counters.record_reconnect_attempt();
                error!(error = %e, attempt = failed, "reconnection attempt failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shared_with_queue(capacity: usize) -> (Arc<Shared>, mpsc::Receiver<Value>) {
        let mut cfg = BridgeConfig::default();
        cfg.queue.capacity = capacity;
        let shared = Arc::new(Shared::new(cfg));
        let (tx, rx) = mpsc::channel(capacity);
        shared.install_queue(tx);
        (shared, rx)
    }

    #[test]
    fn enqueue_on_full_queue_counts_a_drop() {
        // Hold the receiver without draining, as if processors were paused.
        let (shared, _rx) = shared_with_queue(2);
        shared.enqueue(json!({"n": 1}));
        shared.enqueue(json!({"n": 2}));
        assert_eq!(shared.queue_len(), 2);
        assert_eq!(shared.counters.dropped(), 0);

        shared.enqueue(json!({"n": 3}));
        assert_eq!(shared.queue_len(), 2, "queue length never exceeds capacity");
        assert_eq!(shared.counters.dropped(), 1);
        assert_eq!(shared.counters.processed(), 0);
    }

    #[test]
    fn enqueue_without_installed_queue_counts_a_drop() {
        let shared = Arc::new(Shared::new(BridgeConfig::default()));
        shared.enqueue(json!({}));
        assert_eq!(shared.counters.dropped(), 1);
    }

    #[test]
    fn time_since_last_message_is_none_until_first_frame() {
        let shared = Arc::new(Shared::new(BridgeConfig::default()));
        assert!(shared.time_since_last_message().is_none());
        shared.touch_last_message();
        assert!(shared.time_since_last_message().is_some());
    }

    #[tokio::test]
    async fn metrics_snapshot_before_start_is_inert() {
        let bridge = SocketBridge::new(BridgeConfig::default());
        let metrics = bridge.get_metrics();
        assert!(!metrics.is_running);
        assert!(!metrics.is_connected);
        assert_eq!(metrics.connection_status, "disconnected");
        assert_eq!(metrics.websocket_state, "disconnected");
        assert_eq!(metrics.nats_state, "disconnected");
        assert_eq!(metrics.processed_messages, 0);
        assert_eq!(metrics.dropped_messages, 0);
        assert_eq!(metrics.queue_size, 0);
        assert_eq!(metrics.uptime_seconds, 0.0);
        assert_eq!(metrics.messages_per_second, 0.0);
        assert!(metrics.time_since_last_message.is_none());
        assert_eq!(metrics.stream_count, metrics.streams.len());
        assert_eq!(bridge.state(), BridgeState::Initial);
    }

    #[tokio::test]
    async fn stop_before_start_is_safe_and_repeatable() {
        let bridge = SocketBridge::new(BridgeConfig::default());
        bridge.stop().await;
        bridge.stop().await;
        assert!(!bridge.is_running());
        assert_eq!(bridge.state(), BridgeState::Terminated);
        assert!(*bridge.terminated().borrow());
    }

    #[test]
    fn metrics_snapshot_serializes_for_the_health_surface() {
        let bridge = SocketBridge::new(BridgeConfig::default());
        let json = serde_json::to_value(bridge.get_metrics()).unwrap();
        for key in [
            "is_connected",
            "is_running",
            "connection_status",
            "reconnect_attempts",
            "processed_messages",
            "dropped_messages",
            "stream_count",
            "streams",
            "uptime_seconds",
            "queue_size",
            "last_message_time",
            "last_ping",
            "websocket_state",
            "nats_state",
            "messages_per_second",
            "queue_utilization_percent",
            "time_since_last_message",
            "heartbeat_enabled",
            "heartbeat_interval_s",
        ] {
            assert!(json.get(key).is_some(), "missing metrics field {key}");
        }
    }
}
