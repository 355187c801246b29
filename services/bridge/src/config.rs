//! Bridge configuration loading.
//!
//! Everything comes from one TOML file (default
//! `/etc/socket-bridge/bridge.toml`); the environment is never consulted.
//!
//! Every section is optional and falls back to the defaults below; the only
//! required field is `schema_version = 1`.  Value errors (bad URL scheme,
//! zero queue capacity, backoff multiplier below 1) are fatal at start.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level bridge configuration, read once at start and re-read as a
/// snapshot on each reconnection cycle.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub schema_version: u32,
    pub websocket: WebsocketSettings,
    pub broker: BrokerSettings,
    pub reconnect: ReconnectSettings,
    pub queue: QueueSettings,
    pub breakers: BreakersSettings,
    pub heartbeat: HeartbeatSettings,
    pub stats: StatsSettings,
}

/// Upstream market-data WebSocket endpoint and subscription list.
#[derive(Debug, Clone)]
pub struct WebsocketSettings {
    /// `ws://` or `wss://` URL of the exchange stream endpoint.
    pub url: String,
    /// Stream identifiers for the SUBSCRIBE control frame, e.g.
    /// `btcusdt@trade`.  May be empty.
    pub streams: Vec<String>,
    pub ping_interval_s: u64,
    pub ping_timeout_s: u64,
    pub close_timeout_s: u64,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
}

/// Downstream broker endpoint; all envelopes go to one subject.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub url: String,
    pub subject: String,
    pub client_name: String,
}

/// Exponential backoff policy for WebSocket re-dials.
#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    pub initial_delay_s: f64,
    pub max_attempts: u32,
    pub backoff_multiplier: f64,
}

/// Hand-off queue between ingress and the processor pool.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub capacity: usize,
    /// Dequeue wait; doubles as the shutdown polling period.
    pub batch_timeout_s: f64,
    pub processors: usize,
}

/// One circuit breaker per downstream dependency.
#[derive(Debug, Clone)]
pub struct BreakersSettings {
    pub websocket: BreakerSettings,
    pub broker: BreakerSettings,
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Consecutive failures before the breaker opens; 0 means never trip.
    pub failure_threshold: u32,
    pub recovery_timeout_s: f64,
}

#[derive(Debug, Clone)]
pub struct HeartbeatSettings {
    pub enabled: bool,
    pub interval_s: u64,
}

#[derive(Debug, Clone)]
pub struct StatsSettings {
    /// Minimum spacing of the pool-wide "message processing stats" log line.
    pub log_interval_s: u64,
}

impl WebsocketSettings {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_s)
    }
}

impl QueueSettings {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.batch_timeout_s)
    }
}

impl BreakerSettings {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.recovery_timeout_s)
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_websocket() -> WebsocketSettings {
    WebsocketSettings {
        url: "wss://stream.binance.com:9443".to_owned(),
        streams: vec![
            "btcusdt@trade".to_owned(),
            "btcusdt@ticker".to_owned(),
            "btcusdt@depth20@100ms".to_owned(),
            "ethusdt@trade".to_owned(),
            "ethusdt@ticker".to_owned(),
            "ethusdt@depth20@100ms".to_owned(),
        ],
        ping_interval_s: 30,
        ping_timeout_s: 10,
        close_timeout_s: 10,
        max_message_size: 1_048_576,
    }
}

fn default_broker() -> BrokerSettings {
    BrokerSettings {
        url: "nats://localhost:4222".to_owned(),
        subject: "binance.websocket.data".to_owned(),
        client_name: "socket-bridge".to_owned(),
    }
}

fn default_reconnect() -> ReconnectSettings {
    ReconnectSettings {
        initial_delay_s: 5.0,
        max_attempts: 10,
        backoff_multiplier: 2.0,
    }
}

fn default_queue() -> QueueSettings {
    QueueSettings {
        capacity: 1000,
        batch_timeout_s: 1.0,
        processors: 4,
    }
}

fn default_breakers() -> BreakersSettings {
    BreakersSettings {
        websocket: BreakerSettings {
            failure_threshold: 5,
            recovery_timeout_s: 60.0,
        },
        broker: BreakerSettings {
            failure_threshold: 3,
            recovery_timeout_s: 30.0,
        },
    }
}

fn default_heartbeat() -> HeartbeatSettings {
    HeartbeatSettings {
        enabled: true,
        interval_s: 30,
    }
}

fn default_stats() -> StatsSettings {
    StatsSettings { log_interval_s: 60 }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            schema_version: 1,
            websocket: default_websocket(),
            broker: default_broker(),
            reconnect: default_reconnect(),
            queue: default_queue(),
            breakers: default_breakers(),
            heartbeat: default_heartbeat(),
            stats: default_stats(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    websocket: Option<RawWebsocket>,
    broker: Option<RawBroker>,
    reconnect: Option<RawReconnect>,
    queue: Option<RawQueue>,
    breakers: Option<RawBreakers>,
    heartbeat: Option<RawHeartbeat>,
    stats: Option<RawStats>,
}

#[derive(Debug, Deserialize)]
struct RawWebsocket {
    url: Option<String>,
    streams: Option<Vec<String>>,
    ping_interval_s: Option<u64>,
    ping_timeout_s: Option<u64>,
    close_timeout_s: Option<u64>,
    max_message_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawBroker {
    url: Option<String>,
    subject: Option<String>,
    client_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReconnect {
    initial_delay_s: Option<f64>,
    max_attempts: Option<u32>,
    backoff_multiplier: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawQueue {
    capacity: Option<usize>,
    batch_timeout_s: Option<f64>,
    processors: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawBreakers {
    websocket: Option<RawBreaker>,
    broker: Option<RawBreaker>,
}

#[derive(Debug, Deserialize)]
struct RawBreaker {
    failure_threshold: Option<u32>,
    recovery_timeout_s: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawHeartbeat {
    enabled: Option<bool>,
    interval_s: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawStats {
    log_interval_s: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load bridge config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load bridge config from the default path `/etc/socket-bridge/bridge.toml`.
pub fn load_config() -> Result<BridgeConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/socket-bridge/bridge.toml"))
}

/// Load bridge config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<BridgeConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let websocket = match raw.websocket {
        Some(w) => {
            let d = default_websocket();
            WebsocketSettings {
                url: w.url.unwrap_or(d.url),
                streams: w.streams.unwrap_or(d.streams),
                ping_interval_s: w.ping_interval_s.unwrap_or(d.ping_interval_s),
                ping_timeout_s: w.ping_timeout_s.unwrap_or(d.ping_timeout_s),
                close_timeout_s: w.close_timeout_s.unwrap_or(d.close_timeout_s),
                max_message_size: w.max_message_size.unwrap_or(d.max_message_size),
            }
        }
        None => default_websocket(),
    };

    let broker = match raw.broker {
        Some(b) => {
            let d = default_broker();
            BrokerSettings {
                url: b.url.unwrap_or(d.url),
                subject: b.subject.unwrap_or(d.subject),
                client_name: b.client_name.unwrap_or(d.client_name),
            }
        }
        None => default_broker(),
    };

    let reconnect = match raw.reconnect {
        Some(r) => {
            let d = default_reconnect();
            ReconnectSettings {
                initial_delay_s: r.initial_delay_s.unwrap_or(d.initial_delay_s),
                max_attempts: r.max_attempts.unwrap_or(d.max_attempts),
                backoff_multiplier: r.backoff_multiplier.unwrap_or(d.backoff_multiplier),
            }
        }
        None => default_reconnect(),
    };

    let queue = match raw.queue {
        Some(q) => {
            let d = default_queue();
            QueueSettings {
                capacity: q.capacity.unwrap_or(d.capacity),
                batch_timeout_s: q.batch_timeout_s.unwrap_or(d.batch_timeout_s),
                processors: q.processors.unwrap_or(d.processors),
            }
        }
        None => default_queue(),
    };

    let breakers = match raw.breakers {
        Some(b) => {
            let d = default_breakers();
            BreakersSettings {
                websocket: merge_breaker(b.websocket, d.websocket),
                broker: merge_breaker(b.broker, d.broker),
            }
        }
        None => default_breakers(),
    };

    let heartbeat = match raw.heartbeat {
        Some(h) => {
            let d = default_heartbeat();
            HeartbeatSettings {
                enabled: h.enabled.unwrap_or(d.enabled),
                interval_s: h.interval_s.unwrap_or(d.interval_s),
            }
        }
        None => default_heartbeat(),
    };

    let stats = match raw.stats {
        Some(s) => {
            let d = default_stats();
            StatsSettings {
                log_interval_s: s.log_interval_s.unwrap_or(d.log_interval_s),
            }
        }
        None => default_stats(),
    };

    let config = BridgeConfig {
        schema_version,
        websocket,
        broker,
        reconnect,
        queue,
        breakers,
        heartbeat,
        stats,
    };
    validate(&config)?;
    Ok(config)
}

fn merge_breaker(raw: Option<RawBreaker>, default: BreakerSettings) -> BreakerSettings {
    match raw {
        Some(b) => BreakerSettings {
            failure_threshold: b.failure_threshold.unwrap_or(default.failure_threshold),
            recovery_timeout_s: b.recovery_timeout_s.unwrap_or(default.recovery_timeout_s),
        },
        None => default,
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &BridgeConfig) -> Result<(), ConfigError> {
    let ws = &config.websocket;
    if !ws.url.starts_with("ws://") && !ws.url.starts_with("wss://") {
        return Err(ConfigError::InvalidValue(format!(
            "websocket.url must start with ws:// or wss://, got '{}'",
            ws.url
        )));
    }
    if ws.max_message_size == 0 {
        return Err(ConfigError::InvalidValue(
            "websocket.max_message_size must be positive".to_owned(),
        ));
    }
    if config.broker.url.is_empty() {
        return Err(ConfigError::InvalidValue("broker.url must not be empty".to_owned()));
    }
    if config.broker.subject.is_empty() {
        return Err(ConfigError::InvalidValue(
            "broker.subject must not be empty".to_owned(),
        ));
    }
    let rc = &config.reconnect;
    if !rc.initial_delay_s.is_finite() || rc.initial_delay_s < 0.0 {
        return Err(ConfigError::InvalidValue(
            "reconnect.initial_delay_s must be non-negative".to_owned(),
        ));
    }
    if !rc.backoff_multiplier.is_finite() || rc.backoff_multiplier < 1.0 {
        return Err(ConfigError::InvalidValue(
            "reconnect.backoff_multiplier must be at least 1".to_owned(),
        ));
    }
    let q = &config.queue;
    if q.capacity == 0 {
        return Err(ConfigError::InvalidValue("queue.capacity must be at least 1".to_owned()));
    }
    if q.processors == 0 {
        return Err(ConfigError::InvalidValue(
            "queue.processors must be at least 1".to_owned(),
        ));
    }
    if !q.batch_timeout_s.is_finite() || q.batch_timeout_s <= 0.0 {
        return Err(ConfigError::InvalidValue(
            "queue.batch_timeout_s must be positive".to_owned(),
        ));
    }
    for (name, breaker) in [
        ("breakers.websocket", &config.breakers.websocket),
        ("breakers.broker", &config.breakers.broker),
    ] {
        if !breaker.recovery_timeout_s.is_finite() || breaker.recovery_timeout_s < 0.0 {
            return Err(ConfigError::InvalidValue(format!(
                "{name}.recovery_timeout_s must be non-negative"
            )));
        }
    }
    if config.heartbeat.interval_s == 0 {
        return Err(ConfigError::InvalidValue(
            "heartbeat.interval_s must be at least 1".to_owned(),
        ));
    }
    if config.stats.log_interval_s == 0 {
        return Err(ConfigError::InvalidValue(
            "stats.log_interval_s must be at least 1".to_owned(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
