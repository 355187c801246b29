// sb-protocol: Egress wire format and stream naming for the socket bridge.
//
// Everything published downstream is an `Envelope`; the `stream` field it
// carries is derived from the raw exchange frame by `classify_stream`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Constant `source` tag stamped on every envelope.
pub const ENVELOPE_SOURCE: &str = "binance-websocket";

/// Constant envelope schema version.
pub const ENVELOPE_VERSION: &str = "1.0";

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The normalized record published to the broker.
///
/// Immutable after creation; one envelope exists for the duration of a single
/// publish attempt.  The original frame payload is carried structure-preserving
/// under `data`; the event variant lives in `stream` and inside the payload,
/// never in the type system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Routing hint, e.g. `btcusdt@trade`.
    pub stream: String,
    /// The decoded upstream payload, passed through untouched.
    pub data: Value,
    /// Envelope creation instant, UTC, microsecond precision.
    #[serde(with = "iso_micros")]
    pub timestamp: DateTime<Utc>,
    /// Unique per envelope; opaque to consumers.
    pub message_id: String,
    pub source: String,
    pub version: String,
}

impl Envelope {
    /// Build an envelope for one publish attempt: fresh `message_id`, fresh
    /// `timestamp`, constant `source` and `version`.
    pub fn new(stream: String, data: Value) -> Self {
        let now = Utc::now();
        // Truncate to the serialized precision so a round-trip through the
        // wire format parses back to the same instant.
        let timestamp = DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now);
        Envelope {
            stream,
            data,
            timestamp,
            message_id: uuid::Uuid::new_v4().to_string(),
            source: ENVELOPE_SOURCE.to_owned(),
            version: ENVELOPE_VERSION.to_owned(),
        }
    }

    /// The UTF-8 JSON body published on the broker subject.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Serde adapter for the envelope timestamp: ISO-8601 UTC with a fixed
/// six-digit fractional second and a trailing `Z`, e.g.
/// `2025-01-01T12:00:00.000000Z`.
mod iso_micros {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}Z", ts.format(FORMAT)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let trimmed = s.strip_suffix('Z').unwrap_or(&s);
        NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(D::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Stream classification
// ---------------------------------------------------------------------------

/// Derive the logical stream name for a decoded exchange frame.
///
/// Returns `None` when the frame carries neither a depth-snapshot signature
/// nor the event-type/symbol pair; callers discard such frames with a
/// warning.  Collisions across symbols are intentional; the name is a
/// routing hint, not an identity.
///
/// `subscribed` is the currently configured subscription list; it is only
/// consulted for depth snapshots that omit their symbol, and only when
/// exactly one subscribed stream is depth-like.
pub fn classify_stream(frame: &Value, subscribed: &[String]) -> Option<String> {
    let obj = frame.as_object()?;

    // Depth snapshots carry no event-type field; recognize them by shape.
    if obj.contains_key("lastUpdateId") && obj.contains_key("bids") && obj.contains_key("asks") {
        if let Some(symbol) = non_empty_str(obj.get("s")) {
            return Some(format!("{}@depth20@100ms", symbol.to_lowercase()));
        }
        return infer_depth_symbol(subscribed).map(|sym| format!("{sym}@depth20@100ms"));
    }

    let event_type = non_empty_str(obj.get("e"))?;
    let symbol = non_empty_str(obj.get("s"))?.to_lowercase();

    let stream = match event_type {
        "trade" => format!("{symbol}@trade"),
        "24hrTicker" => format!("{symbol}@ticker"),
        "depthUpdate" => format!("{symbol}@depth20@100ms"),
        "markPriceUpdate" => format!("{symbol}@markPrice@1s"),
        "fundingRate" => format!("{symbol}@fundingRate@1s"),
        other => format!("{symbol}@{other}"),
    };
    Some(stream)
}

/// A symbol-less depth snapshot is attributable only when the subscription
/// list contains exactly one depth-like stream.
fn infer_depth_symbol(subscribed: &[String]) -> Option<String> {
    let mut depth_streams = subscribed.iter().filter(|s| s.contains("@depth"));
    let first = depth_streams.next()?;
    if depth_streams.next().is_some() {
        return None;
    }
    let symbol = first.split('@').next()?;
    if symbol.is_empty() {
        return None;
    }
    Some(symbol.to_lowercase())
}

fn non_empty_str(v: Option<&Value>) -> Option<&str> {
    v.and_then(Value::as_str).filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
