//! Frame codec for the realtime stream protocol
//!
//! One transport message carries exactly one JSON document. Inbound
//! documents decode into a [`Frame`]; outbound traffic is limited to the
//! [`ControlFrame`] shapes the server understands.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::CodecError;

// ============================================================================
// Client -> Server Frames
// ============================================================================

/// Control frames sent from client to server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Start receiving a topic
    Subscribe { topic: String },
    /// Stop receiving a topic
    Unsubscribe { topic: String },
    /// Keep-alive, epoch milliseconds
    Ping { timestamp: i64 },
}

impl ControlFrame {
    pub fn subscribe(topic: impl Into<String>) -> Self {
        Self::Subscribe {
            topic: topic.into(),
        }
    }

    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        Self::Unsubscribe {
            topic: topic.into(),
        }
    }

    /// Ping stamped with the current wall-clock time
    pub fn ping() -> Self {
        Self::Ping {
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Serialize to the single JSON document sent on the wire
    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Server -> Client Frames
// ============================================================================

/// Decoded inbound frame
///
/// The payload is opaque to the client. Fields other than the four known
/// ones are kept in `extra` so handlers see the whole document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Epoch milliseconds when the server supplied a usable timestamp
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Frame {
    /// Frame with only a type, mostly useful in tests
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            topic: None,
            data: None,
            timestamp: None,
            extra: Map::new(),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Decode a text transport message
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_str(text)?;

        match value.get("type") {
            Some(Value::String(_)) => {}
            _ => return Err(CodecError::MissingType),
        }

        Ok(serde_json::from_value(value)?)
    }

    /// Decode a binary transport message carrying UTF-8 JSON
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let text = std::str::from_utf8(bytes).map_err(|_| CodecError::NotText)?;
        Self::decode(text)
    }

    /// The key this frame is routed under for the given discriminator
    pub fn dispatch_key(&self, key: DispatchKey) -> &str {
        match key {
            DispatchKey::Type => &self.kind,
            DispatchKey::Topic => self.topic.as_deref().unwrap_or(&self.kind),
        }
    }
}

/// Which frame field handlers are keyed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchKey {
    /// Route by `type`
    #[default]
    Type,
    /// Route by `topic`, falling back to `type` when the frame has no topic
    Topic,
}

impl std::str::FromStr for DispatchKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "type" => Ok(DispatchKey::Type),
            "topic" => Ok(DispatchKey::Topic),
            _ => Err(format!("Unknown dispatch key: {}", s)),
        }
    }
}

/// Naive ISO 8601 shape produced by the dashboard server, read as UTC
const NAIVE_ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Accept numbers, numeric strings, RFC 3339 and naive ISO strings; drop anything else
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;

    Ok(match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.parse::<f64>().ok().or_else(|| {
            DateTime::parse_from_rfc3339(&s)
                .map(|ts| ts.timestamp_millis())
                .or_else(|_| {
                    NaiveDateTime::parse_from_str(&s, NAIVE_ISO_FORMAT)
                        .map(|ts| ts.and_utc().timestamp_millis())
                })
                .ok()
                .map(|millis| millis as f64)
        }),
        _ => None,
    })
}
