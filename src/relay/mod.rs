//! Uplink relay
//!
//! Turns LoRa Server uplink records into raw payloads on the platform broker.
//! Each record is a JSON object whose `Data` field carries the device payload
//! as standard base64; everything else in the record is ignored. The field
//! name is matched without regard to ASCII case, an exact `Data` key winning
//! over variants such as `data`.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::adapter::{MessageHandler, RelayTarget};
use crate::metrics::Metrics;
use crate::topic::UplinkTopic;


/// The part of an uplink record the relay cares about
#[derive(Debug, Clone)]
pub struct UplinkMessage {
    pub data: String,
}

const DATA_FIELD: &str = "Data";

impl<'de> Deserialize<'de> for UplinkMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut record = Map::<String, Value>::deserialize(deserializer)?;

        let key = if record.contains_key(DATA_FIELD) {
            DATA_FIELD.to_string()
        } else {
            record
                .keys()
                .find(|k| k.eq_ignore_ascii_case(DATA_FIELD))
                .cloned()
                .ok_or_else(|| <D::Error as de::Error>::missing_field(DATA_FIELD))?
        };

        match record.remove(&key) {
            Some(Value::String(data)) => Ok(UplinkMessage { data }),
            // null leaves the payload empty
            Some(Value::Null) => Ok(UplinkMessage {
                data: String::new(),
            }),
            Some(other) => Err(de::Error::invalid_type(
                unexpected(&other),
                &"a base64 string",
            )),
            None => Err(de::Error::missing_field(DATA_FIELD)),
        }
    }
}

fn unexpected(value: &Value) -> de::Unexpected<'_> {
    match value {
        Value::Bool(b) => de::Unexpected::Bool(*b),
        Value::Number(_) => de::Unexpected::Other("number"),
        Value::Array(_) => de::Unexpected::Seq,
        Value::Object(_) => de::Unexpected::Map,
        Value::String(s) => de::Unexpected::Str(s),
        Value::Null => de::Unexpected::Unit,
    }
}

/// Why an uplink could not be turned into a payload
#[derive(Debug)]
pub enum DecodeError {
    Json(serde_json::Error),
    Base64(base64::DecodeError),
}

impl DecodeError {
    /// Label used for the drop counter
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::Json(_) => "parse",
            DecodeError::Base64(_) => "decode",
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Json(e) => write!(f, "Failed to parse uplink: {}", e),
            DecodeError::Base64(e) => write!(f, "Failed to decode Data: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        DecodeError::Json(e)
    }
}

impl From<base64::DecodeError> for DecodeError {
    fn from(e: base64::DecodeError) -> Self {
        DecodeError::Base64(e)
    }
}

/// Extract and decode the `Data` payload of an uplink record
pub fn decode_uplink(payload: &[u8]) -> Result<Bytes, DecodeError> {
    let message: UplinkMessage = serde_json::from_slice(payload)?;
    let data = STANDARD.decode(message.data.as_bytes())?;
    Ok(Bytes::from(data))
}

/// Handler installed on the source session
pub struct Relay {
    target: Arc<dyn RelayTarget>,
    topic: String,
    metrics: Arc<Metrics>,
}

impl Relay {
    pub fn new(
        target: Arc<dyn RelayTarget>,
        topic: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            target,
            topic: topic.into(),
            metrics,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl MessageHandler for Relay {
    async fn handle(&self, topic: &str, payload: Bytes) {
        let started = Instant::now();
        self.metrics.uplink_received();

        let (application, node) = UplinkTopic::parse(topic)
            .map(|t| (t.application, t.node))
            .unwrap_or(("?", "?"));

        let data = match decode_uplink(&payload) {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    "Uplink from application {} node {} dropped: {}",
                    application, node, e
                );
                self.metrics.uplink_dropped(e.reason());
                return;
            }
        };

        let len = data.len();
        match self.target.publish(&self.topic, data).await {
            Ok(()) => {
                debug!(
                    "Relayed {} bytes from application {} node {} to {}",
                    len, application, node, self.topic
                );
                self.metrics.uplink_relayed(len, started.elapsed());
            }
            Err(e) => {
                warn!(
                    "Relay of uplink from application {} node {} failed: {}",
                    application, node, e
                );
                self.metrics.uplink_dropped("publish");
            }
        }
    }
}
