use chrono::{DateTime, Utc};
use rumqttc::Publish;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::Utf8Error;
use thiserror::Error;

use crate::simulator::{HeaterCommand, Reading};

const PREVIEW_CHARS: usize = 32;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Payload on {topic} is not valid UTF-8: {source}")]
    NotUtf8 { topic: String, source: Utf8Error },

    #[error("Failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode reading: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Copy of an inbound PUBLISH, detached from the event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = String::from_utf8_lossy(&self.payload);
        let preview: String = text.chars().take(PREVIEW_CHARS).collect();
        if text.chars().count() > PREVIEW_CHARS {
            write!(f, "{} - {}: {}...", self.received_at, self.topic, preview)
        } else {
            write!(f, "{} - {}: {}", self.received_at, self.topic, preview)
        }
    }
}

impl InboundMessage {
    pub fn from_publish(publish: &Publish) -> Self {
        InboundMessage {
            topic: publish.topic.clone(),
            payload: publish.payload.to_vec(),
            received_at: Utc::now(),
        }
    }

    pub fn text(&self) -> Result<&str, PayloadError> {
        std::str::from_utf8(&self.payload).map_err(|source| PayloadError::NotUtf8 {
            topic: self.topic.clone(),
            source,
        })
    }

    pub fn heater_command(&self) -> Result<HeaterCommand, PayloadError> {
        self.text().map(HeaterCommand::from_payload)
    }
}

/// `{"timestamp": "...", "temperature": 21.7, "unit": "Celsius"}`
pub fn encode_reading(reading: &Reading) -> Result<Vec<u8>, PayloadError> {
    serde_json::to_vec(reading).map_err(PayloadError::Encode)
}

pub fn decode_reading(payload: &[u8]) -> Result<Reading, PayloadError> {
    serde_json::from_slice(payload).map_err(PayloadError::Decode)
}

/// Status report for the status topic
///
/// `{"temperature": 21.7, "heaterOn": false, "timestamp": 1709296200000}`, the
/// timestamp in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub temperature: f64,
    pub heater_on: bool,
    pub timestamp: i64,
}

impl SystemStatus {
    pub fn new(reading: &Reading, heater_on: bool) -> Self {
        Self {
            temperature: reading.temperature,
            heater_on,
            timestamp: reading.timestamp.timestamp_millis(),
        }
    }
}

pub fn encode_status(status: &SystemStatus) -> Result<Vec<u8>, PayloadError> {
    serde_json::to_vec(status).map_err(PayloadError::Encode)
}
