// Copyright 2026 ble2mqtt contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Payload classification and forwarding.
//!
//! Inbound payloads carry no type header; the only discriminator is the
//! decoded text itself. Classification is a best-effort heuristic with a
//! fixed precedence, and the same text always classifies the same way.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::bluetooth::transport::SubChannel;
use crate::cloud::PublishTransport;
use crate::error::GatewayError;
use crate::metrics::MetricsAggregator;
use crate::state::GatewayState;

/// Classification tag assigned to every inbound payload at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    SensorReading,
    CommandResponse,
    StatusUpdate,
    Unknown,
}

/// Classify decoded payload text.
///
/// Precedence: sensor formats first (compact temperature encoding,
/// embedded decimal numbers, domain keywords), then command ack/error
/// prefixes, then connection-state keywords. First match wins.
pub fn classify(text: &str) -> Classification {
    if parse_temperature(text).is_some()
        || contains_decimal_number(text)
        || text.contains("temperature")
        || text.contains("humidity")
    {
        Classification::SensorReading
    } else if text.starts_with("OK") || text.starts_with("ERROR") {
        Classification::CommandResponse
    } else if text.contains("status") || text.contains("connected") || text.contains("disconnected")
    {
        Classification::StatusUpdate
    } else {
        Classification::Unknown
    }
}

/// Parse the compact temperature encoding `T<sample>:<value>C`,
/// e.g. `"T1:23.5C"` -> `(1, 23.5)`.
pub fn parse_temperature(text: &str) -> Option<(u32, f64)> {
    let rest = text.strip_prefix('T')?;
    let (sample, value) = rest.split_once(':')?;
    if sample.is_empty() || !sample.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value = value.strip_suffix('C')?;
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        return None;
    }
    Some((sample.parse().ok()?, value.parse().ok()?))
}

/// True when the text embeds a decimal number such as `23.5`.
fn contains_decimal_number(text: &str) -> bool {
    text.as_bytes()
        .windows(3)
        .any(|w| w[0].is_ascii_digit() && w[1] == b'.' && w[2].is_ascii_digit())
}

/// An inbound notification decoded and classified at receipt.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub identity: String,
    pub display_name: Option<String>,
    pub channel: SubChannel,
    pub payload: Vec<u8>,
    pub text: String,
    pub received_at: DateTime<Utc>,
    pub classification: Classification,
}

impl InboundMessage {
    pub fn new(
        identity: &str,
        display_name: Option<String>,
        channel: SubChannel,
        payload: Vec<u8>,
    ) -> Self {
        let text = String::from_utf8_lossy(&payload).into_owned();
        let classification = classify(&text);
        Self {
            identity: identity.to_string(),
            display_name,
            channel,
            payload,
            text,
            received_at: Utc::now(),
            classification,
        }
    }
}

/// The structured record published to the broker.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    pub device: String,
    #[serde(rename = "deviceName")]
    pub device_name: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub body: MessageBody,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum MessageBody {
    #[serde(rename = "temperature")]
    Temperature {
        #[serde(rename = "sampleNumber")]
        sample_number: u32,
        temperature: f64,
        unit: String,
        #[serde(rename = "rawData")]
        raw_data: String,
    },
    #[serde(rename = "sensor_data")]
    SensorData {
        data: String,
        #[serde(rename = "dataLength")]
        data_length: usize,
    },
    #[serde(rename = "status")]
    Status { data: String },
    #[serde(rename = "response")]
    Response { data: String },
}

impl OutboundMessage {
    /// Build the outbound record for an inbound message. The timestamp is
    /// taken here, at construction, not at receipt.
    pub fn from_inbound(inbound: &InboundMessage) -> Self {
        let body = match inbound.classification {
            Classification::SensorReading => match parse_temperature(&inbound.text) {
                Some((sample_number, temperature)) => MessageBody::Temperature {
                    sample_number,
                    temperature,
                    unit: "C".to_string(),
                    raw_data: inbound.text.clone(),
                },
                None => MessageBody::SensorData {
                    data: inbound.text.clone(),
                    data_length: inbound.payload.len(),
                },
            },
            Classification::StatusUpdate => MessageBody::Status {
                data: inbound.text.clone(),
            },
            Classification::CommandResponse => MessageBody::Response {
                data: inbound.text.clone(),
            },
            Classification::Unknown => MessageBody::SensorData {
                data: inbound.text.clone(),
                data_length: inbound.payload.len(),
            },
        };

        Self {
            device: inbound.identity.clone(),
            device_name: inbound
                .display_name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "Unknown".to_string()),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            body,
        }
    }
}

/// Destination topic: a pure function of identity and classification.
pub fn topic_for(identity: &str, classification: Classification) -> String {
    let id = identity.replace(':', "");
    let suffix = match classification {
        Classification::SensorReading | Classification::Unknown => "data",
        Classification::StatusUpdate => "status",
        Classification::CommandResponse => "response",
    };
    format!("devices/{id}/{suffix}")
}

/// Forwards classified inbound messages to the publish transport,
/// feeding the metrics aggregator and the status surface.
pub struct DataBridge {
    publisher: Arc<dyn PublishTransport>,
    metrics: Arc<MetricsAggregator>,
    state: Arc<GatewayState>,
}

impl DataBridge {
    pub fn new(
        publisher: Arc<dyn PublishTransport>,
        metrics: Arc<MetricsAggregator>,
        state: Arc<GatewayState>,
    ) -> Self {
        Self {
            publisher,
            metrics,
            state,
        }
    }

    /// Classify-and-publish for one inbound message. At-most-once: a
    /// failure drops the message and is recorded, never retried.
    pub async fn forward(&self, inbound: &InboundMessage) -> Result<(), GatewayError> {
        let outbound = OutboundMessage::from_inbound(inbound);
        let topic = topic_for(&inbound.identity, inbound.classification);
        let payload = match serde_json::to_vec(&outbound) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode outbound message: {}", e);
                self.state.record_publish(false);
                return Err(GatewayError::PublishFailed { topic });
            }
        };

        debug!(
            "Forwarding {:?} from {} to {}",
            inbound.classification, inbound.identity, topic
        );

        self.metrics.record_publish_start();
        let success = self.publisher.publish(&topic, &payload).await;
        self.metrics.record_publish_complete(success);
        self.state.record_publish(success);

        if success {
            Ok(())
        } else {
            warn!("Dropped message for {}: publish failed", topic);
            Err(GatewayError::PublishFailed { topic })
        }
    }
}
