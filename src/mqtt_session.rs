// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Broker-facing message logic, kept apart from the network event loop so
//! that the ordering rules (discovery first on every connection, latest
//! status after it) can be exercised without a broker.

use canonical_error::{CanonicalError, internal_error};
use log::{debug, info};
use serde::Serialize;

use crate::config::MqttConfig;
use crate::detect_engine::DetectionResult;

/// JSON body published to the status topic after each classification.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusPayload {
    pub iscloudy: bool,
    pub skystate: String,
    pub confidence: f64,
    pub roof_status: String,
    pub sun_altitude: f64,
    pub timestamp: String,
}

impl StatusPayload {
    pub fn new(detection: &DetectionResult, roof_status: &str, sun_altitude: f64)
               -> Self {
        StatusPayload{
            iscloudy: detection.is_cloudy,
            skystate: detection.class_name.to_lowercase(),
            confidence: round_to(detection.confidence as f64, 4),
            roof_status: roof_status.to_string(),
            sun_altitude: round_to(sun_altitude, 2),
            timestamp: detection.timestamp.to_rfc3339(),
        }
    }

    // ON means "problem", i.e. clouds.
    fn binary_state(&self) -> &'static str {
        if self.iscloudy { "ON" } else { "OFF" }
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

/// Home Assistant MQTT discovery record for the cloud binary sensor.
#[derive(Debug, Serialize)]
pub struct Discovery {
    pub name: String,
    pub unique_id: String,
    pub device_class: String,
    pub state_topic: String,
    pub payload_on: String,
    pub payload_off: String,
    pub json_attributes_topic: String,
    pub device: Device,
}

#[derive(Clone, Debug, Serialize)]
pub struct Device {
    pub identifiers: Vec<String>,
    pub name: String,
    pub model: String,
    pub manufacturer: String,
    pub sw_version: String,
}

impl Discovery {
    /// Everything here derives from the configured device id and topic, so
    /// re-publishing it on each connection is idempotent for the consumer.
    pub fn new(config: &MqttConfig) -> Self {
        Discovery{
            name: config.device_name.clone(),
            unique_id: format!("{}_clouds", config.device_id),
            device_class: "problem".to_string(),
            state_topic: config.state_topic(),
            payload_on: "ON".to_string(),
            payload_off: "OFF".to_string(),
            json_attributes_topic: config.topic.clone(),
            device: Device{
                identifiers: vec![config.device_id.clone()],
                name: config.device_name.clone(),
                model: "ML Cloud Detector".to_string(),
                manufacturer: "cloud_detect".to_string(),
                sw_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// A single publish request. All messages go out retained at QoS 1.
#[derive(Clone, Debug, PartialEq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

impl MqttMessage {
    fn retained(topic: &str, payload: String) -> Self {
        MqttMessage{topic: topic.to_string(), payload, retain: true}
    }
}

/// Tracks connection state and decides which messages go out when.
pub struct MqttSession {
    topic: String,
    state_topic: String,

    // None when discovery is disabled.
    discovery: Option<MqttMessage>,

    connected: bool,

    // Messages for the most recent status; re-sent after each (re)connect
    // since anything in flight when the link dropped is discarded.
    latest_status: Option<Vec<MqttMessage>>,
}

impl MqttSession {
    pub fn new(config: &MqttConfig) -> Result<Self, CanonicalError> {
        let discovery = if config.ha_discovery {
            let body = serde_json::to_string(&Discovery::new(config)).map_err(|e| {
                internal_error(format!("Cannot encode discovery: {:?}", e).as_str())
            })?;
            Some(MqttMessage::retained(&config.discovery_topic(), body))
        } else {
            None
        };
        Ok(MqttSession{
            topic: config.topic.clone(),
            state_topic: config.state_topic(),
            discovery,
            connected: false,
            latest_status: None,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Called on each ConnAck. Returns discovery (if enabled) followed by the
    /// latest status, if there is one.
    pub fn on_connected(&mut self) -> Vec<MqttMessage> {
        self.connected = true;
        let mut messages = Vec::new();
        if let Some(discovery) = &self.discovery {
            info!("Sending discovery to {}", discovery.topic);
            messages.push(discovery.clone());
        }
        if let Some(status) = &self.latest_status {
            debug!("Re-sending latest status after connect");
            messages.extend(status.iter().cloned());
        }
        messages
    }

    pub fn on_disconnected(&mut self) {
        self.connected = false;
    }

    /// Records `status` as the latest. Returns the messages to publish now;
    /// empty while disconnected, in which case the status is held for the
    /// next connection.
    pub fn on_status(&mut self, status: &StatusPayload)
                     -> Result<Vec<MqttMessage>, CanonicalError> {
        let body = serde_json::to_string(status).map_err(|e| {
            internal_error(format!("Cannot encode status: {:?}", e).as_str())
        })?;
        let messages = vec![
            MqttMessage::retained(&self.topic, body),
            MqttMessage::retained(&self.state_topic, status.binary_state().to_string()),
        ];
        self.latest_status = Some(messages.clone());
        if self.connected {
            Ok(messages)
        } else {
            debug!("Not connected; holding status for next connection");
            Ok(Vec::new())
        }
    }
}

// mod tests.
