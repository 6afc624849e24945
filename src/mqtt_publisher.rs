// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use canonical_error::CanonicalError;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, NetworkOptions,
              Outgoing, Packet, QoS};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};

use crate::config::MqttConfig;
use crate::mqtt_session::{MqttMessage, MqttSession, StatusPayload};

// Pending publish requests between the scheduler and the worker.
const COMMAND_QUEUE_DEPTH: usize = 16;

// Requests buffered between the worker and the rumqttc event loop.
const CLIENT_QUEUE_DEPTH: usize = 10;

enum Command {
    Publish(StatusPayload),
    Close,
}

/// Publishes status payloads to an MQTT broker. A background worker task
/// owns the connection; it reconnects on its own and sends the Home
/// Assistant discovery record at the start of every connection.
pub struct MqttPublisher {
    commands: mpsc::Sender<Command>,
    worker: Option<JoinHandle<()>>,
    close_timeout: Duration,
}

impl MqttPublisher {
    /// Starts the worker and waits (bounded by the connect timeout) for the
    /// first connection attempt. Failing to reach the broker is not an error;
    /// the worker keeps retrying in the background.
    pub async fn connect(config: &MqttConfig) -> Result<Self, CanonicalError> {
        let session = MqttSession::new(config)?;

        let client_id = format!("cloud-detect-{}", config.device_id);
        let mut options = MqttOptions::new(client_id, &config.broker, config.port);
        options.set_keep_alive(Duration::from_secs(60));
        if !config.username.is_empty() {
            options.set_credentials(&config.username, &config.password);
        }
        let (client, mut eventloop) = AsyncClient::new(options, CLIENT_QUEUE_DEPTH);
        let mut network_options = NetworkOptions::new();
        network_options.set_connection_timeout(config.connect_timeout_secs);
        eventloop.set_network_options(network_options);

        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (first_attempt_tx, first_attempt_rx) = oneshot::channel();
        let close_timeout = Duration::from_secs(config.connect_timeout_secs);
        let worker = Worker{
            session,
            client,
            eventloop,
            commands: receiver,
            reconnect_delay: Duration::from_secs(config.reconnect_delay_secs),
            close_timeout,
            first_attempt: Some(first_attempt_tx),
        };
        let handle = tokio::spawn(worker.run());

        info!("Connecting to MQTT broker {}:{}", config.broker, config.port);
        match timeout(close_timeout + Duration::from_secs(1), first_attempt_rx).await {
            Ok(Ok(true)) => info!("Connected to MQTT broker"),
            _ => warn!("MQTT broker {}:{} not reachable; will keep retrying",
                       config.broker, config.port),
        }
        Ok(MqttPublisher{commands, worker: Some(handle), close_timeout})
    }

    /// Queues `status` for publishing. Never blocks; if the worker is
    /// backlogged the payload is dropped.
    pub fn publish(&self, status: StatusPayload) {
        match self.commands.try_send(Command::Publish(status)) {
            Ok(()) => (),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("MQTT publish queue full; dropping status");
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("MQTT worker is gone; dropping status");
            },
        }
    }

    /// Disconnects from the broker and waits for the worker to finish.
    pub async fn close(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        if self.commands.send(Command::Close).await.is_err() {
            debug!("MQTT worker already stopped");
        }
        match timeout(self.close_timeout, worker).await {
            Ok(Ok(())) => info!("MQTT publisher closed"),
            Ok(Err(e)) => error!("MQTT worker failed: {:?}", e),
            Err(_) => warn!("Timed out closing MQTT publisher"),
        }
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

struct Worker {
    session: MqttSession,
    client: AsyncClient,
    eventloop: EventLoop,
    commands: mpsc::Receiver<Command>,
    reconnect_delay: Duration,
    close_timeout: Duration,

    // Reports the outcome of the first connection attempt to connect().
    first_attempt: Option<oneshot::Sender<bool>>,
}

impl Worker {
    async fn run(mut self) {
        // Set while waiting out the reconnect delay.
        let mut retry_at: Option<Instant> = None;
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Publish(status)) => {
                            match self.session.on_status(&status) {
                                Ok(messages) => self.send(messages),
                                Err(e) => error!("Cannot publish status: {:?}", e),
                            }
                        },
                        Some(Command::Close) | None => break,
                    }
                },
                event = self.eventloop.poll(), if retry_at.is_none() => {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!("MQTT connection established");
                            self.report_first_attempt(true);
                            let messages = self.session.on_connected();
                            self.send(messages);
                        },
                        Ok(event) => {
                            debug!("MQTT event {:?}", event);
                        },
                        Err(e) => {
                            if self.session.is_connected() {
                                warn!("MQTT connection lost: {}", e);
                            } else {
                                warn!("MQTT connection failed: {}", e);
                            }
                            self.report_first_attempt(false);
                            self.session.on_disconnected();
                            // Anything queued for the dead connection is
                            // superseded by the session's replay on reconnect,
                            // which must follow discovery.
                            self.eventloop.pending.clear();
                            retry_at = Some(Instant::now() + self.reconnect_delay);
                        },
                    }
                },
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    debug!("Retrying MQTT connection");
                    retry_at = None;
                },
            }
        }
        self.disconnect().await;
    }

    fn report_first_attempt(&mut self, connected: bool) {
        if let Some(sender) = self.first_attempt.take() {
            let _ = sender.send(connected);
        }
    }

    fn send(&self, messages: Vec<MqttMessage>) {
        for message in messages {
            debug!("Publishing to {}: {}", message.topic, message.payload);
            if let Err(e) = self.client.try_publish(&message.topic, QoS::AtLeastOnce,
                                                    message.retain, message.payload) {
                warn!("MQTT publish to {} failed: {:?}", message.topic, e);
            }
        }
    }

    // Sends DISCONNECT and drives the event loop until it has gone out.
    async fn disconnect(&mut self) {
        if !self.session.is_connected() {
            return;
        }
        if let Err(e) = self.client.try_disconnect() {
            warn!("MQTT disconnect failed: {:?}", e);
            return;
        }
        let drain = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => (),
                    Err(e) => {
                        debug!("MQTT event loop ended: {}", e);
                        break;
                    },
                }
            }
        };
        if timeout(self.close_timeout, drain).await.is_err() {
            warn!("Timed out disconnecting from MQTT broker");
        }
        self.session.on_disconnected();
        info!("Disconnected from MQTT broker");
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use chrono::Utc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use crate::detect_engine::DetectionResult;
    use super::*;

    fn status(is_cloudy: bool) -> StatusPayload {
        let detection = DetectionResult{
            is_cloudy,
            class_name: if is_cloudy { "Cloudy" } else { "Clear" }.to_string(),
            confidence: 0.75,
            image_path: PathBuf::from("frame.jpg"),
            timestamp: Utc::now(),
            processing_duration: Duration::from_millis(5),
        };
        let roof_status = if is_cloudy { "Roof Closed" } else { "Roof Open" };
        StatusPayload::new(&detection, roof_status, -30.0)
    }

    // Reads one MQTT control packet; returns its first header byte and body.
    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut length = 0_usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            length |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; length];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    // Bare-bones MQTT 3.1.1 broker serving one connection at a time. Every
    // PUBLISH is reported as (connection number, topic, payload). The first
    // connection is dropped after `drop_after` publishes. Returns when a
    // client sends DISCONNECT.
    async fn run_broker(listener: TcpListener,
                        received: mpsc::UnboundedSender<(usize, String, String)>,
                        drop_after: usize) {
        for connection in 0_usize.. {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut publishes = 0;
            while let Ok((header, body)) = read_packet(&mut stream).await {
                let reply = match header >> 4 {
                    // CONNECT; accept it.
                    1 => vec![0x20, 2, 0, 0],
                    // PUBLISH; QoS 1 carries a packet id to acknowledge.
                    3 => {
                        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                        let topic = String::from_utf8_lossy(&body[2..2 + topic_len]);
                        let mut offset = 2 + topic_len;
                        let mut puback = Vec::new();
                        if (header >> 1) & 3 == 1 {
                            puback = vec![0x40, 2, body[offset], body[offset + 1]];
                            offset += 2;
                        }
                        let payload = String::from_utf8_lossy(&body[offset..]);
                        let _ = received.send(
                            (connection, topic.to_string(), payload.to_string()));
                        publishes += 1;
                        puback
                    },
                    // PINGREQ.
                    12 => vec![0xd0, 0],
                    // DISCONNECT.
                    14 => return,
                    _ => Vec::new(),
                };
                if stream.write_all(&reply).await.is_err() {
                    break;
                }
                if connection == 0 && publishes == drop_after {
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_not_fatal() {
        // Nothing listens on port 1; connecting is refused immediately.
        let config = MqttConfig{enabled: true,
                                broker: "127.0.0.1".to_string(),
                                port: 1,
                                connect_timeout_secs: 2,
                                reconnect_delay_secs: 1,
                                ..Default::default()};
        let mut publisher = MqttPublisher::connect(&config).await.unwrap();
        for _ in 0..COMMAND_QUEUE_DEPTH * 2 {
            publisher.publish(status(false));
        }
        publisher.close().await;
        assert!(publisher.worker.is_none());
        // Closing twice is harmless.
        publisher.close().await;
    }

    #[tokio::test]
    async fn test_reconnect_sends_discovery_first() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (received_tx, mut received) = mpsc::unbounded_channel();
        // Hang up after discovery plus one status (JSON and ON/OFF topics).
        let broker = tokio::spawn(run_broker(listener, received_tx, 3));

        let config = MqttConfig{enabled: true,
                                broker: "127.0.0.1".to_string(),
                                port,
                                device_id: "obs1".to_string(),
                                connect_timeout_secs: 2,
                                reconnect_delay_secs: 1,
                                ..Default::default()};
        let discovery_topic = "homeassistant/binary_sensor/obs1/config";
        let mut publisher = MqttPublisher::connect(&config).await.unwrap();
        publisher.publish(status(true));

        let mut connections: Vec<Vec<(String, String)>> = vec![Vec::new(), Vec::new()];
        while connections[0].len() < 3 {
            let (connection, topic, payload) =
                timeout(Duration::from_secs(10), received.recv()).await.unwrap().unwrap();
            assert_eq!(connection, 0);
            connections[0].push((topic, payload));
        }

        // The broker is gone or going; this status has to arrive on the
        // next connection.
        publisher.publish(status(false));
        let clear_received = |messages: &Vec<(String, String)>| {
            messages.last().map_or(false, |(topic, payload)| {
                topic == "observatory/clouds/state" && payload == "OFF"
            })
        };
        while !clear_received(&connections[1]) {
            let (connection, topic, payload) =
                timeout(Duration::from_secs(10), received.recv()).await.unwrap().unwrap();
            assert_eq!(connection, 1);
            connections[1].push((topic, payload));
        }

        publisher.close().await;
        timeout(Duration::from_secs(5), broker).await.unwrap().unwrap();
        // Anything sent after the clear status but before DISCONNECT.
        while let Some((connection, topic, payload)) = received.recv().await {
            connections[connection].push((topic, payload));
        }

        let topics = |messages: &Vec<(String, String)>| -> Vec<String> {
            messages.iter().map(|(topic, _)| topic.clone()).collect()
        };
        assert_eq!(topics(&connections[0]),
                   [discovery_topic, "observatory/clouds", "observatory/clouds/state"]);
        assert_eq!(connections[0][2].1, "ON");

        // Discovery opens the new connection, exactly once, before any
        // status; the connection ends on the clear status.
        let second = topics(&connections[1]);
        assert_eq!(second[0], discovery_topic);
        assert_eq!(second.iter().filter(|topic| *topic == discovery_topic).count(), 1);
        assert!(second[1..].iter().all(|topic| topic.starts_with("observatory/clouds")));
        assert!(clear_received(&connections[1]));
        assert!(connections[1][1].1.contains("\"iscloudy\""));
    }

}  // mod tests.
