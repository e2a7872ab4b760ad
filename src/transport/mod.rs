//! MQTT side of the bridge.
//!
//! `Publisher` is the seam the registry and router publish through. The
//! broker-backed implementation wraps a rumqttc v5 client; tests use
//! `RecordingPublisher`.

mod tls;

pub use tls::{parse_mqtt_endpoint, MqttEndpoint, TlsMaterials};

use anyhow::{anyhow, Result};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use rumqttc::Outgoing;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::topics::{BRIDGE_STATE_TOPIC, COMMAND_SUBSCRIPTION, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()>;
}

/// Publishes with QoS 1 through a rumqttc client.
///
/// Never waits on the request channel. While the broker is unreachable the
/// event loop stops draining it, so a full channel fails the publish instead
/// of stalling the caller.
#[derive(Clone)]
pub struct MqttPublisher {
    client: Client,
}

impl MqttPublisher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl Publisher for MqttPublisher {
    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .map_err(|e| anyhow!("MQTT publish to {} not queued: {}", topic, e))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// In-memory publisher that keeps every message in order.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<PublishedMessage>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.clear();
        }
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        let mut messages = self
            .messages
            .lock()
            .map_err(|_| anyhow::anyhow!("recording publisher poisoned"))?;
        messages.push(PublishedMessage {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            retain,
        });
        Ok(())
    }
}

/// Broker session settings.
#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub endpoint: MqttEndpoint,
    pub tls: TlsMaterials,
    pub client_id: String,
    pub username: String,
    pub password: String,
}

/// Create the client with the bridge's last will registered.
pub fn connect_mqtt(settings: &MqttSettings) -> Result<(Client, Connection)> {
    let endpoint = &settings.endpoint;
    let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
    options.set_keep_alive(Duration::from_secs(60));
    options.set_clean_start(true);
    options.set_credentials(&settings.username, &settings.password);
    let will = LastWill::new(
        BRIDGE_STATE_TOPIC,
        PAYLOAD_OFFLINE.as_bytes().to_vec(),
        QoS::AtLeastOnce,
        true,
        None,
    );
    options.set_last_will(will);
    options.set_transport(settings.tls.build_transport(endpoint)?);

    let (client, connection) = Client::new(options, 64);
    log::info!(
        "Connecting to MQTT server {}:{} (TLS: {}) as '{}'",
        endpoint.host,
        endpoint.port,
        endpoint.use_tls,
        settings.username
    );
    Ok((client, connection))
}

/// Drives the connection until the client disconnects, or until a
/// connection error occurs after `shutdown` is set.
///
/// On every ConnAck the command subscription is re-issued and the bridge is
/// announced online; incoming publishes are handed to `on_message`.
pub fn run_event_loop<F>(
    client: &Client,
    mut connection: Connection,
    shutdown: Arc<AtomicBool>,
    mut on_message: F,
) where
    F: FnMut(&str, &[u8]),
{
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                log::info!("Connected to MQTT server");
                if let Err(e) = client.try_subscribe(COMMAND_SUBSCRIPTION, QoS::AtLeastOnce) {
                    log::warn!("Failed to subscribe to {}: {}", COMMAND_SUBSCRIPTION, e);
                }
                if let Err(e) = client.try_publish(
                    BRIDGE_STATE_TOPIC,
                    QoS::AtLeastOnce,
                    true,
                    PAYLOAD_ONLINE.as_bytes().to_vec(),
                ) {
                    log::warn!("Failed to publish bridge state: {}", e);
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let topic = match std::str::from_utf8(&publish.topic) {
                    Ok(topic) => topic,
                    Err(e) => {
                        log::warn!("Skipping publish with invalid topic: {}", e);
                        continue;
                    }
                };
                on_message(topic, &publish.payload);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                log::error!("MQTT connection error: {}. Reconnecting...", e);
                std::thread::sleep(RECONNECT_DELAY);
            }
        }
    }
    log::debug!("MQTT event loop stopped");
}
