//! Device registry.
//!
//! A device is identified by `lowercase(model ++ serial)`. The first poll
//! from a new identity publishes its Home Assistant discovery configs and
//! marks it online; later polls only look the record up. Commands arriving
//! over MQTT are translated into pending writes on the record and leave
//! with the next response envelope.

pub mod discovery;
pub mod setters;

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::protocol::{encode, CommandSet};
use crate::topics::{availability_topic, parse_command_topic, BRIDGE_STATE_TOPIC, PAYLOAD_ONLINE};
use crate::transport::Publisher;

pub use setters::{translate_command, PendingWrite, SetterQueue};

/// Only this model reports the leakage protection block (valve, temperature).
pub const LEAKAGE_PROTECTION_MODEL: &str = "LEXplus10SL";

pub fn device_id(model: &str, serial: &str) -> String {
    format!("{model}{serial}").to_lowercase()
}

pub fn has_leakage_protection(model: &str) -> bool {
    model == LEAKAGE_PROTECTION_MODEL
}

#[derive(Debug)]
pub struct DeviceRecord {
    id: String,
    pub model: String,
    pub serial: String,
    pub sw_version: String,
    pub base_url: String,
    pub has_leakage_protection: bool,
    setters: Mutex<SetterQueue>,
}

impl DeviceRecord {
    pub fn new(model: &str, serial: &str, sw_version: &str, base_url: &str) -> Self {
        Self {
            id: device_id(model, serial),
            model: model.to_string(),
            serial: serial.to_string(),
            sw_version: sw_version.to_string(),
            base_url: base_url.to_string(),
            has_leakage_protection: has_leakage_protection(model),
            setters: Mutex::new(SetterQueue::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn enqueue(&self, writes: Vec<PendingWrite>) -> Result<()> {
        let mut queue = self
            .setters
            .lock()
            .map_err(|_| anyhow!("setter queue poisoned for {}", self.id))?;
        for write in writes {
            queue.push(write);
        }
        Ok(())
    }

    pub fn drain(&self) -> Result<Vec<PendingWrite>> {
        let mut queue = self
            .setters
            .lock()
            .map_err(|_| anyhow!("setter queue poisoned for {}", self.id))?;
        Ok(queue.drain())
    }

    pub fn pending_len(&self) -> usize {
        self.setters.lock().map(|q| q.len()).unwrap_or(0)
    }
}

/// Every device seen since startup.
pub struct DeviceRegistry {
    publisher: Arc<dyn Publisher>,
    commands: CommandSet,
    devices: Mutex<HashMap<String, Arc<DeviceRecord>>>,
}

impl DeviceRegistry {
    pub fn new(publisher: Arc<dyn Publisher>, commands: CommandSet) -> Self {
        Self {
            publisher,
            commands,
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub fn commands(&self) -> &CommandSet {
        &self.commands
    }

    pub fn publisher(&self) -> &dyn Publisher {
        self.publisher.as_ref()
    }

    /// Looks up the device, creating and announcing it on first contact.
    ///
    /// The map lock is held while discovery is published, so a concurrent
    /// poll for the same identity never sees a record whose discovery has
    /// not gone out. Publishers therefore must not wait on the broker. A
    /// failed publish leaves the identity unknown and the next poll tries
    /// again.
    pub fn get_or_create(
        &self,
        model: &str,
        serial: &str,
        sw_version: &str,
        base_url: &str,
    ) -> Result<Arc<DeviceRecord>> {
        let id = device_id(model, serial);
        let mut devices = self
            .devices
            .lock()
            .map_err(|_| anyhow!("device registry poisoned"))?;
        if let Some(device) = devices.get(&id) {
            return Ok(Arc::clone(device));
        }

        let device = Arc::new(DeviceRecord::new(model, serial, sw_version, base_url));
        log::info!(
            "New device {} (model {}, serial {}, sw {}, leakage protection: {})",
            device.id(),
            device.model,
            device.serial,
            device.sw_version,
            device.has_leakage_protection
        );
        discovery::publish_discovery(
            self.publisher.as_ref(),
            &device,
            self.commands.extra_properties(),
        )?;
        self.publisher.publish(
            &availability_topic(device.id()),
            PAYLOAD_ONLINE.as_bytes(),
            true,
        )?;
        self.publisher
            .publish(BRIDGE_STATE_TOPIC, PAYLOAD_ONLINE.as_bytes(), true)?;

        devices.insert(id, Arc::clone(&device));
        Ok(device)
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceRecord>> {
        self.devices
            .lock()
            .ok()
            .and_then(|devices| devices.get(device_id).cloned())
    }

    pub fn len(&self) -> usize {
        self.devices.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues the writes for a Home Assistant command.
    ///
    /// Returns false when the device or field is unknown or the payload is
    /// not accepted; those commands are dropped without error.
    pub fn enqueue(&self, device_id: &str, field: &str, payload: &str) -> bool {
        let Some(device) = self.get(device_id) else {
            log::debug!("Ignoring command for unknown device {}", device_id);
            return false;
        };
        let Some(writes) = translate_command(field, payload) else {
            log::debug!(
                "Ignoring command {}={:?} for {}",
                field,
                payload,
                device_id
            );
            return false;
        };
        match device.enqueue(writes) {
            Ok(()) => {
                log::info!("Queued {}={:?} for {}", field, payload, device_id);
                true
            }
            Err(e) => {
                log::warn!("Failed to queue command for {}: {}", device_id, e);
                false
            }
        }
    }

    /// Entry point for messages received on the `syr/#` subscription.
    pub fn handle_command(&self, topic: &str, payload: &[u8]) -> bool {
        let Some((device_id, field)) = parse_command_topic(topic) else {
            return false;
        };
        let payload = String::from_utf8_lossy(payload);
        self.enqueue(device_id, field, payload.trim())
    }

    /// Builds the reconciled response envelope for `device`, consuming its
    /// pending writes.
    pub fn response_envelope(&self, device: &DeviceRecord) -> Result<String> {
        let pending = device.drain()?;
        if !pending.is_empty() {
            log::info!(
                "Sending {} pending write(s) to {}",
                pending.len(),
                device.id()
            );
        }
        Ok(encode(&setters::response_entries(&self.commands, pending)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RecordingPublisher;

    fn registry() -> (Arc<RecordingPublisher>, DeviceRegistry) {
        let publisher = Arc::new(RecordingPublisher::new());
        let registry = DeviceRegistry::new(publisher.clone(), CommandSet::default());
        (publisher, registry)
    }

    #[test]
    fn device_id_is_lowercase_concatenation() {
        assert_eq!(device_id("LEXplus10SL", "12345"), "lexplus10sl12345");
        assert!(has_leakage_protection("LEXplus10SL"));
        assert!(!has_leakage_protection("LEXplus10sl"));
        assert!(!has_leakage_protection("LEXplus10"));
    }

    #[test]
    fn first_contact_publishes_discovery_then_availability() {
        let (publisher, registry) = registry();
        let device = registry
            .get_or_create("LEXplus10", "1", "1.0", "http://10.0.0.2")
            .unwrap();
        assert!(!device.has_leakage_protection);

        let messages = publisher.messages();
        assert_eq!(messages.len(), 14 + 2);
        assert!(messages.iter().all(|m| m.retain));
        assert!(messages[..14]
            .iter()
            .all(|m| m.topic.starts_with("homeassistant/")));
        assert_eq!(messages[14].topic, "syr/lexplus101/availability");
        assert_eq!(messages[14].payload, "online");
        assert_eq!(messages[15].topic, "syr/syrlex2mqtt/state");
    }

    #[test]
    fn second_contact_is_pure_lookup() {
        let (publisher, registry) = registry();
        let first = registry.get_or_create("LEXplus10", "1", "1.0", "u").unwrap();
        publisher.clear();
        let second = registry.get_or_create("LEXplus10", "1", "2.0", "v").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.sw_version, "1.0");
        assert!(publisher.messages().is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn commands_for_unknown_targets_are_ignored() {
        let (_, registry) = registry();
        assert!(!registry.handle_command("syr/nobody/set_valve", b"OPEN"));
        registry.get_or_create("LEXplus10", "1", "1.0", "u").unwrap();
        assert!(!registry.handle_command("syr/lexplus101/set_bogus", b"1"));
        assert!(!registry.handle_command("syr/lexplus101/state", b"{}"));
        assert!(registry.handle_command("syr/lexplus101/set_salt_in_stock", b"10"));
        assert_eq!(registry.get("lexplus101").unwrap().pending_len(), 1);
    }

    #[test]
    fn response_envelope_consumes_pending_writes() {
        let (_, registry) = registry();
        let device = registry.get_or_create("LEXplus10", "1", "1.0", "u").unwrap();
        assert!(registry.enqueue("lexplus101", "regeneration_interval", "4"));

        let first = registry.response_envelope(&device).unwrap();
        assert!(first.contains(r#"<c n="setRPD" v="4"/>"#));
        assert!(!first.contains(r#"<c n="getRPD" v=""/>"#));

        let second = registry.response_envelope(&device).unwrap();
        assert!(!second.contains("setRPD"));
        assert!(second.contains(r#"<c n="getRPD" v=""/>"#));
    }
}
