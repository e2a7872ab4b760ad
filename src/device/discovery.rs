//! Home Assistant MQTT discovery for a water softener.
//!
//! One retained config message per entity under
//! `homeassistant/<component>/syr_watersoftening/<id>_<field>/config`.
//! Entities read their state out of the shared JSON state topic through a
//! value template and go unavailable with either the device or the bridge.

use anyhow::Result;
use serde::Serialize;

use super::DeviceRecord;
use crate::protocol::weekdays;
use crate::topics::{
    availability_topic, command_topic, discovery_topic, state_topic, BRIDGE_STATE_TOPIC,
};
use crate::transport::Publisher;

const MANUFACTURER: &str = "Syr";
const DEFAULT_ICON: &str = "mdi:water";
pub const REGENERATION_TIME_PATTERN: &str = r"\d?\d:\d\d";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Component {
    Sensor,
    BinarySensor,
    Button,
    Number,
    Select,
    Text,
    Valve,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sensor => "sensor",
            Self::BinarySensor => "binary_sensor",
            Self::Button => "button",
            Self::Number => "number",
            Self::Select => "select",
            Self::Text => "text",
            Self::Valve => "valve",
        }
    }

    /// Buttons are write-only; everything else reads the state topic.
    fn has_state(&self) -> bool {
        !matches!(self, Self::Button)
    }

    fn has_command(&self) -> bool {
        matches!(
            self,
            Self::Button | Self::Number | Self::Select | Self::Text | Self::Valve
        )
    }

    fn mode(&self) -> Option<&'static str> {
        match self {
            Self::Number => Some("box"),
            Self::Text => Some("text"),
            _ => None,
        }
    }
}

/// Static description of one entity.
#[derive(Clone, Debug, PartialEq)]
pub struct Entity {
    pub component: Component,
    pub field: String,
    pub name: String,
    pub device_class: Option<&'static str>,
    pub entity_category: Option<&'static str>,
    pub unit: Option<&'static str>,
    pub icon: Option<&'static str>,
    pub range: Option<(i32, i32)>,
    pub options: Option<Vec<String>>,
    pub pattern: Option<&'static str>,
}

impl Entity {
    fn new(component: Component, field: &str, name: &str) -> Self {
        Self {
            component,
            field: field.to_string(),
            name: name.to_string(),
            device_class: None,
            entity_category: None,
            unit: None,
            icon: None,
            range: None,
            options: None,
            pattern: None,
        }
    }

    fn class(mut self, device_class: &'static str) -> Self {
        self.device_class = Some(device_class);
        self
    }

    fn category(mut self, category: &'static str) -> Self {
        self.entity_category = Some(category);
        self
    }

    fn unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    fn icon(mut self, icon: &'static str) -> Self {
        self.icon = Some(icon);
        self
    }

    fn range(mut self, min: i32, max: i32) -> Self {
        self.range = Some((min, max));
        self
    }
}

/// Every entity a device exposes, in publication order.
pub fn entities(has_leakage_protection: bool, extra_properties: &[String]) -> Vec<Entity> {
    use Component::{BinarySensor, Button, Number, Select, Sensor, Text, Valve};

    let mut out = vec![
        Entity::new(Sensor, "current_water_flow", "Current Water Flow")
            .unit("l/min")
            .icon("mdi:water"),
        Entity::new(Sensor, "salt_remaining", "Salt Remaining")
            .unit("weeks")
            .icon("mdi:cup"),
        Entity::new(Sensor, "remaining_resin_capacity", "Remaining Resin Capacity")
            .category("diagnostic")
            .unit("%")
            .icon("mdi:water-percent"),
        Entity::new(Sensor, "remaining_water_capacity", "Remaining Water Capacity")
            .class("water")
            .category("diagnostic")
            .unit("L")
            .icon("mdi:water"),
        Entity::new(Sensor, "total_water_consumption", "Total Water Consumption")
            .class("water")
            .unit("L")
            .icon("mdi:water"),
        Entity::new(Sensor, "number_of_regenerations", "Number of Regenerations")
            .category("diagnostic")
            .icon("mdi:counter"),
        Entity::new(Sensor, "last_regeneration", "Last Regeneration")
            .class("timestamp")
            .icon("mdi:clock-time-four-outline"),
        Entity::new(Sensor, "status_message", "Status Message").icon("mdi:message-text"),
        Entity::new(BinarySensor, "regeneration_running", "Regeneration Running").class("running"),
        Entity::new(Button, "start_regeneration", "Start Regeneration"),
        Entity::new(Number, "salt_in_stock", "Salt in Stock")
            .class("weight")
            .unit("kg")
            .range(0, 25)
            .icon("mdi:cup"),
        Entity {
            options: Some(weekdays::options()),
            ..Entity::new(Select, "regeneration_week_days", "Regeneration Week Days")
                .category("config")
                .icon("mdi:calendar-clock")
        },
        Entity::new(Number, "regeneration_interval", "Regeneration Interval")
            .category("config")
            .unit("days")
            .range(1, 10)
            .icon("mdi:calendar-clock"),
        Entity {
            pattern: Some(REGENERATION_TIME_PATTERN),
            ..Entity::new(Text, "regeneration_time", "Regeneration Time (Hour:Minutes)")
                .category("config")
                .icon("mdi:clock")
        },
    ];

    if has_leakage_protection {
        out.push(
            Entity::new(Sensor, "water_temperature", "Water Temperature")
                .class("temperature")
                .unit("°C")
                .icon("mdi:thermometer-water"),
        );
        out.push(
            Entity::new(Valve, "valve", "Valve")
                .class("water")
                .icon("mdi:pipe-valve"),
        );
    }

    for property in extra_properties {
        out.push(Entity::new(Sensor, property, property).icon(DEFAULT_ICON));
    }
    out
}

#[derive(Clone, Debug, Serialize)]
pub struct AvailabilityRef {
    pub topic: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub manufacturer: String,
    pub name: String,
    pub model: String,
    pub sw_version: String,
    pub configuration_url: String,
}

/// Discovery config payload.
#[derive(Clone, Debug, Serialize)]
pub struct DiscoveryConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,
    pub availability: Vec<AvailabilityRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
    pub unique_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub device: DeviceInfo,
}

pub fn device_info(device: &DeviceRecord) -> DeviceInfo {
    DeviceInfo {
        identifiers: vec![device.serial.clone()],
        manufacturer: MANUFACTURER.to_string(),
        name: device.model.clone(),
        model: device.model.clone(),
        sw_version: device.sw_version.clone(),
        configuration_url: device.base_url.clone(),
    }
}

/// Both liveness topics an entity depends on.
pub fn availability(device_id: &str) -> Vec<AvailabilityRef> {
    vec![
        AvailabilityRef {
            topic: BRIDGE_STATE_TOPIC.to_string(),
        },
        AvailabilityRef {
            topic: availability_topic(device_id),
        },
    ]
}

pub fn discovery_config(entity: &Entity, device: &DeviceRecord) -> DiscoveryConfig {
    let id = device.id();
    let component = entity.component;
    DiscoveryConfig {
        name: entity.name.clone(),
        device_class: entity.device_class.map(str::to_string),
        entity_category: entity.entity_category.map(str::to_string),
        unit_of_measurement: entity.unit.map(str::to_string),
        icon: entity.icon.map(str::to_string),
        state_topic: component.has_state().then(|| state_topic(id)),
        command_topic: component
            .has_command()
            .then(|| command_topic(id, &entity.field)),
        availability: availability(id),
        value_template: component
            .has_state()
            .then(|| format!("{{{{ value_json.{}}}}}", entity.field)),
        unique_id: format!("{}_{}", id, entity.field),
        min: entity.range.map(|(min, _)| min),
        max: entity.range.map(|(_, max)| max),
        mode: component.mode().map(str::to_string),
        options: entity.options.clone(),
        pattern: entity.pattern.map(str::to_string),
        device: device_info(device),
    }
}

/// Publishes every discovery config for `device` (retained).
pub fn publish_discovery(
    publisher: &dyn Publisher,
    device: &DeviceRecord,
    extra_properties: &[String],
) -> Result<usize> {
    let entities = entities(device.has_leakage_protection, extra_properties);
    for entity in &entities {
        let topic = discovery_topic(entity.component.as_str(), device.id(), &entity.field);
        let payload = serde_json::to_vec(&discovery_config(entity, device))?;
        publisher.publish(&topic, &payload, true)?;
    }
    log::debug!(
        "Published {} discovery configs for {}",
        entities.len(),
        device.id()
    );
    Ok(entities.len())
}
