//! MQTT topic layout.

pub const TOPIC_ROOT: &str = "syr";
pub const BRIDGE_NAME: &str = "syrlex2mqtt";
pub const BRIDGE_STATE_TOPIC: &str = "syr/syrlex2mqtt/state";
pub const COMMAND_SUBSCRIPTION: &str = "syr/#";
pub const DISCOVERY_PREFIX: &str = "homeassistant";
pub const DISCOVERY_NODE: &str = "syr_watersoftening";

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

pub fn availability_topic(device_id: &str) -> String {
    format!("{TOPIC_ROOT}/{device_id}/availability")
}

pub fn state_topic(device_id: &str) -> String {
    format!("{TOPIC_ROOT}/{device_id}/state")
}

pub fn command_topic(device_id: &str, field: &str) -> String {
    format!("{TOPIC_ROOT}/{device_id}/set_{field}")
}

pub fn discovery_topic(component: &str, device_id: &str, field: &str) -> String {
    format!("{DISCOVERY_PREFIX}/{component}/{DISCOVERY_NODE}/{device_id}_{field}/config")
}

/// Splits `syr/<device>/set_<field>` into `(device, field)`.
///
/// Both parts must be non-empty and consist of word characters or `-`.
pub fn parse_command_topic(topic: &str) -> Option<(&str, &str)> {
    let rest = topic.strip_prefix(TOPIC_ROOT)?.strip_prefix('/')?;
    let (device_id, leaf) = rest.split_once('/')?;
    let field = leaf.strip_prefix("set_")?;
    let valid = |s: &str| {
        !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    };
    if valid(device_id) && valid(field) {
        Some((device_id, field))
    } else {
        None
    }
}
