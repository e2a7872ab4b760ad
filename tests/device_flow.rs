use rumqttc::v5::{mqttbytes::QoS, Client, MqttOptions};
use serde_json::Value;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use syrlex2mqtt::protocol::{encode, CommandEntry, CommandSet, ValueMap};
use syrlex2mqtt::transport::{MqttPublisher, PublishedMessage, RecordingPublisher};
use syrlex2mqtt::{state, DeviceRegistry, RequestRouter};

const DEVICE_ID: &str = "lexplus10sl12345";

fn full_values(commands: &CommandSet, valve: &str) -> ValueMap {
    let mut values: ValueMap = commands
        .all_codes()
        .iter()
        .map(|code| (code.clone(), "0".to_string()))
        .collect();
    for (code, value) in [
        ("getCNA", "LEXplus10SL"),
        ("getSRN", "12345"),
        ("getVER", "2.7"),
        ("getIPA", "192.168.1.40"),
        ("getFLO", "4"),
        ("getRPW", "0"),
        ("getRTH", "2"),
        ("getRTM", "0"),
        ("getCEL", "118"),
        ("getAB", valve),
    ] {
        values.insert(code.to_string(), value.to_string());
    }
    values
}

fn poll_body(commands: &CommandSet, valve: &str) -> String {
    let values = full_values(commands, valve);
    let entries: Vec<CommandEntry> = commands
        .all_codes()
        .iter()
        .map(|code| CommandEntry::new(code.as_str(), values[code].as_str()))
        .collect();
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair("xml", &encode(&entries))
        .finish()
}

fn bridge() -> (Arc<RecordingPublisher>, RequestRouter) {
    let publisher = Arc::new(RecordingPublisher::new());
    let registry = Arc::new(DeviceRegistry::new(publisher.clone(), CommandSet::default()));
    (publisher, RequestRouter::new(registry))
}

fn state_messages(messages: &[PublishedMessage]) -> Vec<Value> {
    messages
        .iter()
        .filter(|m| m.topic == format!("syr/{DEVICE_ID}/state"))
        .map(|m| serde_json::from_str(&m.payload).unwrap())
        .collect()
}

#[test]
fn first_poll_publishes_discovery_availability_then_state() {
    let (publisher, router) = bridge();
    let commands = CommandSet::default();
    router.handle_all(&poll_body(&commands, "1"));

    let messages = publisher.messages();
    let discovery: Vec<&PublishedMessage> = messages
        .iter()
        .filter(|m| m.topic.starts_with("homeassistant/"))
        .collect();
    assert_eq!(discovery.len(), 16);
    for field in [
        "current_water_flow",
        "salt_remaining",
        "remaining_resin_capacity",
        "remaining_water_capacity",
        "total_water_consumption",
        "number_of_regenerations",
        "last_regeneration",
        "status_message",
        "regeneration_running",
        "start_regeneration",
        "salt_in_stock",
        "regeneration_week_days",
        "regeneration_interval",
        "regeneration_time",
        "water_temperature",
        "valve",
    ] {
        assert!(
            discovery
                .iter()
                .any(|m| m.topic.ends_with(&format!("/{DEVICE_ID}_{field}/config"))),
            "missing discovery for {}",
            field
        );
    }
    assert!(discovery
        .iter()
        .any(|m| m.topic == "homeassistant/valve/syr_watersoftening/lexplus10sl12345_valve/config"));

    let position = |topic: &str| messages.iter().position(|m| m.topic == topic).unwrap();
    let last_discovery = messages
        .iter()
        .rposition(|m| m.topic.starts_with("homeassistant/"))
        .unwrap();
    let availability = position("syr/lexplus10sl12345/availability");
    let bridge_state = position("syr/syrlex2mqtt/state");
    let state = position("syr/lexplus10sl12345/state");
    assert!(last_discovery < availability);
    assert!(availability < bridge_state);
    assert!(bridge_state < state);

    let states = state_messages(&messages);
    assert_eq!(states.len(), 1);
    assert_eq!(states[0]["valve"], "open");
    assert_eq!(states[0]["water_temperature"], 11.8);
    assert_eq!(states[0]["regeneration_week_days"], "(None)");
    assert_eq!(states[0]["regeneration_time"], "02:00");
    assert_eq!(states[0]["regeneration_running"], "OFF");
}

#[test]
fn later_polls_only_publish_state() {
    let (publisher, router) = bridge();
    let commands = CommandSet::default();
    router.handle_all(&poll_body(&commands, "1"));
    publisher.clear();

    router.handle_all(&poll_body(&commands, "2"));
    let messages = publisher.messages();
    assert_eq!(messages.len(), 1);
    let states = state_messages(&messages);
    assert_eq!(states[0]["valve"], "closed");
}

#[test]
fn any_missing_code_suppresses_state() {
    let commands = CommandSet::new(vec!["NOT".to_string()]);
    let full = full_values(&commands, "1");
    assert!(state::translate(&full, &commands, true).is_some());
    for code in commands.all_codes() {
        let mut partial = full.clone();
        partial.remove(code);
        assert!(
            state::translate(&partial, &commands, true).is_none(),
            "state produced without {}",
            code
        );
    }
}

#[test]
fn queued_write_is_sent_exactly_once() {
    let (_, router) = bridge();
    let commands = CommandSet::default();
    router.handle_all(&poll_body(&commands, "1"));

    assert!(router
        .registry()
        .enqueue(DEVICE_ID, "regeneration_interval", "5"));
    let first = router.handle_all(&poll_body(&commands, "1"));
    assert!(first.contains(r#"<c n="setRPD" v="5"/>"#));

    let second = router.handle_all(&poll_body(&commands, "1"));
    assert!(!second.contains("setRPD"));
    assert!(second.contains(r#"<c n="getRPD" v=""/>"#));
}

#[test]
fn valve_command_reaches_next_response() {
    let (_, router) = bridge();
    let commands = CommandSet::default();
    router.handle_all(&poll_body(&commands, "2"));

    assert!(router
        .registry()
        .handle_command("syr/lexplus10sl12345/set_valve", b"OPEN"));
    let response = router.handle_all(&poll_body(&commands, "2"));
    assert!(response.contains(r#"<c n="setAB" v="1"/>"#));
    assert!(!response.contains(r#"<c n="getAB" v=""/>"#));
}

#[test]
fn writes_outside_code_set_are_appended() {
    let (_, router) = bridge();
    let commands = CommandSet::default();
    router.handle_all(&poll_body(&commands, "1"));

    router
        .registry()
        .handle_command("syr/lexplus10sl12345/set_start_regeneration", b"PRESS");
    router
        .registry()
        .handle_command("syr/lexplus10sl12345/set_regeneration_time", b"3:15");
    let response = router.handle_all(&poll_body(&commands, "1"));
    assert!(response.contains(r#"<c n="setRTH" v="3"/><c n="setRTM" v="15"/>"#));
    assert!(response.ends_with(r#"<c n="setSIR" v="0"/></d></sc>"#));
}

#[test]
fn commands_before_first_poll_are_dropped() {
    let (publisher, router) = bridge();
    assert!(!router
        .registry()
        .handle_command("syr/lexplus10sl12345/set_valve", b"OPEN"));

    let commands = CommandSet::default();
    let response = router.handle_all(&poll_body(&commands, "1"));
    assert!(!response.contains("setAB"));
    assert!(!publisher.messages().is_empty());
}

#[test]
fn full_mqtt_queue_does_not_stall_registry() {
    // Nothing polls the connection, as while the broker is unreachable.
    let options = MqttOptions::new("syrlex2mqtt-test", "127.0.0.1", 1);
    let (client, _connection) = Client::new(options, 64);
    for _ in 0..64 {
        client
            .try_publish("syr/backlog", QoS::AtLeastOnce, false, b"x".to_vec())
            .expect("queue has room");
    }
    let registry = Arc::new(DeviceRegistry::new(
        Arc::new(MqttPublisher::new(client)),
        CommandSet::default(),
    ));

    let (tx, rx) = mpsc::channel();
    let worker = registry.clone();
    std::thread::spawn(move || {
        let created = worker.get_or_create("LEXplus10", "1", "2.7", "http://192.168.1.40");
        let _ = tx.send(created.is_ok());
    });
    let created = rx
        .recv_timeout(Duration::from_secs(3))
        .expect("get_or_create blocked on the MQTT queue");
    assert!(!created);

    let (tx, rx) = mpsc::channel();
    let worker = registry.clone();
    std::thread::spawn(move || {
        let _ = tx.send(worker.get("lexplus102").is_some());
    });
    let found = rx
        .recv_timeout(Duration::from_secs(3))
        .expect("registry lookup blocked");
    assert!(!found);
    assert!(registry.is_empty());
}
