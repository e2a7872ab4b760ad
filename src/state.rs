//! Device values to the JSON state payload.
//!
//! A state message is only built from a complete poll: every code of the
//! superset must be present, otherwise the retained last-known state is
//! left alone.

use anyhow::Result;
use chrono::{Local, TimeZone};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::device::DeviceRecord;
use crate::protocol::{weekdays, CommandSet, ValueMap, GET_PREFIX};
use crate::topics::state_topic;
use crate::transport::Publisher;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusPayload {
    pub current_water_flow: Option<String>,
    pub salt_remaining: Option<String>,
    pub remaining_resin_capacity: Option<String>,
    pub remaining_water_capacity: Option<String>,
    pub total_water_consumption: Option<String>,
    pub number_of_regenerations: Option<String>,
    pub last_regeneration: Option<String>,
    pub status_message: Option<String>,
    pub salt_in_stock: Option<String>,
    pub regeneration_interval: Option<String>,
    pub regeneration_week_days: Option<String>,
    pub regeneration_time: Option<String>,
    pub regeneration_running: &'static str,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Option<String>>,
    #[serde(flatten)]
    pub leakage: Option<LeakageState>,
}

/// Fields only reported by models with leakage protection.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LeakageState {
    pub water_temperature: Option<f64>,
    pub valve: &'static str,
}

/// Builds the payload, or `None` while the poll is incomplete.
pub fn translate(
    values: &ValueMap,
    commands: &CommandSet,
    has_leakage_protection: bool,
) -> Option<StatusPayload> {
    if !commands.is_complete(values) {
        return None;
    }
    let text = |code: &str| {
        values
            .get(code)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let last_regeneration = text("getLAR")
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(format_timestamp);
    let regeneration_week_days = text("getRPW")
        .and_then(|v| v.parse::<u8>().ok())
        .map(weekdays::to_text);
    let regeneration_time = match (text("getRTH"), text("getRTM")) {
        (Some(hours), Some(minutes)) => Some(format!("{hours:0>2}:{minutes:0>2}")),
        _ => None,
    };
    let regeneration_running = if text("getRG1").as_deref() == Some("1") {
        "ON"
    } else {
        "OFF"
    };

    let extra = commands
        .extra_properties()
        .iter()
        .map(|p| (p.clone(), text(&format!("{GET_PREFIX}{p}"))))
        .collect();

    let leakage = has_leakage_protection.then(|| LeakageState {
        water_temperature: text("getCEL")
            .and_then(|v| v.parse::<f64>().ok())
            .map(|decidegrees| decidegrees / 10.0),
        valve: if text("getAB").as_deref() == Some("1") {
            "open"
        } else {
            "closed"
        },
    });

    Some(StatusPayload {
        current_water_flow: text("getFLO"),
        salt_remaining: text("getSS1"),
        remaining_resin_capacity: text("getCS1"),
        remaining_water_capacity: text("getRES"),
        total_water_consumption: text("getCOF"),
        number_of_regenerations: text("getTOR"),
        last_regeneration,
        status_message: text("getSTA"),
        salt_in_stock: text("getSV1"),
        regeneration_interval: text("getRPD"),
        regeneration_week_days,
        regeneration_time,
        regeneration_running,
        extra,
        leakage,
    })
}

/// Epoch seconds as local time with numeric offset.
pub fn format_timestamp(epoch_secs: i64) -> Option<String> {
    format_timestamp_in(epoch_secs, &Local)
}

pub fn format_timestamp_in<Tz>(epoch_secs: i64, tz: &Tz) -> Option<String>
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    tz.timestamp_opt(epoch_secs, 0)
        .single()
        .map(|dt| dt.format(TIMESTAMP_FORMAT).to_string())
}

pub fn publish_state(
    publisher: &dyn Publisher,
    device: &DeviceRecord,
    payload: &StatusPayload,
) -> Result<()> {
    let json = serde_json::to_string(payload)?;
    log::debug!("State for {}: {}", device.id(), json);
    publisher.publish(&state_topic(device.id()), json.as_bytes(), true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use serde_json::Value;

    fn full_values(commands: &CommandSet) -> ValueMap {
        let mut values: ValueMap = commands
            .all_codes()
            .iter()
            .map(|c| (c.clone(), String::new()))
            .collect();
        for (code, value) in [
            ("getFLO", "3"),
            ("getSS1", "8"),
            ("getLAR", "0"),
            ("getRPW", "21"),
            ("getRTH", "2"),
            ("getRTM", "5"),
            ("getRG1", "1"),
            ("getCEL", "105"),
            ("getAB", "2"),
        ] {
            values.insert(code.to_string(), value.to_string());
        }
        values
    }

    #[test]
    fn incomplete_poll_is_not_ready() {
        let commands = CommandSet::default();
        let mut values = full_values(&commands);
        values.remove("getRPW");
        assert!(translate(&values, &commands, false).is_none());
    }

    #[test]
    fn fields_are_converted() {
        let commands = CommandSet::default();
        let payload = translate(&full_values(&commands), &commands, true).unwrap();
        assert_eq!(payload.current_water_flow.as_deref(), Some("3"));
        assert_eq!(payload.salt_in_stock, None);
        assert_eq!(
            payload.regeneration_week_days.as_deref(),
            Some("Every Mon, Wed & Fri")
        );
        assert_eq!(payload.regeneration_time.as_deref(), Some("02:05"));
        assert_eq!(payload.regeneration_running, "ON");
        let leakage = payload.leakage.unwrap();
        assert_eq!(leakage.water_temperature, Some(10.5));
        assert_eq!(leakage.valve, "closed");
    }

    #[test]
    fn json_omits_leakage_fields_without_protection() {
        let commands = CommandSet::new(vec!["NOT".to_string()]);
        let mut values = full_values(&commands);
        values.insert("getNOT".to_string(), "7".to_string());
        let payload = translate(&values, &commands, false).unwrap();
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("valve").is_none());
        assert!(json.get("water_temperature").is_none());
        assert_eq!(json["NOT"], "7");
        assert_eq!(json["status_message"], Value::Null);
    }

    #[test]
    fn timestamps_carry_numeric_offset() {
        let utc = FixedOffset::east_opt(0).unwrap();
        assert_eq!(
            format_timestamp_in(0, &utc).as_deref(),
            Some("1970-01-01T00:00:00+00:00")
        );
        let cest = FixedOffset::east_opt(2 * 3600).unwrap();
        assert_eq!(
            format_timestamp_in(1_700_000_000, &cest).as_deref(),
            Some("2023-11-15T00:13:20+02:00")
        );
        let west = FixedOffset::west_opt(5 * 3600 + 30 * 60).unwrap();
        assert_eq!(
            format_timestamp_in(0, &west).as_deref(),
            Some("1969-12-31T18:30:00-05:30")
        );
    }
}
