//! Pending writes for a device.
//!
//! Home Assistant publishes commands whenever it likes, but the device only
//! accepts writes in the response to its own poll. Commands are translated
//! into `set` codes here and wait in the queue until the next response
//! envelope drains them.

use regex::Regex;
use std::sync::OnceLock;

use crate::protocol::{setter_code, weekdays, CommandEntry, CommandSet};

/// One write waiting for the next poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingWrite {
    pub code: String,
    pub value: String,
}

impl PendingWrite {
    fn new(code: &str, value: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            value: value.into(),
        }
    }
}

/// Ordered pending writes, at most one per code. A later write to the same
/// code replaces the value and keeps its queue position.
#[derive(Debug, Default)]
pub struct SetterQueue {
    pending: Vec<PendingWrite>,
}

impl SetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, write: PendingWrite) {
        match self.pending.iter_mut().find(|p| p.code == write.code) {
            Some(existing) => existing.value = write.value,
            None => self.pending.push(write),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Removes and returns every pending write.
    pub fn drain(&mut self) -> Vec<PendingWrite> {
        std::mem::take(&mut self.pending)
    }
}

fn time_regex() -> &'static Regex {
    static TIME_RE: OnceLock<Regex> = OnceLock::new();
    TIME_RE.get_or_init(|| Regex::new(r"(\d?\d):(\d\d)").unwrap())
}

/// Translates a Home Assistant command into device writes.
///
/// Returns `None` for unknown fields and payloads a field does not accept.
pub fn translate_command(field: &str, payload: &str) -> Option<Vec<PendingWrite>> {
    let writes = match field {
        "salt_in_stock" => vec![PendingWrite::new("setSV1", payload)],
        "regeneration_interval" => vec![PendingWrite::new("setRPD", payload)],
        "regeneration_week_days" => vec![PendingWrite::new(
            "setRPW",
            weekdays::from_text(payload).to_string(),
        )],
        "regeneration_time" => {
            let caps = time_regex().captures(payload)?;
            vec![
                PendingWrite::new("setRTH", &caps[1]),
                PendingWrite::new("setRTM", &caps[2]),
            ]
        }
        "start_regeneration" if payload == "PRESS" => vec![PendingWrite::new("setSIR", "0")],
        "valve" => match payload {
            "OPEN" => vec![PendingWrite::new("setAB", "1")],
            "CLOSE" => vec![PendingWrite::new("setAB", "2")],
            _ => return None,
        },
        _ => return None,
    };
    Some(writes)
}

/// Builds the response entries for one poll.
///
/// Walks the full code set and emits the pending `set` value in place of
/// its `get` code; everything else is an empty `get`. Writes for codes
/// outside the set are appended in queue order.
pub fn response_entries(commands: &CommandSet, pending: Vec<PendingWrite>) -> Vec<CommandEntry> {
    let mut remaining = pending;
    let mut entries = Vec::with_capacity(commands.all_codes().len() + remaining.len());
    for getter in commands.all_codes() {
        let setter = setter_code(getter);
        match remaining.iter().position(|p| p.code == setter) {
            Some(idx) => {
                let write = remaining.remove(idx);
                entries.push(CommandEntry::new(write.code, write.value));
            }
            None => entries.push(CommandEntry::request(getter.as_str())),
        }
    }
    entries.extend(
        remaining
            .into_iter()
            .map(|write| CommandEntry::new(write.code, write.value)),
    );
    entries
}
