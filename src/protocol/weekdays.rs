//! Regeneration weekday bit mask (`getRPW` / `setRPW`).
//!
//! Bit 0 is Monday, bit 6 is Sunday. The text form is what Home Assistant
//! shows in the select entity, so `options()` is the list of selectable
//! values and its order is fixed.

use regex::Regex;
use std::sync::OnceLock;

pub const MASK_BITS: u8 = 0x7F;
pub const NONE_TEXT: &str = "(None)";

const FULL_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];
const SHORT_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

fn token_regex() -> &'static Regex {
    static TOKENS: OnceLock<Regex> = OnceLock::new();
    TOKENS.get_or_init(|| Regex::new("Mon|Tue|Wed|Thu|Fri|Sat|Sun").unwrap())
}

/// Renders a mask, e.g. `"Every Monday & Tuesday"` or `"Every Mon, Wed & Fri"`.
/// Bits above the lowest seven are ignored.
pub fn to_text(mask: u8) -> String {
    let mask = mask & MASK_BITS;
    if mask == 0 {
        return NONE_TEXT.to_string();
    }
    let names = if mask.count_ones() <= 2 {
        &FULL_NAMES
    } else {
        &SHORT_NAMES
    };
    let days: Vec<&str> = names
        .iter()
        .enumerate()
        .filter(|(bit, _)| mask & (1u8 << *bit) != 0)
        .map(|(_, name)| *name)
        .collect();
    let listed = match days.split_last() {
        Some((last, rest)) if !rest.is_empty() => format!("{} & {}", rest.join(", "), last),
        _ => days.join(", "),
    };
    format!("Every {listed}")
}

/// Collects every abbreviated weekday token found anywhere in `text`.
/// Full names match through their prefix; unmatched input yields 0.
pub fn from_text(text: &str) -> u8 {
    token_regex()
        .find_iter(text)
        .filter_map(|m| SHORT_NAMES.iter().position(|name| *name == m.as_str()))
        .fold(0u8, |mask, bit| mask | (1 << bit))
}

/// Reverses the lowest seven bits (bit 0 <-> bit 6).
fn reverse7(value: u8) -> u8 {
    (value & MASK_BITS).reverse_bits() >> 1
}

/// All 128 display strings: "(None)" first, then grouped by number of days.
/// Within a group Monday-heavy patterns come first.
pub fn options() -> Vec<String> {
    let mut out = Vec::with_capacity(128);
    out.push(NONE_TEXT.to_string());
    for days in 1..=7u32 {
        for pattern in (1..=MASK_BITS).rev() {
            if pattern.count_ones() == days {
                out.push(to_text(reverse7(pattern)));
            }
        }
    }
    out
}
