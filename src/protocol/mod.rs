//! SYR Connect command-code protocol.
//!
//! The appliance talks to its "cloud" with a flat list of command codes.
//! Every code is a `get` or `set` verb followed by a short mnemonic
//! (`getFLO`, `setRPD`, ...). This module holds the code sets the bridge
//! requests from a device and the types shared by the envelope and
//! weekday codecs.

use std::collections::HashMap;

pub mod envelope;
pub mod weekdays;

pub use envelope::{decode, encode, ParseError};

/// Raw values reported by a device, keyed by command code.
pub type ValueMap = HashMap<String, String>;

pub const GET_PREFIX: &str = "get";
pub const SET_PREFIX: &str = "set";

/// Identity codes every device answers, in request order.
pub const BASIC_CODES: [&str; 6] = ["getSRN", "getVER", "getFIR", "getTYP", "getCNA", "getIPA"];

/// Status and configuration codes shared by all supported models.
pub const STATUS_CODES: [&str; 14] = [
    "getSV1", "getRPD", "getFLO", "getLAR", "getTOR", "getRG1", "getCS1", "getRES", "getSS1",
    "getSTA", "getCOF", "getRTH", "getRTM", "getRPW",
];

/// Leakage protection codes. Requested from every model; devices without
/// the feature simply answer them empty.
pub const LEAKAGE_CODES: [&str; 2] = ["getAB", "getCEL"];

pub const CODE_SERIAL: &str = "getSRN";
pub const CODE_VERSION: &str = "getVER";
pub const CODE_MODEL: &str = "getCNA";
pub const CODE_ADDRESS: &str = "getIPA";

/// One `<c n=".." v=".."/>` element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandEntry {
    pub code: String,
    pub value: String,
}

impl CommandEntry {
    pub fn new(code: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            value: value.into(),
        }
    }

    /// Empty-valued entry: "give me this field" / "no change requested".
    pub fn request(code: impl Into<String>) -> Self {
        Self::new(code, String::new())
    }
}

/// Maps `getXYZ` to `setXYZ`. Codes without the `get` prefix are returned as-is.
pub fn setter_code(getter: &str) -> String {
    match getter.strip_prefix(GET_PREFIX) {
        Some(mnemonic) => format!("{SET_PREFIX}{mnemonic}"),
        None => getter.to_string(),
    }
}

/// The full set of codes the bridge exchanges with a device.
///
/// Built once from the configured additional properties and shared by the
/// router, the registry and the state translator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSet {
    extra_properties: Vec<String>,
    all_codes: Vec<String>,
}

impl CommandSet {
    pub fn new(extra_properties: Vec<String>) -> Self {
        let mut all_codes: Vec<String> = Vec::new();
        let extra_codes = extra_properties.iter().map(|p| format!("{GET_PREFIX}{p}"));
        let known = BASIC_CODES
            .iter()
            .chain(STATUS_CODES.iter())
            .chain(LEAKAGE_CODES.iter())
            .map(|c| c.to_string())
            .chain(extra_codes);
        for code in known {
            if !all_codes.contains(&code) {
                all_codes.push(code);
            }
        }
        Self {
            extra_properties,
            all_codes,
        }
    }

    /// Property suffixes configured on top of the built-in codes.
    pub fn extra_properties(&self) -> &[String] {
        &self.extra_properties
    }

    /// Every `get` code, in request order and without duplicates.
    pub fn all_codes(&self) -> &[String] {
        &self.all_codes
    }

    pub fn basic_request(&self) -> Vec<CommandEntry> {
        BASIC_CODES.iter().map(|c| CommandEntry::request(*c)).collect()
    }

    pub fn full_request(&self) -> Vec<CommandEntry> {
        self.all_codes
            .iter()
            .map(|c| CommandEntry::request(c.as_str()))
            .collect()
    }

    /// True when `values` carries every code of the superset.
    pub fn is_complete(&self, values: &ValueMap) -> bool {
        self.all_codes.iter().all(|code| values.contains_key(code))
    }
}

impl Default for CommandSet {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
