//! XML envelope codec.
//!
//! ```text
//! <?xml version="1.0" encoding="utf-8"?><sc version="1.0"><d>
//!   <c n="getFLO" v="0"/> ...
//! </d></sc>
//! ```

use super::{CommandEntry, ValueMap};

pub const XML_START: &str = r#"<?xml version="1.0" encoding="utf-8"?><sc version="1.0"><d>"#;
pub const XML_END: &str = "</d></sc>";

/// Raised when a device sends something that is not a command envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "envelope parse error: {}", self.message)
    }
}
impl std::error::Error for ParseError {}

/// Parses an envelope into a code/value map.
///
/// Requires a `sc` root with a `d` child holding at least one `c` element.
/// A `c` without `v` decodes to an empty value; later duplicates win.
pub fn decode(xml: &str) -> Result<ValueMap, ParseError> {
    let doc = roxmltree::Document::parse(xml.trim()).map_err(|e| ParseError::new(e.to_string()))?;
    let root = doc.root_element();
    if root.tag_name().name() != "sc" {
        return Err(ParseError::new(format!(
            "unexpected root element '{}'",
            root.tag_name().name()
        )));
    }
    let data = root
        .children()
        .find(|n| n.is_element() && n.tag_name().name() == "d")
        .ok_or_else(|| ParseError::new("missing <d> element"))?;

    let mut values = ValueMap::new();
    for command in data
        .children()
        .filter(|n| n.is_element() && n.tag_name().name() == "c")
    {
        let code = command
            .attribute("n")
            .ok_or_else(|| ParseError::new("<c> element without 'n' attribute"))?;
        let value = command.attribute("v").unwrap_or_default();
        values.insert(code.to_string(), value.to_string());
    }
    if values.is_empty() {
        return Err(ParseError::new("no <c> elements"));
    }
    Ok(values)
}

/// Serializes entries in the given order.
pub fn encode(entries: &[CommandEntry]) -> String {
    let mut out = String::from(XML_START);
    for entry in entries {
        out.push_str(r#"<c n=""#);
        push_escaped(&mut out, &entry.code);
        out.push_str(r#"" v=""#);
        push_escaped(&mut out, &entry.value);
        out.push_str(r#""/>"#);
    }
    out.push_str(XML_END);
    out
}

fn push_escaped(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
}
