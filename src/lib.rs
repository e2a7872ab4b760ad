//! syrlex2mqtt
//!
//! Bridges SYR LEX Plus water softeners to MQTT with Home Assistant
//! discovery.
//!
//! # Architecture
//!
//! The softener polls what it believes is the vendor cloud with a flat XML
//! list of command codes. The bridge answers those polls itself:
//!
//! 1. **Codec**: envelopes are decoded into code/value maps and encoded back.
//! 2. **Registry**: the first poll from a device publishes its discovery
//!    configs and marks it online; later polls are lookups.
//! 3. **State**: a complete poll is translated into one JSON state message.
//! 4. **Setters**: Home Assistant commands wait per device and are written
//!    into the next response envelope, each exactly once.
//!
//! # Module Structure
//!
//! - `protocol`: code sets, XML envelope and weekday mask codecs
//! - `device`: registry, discovery configs, pending writes
//! - `state`: state payload translation
//! - `api`: HTTP(S) listener, request routing, device proxy
//! - `transport`: MQTT publisher seam and broker session
//! - `config`: file and environment configuration

pub mod api;
pub mod config;
pub mod device;
pub mod protocol;
pub mod state;
pub mod topics;
pub mod transport;

pub use api::{HttpServer, RequestRouter, ServerHandle};
pub use config::BridgeConfig;
pub use device::{device_id, DeviceRecord, DeviceRegistry};
pub use protocol::{decode, encode, CommandEntry, CommandSet, ParseError, ValueMap};
pub use state::{translate, StatusPayload};
pub use transport::{MqttPublisher, Publisher, RecordingPublisher};
