//! Turns device polls into registry updates and response envelopes.
//!
//! Nothing here returns an error to the device. Whatever goes wrong, the
//! device gets a valid envelope back so it keeps polling.

use anyhow::{anyhow, Result};
use std::sync::Arc;

use super::proxy::DeviceFetcher;
use crate::device::{DeviceRecord, DeviceRegistry};
use crate::protocol::{
    decode, encode, CommandSet, ValueMap, CODE_ADDRESS, CODE_MODEL, CODE_SERIAL, CODE_VERSION,
};
use crate::state;

const FORM_FIELD: &str = "xml";

pub struct RequestRouter {
    registry: Arc<DeviceRegistry>,
    proxy: Option<Box<dyn DeviceFetcher>>,
}

impl RequestRouter {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            proxy: None,
        }
    }

    pub fn with_proxy(mut self, proxy: Box<dyn DeviceFetcher>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    fn commands(&self) -> &CommandSet {
        self.registry.commands()
    }

    /// Empty `get` entries for the six identity codes.
    pub fn basic_fallback(&self) -> String {
        encode(&self.commands().basic_request())
    }

    /// Empty `get` entries for the full superset, no writes.
    pub fn all_fallback(&self) -> String {
        encode(&self.commands().full_request())
    }

    /// GetBasicCommands.
    ///
    /// With a proxy configured the device at `client_ip` is asked for the
    /// full superset; its reply is processed like a GetAllCommands poll and
    /// relayed verbatim. Without one, or when the device does not answer,
    /// the basic envelope is returned.
    pub fn handle_basic(&self, client_ip: Option<&str>) -> String {
        let (Some(proxy), Some(ip)) = (self.proxy.as_ref(), client_ip) else {
            return self.basic_fallback();
        };
        let request = self.all_fallback();
        let reply = match proxy.fetch_all(ip, &request) {
            Ok(reply) => reply,
            Err(e) => {
                log::info!("Device proxy to {} failed: {:#}", ip, e);
                return self.basic_fallback();
            }
        };
        let body = extract_xml(&reply).unwrap_or_else(|| reply.trim().to_string());
        log::debug!("Proxied response from {}:\n{}", ip, body);
        match decode(&body) {
            Ok(values) => {
                if let Err(e) = self.ingest(&values) {
                    log::info!("Proxied response from {} not processed: {:#}", ip, e);
                }
            }
            Err(e) => log::info!("Proxied response from {} not processed: {}", ip, e),
        }
        body
    }

    /// GetAllCommands: `body` is a form (`xml=...`) or raw XML.
    pub fn handle_all(&self, body: &str) -> String {
        let Some(xml) = extract_xml(body) else {
            log::debug!("GetAllCommands without envelope");
            return self.all_fallback();
        };
        log::debug!("GetAllCommands envelope:\n{}", xml);
        let values = match decode(&xml) {
            Ok(values) => values,
            Err(e) => {
                log::info!("Rejected device envelope: {}", e);
                return self.all_fallback();
            }
        };
        let response = self
            .ingest(&values)
            .and_then(|device| self.registry.response_envelope(&device));
        match response {
            Ok(response) => {
                log::debug!("GetAllCommands response:\n{}", response);
                response
            }
            Err(e) => {
                log::info!("GetAllCommands processing failed: {:#}", e);
                self.all_fallback()
            }
        }
    }

    /// Registers the reporting device and publishes its state when the poll
    /// is complete.
    fn ingest(&self, values: &ValueMap) -> Result<Arc<DeviceRecord>> {
        let field = |code: &str| values.get(code).map(|v| v.trim()).unwrap_or_default();
        let model = field(CODE_MODEL);
        let serial = field(CODE_SERIAL);
        if model.is_empty() || serial.is_empty() {
            return Err(anyhow!("envelope without model or serial number"));
        }
        let base_url = format!("http://{}", field(CODE_ADDRESS));
        let device = self
            .registry
            .get_or_create(model, serial, field(CODE_VERSION), &base_url)?;

        match state::translate(values, self.commands(), device.has_leakage_protection) {
            Some(payload) => state::publish_state(self.registry.publisher(), &device, &payload)?,
            None => log::debug!("Incomplete poll from {}, state not published", device.id()),
        }
        Ok(device)
    }
}

/// Pulls the envelope out of a request body.
///
/// Raw XML is returned as is; otherwise the body is parsed as a form and the
/// URL-decoded `xml` field returned.
pub fn extract_xml(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    if body.starts_with('<') {
        return Some(body.to_string());
    }
    url::form_urlencoded::parse(body.as_bytes())
        .find(|(key, _)| key == FORM_FIELD)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
