//! Outbound request to the device's own web service.
//!
//! When enabled, a GetBasicCommands poll is answered by asking the device
//! for the full code set directly and relaying what it returns.

use anyhow::{anyhow, Context, Result};
use std::time::Duration;

pub const DEVICE_SERVICE_PATH: &str = "/WebServices/SyrConnectLimexWebService.asmx/GetAllCommands";
pub const PROXY_TIMEOUT: Duration = Duration::from_secs(8);

pub trait DeviceFetcher: Send + Sync {
    /// Posts `request_xml` to the device at `device_ip` and returns the raw body.
    fn fetch_all(&self, device_ip: &str, request_xml: &str) -> Result<String>;
}

pub struct HttpDeviceProxy {
    agent: ureq::Agent,
    port: u16,
}

impl HttpDeviceProxy {
    pub fn new() -> Self {
        Self::with_port(80)
    }

    pub fn with_port(port: u16) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(PROXY_TIMEOUT).build();
        Self { agent, port }
    }

    pub fn device_url(&self, device_ip: &str) -> String {
        let host = if device_ip.contains(':') {
            format!("[{device_ip}]")
        } else {
            device_ip.to_string()
        };
        if self.port == 80 {
            format!("http://{host}{DEVICE_SERVICE_PATH}")
        } else {
            format!("http://{host}:{}{DEVICE_SERVICE_PATH}", self.port)
        }
    }
}

impl Default for HttpDeviceProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceFetcher for HttpDeviceProxy {
    fn fetch_all(&self, device_ip: &str, request_xml: &str) -> Result<String> {
        let url = self.device_url(device_ip);
        log::debug!("Proxying full command request to {}", url);
        let response = self
            .agent
            .post(&url)
            .send_form(&[("xml", request_xml)])
            .with_context(|| format!("proxy request to {}", url))?;
        let body = response
            .into_string()
            .with_context(|| format!("read proxy response from {}", url))?;
        if body.trim().is_empty() {
            return Err(anyhow!("empty proxy response from {}", url));
        }
        Ok(body)
    }
}
