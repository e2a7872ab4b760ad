use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::protocol::CommandSet;
use crate::transport::{parse_mqtt_endpoint, MqttSettings, TlsMaterials};

const DEFAULT_CLIENT_ID: &str = "syrlex2mqtt";
const DEFAULT_BIND_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
const DEFAULT_HTTP_PORT: u16 = 80;
const DEFAULT_HTTPS_PORT: u16 = 443;

#[derive(Debug, Deserialize, Default)]
struct BridgeConfigFile {
    mqtt: Option<MqttConfigFile>,
    http: Option<HttpConfigFile>,
    verbose: Option<bool>,
    additional_properties: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    server: Option<String>,
    user: Option<String>,
    password: Option<String>,
    client_id: Option<String>,
    tls_ca_path: Option<PathBuf>,
    tls_client_cert_path: Option<PathBuf>,
    tls_client_key_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct HttpConfigFile {
    bind_addr: Option<String>,
    port: Option<u16>,
    https_port: Option<u16>,
    tls_cert_path: Option<PathBuf>,
    tls_key_path: Option<PathBuf>,
    proxy_basic_commands: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub mqtt: MqttConfig,
    pub http: HttpConfig,
    pub verbose: bool,
    pub additional_properties: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub server: String,
    pub user: String,
    pub password: String,
    pub client_id: String,
    pub tls_ca_path: Option<PathBuf>,
    pub tls_client_cert_path: Option<PathBuf>,
    pub tls_client_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub https_port: u16,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub proxy_basic_commands: bool,
}

impl BridgeConfig {
    /// File named by `SYR_CONFIG` (optional), then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SYR_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => BridgeConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: BridgeConfigFile) -> Result<Self> {
        let mqtt_file = file.mqtt.unwrap_or_default();
        let http_file = file.http.unwrap_or_default();
        let bind_addr = match http_file.bind_addr.as_deref() {
            Some(addr) => parse_bind_addr(addr)?,
            None => DEFAULT_BIND_ADDR,
        };
        Ok(Self {
            mqtt: MqttConfig {
                server: mqtt_file.server.unwrap_or_default(),
                user: mqtt_file.user.unwrap_or_default(),
                password: mqtt_file.password.unwrap_or_default(),
                client_id: mqtt_file
                    .client_id
                    .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
                tls_ca_path: mqtt_file.tls_ca_path,
                tls_client_cert_path: mqtt_file.tls_client_cert_path,
                tls_client_key_path: mqtt_file.tls_client_key_path,
            },
            http: HttpConfig {
                bind_addr,
                port: http_file.port.unwrap_or(DEFAULT_HTTP_PORT),
                https_port: http_file.https_port.unwrap_or(DEFAULT_HTTPS_PORT),
                tls_cert_path: http_file.tls_cert_path,
                tls_key_path: http_file.tls_key_path,
                proxy_basic_commands: http_file.proxy_basic_commands.unwrap_or(false),
            },
            verbose: file.verbose.unwrap_or(false),
            additional_properties: file.additional_properties.unwrap_or_default(),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(server) = env_nonempty("MQTT_SERVER") {
            self.mqtt.server = server;
        }
        if let Some(user) = env_nonempty("MQTT_USER") {
            self.mqtt.user = user;
        }
        if let Some(password) = env_nonempty("MQTT_PASSWORD") {
            self.mqtt.password = password;
        }
        if let Some(client_id) = env_nonempty("MQTT_CLIENT_ID") {
            self.mqtt.client_id = client_id;
        }
        if let Some(path) = env_nonempty("MQTT_TLS_CA_PATH") {
            self.mqtt.tls_ca_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_nonempty("MQTT_TLS_CLIENT_CERT_PATH") {
            self.mqtt.tls_client_cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_nonempty("MQTT_TLS_CLIENT_KEY_PATH") {
            self.mqtt.tls_client_key_path = Some(PathBuf::from(path));
        }
        if let Some(addr) = env_nonempty("HTTP_BIND_ADDR") {
            self.http.bind_addr = parse_bind_addr(&addr)?;
        }
        if let Some(port) = env_nonempty("HTTP_PORT") {
            self.http.port = parse_port("HTTP_PORT", &port)?;
        }
        if let Some(port) = env_nonempty("HTTPS_PORT") {
            self.http.https_port = parse_port("HTTPS_PORT", &port)?;
        }
        if let Some(path) = env_nonempty("TLS_CERT_PATH") {
            self.http.tls_cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_nonempty("TLS_KEY_PATH") {
            self.http.tls_key_path = Some(PathBuf::from(path));
        }
        if let Some(flag) = env_nonempty("PROXY_BASIC_COMMANDS") {
            self.http.proxy_basic_commands = parse_flag(&flag);
        }
        if let Some(flag) = env_nonempty("VERBOSE_LOGGING") {
            self.verbose = parse_flag(&flag);
        }
        if let Ok(properties) = std::env::var("ADDITIONAL_PROPERTIES") {
            let parsed = split_csv(&properties);
            if !parsed.is_empty() {
                self.additional_properties = parsed;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.mqtt.server.trim().is_empty() {
            return Err(anyhow!("MQTT_SERVER is required"));
        }
        if self.mqtt.user.is_empty() {
            return Err(anyhow!("MQTT_USER is required"));
        }
        if self.mqtt.password.is_empty() {
            return Err(anyhow!("MQTT_PASSWORD is required"));
        }
        parse_mqtt_endpoint(&self.mqtt.server)?;

        for property in &mut self.additional_properties {
            *property = property.trim().to_string();
        }
        self.additional_properties.retain(|p| !p.is_empty());
        if let Some(bad) = self
            .additional_properties
            .iter()
            .find(|p| !p.chars().all(|c| c.is_ascii_alphanumeric()))
        {
            return Err(anyhow!(
                "additional property '{}' must be alphanumeric",
                bad
            ));
        }

        match (&self.http.tls_cert_path, &self.http.tls_key_path) {
            (Some(_), None) => return Err(anyhow!("TLS_CERT_PATH set without TLS_KEY_PATH")),
            (None, Some(_)) => return Err(anyhow!("TLS_KEY_PATH set without TLS_CERT_PATH")),
            _ => {}
        }
        if self.https_enabled() && self.http.port == self.http.https_port && self.http.port != 0 {
            return Err(anyhow!(
                "HTTP_PORT and HTTPS_PORT must differ (both {})",
                self.http.port
            ));
        }
        Ok(())
    }

    pub fn https_enabled(&self) -> bool {
        self.http.tls_cert_path.is_some() && self.http.tls_key_path.is_some()
    }

    pub fn http_addr(&self) -> String {
        SocketAddr::new(self.http.bind_addr, self.http.port).to_string()
    }

    pub fn https_addr(&self) -> String {
        SocketAddr::new(self.http.bind_addr, self.http.https_port).to_string()
    }

    pub fn command_set(&self) -> CommandSet {
        CommandSet::new(self.additional_properties.clone())
    }

    /// Resolves the broker endpoint and reads any TLS materials.
    pub fn mqtt_settings(&self) -> Result<MqttSettings> {
        let endpoint = parse_mqtt_endpoint(&self.mqtt.server)?;
        let tls = TlsMaterials::load(
            self.mqtt.tls_ca_path.as_ref(),
            self.mqtt.tls_client_cert_path.as_ref(),
            self.mqtt.tls_client_key_path.as_ref(),
        )?;
        Ok(MqttSettings {
            endpoint,
            tls,
            client_id: self.mqtt.client_id.clone(),
            username: self.mqtt.user.clone(),
            password: self.mqtt.password.clone(),
        })
    }
}

fn read_config_file(path: &Path) -> Result<BridgeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    value
        .parse()
        .map_err(|_| anyhow!("{} must be a port number, got '{}'", key, value))
}

fn parse_bind_addr(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid bind address '{}'", value))
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
