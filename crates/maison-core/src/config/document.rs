//! JSON form of the configuration, as stored in `/config.json` and carried by
//! `CONFIG:` control messages.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use super::{Config, ConfigError, FINGERPRINT_LEN, truncated};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConfigDocument {
    pub version: u16,
    pub device_name: String,
    pub ssid: String,
    pub wifi_password: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub subnet_mask: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub dns: String,
    pub mqtt_server_name: String,
    pub mqtt_user_name: String,
    pub mqtt_password: String,
    pub mqtt_port: u16,
    #[serde(default)]
    pub mqtt_fingerprint: Vec<u8>,
}

impl ConfigDocument {
    pub fn parse(json: &[u8]) -> Result<Self, ConfigError> {
        serde_json::from_slice(json).map_err(|e| ConfigError::Parse(truncated(&e.to_string())))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ConfigError> {
        serde_json::to_vec(self).map_err(|e| ConfigError::Parse(truncated(&e.to_string())))
    }

    /// Validate and narrow into the fixed-capacity live form.
    pub fn into_config(self) -> Result<Config, ConfigError> {
        if self.version == 0 {
            return Err(ConfigError::MissingField("version"));
        }
        if self.mqtt_port == 0 {
            return Err(ConfigError::MissingField("mqtt_port"));
        }

        let mqtt_fingerprint = match self.mqtt_fingerprint.len() {
            0 => None,
            FINGERPRINT_LEN if self.mqtt_fingerprint.iter().all(|&b| b == 0) => None,
            FINGERPRINT_LEN => {
                let mut fingerprint = [0u8; FINGERPRINT_LEN];
                fingerprint.copy_from_slice(&self.mqtt_fingerprint);
                Some(fingerprint)
            }
            _ => return Err(ConfigError::InvalidField("mqtt_fingerprint")),
        };

        Ok(Config {
            version: self.version,
            device_name: truncated(&self.device_name),
            wifi_ssid: truncated(&self.ssid),
            wifi_password: truncated(&self.wifi_password),
            ip: parse_address(&self.ip, "ip")?,
            subnet_mask: parse_address(&self.subnet_mask, "subnet_mask")?,
            gateway: parse_address(&self.gateway, "gateway")?,
            dns: parse_address(&self.dns, "dns")?,
            mqtt_server: truncated(&self.mqtt_server_name),
            mqtt_username: truncated(&self.mqtt_user_name),
            mqtt_password: truncated(&self.mqtt_password),
            mqtt_port: self.mqtt_port,
            mqtt_fingerprint,
        })
    }
}

impl From<&Config> for ConfigDocument {
    fn from(config: &Config) -> Self {
        Self {
            version: config.version,
            device_name: config.device_name.as_str().to_string(),
            ssid: config.wifi_ssid.as_str().to_string(),
            wifi_password: config.wifi_password.as_str().to_string(),
            ip: render_address(config.ip),
            subnet_mask: render_address(config.subnet_mask),
            gateway: render_address(config.gateway),
            dns: render_address(config.dns),
            mqtt_server_name: config.mqtt_server.as_str().to_string(),
            mqtt_user_name: config.mqtt_username.as_str().to_string(),
            mqtt_password: config.mqtt_password.as_str().to_string(),
            mqtt_port: config.mqtt_port,
            mqtt_fingerprint: config
                .mqtt_fingerprint
                .map(|f| f.to_vec())
                .unwrap_or_default(),
        }
    }
}

/// Empty means "use DHCP".
fn parse_address(value: &str, field: &'static str) -> Result<Option<Ipv4Addr>, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    match value.parse::<Ipv4Addr>() {
        Ok(addr) if addr.is_unspecified() => Ok(None),
        Ok(addr) => Ok(Some(addr)),
        Err(_) => Err(ConfigError::InvalidField(field)),
    }
}

fn render_address(addr: Option<Ipv4Addr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_default()
}
