//! Versioned node configuration with rotated backups
//!
//! The live [`Config`] is loaded at boot from `/config.json`. It only changes
//! through [`ConfigManager::apply_update`], which accepts a candidate whose
//! version is strictly greater than the current one. Every accepted update
//! is saved after rotating the previous five generations:
//!
//! ```text
//! /config_4.json -> /config_5.json   (old 5 discarded)
//! /config_3.json -> /config_4.json
//! /config_2.json -> /config_3.json
//! /config_1.json -> /config_2.json
//! /config.json   -> /config_1.json
//! new            -> /config.json
//! ```

mod document;
mod files;

pub use document::ConfigDocument;
pub use files::*;

use alloc::vec::Vec;
use core::fmt::{self, Write};
use core::net::Ipv4Addr;

use heapless::String;
use log::{debug, info, warn};
use thiserror_no_std::Error;

/// Number of backup generations kept next to the primary file.
pub const MAX_BACKUPS: u8 = 5;

/// Length of the broker certificate fingerprint (SHA-1).
pub const FINGERPRINT_LEN: usize = 20;

pub const PRIMARY_FILE: &str = "/config.json";

pub type DeviceName = String<16>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("config generation {0} does not exist")]
    NotFound(u8),
    #[error("config generation {0} is out of range")]
    InvalidGeneration(u8),
    #[error("unable to parse config: {0}")]
    Parse(String<64>),
    #[error("config field {0} is missing")]
    MissingField(&'static str),
    #[error("config field {0} is malformed")]
    InvalidField(&'static str),
    #[error("config file system error: {0}")]
    Storage(FileError),
}

impl From<FileError> for ConfigError {
    fn from(e: FileError) -> Self {
        Self::Storage(e)
    }
}

/// Node configuration. String fields have fixed capacities; longer input is truncated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Config {
    /// Strictly increasing with every accepted update.
    pub version: u16,
    /// Empty until filled from the MAC address at setup.
    pub device_name: DeviceName,
    pub wifi_ssid: String<16>,
    pub wifi_password: String<16>,
    /// Static address; `None` means DHCP.
    pub ip: Option<Ipv4Addr>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
    pub mqtt_server: String<32>,
    pub mqtt_username: String<16>,
    pub mqtt_password: String<32>,
    pub mqtt_port: u16,
    /// Broker certificate pin; `None` accepts any certificate.
    pub mqtt_fingerprint: Option<[u8; FINGERPRINT_LEN]>,
}

impl Config {
    /// Parse a JSON document into a validated config.
    pub fn from_json(json: &[u8]) -> Result<Self, ConfigError> {
        ConfigDocument::parse(json)?.into_config()
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ConfigError> {
        ConfigDocument::from(self).to_json()
    }

    pub fn to_document(&self) -> ConfigDocument {
        ConfigDocument::from(self)
    }

    /// Static network settings, when an address is configured.
    pub fn static_ip(&self) -> Option<StaticIp> {
        self.ip.map(|address| StaticIp {
            address,
            subnet_mask: self.subnet_mask.unwrap_or(Ipv4Addr::new(255, 255, 255, 0)),
            gateway: self.gateway,
            dns: self.dns,
        })
    }

    /// Fill an empty device name with the compact MAC form. Returns true if it changed.
    pub fn default_device_name(&mut self, mac: &[u8; 6]) -> bool {
        if !self.device_name.is_empty() {
            return false;
        }
        self.device_name = truncated(crate::platform::mac_to_compact(mac).as_str());
        true
    }
}

/// Passwords are never rendered.
impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "v{} device={} ssid={} wifi_password=<hidden> ip={} mqtt={}:{} user={} mqtt_password=<hidden> fingerprint={}",
            self.version,
            self.device_name,
            self.wifi_ssid,
            AddressOrDhcp(self.ip),
            self.mqtt_server,
            self.mqtt_port,
            self.mqtt_username,
            if self.mqtt_fingerprint.is_some() { "pinned" } else { "none" },
        )
    }
}

struct AddressOrDhcp(Option<Ipv4Addr>);

impl fmt::Display for AddressOrDhcp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{addr}"),
            None => f.write_str("dhcp"),
        }
    }
}

/// Static IPv4 settings handed to the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticIp {
    pub address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Option<Ipv4Addr>,
}

/// Copy `value` into a fixed-capacity string, cutting on a char boundary.
pub fn truncated<const N: usize>(value: &str) -> String<N> {
    let mut out = String::new();
    for ch in value.chars() {
        if out.push(ch).is_err() {
            break;
        }
    }
    out
}

/// File name of a config generation: 0 is the primary, 1..=5 the backups.
pub fn generation_file(generation: u8) -> Result<String<24>, ConfigError> {
    if generation > MAX_BACKUPS {
        return Err(ConfigError::InvalidGeneration(generation));
    }
    let mut name = String::new();
    if generation == 0 {
        let _ = name.push_str(PRIMARY_FILE);
    } else {
        let _ = write!(name, "/config_{generation}.json");
    }
    Ok(name)
}

/// Outcome of [`ConfigManager::apply_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Candidate became the live config and was saved.
    Accepted { previous: Config },
    /// Candidate version was not newer; nothing changed.
    Rejected { current: u16, offered: u16 },
}

/// Owns the live config and its files.
pub struct ConfigManager<F: FileStore> {
    files: F,
    config: Config,
}

impl<F: FileStore> ConfigManager<F> {
    /// Start with an empty (version 0) config; call [`load`](Self::load) next.
    pub fn new(files: F) -> Self {
        Self {
            files,
            config: Config::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn files(&self) -> &F {
        &self.files
    }

    pub fn files_mut(&mut self) -> &mut F {
        &mut self.files
    }

    pub fn into_files(self) -> F {
        self.files
    }

    /// Read a generation from storage without touching the live config.
    pub fn read_generation(&mut self, generation: u8) -> Result<Config, ConfigError> {
        let name = generation_file(generation)?;
        if !self.files.exists(&name) {
            return Err(ConfigError::NotFound(generation));
        }
        let json = self.files.read(&name)?;
        Config::from_json(&json)
    }

    /// Replace the live config with generation `generation` (0 = primary).
    ///
    /// Any failure leaves the live config untouched.
    pub fn load(&mut self, generation: u8) -> Result<(), ConfigError> {
        let config = self.read_generation(generation)?;
        debug!("Loaded config generation {}: {}", generation, config);
        self.config = config;
        Ok(())
    }

    /// Load the primary file, falling back to the newest readable backup.
    ///
    /// Returns the generation that was loaded.
    pub fn load_newest(&mut self) -> Result<u8, ConfigError> {
        let mut first_error = None;
        for generation in 0..=MAX_BACKUPS {
            match self.load(generation) {
                Ok(()) => {
                    if generation != 0 {
                        warn!("Primary config unusable, running on backup {}", generation);
                    }
                    return Ok(generation);
                }
                Err(e) => {
                    debug!("Config generation {} unusable: {}", generation, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        Err(first_error.unwrap_or(ConfigError::NotFound(0)))
    }

    /// Rotate the backups and write the live config as the new primary.
    pub fn save(&mut self) -> Result<(), ConfigError> {
        let json = self.config.to_json()?;

        let oldest = generation_file(MAX_BACKUPS)?;
        if self.files.exists(&oldest) {
            self.files.remove(&oldest)?;
        }
        for generation in (0..MAX_BACKUPS).rev() {
            let from = generation_file(generation)?;
            if self.files.exists(&from) {
                let to = generation_file(generation + 1)?;
                self.files.rename(&from, &to)?;
            }
        }

        self.files.write(PRIMARY_FILE, &json)?;
        info!("Config version {} saved", self.config.version);
        Ok(())
    }

    /// Adopt `candidate` if its version is newer than the live one.
    ///
    /// On a storage failure the previous config is restored and the error returned.
    pub fn apply_update(&mut self, candidate: Config) -> Result<UpdateOutcome, ConfigError> {
        if candidate.version <= self.config.version {
            warn!(
                "Config update rejected: version {} is not newer than {}",
                candidate.version, self.config.version
            );
            return Ok(UpdateOutcome::Rejected {
                current: self.config.version,
                offered: candidate.version,
            });
        }

        let previous = core::mem::replace(&mut self.config, candidate);
        if let Err(e) = self.save() {
            self.config = previous;
            return Err(e);
        }

        info!(
            "Config updated from version {} to {}",
            previous.version, self.config.version
        );
        Ok(UpdateOutcome::Accepted { previous })
    }
}
