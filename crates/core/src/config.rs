//! Relay configuration file.
//!
//! Every field has a default so a partial file (or none at all) is valid.
//! Command-line flags override whatever the file provides.

use crate::error::{Error, Result};
use crate::types::{
    DEFAULT_MTU, DEFAULT_QUEUE_CAPACITY, DEFAULT_SOCKET_PATH, ETHERNET_HEADER_LEN, Framing,
    LinkMode, MAX_FRAME_SIZE, MacAddress,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Smallest MTU an IPv4 host must accept.
const MIN_MTU: usize = 576;

const DEFAULT_MAX_CONNECTIONS: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    /// Unix socket shared by the device and stack processes.
    pub socket_path: PathBuf,
    pub framing: Framing,
    /// Upper bound on concurrently bridged connections.
    pub max_connections: usize,
    pub device: DeviceSection,
    pub stack: StackSection,
}

/// Settings for the process that owns the TUN/TAP device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceSection {
    pub name: Option<String>,
    pub tap: bool,
}

/// Settings for the process that owns the virtual NIC and protocol stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StackSection {
    pub mac: MacAddress,
    pub mtu: usize,
    pub queue_capacity: usize,
    pub address: Option<IpAddr>,
    pub port: Option<u16>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            framing: Framing::default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            device: DeviceSection::default(),
            stack: StackSection::default(),
        }
    }
}

impl Default for StackSection {
    fn default() -> Self {
        Self {
            mac: MacAddress::default(),
            mtu: DEFAULT_MTU,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            address: None,
            port: None,
        }
    }
}

impl RelayConfig {
    /// Load and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.stack.queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "stack.queue_capacity must be at least 1".to_string(),
            ));
        }
        if !(MIN_MTU..=MAX_FRAME_SIZE).contains(&self.stack.mtu) {
            return Err(Error::InvalidConfig(format!(
                "stack.mtu must be between {MIN_MTU} and {MAX_FRAME_SIZE}"
            )));
        }
        if self.stack.mac.is_multicast() {
            return Err(Error::InvalidConfig(format!(
                "stack.mac {} is a multicast address",
                self.stack.mac
            )));
        }
        if self.socket_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("socket_path cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn link_mode(&self) -> LinkMode {
        LinkMode::from_tap_flag(self.device.tap)
    }

    /// MTU to give the virtual NIC.
    ///
    /// On a TAP link the Ethernet header travels inside the same
    /// `MAX_FRAME_SIZE` frame, so the configured MTU is clamped to leave
    /// room for it.
    pub fn link_mtu(&self) -> usize {
        if self.link_mode().has_ethernet_header() {
            self.stack.mtu.min(MAX_FRAME_SIZE - ETHERNET_HEADER_LEN)
        } else {
            self.stack.mtu
        }
    }
}
