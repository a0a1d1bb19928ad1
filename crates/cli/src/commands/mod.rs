#[cfg(target_os = "linux")]
pub mod device;
#[cfg(target_os = "linux")]
pub mod direct;
pub mod stack;
pub mod version;

use anyhow::Context;
use clap::Args;
use std::net::IpAddr;
use std::path::PathBuf;
use tunrelay_core::{Framing, MacAddress, RelayConfig};

/// Options shared by every subcommand that talks over the relay socket.
#[derive(Args)]
pub struct SocketArgs {
    /// Path to configuration file
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Unix socket path of the relay
    #[arg(long, short)]
    pub socket: Option<PathBuf>,

    /// Transport framing (length-prefixed or unframed)
    #[arg(long)]
    pub framing: Option<Framing>,
}

impl SocketArgs {
    /// Load the config file, if any, and apply the socket overrides.
    pub fn resolve(&self) -> anyhow::Result<RelayConfig> {
        let mut config = load_config(self.config.as_ref())?;
        if let Some(socket) = &self.socket {
            config.socket_path = socket.clone();
        }
        if let Some(framing) = self.framing {
            config.framing = framing;
        }
        config.validate()?;
        Ok(config)
    }
}

pub fn load_config(path: Option<&PathBuf>) -> anyhow::Result<RelayConfig> {
    match path {
        Some(path) => RelayConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(RelayConfig::default()),
    }
}

fn parse_mac(s: &str) -> Result<MacAddress, String> {
    s.parse().map_err(|e| format!("{e}"))
}

fn parse_addr(s: &str) -> Result<IpAddr, String> {
    tunrelay_core::parse_ip(s).map_err(|e| format!("{e}"))
}

fn parse_port(s: &str) -> Result<u16, String> {
    let port: u16 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid port"))?;
    if port == 0 {
        return Err("port must be between 1 and 65535".to_string());
    }
    Ok(port)
}
