//! The `direct` command - attaches a TUN/TAP device straight to the stack.

use super::{load_config, parse_addr, parse_mac, parse_port};
use clap::Args;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::info;
use tunrelay_core::{LinkMode, MacAddress};
use tunrelay_net::{FrameIO, NetStack, StackConfig, TunDevice};

#[derive(Args)]
pub struct DirectArgs {
    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Name of the TUN/TAP interface
    #[arg(long = "dev", short = 'd')]
    name: Option<String>,

    /// Open the interface as TAP (Ethernet frames) instead of TUN
    #[arg(long)]
    tap: bool,

    /// MAC address of the stack on a TAP link
    #[arg(long, value_parser = parse_mac)]
    mac: Option<MacAddress>,

    /// Address to serve HTTP on (IPv4 or IPv6)
    #[arg(long, value_parser = parse_addr)]
    addr: Option<IpAddr>,

    /// Port to serve HTTP on
    #[arg(long, value_parser = parse_port)]
    port: Option<u16>,
}

pub async fn run(args: DirectArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_ref())?;

    let name = args
        .name
        .or(config.device.name)
        .ok_or_else(|| anyhow::anyhow!("--dev is required"))?;
    let address = args
        .addr
        .or(config.stack.address)
        .ok_or_else(|| anyhow::anyhow!("--addr is required"))?;
    let port = args
        .port
        .or(config.stack.port)
        .ok_or_else(|| anyhow::anyhow!("--port is required"))?;
    let mac = args.mac.unwrap_or(config.stack.mac);
    let mode = LinkMode::from_tap_flag(args.tap || config.device.tap);

    let device = TunDevice::open(&name, mode)?;
    info!(device = %name, mtu = device.mtu(), "attaching device to stack");
    let stack = NetStack::new(device, StackConfig { address, port, mac })?;
    info!(address = %stack.address(), port = stack.port(), "serving HTTP");

    let shutdown = crate::shutdown::on_signal()?;
    stack.run(shutdown).await;
    Ok(())
}
