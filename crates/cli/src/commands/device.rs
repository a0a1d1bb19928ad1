//! The `device` command - bridges a TUN/TAP device to the relay socket.

use super::SocketArgs;
use anyhow::Context;
use clap::Args;
use std::sync::Arc;
use tracing::info;
use tunrelay_core::LinkMode;
use tunrelay_net::{BridgedConnection, FrameConnection, TunDevice};

#[derive(Args)]
pub struct DeviceArgs {
    #[command(flatten)]
    socket: SocketArgs,

    /// Name of the TUN/TAP interface
    #[arg(long = "dev", short = 'd')]
    name: Option<String>,

    /// Open the interface as TAP (Ethernet frames) instead of TUN
    #[arg(long)]
    tap: bool,
}

pub async fn run(args: DeviceArgs) -> anyhow::Result<()> {
    let config = args.socket.resolve()?;
    let name = args
        .name
        .or(config.device.name)
        .ok_or_else(|| anyhow::anyhow!("--dev is required"))?;
    let mode = LinkMode::from_tap_flag(args.tap || config.device.tap);

    let device = TunDevice::open(&name, mode)?;
    let connection = FrameConnection::connect(&config.socket_path, config.framing)
        .await
        .context("is the stack side running?")?;
    info!(
        device = %name,
        socket = %config.socket_path.display(),
        framing = ?config.framing,
        "relaying"
    );

    let shutdown = crate::shutdown::on_signal()?;
    let bridge =
        BridgedConnection::spawn_device(0, connection, Arc::new(device), shutdown.child_token());
    let report = bridge.join().await;

    info!(
        egress = ?report.egress.exit,
        egress_frames = report.egress.frames,
        ingress = ?report.ingress.exit,
        ingress_frames = report.ingress.frames,
        "relay stopped"
    );
    Ok(())
}
