//! The `stack` command - serves the userspace stack on the relay socket.

use super::{SocketArgs, parse_addr, parse_mac, parse_port};
use anyhow::Context;
use clap::Args;
use std::net::IpAddr;
use tracing::{info, warn};
use tunrelay_core::{MacAddress, NetworkProtocol, RelayConfig};
use tunrelay_net::{
    ChannelEndpoint, EndpointConfig, FrameListener, Multiplexer, MultiplexerOptions, NetStack,
    StackConfig,
};

#[derive(Args)]
pub struct StackArgs {
    #[command(flatten)]
    socket: SocketArgs,

    /// MAC address of the virtual NIC
    #[arg(long, value_parser = parse_mac)]
    mac: Option<MacAddress>,

    /// Address to serve HTTP on (IPv4 or IPv6)
    #[arg(long, value_parser = parse_addr)]
    addr: Option<IpAddr>,

    /// Port to serve HTTP on
    #[arg(long, value_parser = parse_port)]
    port: Option<u16>,

    /// Link MTU of the virtual NIC
    #[arg(long)]
    mtu: Option<usize>,

    /// Frames the virtual NIC queues in each direction
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Maximum number of relay connections served at once
    #[arg(long)]
    max_connections: Option<usize>,

    /// Expect Ethernet frames (the device side runs with --tap)
    #[arg(long)]
    tap: bool,
}

impl StackArgs {
    fn apply(&self, config: &mut RelayConfig) {
        if let Some(mac) = self.mac {
            config.stack.mac = mac;
        }
        if let Some(addr) = self.addr {
            config.stack.address = Some(addr);
        }
        if let Some(port) = self.port {
            config.stack.port = Some(port);
        }
        if let Some(mtu) = self.mtu {
            config.stack.mtu = mtu;
        }
        if let Some(queue_capacity) = self.queue_capacity {
            config.stack.queue_capacity = queue_capacity;
        }
        if let Some(max_connections) = self.max_connections {
            config.max_connections = max_connections;
        }
        config.device.tap |= self.tap;
    }
}

pub async fn run(args: StackArgs) -> anyhow::Result<()> {
    let mut config = args.socket.resolve()?;
    args.apply(&mut config);
    config.validate()?;

    let address = config
        .stack
        .address
        .ok_or_else(|| anyhow::anyhow!("--addr is required"))?;
    let port = config
        .stack
        .port
        .ok_or_else(|| anyhow::anyhow!("--port is required"))?;

    let mtu = config.link_mtu();
    if mtu != config.stack.mtu {
        warn!(
            requested = config.stack.mtu,
            mtu, "link MTU lowered to fit Ethernet frames"
        );
    }
    let endpoint = ChannelEndpoint::new(EndpointConfig {
        mac: config.stack.mac,
        mtu,
        queue_capacity: config.stack.queue_capacity,
        mode: config.link_mode(),
    });
    let stack = NetStack::new(
        endpoint.stack_port(),
        StackConfig {
            address,
            port,
            mac: config.stack.mac,
        },
    )?;

    let listener = FrameListener::bind(&config.socket_path, config.framing)?;
    info!(
        socket = %config.socket_path.display(),
        framing = ?config.framing,
        mac = %config.stack.mac,
        address = %stack.address(),
        port = stack.port(),
        "waiting for device connections"
    );

    let multiplexer = Multiplexer::new(
        endpoint.clone(),
        NetworkProtocol::of(address),
        MultiplexerOptions {
            max_connections: config.max_connections,
            ..MultiplexerOptions::default()
        },
    );

    let shutdown = crate::shutdown::on_signal()?;
    let stack_task = tokio::spawn(stack.run(shutdown.child_token()));

    let served = multiplexer.serve(&listener, shutdown.clone()).await;

    shutdown.cancel();
    endpoint.close();
    if let Err(e) = stack_task.await {
        tracing::warn!(error = %e, "network stack task failed");
    }
    drop(listener);

    let stats = endpoint.stats();
    info!(
        inbound = stats.inbound_injected,
        inbound_dropped = stats.inbound_dropped,
        outbound = stats.outbound_queued,
        outbound_dropped = stats.outbound_dropped,
        "stack stopped"
    );

    served.context("relay listener failed")
}
