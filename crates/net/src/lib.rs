//! Frame relay between TUN/TAP devices, Unix-domain sockets and a
//! userspace network stack.

mod bridge;
mod device;
mod endpoint;
mod error;
mod frame_io;
mod multiplexer;
mod pump;
mod stack;
mod transport;

#[cfg(target_os = "linux")]
mod tun;

pub use bridge::{BridgeReport, BridgedConnection};
pub use device::SmoltcpDevice;
pub use endpoint::{
    ChannelEndpoint, EndpointConfig, EndpointInjector, EndpointReader, EndpointStats,
    InboundFrame, ReadOutcome, StackPort,
};
pub use error::NetError;
pub use frame_io::{Frame, FrameIO, FrameSink, FrameSource};
pub use multiplexer::{Multiplexer, MultiplexerOptions};
pub use pump::{PumpExit, PumpReport, pump_from_transport, pump_to_transport};
pub use stack::{HTTP_LISTEN_BACKLOG, NetStack, StackConfig};
pub use transport::{
    Acceptor, FrameCodec, FrameConnection, FrameListener, FrameReader, FrameWriter,
};

#[cfg(target_os = "linux")]
pub use tun::{TunDevice, interface_mtu};
