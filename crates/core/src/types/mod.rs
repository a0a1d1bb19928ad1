mod link;
mod mac;

pub use link::{Framing, LinkMode, NetworkProtocol, parse_ip};
pub use mac::{DEFAULT_MAC, MacAddress};

/// Largest frame carried across the relay, in bytes.
pub const MAX_FRAME_SIZE: usize = 4096;

/// Link-layer header carried by every frame on a TAP link.
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Default MTU advertised by the virtual NIC endpoint.
pub const DEFAULT_MTU: usize = 4096;

/// Default depth of the endpoint's inbound and outbound queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Well-known path of the Unix socket shared by both relay processes.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/tunrelay.sock";
