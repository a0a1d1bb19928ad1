pub mod config;
pub mod error;
pub mod types;

pub use config::{DeviceSection, RelayConfig, StackSection};
pub use error::{Error, Result};
pub use types::{
    DEFAULT_MAC, DEFAULT_MTU, DEFAULT_QUEUE_CAPACITY, DEFAULT_SOCKET_PATH, ETHERNET_HEADER_LEN, Framing,
    LinkMode,
    MAX_FRAME_SIZE, MacAddress, NetworkProtocol, parse_ip,
};
