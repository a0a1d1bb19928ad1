use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("failed to open virtual interface '{name}': {source}")]
    DeviceOpen { name: String, source: io::Error },

    #[error("failed to listen on {}: {source}", path.display())]
    TransportListen { path: PathBuf, source: io::Error },

    #[error("failed to connect to {}: {source}", path.display())]
    TransportConnect { path: PathBuf, source: io::Error },

    #[error("failed to accept transport connection: {0}")]
    TransportAccept(io::Error),

    #[error("network stack configuration error: {0}")]
    StackConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
