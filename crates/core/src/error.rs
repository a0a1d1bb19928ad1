/// Errors raised while parsing or validating tunrelay configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid MAC address '{0}'")]
    InvalidMac(String),

    #[error("invalid IP address '{0}'")]
    InvalidAddress(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
