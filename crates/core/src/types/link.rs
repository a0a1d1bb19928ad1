use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;

/// Which flavour of virtual interface a device is opened as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Raw IP packets, no link-layer header.
    #[default]
    Tun,
    /// Ethernet frames including the 14-byte link-layer header.
    Tap,
}

impl LinkMode {
    pub fn from_tap_flag(tap: bool) -> Self {
        if tap { Self::Tap } else { Self::Tun }
    }

    /// Whether frames on this link carry an Ethernet header.
    pub fn has_ethernet_header(self) -> bool {
        matches!(self, Self::Tap)
    }
}

/// Network-layer protocol tagged onto frames injected into the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkProtocol {
    Ipv4,
    Ipv6,
}

impl NetworkProtocol {
    /// Protocol matching the family of `addr`.
    ///
    /// IPv4-mapped IPv6 addresses count as IPv4.
    pub fn of(addr: IpAddr) -> Self {
        match addr.to_canonical() {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }
}

/// Parse a bind address, auto-detecting the IP family.
pub fn parse_ip(s: &str) -> Result<IpAddr, Error> {
    IpAddr::from_str(s)
        .map(|addr| addr.to_canonical())
        .map_err(|_| Error::InvalidAddress(s.to_string()))
}

/// How frames are delimited on the Unix socket transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// Every frame is preceded by a 4-byte big-endian length.
    #[default]
    LengthPrefixed,
    /// One read is taken to be one frame, as long as both peers write
    /// whole frames no larger than the shared buffer size.
    Unframed,
}

impl FromStr for Framing {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "length-prefixed" => Ok(Self::LengthPrefixed),
            "unframed" => Ok(Self::Unframed),
            other => Err(Error::InvalidConfig(format!(
                "unknown framing '{other}', expected 'length-prefixed' or 'unframed'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn protocol_detects_family() {
        assert_eq!(
            NetworkProtocol::of(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))),
            NetworkProtocol::Ipv4
        );
        assert_eq!(
            NetworkProtocol::of(IpAddr::V6(Ipv6Addr::LOCALHOST)),
            NetworkProtocol::Ipv6
        );
    }

    #[test]
    fn mapped_ipv6_is_ipv4() {
        let addr = parse_ip("::ffff:10.0.0.1").unwrap();
        assert_eq!(addr, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(NetworkProtocol::of(addr), NetworkProtocol::Ipv4);
    }

    #[test]
    fn rejects_garbage_address() {
        assert!(matches!(parse_ip("not-an-ip"), Err(Error::InvalidAddress(_))));
    }

    #[test]
    fn tap_flag_selects_mode() {
        assert_eq!(LinkMode::from_tap_flag(true), LinkMode::Tap);
        assert_eq!(LinkMode::from_tap_flag(false), LinkMode::Tun);
        assert!(LinkMode::Tap.has_ethernet_header());
        assert!(!LinkMode::Tun.has_ethernet_header());
    }

    #[test]
    fn framing_parses() {
        assert_eq!(
            "length-prefixed".parse::<Framing>().unwrap(),
            Framing::LengthPrefixed
        );
        assert_eq!("unframed".parse::<Framing>().unwrap(), Framing::Unframed);
        assert!("lines".parse::<Framing>().is_err());
    }
}
