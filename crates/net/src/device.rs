use crate::FrameIO;
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;
use std::io;
use std::task::{Context, Poll};
use tunrelay_core::{ETHERNET_HEADER_LEN, MAX_FRAME_SIZE};

/// Wraps a FrameIO to implement smoltcp's Device trait.
pub struct SmoltcpDevice<F: FrameIO> {
    frame_io: F,
    medium: Medium,
    rx_buffer: Vec<u8>,
    rx_len: Option<usize>,
    tx_buffer: Vec<u8>,
}

impl<F: FrameIO> SmoltcpDevice<F> {
    pub fn new(frame_io: F) -> Self {
        let mtu = frame_io.mtu();
        let medium = if frame_io.link_mode().has_ethernet_header() {
            Medium::Ethernet
        } else {
            Medium::Ip
        };
        Self {
            frame_io,
            medium,
            rx_buffer: vec![0u8; mtu + ETHERNET_HEADER_LEN],
            rx_len: None,
            tx_buffer: vec![0u8; mtu + ETHERNET_HEADER_LEN],
        }
    }

    pub fn medium(&self) -> Medium {
        self.medium
    }

    /// Poll for an incoming frame. Call this before each smoltcp poll.
    ///
    /// Only errors that mean the link is gone are returned; a bad frame is
    /// logged and skipped.
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if self.rx_len.is_some() {
            return Ok(()); // Already have a pending frame
        }

        match self.frame_io.poll_recv(cx, &mut self.rx_buffer) {
            Poll::Ready(Ok(len)) => {
                self.rx_len = Some(len);
            }
            Poll::Ready(Err(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
                ) =>
            {
                return Err(e);
            }
            Poll::Ready(Err(e)) => {
                tracing::warn!("Frame receive error: {}", e);
            }
            Poll::Pending => {}
        }
        Ok(())
    }

    /// Check if there's a pending frame to process.
    pub fn has_pending_rx(&self) -> bool {
        self.rx_len.is_some()
    }
}

impl<F: FrameIO> Device for SmoltcpDevice<F> {
    type RxToken<'a>
        = SmoltcpRxToken<'a>
    where
        Self: 'a;
    type TxToken<'a>
        = SmoltcpTxToken<'a, F>
    where
        Self: 'a;

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        // smoltcp counts the Ethernet header as part of the MTU. Whole frames
        // must still fit the relay's frame limit.
        let link_frame = match self.medium {
            Medium::Ethernet => self.frame_io.mtu() + ETHERNET_HEADER_LEN,
            _ => self.frame_io.mtu(),
        };
        caps.max_transmission_unit = link_frame.min(MAX_FRAME_SIZE);
        caps.medium = self.medium;
        caps
    }

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let len = self.rx_len.take()?;

        let rx_token = SmoltcpRxToken {
            buffer: &self.rx_buffer[..len],
        };
        let tx_token = SmoltcpTxToken {
            frame_io: &mut self.frame_io,
            buffer: &mut self.tx_buffer,
        };

        Some((rx_token, tx_token))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(SmoltcpTxToken {
            frame_io: &mut self.frame_io,
            buffer: &mut self.tx_buffer,
        })
    }
}

/// Receive token for smoltcp.
pub struct SmoltcpRxToken<'a> {
    buffer: &'a [u8],
}

impl RxToken for SmoltcpRxToken<'_> {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(self.buffer)
    }
}

/// Transmit token for smoltcp.
pub struct SmoltcpTxToken<'a, F: FrameIO> {
    frame_io: &'a mut F,
    buffer: &'a mut Vec<u8>,
}

impl<F: FrameIO> TxToken for SmoltcpTxToken<'_, F> {
    fn consume<R, Func>(self, len: usize, f: Func) -> R
    where
        Func: FnOnce(&mut [u8]) -> R,
    {
        if self.buffer.len() < len {
            self.buffer.resize(len, 0);
        }
        let buf = &mut self.buffer[..len];
        let result = f(buf);
        if let Err(e) = self.frame_io.send(buf) {
            tracing::warn!("Frame send error: {}", e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{ChannelEndpoint, EndpointConfig};
    use bytes::Bytes;
    use tunrelay_core::{LinkMode, NetworkProtocol};

    fn endpoint(mode: LinkMode) -> ChannelEndpoint {
        ChannelEndpoint::new(EndpointConfig {
            mtu: 1500,
            mode,
            ..EndpointConfig::default()
        })
    }

    #[test]
    fn medium_follows_link_mode() {
        let tun = SmoltcpDevice::new(endpoint(LinkMode::Tun).stack_port());
        assert_eq!(tun.medium(), Medium::Ip);
        assert_eq!(tun.capabilities().max_transmission_unit, 1500);

        let tap = SmoltcpDevice::new(endpoint(LinkMode::Tap).stack_port());
        assert_eq!(tap.medium(), Medium::Ethernet);
        assert_eq!(tap.capabilities().max_transmission_unit, 1514);
    }

    #[test]
    fn tap_frames_never_exceed_relay_frame_size() {
        let endpoint = ChannelEndpoint::new(EndpointConfig {
            mtu: MAX_FRAME_SIZE,
            mode: LinkMode::Tap,
            ..EndpointConfig::default()
        });
        let device = SmoltcpDevice::new(endpoint.stack_port());
        assert_eq!(device.capabilities().max_transmission_unit, MAX_FRAME_SIZE);

        let tun = SmoltcpDevice::new(
            ChannelEndpoint::new(EndpointConfig {
                mtu: MAX_FRAME_SIZE,
                mode: LinkMode::Tun,
                ..EndpointConfig::default()
            })
            .stack_port(),
        );
        assert_eq!(tun.capabilities().max_transmission_unit, MAX_FRAME_SIZE);
    }

    #[test]
    fn pending_frame_is_handed_to_smoltcp_once() {
        let endpoint = endpoint(LinkMode::Tun);
        let mut device = SmoltcpDevice::new(endpoint.stack_port());
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        endpoint.inject(Bytes::from_static(&[0x45; 20]), NetworkProtocol::Ipv4);
        device.poll_recv(&mut cx).unwrap();
        assert!(device.has_pending_rx());

        let len = {
            let (rx, _tx) = device.receive(Instant::from_millis(0)).unwrap();
            rx.consume(|frame| frame.len())
        };
        assert_eq!(len, 20);
        assert!(!device.has_pending_rx());
        assert!(device.receive(Instant::from_millis(0)).is_none());
    }

    #[test]
    fn transmitted_frames_reach_the_endpoint() {
        let endpoint = endpoint(LinkMode::Tun);
        let mut device = SmoltcpDevice::new(endpoint.stack_port());

        let tx = device.transmit(Instant::from_millis(0)).unwrap();
        tx.consume(4, |buf| buf.copy_from_slice(b"ping"));

        assert_eq!(endpoint.stats().outbound_queued, 1);
    }

    #[test]
    fn closed_link_is_reported() {
        let endpoint = endpoint(LinkMode::Tun);
        let mut device = SmoltcpDevice::new(endpoint.stack_port());
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        endpoint.close();
        let err = device.poll_recv(&mut cx).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
