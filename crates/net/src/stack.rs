//! Userspace TCP/IP stack serving the HTTP demo.
//!
//! `NetStack` drives a smoltcp interface over any `FrameIO`: the stack side
//! of a `ChannelEndpoint` when frames arrive through the relay, or a
//! `TunDevice` when the device is attached directly.

use crate::device::SmoltcpDevice;
use crate::error::NetError;
use crate::frame_io::FrameIO;

use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::Medium;
use smoltcp::socket::tcp;
use smoltcp::time::Instant;
use smoltcp::wire::{EthernetAddress, HardwareAddress, IpAddress, IpCidr};

use std::io;
use std::net::IpAddr;
use std::task::Context;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tunrelay_core::MacAddress;

/// Number of TCP sockets listening on the HTTP port at once.
pub const HTTP_LISTEN_BACKLOG: usize = 4;

const SOCKET_BUFFER_SIZE: usize = 8192;
const MAX_REQUEST_SIZE: usize = 8192;
const MIN_IPV4_MTU: usize = 576;
const MIN_IPV6_MTU: usize = 1280;

/// Inbound frames handled per poll before yielding back to the timer.
const FRAMES_PER_POLL: usize = 64;

const HTTP_BODY: &str = "Hello from tunrelay!\n";

/// Configuration for the userspace stack.
#[derive(Clone, Debug)]
pub struct StackConfig {
    /// Address the stack answers on.
    pub address: IpAddr,
    /// TCP port of the HTTP listener.
    pub port: u16,
    /// Hardware address used on TAP links.
    pub mac: MacAddress,
}

struct HttpSlot {
    handle: SocketHandle,
    request: Vec<u8>,
    response: Option<Vec<u8>>,
    sent: usize,
}

impl HttpSlot {
    fn reset(&mut self) {
        self.request.clear();
        self.response = None;
        self.sent = 0;
    }
}

/// smoltcp interface plus the HTTP sockets bound to it.
pub struct NetStack<F: FrameIO> {
    device: SmoltcpDevice<F>,
    iface: Interface,
    sockets: SocketSet<'static>,
    http: Vec<HttpSlot>,
    config: StackConfig,
    start_time: std::time::Instant,
}

impl<F: FrameIO> NetStack<F> {
    /// Create the interface, assign the address and start listening.
    pub fn new(frame_io: F, config: StackConfig) -> Result<Self, NetError> {
        validate(&config, frame_io.mtu())?;

        let mut device = SmoltcpDevice::new(frame_io);
        let start_time = std::time::Instant::now();

        let hw_addr = match device.medium() {
            Medium::Ethernet => HardwareAddress::Ethernet(EthernetAddress(config.mac.octets())),
            _ => HardwareAddress::Ip,
        };
        let mut iface = Interface::new(Config::new(hw_addr), &mut device, smoltcp_now(start_time));

        // A zero-length prefix makes every peer on-link, which stands in for
        // a default route through this interface.
        let cidr = IpCidr::new(ip_address(config.address), 0);
        let mut pushed = Ok(());
        iface.update_ip_addrs(|addrs| pushed = addrs.push(cidr));
        pushed.map_err(|_| NetError::StackConfig(format!("cannot add address {}", config.address)))?;

        let mut sockets = SocketSet::new(vec![]);
        let mut http = Vec::with_capacity(HTTP_LISTEN_BACKLOG);
        for _ in 0..HTTP_LISTEN_BACKLOG {
            let mut socket = tcp::Socket::new(
                tcp::SocketBuffer::new(vec![0u8; SOCKET_BUFFER_SIZE]),
                tcp::SocketBuffer::new(vec![0u8; SOCKET_BUFFER_SIZE]),
            );
            socket.listen(config.port).map_err(|e| {
                NetError::StackConfig(format!("cannot listen on port {}: {e:?}", config.port))
            })?;
            http.push(HttpSlot {
                handle: sockets.add(socket),
                request: Vec::new(),
                response: None,
                sent: 0,
            });
        }

        tracing::info!(
            address = %config.address,
            port = config.port,
            medium = ?device.medium(),
            "network stack listening"
        );

        Ok(Self {
            device,
            iface,
            sockets,
            http,
            config,
            start_time,
        })
    }

    pub fn address(&self) -> IpAddr {
        self.config.address
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Drain available inbound frames, advance the interface and service the
    /// HTTP sockets.
    ///
    /// Returns an error only when the underlying link has gone away.
    pub fn poll_once(&mut self) -> io::Result<()> {
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        for _ in 0..FRAMES_PER_POLL {
            self.device.poll_recv(&mut cx)?;
            let had_frame = self.device.has_pending_rx();

            let timestamp = smoltcp_now(self.start_time);
            self.iface.poll(timestamp, &mut self.device, &mut self.sockets);
            self.serve_http();

            if !had_frame {
                break;
            }
        }

        // Flush what the HTTP handlers queued during the last pass.
        let timestamp = smoltcp_now(self.start_time);
        self.iface.poll(timestamp, &mut self.device, &mut self.sockets);
        Ok(())
    }

    /// Run the stack until `shutdown` fires or the link closes.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_millis(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("network stack shutting down");
                    return;
                }
                _ = interval.tick() => {}
            }

            if let Err(e) = self.poll_once() {
                tracing::info!(error = %e, "link closed, stopping network stack");
                return;
            }
        }
    }

    fn serve_http(&mut self) {
        for slot in &mut self.http {
            let socket = self.sockets.get_mut::<tcp::Socket>(slot.handle);

            if !socket.is_open() {
                slot.reset();
                if let Err(e) = socket.listen(self.config.port) {
                    tracing::warn!(error = ?e, "failed to re-listen HTTP socket");
                }
                continue;
            }

            if slot.response.is_none() && socket.can_recv() {
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.recv_slice(&mut buf) {
                    if n == 0 {
                        break;
                    }
                    slot.request.extend_from_slice(&buf[..n]);
                }

                if let Some(response) = respond(&slot.request) {
                    tracing::debug!(
                        remote = ?socket.remote_endpoint(),
                        request_line = %request_line(&slot.request),
                        "serving HTTP request"
                    );
                    slot.response = Some(response);
                }
            }

            if slot.response.is_none() && !socket.may_recv() && socket.may_send() {
                // Peer finished sending without a complete request.
                socket.close();
                continue;
            }

            if let Some(response) = &slot.response {
                if slot.sent < response.len() && socket.can_send() {
                    match socket.send_slice(&response[slot.sent..]) {
                        Ok(n) => slot.sent += n,
                        Err(e) => {
                            tracing::warn!(error = ?e, "HTTP send failed");
                            socket.abort();
                            continue;
                        }
                    }
                }
                if slot.sent == response.len() && socket.may_send() {
                    socket.close();
                }
            }
        }
    }
}

fn validate(config: &StackConfig, mtu: usize) -> Result<(), NetError> {
    if config.address.is_unspecified() {
        return Err(NetError::StackConfig(format!(
            "cannot bind to unspecified address {}",
            config.address
        )));
    }
    if config.port == 0 {
        return Err(NetError::StackConfig("HTTP port must not be 0".to_string()));
    }
    let min_mtu = match config.address {
        IpAddr::V4(_) => MIN_IPV4_MTU,
        IpAddr::V6(_) => MIN_IPV6_MTU,
    };
    if mtu < min_mtu {
        return Err(NetError::StackConfig(format!(
            "link MTU {mtu} is below the minimum of {min_mtu} for {}",
            config.address
        )));
    }
    Ok(())
}

/// Build the response once the request headers are complete.
fn respond(request: &[u8]) -> Option<Vec<u8>> {
    let complete = request.windows(4).any(|w| w == b"\r\n\r\n");
    if !complete && request.len() < MAX_REQUEST_SIZE {
        return None;
    }

    let (status, body) = if complete {
        ("200 OK", HTTP_BODY)
    } else {
        ("431 Request Header Fields Too Large", "")
    };
    Some(
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
        .into_bytes(),
    )
}

fn request_line(request: &[u8]) -> String {
    let end = request
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(request.len());
    String::from_utf8_lossy(&request[..end]).into_owned()
}

fn ip_address(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(v4) => IpAddress::Ipv4(v4),
        IpAddr::V6(v6) => IpAddress::Ipv6(v6),
    }
}

/// Convert system time to smoltcp Instant
fn smoltcp_now(start: std::time::Instant) -> Instant {
    let elapsed = start.elapsed();
    Instant::from_millis(elapsed.as_millis() as i64)
}
