//! TUN/TAP character device access.

use crate::error::NetError;
use crate::frame_io::{Frame, FrameIO, FrameSink, FrameSource};
use async_trait::async_trait;
use bytes::BytesMut;
use libc::{IFF_NO_PI, IFF_TAP, IFF_TUN, IFNAMSIZ, c_char, c_int, c_short};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::unix::AsyncFd;
use tunrelay_core::{LinkMode, MAX_FRAME_SIZE};

const TUN_CLONE_DEVICE: &str = "/dev/net/tun";
const TUNSETIFF: libc::Ioctl = 0x400454ca as libc::Ioctl;
const DEFAULT_DEVICE_MTU: usize = 1500;

#[repr(C)]
struct IfReqFlags {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_flags: c_short,
    _padding: [u8; 22],
}

#[repr(C)]
struct IfReqMtu {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_mtu: c_int,
    _padding: [u8; 20],
}

/// An open TUN or TAP device.
///
/// Reads and writes move exactly one frame each. The handle is shared
/// between the two relay directions, so both take `&self`.
pub struct TunDevice {
    name: String,
    mode: LinkMode,
    mtu: usize,
    fd: AsyncFd<OwnedFd>,
}

impl TunDevice {
    /// Attach to the named interface through `/dev/net/tun`.
    ///
    /// The interface is normally created beforehand (`ip tuntap add`) so the
    /// relay itself needs no extra privileges.
    pub fn open(name: &str, mode: LinkMode) -> Result<Self, NetError> {
        let device_open = |source| NetError::DeviceOpen {
            name: name.to_string(),
            source,
        };

        let fd = attach(name, mode).map_err(device_open)?;
        let mtu = match interface_mtu(name) {
            Ok(mtu) => mtu,
            Err(e) => {
                tracing::debug!(name, error = %e, "could not query MTU, using default");
                DEFAULT_DEVICE_MTU
            }
        };

        let device = Self::from_fd(fd, name, mode).map_err(device_open)?;
        tracing::info!(name, ?mode, mtu, "virtual interface opened");
        Ok(device.with_mtu(mtu))
    }

    /// Adopt an already-open device descriptor.
    pub fn from_fd(fd: OwnedFd, name: &str, mode: LinkMode) -> io::Result<Self> {
        set_nonblocking(&fd)?;
        Ok(Self {
            name: name.to_string(),
            mode,
            mtu: DEFAULT_DEVICE_MTU,
            fd: AsyncFd::new(fd)?,
        })
    }

    /// Create a device backed by a `SOCK_SEQPACKET` socketpair.
    ///
    /// Returns `(device, peer_fd)`; the peer plays the kernel's side of the
    /// interface. Packet boundaries are preserved and closing the peer is
    /// seen as end of stream, which makes this a stand-in for a real device
    /// wherever one cannot be created.
    pub fn socketpair(name: &str, mode: LinkMode) -> io::Result<(Self, OwnedFd)> {
        let mut fds: [RawFd; 2] = [-1, -1];

        let result = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        let device_fd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let peer_fd = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        Ok((Self::from_fd(device_fd, name, mode)?, peer_fd))
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    /// Read one frame. `Ok(None)` means the other side went away.
    ///
    /// A frame that does not fit in `MAX_FRAME_SIZE` bytes is an
    /// `InvalidData` error rather than a silently truncated frame.
    pub async fn recv(&self) -> io::Result<Option<Frame>> {
        // One spare byte tells a maximum-size frame apart from a truncated one.
        let mut buf = BytesMut::zeroed(MAX_FRAME_SIZE + 1);
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| read_frame(inner.get_ref().as_raw_fd(), &mut buf)) {
                Ok(Ok(0)) => return Ok(None),
                Ok(Ok(len)) => {
                    buf.truncate(len);
                    return Ok(Some(buf.freeze()));
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    /// Write one frame.
    pub async fn send(&self, frame: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| write_frame(inner.get_ref(), frame)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsRawFd for TunDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl FrameIO for TunDevice {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn link_mode(&self) -> LinkMode {
        self.mode
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = match self.fd.poll_read_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            match guard.try_io(|inner| read_frame(inner.get_ref().as_raw_fd(), buf)) {
                Ok(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "virtual interface closed",
                    )));
                }
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        write_frame(self.fd.get_ref(), frame)
    }
}

#[async_trait]
impl FrameSource for Arc<TunDevice> {
    async fn recv_frame(&mut self) -> io::Result<Option<Frame>> {
        self.recv().await
    }
}

#[async_trait]
impl FrameSink for Arc<TunDevice> {
    async fn send_frame(&mut self, frame: Frame) -> io::Result<()> {
        self.send(&frame).await
    }
}

fn read_frame(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let len = nix::unistd::read(fd, buf).map_err(io::Error::from)?;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame exceeds {MAX_FRAME_SIZE} bytes"),
        ));
    }
    Ok(len)
}

fn write_frame(fd: &OwnedFd, frame: &[u8]) -> io::Result<()> {
    let written = nix::unistd::write(fd, frame).map_err(io::Error::from)?;
    if written != frame.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "incomplete frame write",
        ));
    }
    Ok(())
}

fn ifname(name: &str) -> io::Result<[c_char; IFNAMSIZ]> {
    if name.is_empty() || name.len() >= IFNAMSIZ || name.contains('\0') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interface name must be 1 to {} bytes", IFNAMSIZ - 1),
        ));
    }

    let mut ifr_name = [0 as c_char; IFNAMSIZ];
    for (dst, byte) in ifr_name.iter_mut().zip(name.bytes()) {
        *dst = byte as c_char;
    }
    Ok(ifr_name)
}

fn attach(name: &str, mode: LinkMode) -> io::Result<OwnedFd> {
    let ifr_name = ifname(name)?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(TUN_CLONE_DEVICE)?;

    let kind = match mode {
        LinkMode::Tun => IFF_TUN,
        LinkMode::Tap => IFF_TAP,
    };
    let ifr = IfReqFlags {
        ifr_name,
        ifr_flags: (kind | IFF_NO_PI) as c_short,
        _padding: [0; 22],
    };

    let result = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &ifr) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(OwnedFd::from(file))
}

/// Look up the MTU of a network interface by name.
pub fn interface_mtu(name: &str) -> io::Result<usize> {
    let mut ifr = IfReqMtu {
        ifr_name: ifname(name)?,
        ifr_mtu: 0,
        _padding: [0; 20],
    };

    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    let sock = unsafe { OwnedFd::from_raw_fd(raw) };

    let result = unsafe {
        libc::ioctl(
            sock.as_raw_fd(),
            libc::SIOCGIFMTU as libc::Ioctl,
            &mut ifr,
        )
    };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }

    usize::try_from(ifr.ifr_mtu)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative MTU"))
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let result = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
