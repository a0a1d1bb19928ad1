use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::task::{Context, Poll};
use tunrelay_core::LinkMode;

/// One raw L2 (TAP) or L3 (TUN) packet.
///
/// Frames are immutable and carried verbatim; every read produces a new
/// frame holding exactly the bytes that were read.
pub type Frame = Bytes;

/// Poll-based frame transport used by the userspace stack.
///
/// This lets the stack run over different links: a TUN/TAP device
/// directly, or the stack side of a `ChannelEndpoint` fed by relay pumps.
pub trait FrameIO: Send + 'static {
    /// Maximum transmission unit.
    fn mtu(&self) -> usize {
        1500
    }

    /// Whether frames carry an Ethernet header (TAP) or are bare IP (TUN).
    fn link_mode(&self) -> LinkMode {
        LinkMode::Tap
    }

    /// Poll for an incoming frame.
    ///
    /// Returns the number of bytes read into `buf` when a frame is available.
    fn poll_recv(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>>;

    /// Send a frame without blocking.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// Where a relay pump reads frames from.
///
/// Implementations must be cancel-safe: dropping the future returned by
/// `recv_frame` before it completes must not lose a frame.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame. `Ok(None)` signals a clean end of stream.
    async fn recv_frame(&mut self) -> io::Result<Option<Frame>>;
}

/// Where a relay pump delivers frames to.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: Frame) -> io::Result<()>;
}
