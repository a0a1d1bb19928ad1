//! In-process virtual NIC shared by every bridged connection.
//!
//! The endpoint sits between the relay pumps and the userspace stack:
//!
//! - pumps `inject` frames received from the transport; the stack drains
//!   them through its `StackPort`
//! - the stack transmits through its `StackPort`; pumps collect those
//!   frames with `read_outbound`
//!
//! Both queues are bounded and drop the *newest* frame when full, so
//! neither side ever blocks the other. Any number of pumps may inject and
//! read concurrently; every outbound frame is handed to exactly one reader.
//! The inbound side has a single consumer, the stack.

use crate::frame_io::{Frame, FrameIO, FrameSink, FrameSource};
use async_trait::async_trait;
use bytes::Bytes;
use futures::task::AtomicWaker;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tunrelay_core::{
    DEFAULT_MTU, DEFAULT_QUEUE_CAPACITY, LinkMode, MAX_FRAME_SIZE, MacAddress, NetworkProtocol,
};

/// Link parameters of a `ChannelEndpoint`.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub mac: MacAddress,
    pub mtu: usize,
    /// Capacity of each of the inbound and outbound queues, in frames.
    pub queue_capacity: usize,
    pub mode: LinkMode,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            mac: MacAddress::default(),
            mtu: DEFAULT_MTU,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            mode: LinkMode::Tun,
        }
    }
}

/// Result of waiting for an outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Frame(Frame),
    /// The caller's token fired or the endpoint was closed.
    Cancelled,
}

/// A frame waiting to be processed by the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub protocol: NetworkProtocol,
    pub frame: Frame,
}

/// Snapshot of the endpoint's frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    pub inbound_injected: u64,
    pub inbound_dropped: u64,
    pub outbound_queued: u64,
    pub outbound_dropped: u64,
}

/// Shared handle to the virtual NIC. Clones refer to the same endpoint.
#[derive(Clone)]
pub struct ChannelEndpoint {
    shared: Arc<Shared>,
}

struct Shared {
    config: EndpointConfig,
    inbound: Mutex<VecDeque<InboundFrame>>,
    inbound_waker: AtomicWaker,
    outbound: Mutex<VecDeque<Frame>>,
    outbound_ready: Notify,
    closed: CancellationToken,
    inbound_injected: AtomicU64,
    inbound_dropped: AtomicU64,
    outbound_queued: AtomicU64,
    outbound_dropped: AtomicU64,
}

impl ChannelEndpoint {
    pub fn new(config: EndpointConfig) -> Self {
        let capacity = config.queue_capacity;
        Self {
            shared: Arc::new(Shared {
                config,
                inbound: Mutex::new(VecDeque::with_capacity(capacity)),
                inbound_waker: AtomicWaker::new(),
                outbound: Mutex::new(VecDeque::with_capacity(capacity)),
                outbound_ready: Notify::new(),
                closed: CancellationToken::new(),
                inbound_injected: AtomicU64::new(0),
                inbound_dropped: AtomicU64::new(0),
                outbound_queued: AtomicU64::new(0),
                outbound_dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn link_address(&self) -> MacAddress {
        self.shared.config.mac
    }

    pub fn mtu(&self) -> usize {
        self.shared.config.mtu
    }

    pub fn mode(&self) -> LinkMode {
        self.shared.config.mode
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Hand a frame to the stack as inbound traffic.
    ///
    /// Never blocks. Returns `false` if the frame was dropped because the
    /// inbound queue is full or the endpoint is closed.
    pub fn inject(&self, frame: Frame, protocol: NetworkProtocol) -> bool {
        if self.is_closed() {
            return false;
        }

        {
            let mut inbound = lock(&self.shared.inbound);
            if inbound.len() >= self.shared.config.queue_capacity {
                drop(inbound);
                self.shared.inbound_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(len = frame.len(), "endpoint: inbound queue full, dropping frame");
                return false;
            }
            inbound.push_back(InboundFrame { protocol, frame });
        }

        self.shared.inbound_injected.fetch_add(1, Ordering::Relaxed);
        self.shared.inbound_waker.wake();
        true
    }

    /// Queue a frame transmitted by the stack for collection by a pump.
    ///
    /// Same drop-newest policy as `inject`.
    pub fn write_outbound(&self, frame: Frame) -> bool {
        if self.is_closed() {
            return false;
        }

        {
            let mut outbound = lock(&self.shared.outbound);
            if outbound.len() >= self.shared.config.queue_capacity {
                drop(outbound);
                self.shared.outbound_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(len = frame.len(), "endpoint: outbound queue full, dropping frame");
                return false;
            }
            outbound.push_back(frame);
        }

        self.shared.outbound_queued.fetch_add(1, Ordering::Relaxed);
        self.shared.outbound_ready.notify_one();
        true
    }

    /// Wait for the next frame transmitted by the stack.
    ///
    /// Returns `Cancelled` as soon as `token` fires or the endpoint is
    /// closed, without consuming a frame. Cancel-safe.
    pub async fn read_outbound(&self, token: &CancellationToken) -> ReadOutcome {
        loop {
            let notified = self.shared.outbound_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() || token.is_cancelled() {
                return self.cancelled();
            }
            if let Some(frame) = lock(&self.shared.outbound).pop_front() {
                return ReadOutcome::Frame(frame);
            }

            tokio::select! {
                biased;
                _ = self.shared.closed.cancelled() => return self.cancelled(),
                _ = token.cancelled() => return self.cancelled(),
                _ = &mut notified => {}
            }
        }
    }

    /// Take an outbound frame if one is queued.
    pub fn try_read_outbound(&self) -> Option<Frame> {
        if self.is_closed() {
            return None;
        }
        lock(&self.shared.outbound).pop_front()
    }

    /// Poll for the next inbound frame. `Ready(None)` once closed.
    pub fn poll_inbound(&self, cx: &mut Context<'_>) -> Poll<Option<InboundFrame>> {
        if let Some(frame) = self.pop_inbound() {
            return Poll::Ready(Some(frame));
        }
        self.shared.inbound_waker.register(cx.waker());
        if let Some(frame) = self.pop_inbound() {
            return Poll::Ready(Some(frame));
        }
        if self.is_closed() {
            return Poll::Ready(None);
        }
        Poll::Pending
    }

    /// Wait for the next inbound frame. `None` once the endpoint is closed
    /// and drained.
    pub async fn recv_inbound(&self) -> Option<InboundFrame> {
        std::future::poll_fn(|cx| self.poll_inbound(cx)).await
    }

    /// The stack's side of the link.
    pub fn stack_port(&self) -> StackPort {
        StackPort {
            endpoint: self.clone(),
        }
    }

    /// Shut the endpoint down.
    ///
    /// Every pending and future `read_outbound` returns `Cancelled`; frames
    /// offered afterwards are dropped. Calling this more than once is a no-op.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.shared.closed.cancel();
        self.shared.inbound_waker.wake();
        tracing::debug!(mac = %self.link_address(), "endpoint closed");
    }

    pub fn stats(&self) -> EndpointStats {
        EndpointStats {
            inbound_injected: self.shared.inbound_injected.load(Ordering::Relaxed),
            inbound_dropped: self.shared.inbound_dropped.load(Ordering::Relaxed),
            outbound_queued: self.shared.outbound_queued.load(Ordering::Relaxed),
            outbound_dropped: self.shared.outbound_dropped.load(Ordering::Relaxed),
        }
    }

    fn pop_inbound(&self) -> Option<InboundFrame> {
        lock(&self.shared.inbound).pop_front()
    }

    fn cancelled(&self) -> ReadOutcome {
        // A wakeup consumed by a reader that is leaving must go to someone else.
        if !lock(&self.shared.outbound).is_empty() {
            self.shared.outbound_ready.notify_one();
        }
        ReadOutcome::Cancelled
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stack-facing half of a `ChannelEndpoint`.
pub struct StackPort {
    endpoint: ChannelEndpoint,
}

impl FrameIO for StackPort {
    fn mtu(&self) -> usize {
        self.endpoint.mtu()
    }

    fn link_mode(&self) -> LinkMode {
        self.endpoint.mode()
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        match self.endpoint.poll_inbound(cx) {
            Poll::Ready(Some(inbound)) => {
                let len = inbound.frame.len();
                if len > buf.len() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("{len}-byte frame exceeds link MTU"),
                    )));
                }
                buf[..len].copy_from_slice(&inbound.frame);
                Poll::Ready(Ok(len))
            }
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "endpoint closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        if self.endpoint.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "endpoint closed"));
        }
        // A full queue drops the frame; the stack retransmits as needed.
        self.endpoint.write_outbound(Bytes::copy_from_slice(frame));
        Ok(())
    }
}

/// Pump source collecting the stack's outbound frames for one connection.
pub struct EndpointReader {
    endpoint: ChannelEndpoint,
    token: CancellationToken,
}

impl EndpointReader {
    pub fn new(endpoint: ChannelEndpoint, token: CancellationToken) -> Self {
        Self { endpoint, token }
    }
}

#[async_trait]
impl FrameSource for EndpointReader {
    async fn recv_frame(&mut self) -> io::Result<Option<Frame>> {
        match self.endpoint.read_outbound(&self.token).await {
            ReadOutcome::Frame(frame) => Ok(Some(frame)),
            ReadOutcome::Cancelled => Ok(None),
        }
    }
}

/// Pump sink injecting frames into the stack with a fixed protocol tag.
pub struct EndpointInjector {
    endpoint: ChannelEndpoint,
    protocol: NetworkProtocol,
}

impl EndpointInjector {
    pub fn new(endpoint: ChannelEndpoint, protocol: NetworkProtocol) -> Self {
        Self { endpoint, protocol }
    }
}

#[async_trait]
impl FrameSink for EndpointInjector {
    async fn send_frame(&mut self, frame: Frame) -> io::Result<()> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {MAX_FRAME_SIZE} bytes"),
            ));
        }
        if !self.endpoint.inject(frame, self.protocol) && self.endpoint.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "endpoint closed"));
        }
        Ok(())
    }
}
