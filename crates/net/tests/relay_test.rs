#![cfg(target_os = "linux")]

//! End-to-end relay tests.
//!
//! A `SOCK_SEQPACKET` socketpair stands in for the TUN/TAP device: the test
//! holds the peer end and plays the kernel. Frames then travel
//! device → transport → multiplexer → endpoint and back.

use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tunrelay_core::{Framing, LinkMode, MAX_FRAME_SIZE, NetworkProtocol};
use tunrelay_net::{
    BridgedConnection, ChannelEndpoint, EndpointConfig, FrameConnection, FrameIO, FrameListener,
    Multiplexer, MultiplexerOptions, NetError, PumpExit, TunDevice,
};

const TIMEOUT: Duration = Duration::from_secs(1);

struct Relay {
    endpoint: ChannelEndpoint,
    path: PathBuf,
    shutdown: CancellationToken,
    server: JoinHandle<Result<(), NetError>>,
    _dir: TempDir,
}

impl Relay {
    async fn start(options: MultiplexerOptions) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("relay.sock");
        let listener =
            FrameListener::bind(&path, Framing::LengthPrefixed).expect("Failed to bind listener");

        let endpoint = ChannelEndpoint::new(EndpointConfig::default());
        let multiplexer = Multiplexer::new(endpoint.clone(), NetworkProtocol::Ipv4, options);
        let shutdown = CancellationToken::new();
        let server = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { multiplexer.serve(&listener, shutdown).await }
        });

        Self {
            endpoint,
            path,
            shutdown,
            server,
            _dir: dir,
        }
    }

    async fn connect(&self) -> FrameConnection {
        FrameConnection::connect(&self.path, Framing::LengthPrefixed)
            .await
            .expect("Failed to connect to relay")
    }

    /// Start the device side of the split: a fake device bridged to the relay.
    async fn attach_device(&self) -> (BridgedConnection, TunDevice) {
        let (device, peer) =
            TunDevice::socketpair("tun-test", LinkMode::Tun).expect("Failed to create socketpair");
        let peer = TunDevice::from_fd(peer, "tun-peer", LinkMode::Tun)
            .expect("Failed to wrap peer descriptor");
        let bridge = BridgedConnection::spawn_device(
            1,
            self.connect().await,
            Arc::new(device),
            CancellationToken::new(),
        );
        (bridge, peer)
    }

    /// Echo every inbound frame back out, like a stack answering each packet.
    fn spawn_echo(&self) -> JoinHandle<()> {
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            while let Some(inbound) = endpoint.recv_inbound().await {
                endpoint.write_outbound(inbound.frame);
            }
        })
    }

    async fn stop(self) -> Result<(), NetError> {
        self.shutdown.cancel();
        tokio::time::timeout(TIMEOUT, self.server)
            .await
            .expect("Multiplexer did not stop")
            .expect("Multiplexer task panicked")
    }
}

fn ipv4_packet(len: usize) -> Bytes {
    let mut packet = vec![0u8; len];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(len as u16).to_be_bytes());
    packet[9] = 17;
    packet[12..16].copy_from_slice(&[10, 0, 0, 2]);
    packet[16..20].copy_from_slice(&[10, 0, 0, 1]);
    for (i, byte) in packet[20..].iter_mut().enumerate() {
        *byte = i as u8;
    }
    Bytes::from(packet)
}

/// A frame whose content identifies its sender and sequence number.
fn tagged_frame(conn: u8, seq: u8) -> Bytes {
    let len = 40 + seq as usize;
    let mut frame = vec![conn; len];
    frame[1] = seq;
    Bytes::from(frame)
}

async fn recv_inbound(endpoint: &ChannelEndpoint) -> tunrelay_net::InboundFrame {
    tokio::time::timeout(TIMEOUT, endpoint.recv_inbound())
        .await
        .expect("Timed out waiting for inbound frame")
        .expect("Endpoint closed")
}

#[tokio::test]
async fn test_packet_reaches_endpoint_from_device() {
    let relay = Relay::start(MultiplexerOptions::default()).await;
    let (bridge, peer) = relay.attach_device().await;

    let packet = ipv4_packet(60);
    peer.send(&packet).await.expect("Failed to write to device");

    let inbound = recv_inbound(&relay.endpoint).await;
    assert_eq!(inbound.protocol, NetworkProtocol::Ipv4);
    assert_eq!(inbound.frame, packet);

    let reply = ipv4_packet(84);
    assert!(relay.endpoint.write_outbound(reply.clone()));
    let received = tokio::time::timeout(TIMEOUT, peer.recv())
        .await
        .expect("Timed out waiting for device frame")
        .expect("Device read failed")
        .expect("Device closed");
    assert_eq!(received, reply);

    bridge.cancel();
    tokio::time::timeout(TIMEOUT, bridge.join())
        .await
        .expect("Bridge did not stop");
    relay.stop().await.expect("Multiplexer failed");
}

#[tokio::test]
async fn test_max_size_frame_then_short_frame() {
    let relay = Relay::start(MultiplexerOptions::default()).await;
    let (_bridge, peer) = relay.attach_device().await;

    let big = Bytes::from(vec![0xab; MAX_FRAME_SIZE]);
    let small = Bytes::from(vec![0xcd; 100]);
    peer.send(&big).await.expect("Failed to write large frame");
    peer.send(&small).await.expect("Failed to write small frame");

    assert_eq!(recv_inbound(&relay.endpoint).await.frame, big);
    assert_eq!(recv_inbound(&relay.endpoint).await.frame, small);

    relay.stop().await.expect("Multiplexer failed");
}

#[tokio::test]
async fn test_max_size_frame_from_transport_reaches_device() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("relay.sock");
    let listener = FrameListener::bind(&path, Framing::LengthPrefixed).expect("Failed to bind");

    let (device, peer) =
        TunDevice::socketpair("tun-test", LinkMode::Tap).expect("Failed to create socketpair");
    let peer =
        TunDevice::from_fd(peer, "tun-peer", LinkMode::Tap).expect("Failed to wrap peer descriptor");
    let connection = FrameConnection::connect(&path, Framing::LengthPrefixed)
        .await
        .expect("Failed to connect");
    let _bridge = BridgedConnection::spawn_device(
        1,
        connection,
        Arc::new(device),
        CancellationToken::new(),
    );

    let (_reader, mut writer) = listener
        .accept()
        .await
        .expect("Failed to accept")
        .into_split();
    let big = Bytes::from(vec![0x5a; MAX_FRAME_SIZE]);
    let small = Bytes::from_static(&[0x11; 14]);
    writer.write_frame(big.clone()).await.expect("Failed to send large frame");
    writer.write_frame(small.clone()).await.expect("Failed to send small frame");

    for expected in [big, small] {
        let written = tokio::time::timeout(TIMEOUT, peer.recv())
            .await
            .expect("Timed out waiting for device write")
            .expect("Device read failed")
            .expect("Device closed");
        assert_eq!(written, expected);
    }
}

#[tokio::test]
async fn test_client_eof_releases_paired_pump() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("relay.sock");
    let listener = FrameListener::bind(&path, Framing::LengthPrefixed).expect("Failed to bind");
    let endpoint = ChannelEndpoint::new(EndpointConfig::default());

    let client = FrameConnection::connect(&path, Framing::LengthPrefixed)
        .await
        .expect("Failed to connect");
    let server = listener.accept().await.expect("Failed to accept");
    let bridge = BridgedConnection::spawn_endpoint(
        7,
        server,
        &endpoint,
        NetworkProtocol::Ipv4,
        CancellationToken::new(),
    );

    drop(client);

    let report = tokio::time::timeout(TIMEOUT, bridge.join())
        .await
        .expect("Egress pump was not released after client EOF");
    assert_eq!(report.ingress.exit, PumpExit::SourceClosed);
    assert_eq!(report.egress.exit, PumpExit::Cancelled);
    assert!(!endpoint.is_closed());
}

#[tokio::test]
async fn test_device_eof_closes_connection() {
    let relay = Relay::start(MultiplexerOptions::default()).await;
    let (bridge, peer) = relay.attach_device().await;

    drop(peer);

    let report = tokio::time::timeout(TIMEOUT, bridge.join())
        .await
        .expect("Bridge did not stop after device EOF");
    assert_eq!(report.egress.exit, PumpExit::SourceClosed);
    assert_eq!(report.ingress.exit, PumpExit::Cancelled);

    relay.stop().await.expect("Multiplexer failed");
}

#[tokio::test]
async fn test_two_connections_do_not_corrupt_each_other() {
    const PER_CONNECTION: u8 = 50;

    let relay = Relay::start(MultiplexerOptions::default()).await;
    let echo = relay.spawn_echo();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut writers = Vec::new();
    for conn in [1u8, 2u8] {
        let (mut reader, writer) = relay.connect().await.into_split();
        writers.push((conn, writer));
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Ok(Some(frame)) = reader.read_frame().await {
                if tx.send(frame).is_err() {
                    break;
                }
            }
        });
    }

    for seq in 0..PER_CONNECTION {
        for (conn, writer) in &mut writers {
            writer
                .write_frame(tagged_frame(*conn, seq))
                .await
                .expect("Failed to write frame");
        }
    }

    let mut received = Vec::new();
    while received.len() < 2 * PER_CONNECTION as usize {
        let frame = tokio::time::timeout(TIMEOUT, rx.recv())
            .await
            .expect("Timed out waiting for echoed frames")
            .expect("Readers stopped early");
        received.push(frame);
    }

    // Echoes may come back on either connection, but every frame is intact
    // and none is lost or duplicated.
    let mut seen: Vec<(u8, u8)> = received
        .iter()
        .map(|frame| {
            let (conn, seq) = (frame[0], frame[1]);
            assert_eq!(frame, &tagged_frame(conn, seq), "frame corrupted");
            (conn, seq)
        })
        .collect();
    seen.sort_unstable();
    let mut expected: Vec<(u8, u8)> = [1u8, 2u8]
        .iter()
        .flat_map(|&conn| (0..PER_CONNECTION).map(move |seq| (conn, seq)))
        .collect();
    expected.sort_unstable();
    assert_eq!(seen, expected);

    let stats = relay.endpoint.stats();
    assert_eq!(stats.inbound_injected, 2 * PER_CONNECTION as u64);
    assert_eq!(stats.inbound_dropped, 0);

    echo.abort();
    relay.stop().await.expect("Multiplexer failed");
}

#[tokio::test]
async fn test_closing_one_connection_leaves_others_running() {
    let relay = Relay::start(MultiplexerOptions::default()).await;
    let echo = relay.spawn_echo();

    let first = relay.connect().await;
    let (mut reader, mut writer) = relay.connect().await.into_split();

    drop(first);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!relay.endpoint.is_closed());

    let frame = tagged_frame(2, 9);
    writer
        .write_frame(frame.clone())
        .await
        .expect("Failed to write frame");
    let echoed = tokio::time::timeout(TIMEOUT, reader.read_frame())
        .await
        .expect("Timed out waiting for echo")
        .expect("Read failed")
        .expect("Connection closed");
    assert_eq!(echoed, frame);

    echo.abort();
    relay.stop().await.expect("Multiplexer failed");
}

#[tokio::test]
async fn test_endpoint_close_ends_every_connection() {
    let relay = Relay::start(MultiplexerOptions::default()).await;

    let mut readers = Vec::new();
    for _ in 0..3 {
        let (reader, writer) = relay.connect().await.into_split();
        readers.push((reader, writer));
    }
    // Let the multiplexer accept all three.
    tokio::time::sleep(Duration::from_millis(50)).await;

    relay.endpoint.close();
    relay.endpoint.close();

    for (mut reader, _writer) in readers {
        let next = tokio::time::timeout(TIMEOUT, reader.read_frame())
            .await
            .expect("Connection not released after endpoint close")
            .expect("Read failed");
        assert!(next.is_none());
    }

    relay.stop().await.expect("Multiplexer failed");
}

#[tokio::test]
async fn test_connection_limit_defers_accept() {
    let relay = Relay::start(MultiplexerOptions {
        max_connections: 1,
        ..MultiplexerOptions::default()
    })
    .await;

    let first = relay.connect().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The kernel completes the connect, but the relay does not service it.
    let (_reader, mut writer) = relay.connect().await.into_split();
    let frame = tagged_frame(2, 0);
    writer
        .write_frame(frame.clone())
        .await
        .expect("Failed to write frame");

    let early = tokio::time::timeout(Duration::from_millis(200), relay.endpoint.recv_inbound()).await;
    assert!(early.is_err(), "second connection was bridged past the limit");

    drop(first);
    assert_eq!(recv_inbound(&relay.endpoint).await.frame, frame);

    relay.stop().await.expect("Multiplexer failed");
}

#[tokio::test]
async fn test_shutdown_closes_connections_and_removes_socket() {
    let relay = Relay::start(MultiplexerOptions::default()).await;
    let (mut reader, _writer) = relay.connect().await.into_split();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(relay.path.exists());

    let path = relay.path.clone();
    let endpoint = relay.endpoint.clone();
    let Relay {
        shutdown,
        server,
        _dir,
        ..
    } = relay;

    shutdown.cancel();
    let result = tokio::time::timeout(TIMEOUT, server)
        .await
        .expect("Multiplexer did not stop")
        .expect("Multiplexer task panicked");
    assert!(result.is_ok());
    assert!(!path.exists(), "socket file left behind");

    let next = tokio::time::timeout(TIMEOUT, reader.read_frame())
        .await
        .expect("Connection not closed on shutdown")
        .expect("Read failed");
    assert!(next.is_none());
    assert!(!endpoint.is_closed());
}

#[tokio::test]
#[ignore = "needs CAP_NET_ADMIN and a tun-test interface"]
async fn test_real_tun_device_bridges() {
    let relay = Relay::start(MultiplexerOptions::default()).await;
    let device = TunDevice::open("tun-test", LinkMode::Tun).expect("Failed to open tun-test");
    assert!(device.mtu() >= 576);

    let bridge = BridgedConnection::spawn_device(
        1,
        relay.connect().await,
        Arc::new(device),
        CancellationToken::new(),
    );
    bridge.cancel();
    tokio::time::timeout(TIMEOUT, bridge.join())
        .await
        .expect("Bridge did not stop");

    relay.stop().await.expect("Multiplexer failed");
}
