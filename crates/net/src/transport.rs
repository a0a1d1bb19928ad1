//! Unix-domain socket transport carrying frames between relay processes.

use crate::error::NetError;
use crate::frame_io::{Frame, FrameSink, FrameSource};
use async_trait::async_trait;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LengthDelimitedCodec};
use tunrelay_core::{Framing, MAX_FRAME_SIZE};

const LENGTH_FIELD_BYTES: usize = 4;

/// Splits a byte stream into frames according to a `Framing`.
#[derive(Debug)]
pub struct FrameCodec {
    framing: Framing,
    length_delimited: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            length_delimited: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_FIELD_BYTES)
                .big_endian()
                .max_frame_length(MAX_FRAME_SIZE)
                .new_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        match self.framing {
            Framing::LengthPrefixed => Ok(self.length_delimited.decode(src)?.map(BytesMut::freeze)),
            Framing::Unframed => {
                if src.is_empty() {
                    return Ok(None);
                }
                let len = src.len().min(MAX_FRAME_SIZE);
                Ok(Some(src.split_to(len).freeze()))
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> io::Result<()> {
        match self.framing {
            Framing::LengthPrefixed => self.length_delimited.encode(frame, dst),
            Framing::Unframed => {
                if frame.len() > MAX_FRAME_SIZE {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("frame exceeds {MAX_FRAME_SIZE} bytes"),
                    ));
                }
                dst.extend_from_slice(&frame);
                Ok(())
            }
        }
    }
}

/// Listening side of the transport.
///
/// The socket file is removed when the listener is dropped so the next
/// instance can bind the same path.
pub struct FrameListener {
    listener: UnixListener,
    path: PathBuf,
    framing: Framing,
}

impl FrameListener {
    /// Bind `path`, replacing a stale socket left by a previous run.
    pub fn bind(path: impl AsRef<Path>, framing: Framing) -> Result<Self, NetError> {
        let path = path.as_ref().to_path_buf();
        let listen_error = |source| NetError::TransportListen {
            path: path.clone(),
            source,
        };

        remove_stale_socket(&path).map_err(listen_error)?;
        let listener = UnixListener::bind(&path).map_err(listen_error)?;
        tracing::info!(path = %path.display(), ?framing, "transport listening");

        Ok(Self {
            listener,
            path,
            framing,
        })
    }

    pub async fn accept(&self) -> io::Result<FrameConnection> {
        let (stream, _) = self.listener.accept().await?;
        Ok(FrameConnection::from_stream(stream, self.framing))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Source of incoming transport connections for the multiplexer.
///
/// Must be cancel-safe: a dropped `accept` future must not lose a
/// connection.
#[async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept(&self) -> io::Result<FrameConnection>;
}

#[async_trait]
impl Acceptor for FrameListener {
    async fn accept(&self) -> io::Result<FrameConnection> {
        FrameListener::accept(self).await
    }
}

impl Drop for FrameListener {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "removed socket file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove socket file")
            }
        }
    }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            tracing::debug!(path = %path.display(), "removing stale socket file");
            std::fs::remove_file(path)
        }
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "path exists and is not a socket",
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// One transport connection, before it is split between the two pumps.
pub struct FrameConnection {
    stream: UnixStream,
    framing: Framing,
}

impl FrameConnection {
    pub async fn connect(path: impl AsRef<Path>, framing: Framing) -> Result<Self, NetError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| NetError::TransportConnect {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::debug!(path = %path.display(), "transport connected");
        Ok(Self::from_stream(stream, framing))
    }

    pub fn from_stream(stream: UnixStream, framing: Framing) -> Self {
        Self { stream, framing }
    }

    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            FrameReader {
                inner: FramedRead::new(read_half, FrameCodec::new(self.framing)),
            },
            FrameWriter {
                inner: FramedWrite::new(write_half, FrameCodec::new(self.framing)),
            },
        )
    }
}

pub struct FrameReader {
    inner: FramedRead<OwnedReadHalf, FrameCodec>,
}

impl FrameReader {
    /// Read the next frame; `None` when the peer closed the connection.
    pub async fn read_frame(&mut self) -> io::Result<Option<Frame>> {
        self.inner.next().await.transpose()
    }
}

pub struct FrameWriter {
    inner: FramedWrite<OwnedWriteHalf, FrameCodec>,
}

impl FrameWriter {
    pub async fn write_frame(&mut self, frame: Frame) -> io::Result<()> {
        self.inner.send(frame).await
    }
}

#[async_trait]
impl FrameSource for FrameReader {
    async fn recv_frame(&mut self) -> io::Result<Option<Frame>> {
        self.read_frame().await
    }
}

#[async_trait]
impl FrameSink for FrameWriter {
    async fn send_frame(&mut self, frame: Frame) -> io::Result<()> {
        self.write_frame(frame).await
    }
}
