//! The two forwarding loops of a bridged connection.
//!
//! Failure handling is deliberately asymmetric:
//!
//! - the egress pump (device or endpoint → transport) cancels the shared
//!   token when its *source* ends or fails, but a failed transport write only
//!   stops the egress pump itself;
//! - the ingress pump (transport → device or endpoint) cancels the token on
//!   every exit, so the egress pump's blocking read never outlives the
//!   connection it serves.

use crate::frame_io::{FrameSink, FrameSource};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Why a pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The connection's token was cancelled.
    Cancelled,
    /// The source reached a clean end of stream.
    SourceClosed,
    SourceFailed,
    SinkFailed,
    /// The pump task panicked or was aborted.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    pub exit: PumpExit,
    /// Frames delivered to the sink.
    pub frames: u64,
}

/// Forward frames from a device or endpoint to the transport.
pub async fn pump_to_transport<S, D>(
    mut source: S,
    mut sink: D,
    token: CancellationToken,
) -> PumpReport
where
    S: FrameSource,
    D: FrameSink,
{
    let mut frames = 0u64;
    let exit = loop {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => break PumpExit::Cancelled,
            received = source.recv_frame() => received,
        };

        let frame = match received {
            Ok(Some(frame)) => frame,
            Ok(None) if token.is_cancelled() => break PumpExit::Cancelled,
            Ok(None) => {
                debug!("egress: source closed");
                token.cancel();
                break PumpExit::SourceClosed;
            }
            Err(e) => {
                warn!(error = %e, "egress: read failed");
                token.cancel();
                break PumpExit::SourceFailed;
            }
        };

        trace!(len = frame.len(), "egress: forwarding frame");
        let sent = tokio::select! {
            biased;
            _ = token.cancelled() => break PumpExit::Cancelled,
            sent = sink.send_frame(frame) => sent,
        };
        if let Err(e) = sent {
            warn!(error = %e, "egress: write to transport failed");
            break PumpExit::SinkFailed;
        }
        frames += 1;
    };

    debug!(?exit, frames, "egress pump stopped");
    PumpReport { exit, frames }
}

/// Forward frames from the transport to a device or endpoint.
pub async fn pump_from_transport<S, D>(
    mut source: S,
    mut sink: D,
    token: CancellationToken,
) -> PumpReport
where
    S: FrameSource,
    D: FrameSink,
{
    // Release the paired egress pump however this loop ends.
    let _cancel_peer = token.clone().drop_guard();

    let mut frames = 0u64;
    let exit = loop {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => break PumpExit::Cancelled,
            received = source.recv_frame() => received,
        };

        let frame = match received {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("ingress: peer closed connection");
                break PumpExit::SourceClosed;
            }
            Err(e) => {
                warn!(error = %e, "ingress: read from transport failed");
                break PumpExit::SourceFailed;
            }
        };

        trace!(len = frame.len(), "ingress: forwarding frame");
        if let Err(e) = sink.send_frame(frame).await {
            warn!(error = %e, "ingress: delivery failed");
            break PumpExit::SinkFailed;
        }
        frames += 1;
    };

    debug!(?exit, frames, "ingress pump stopped");
    PumpReport { exit, frames }
}
