//! Bridged connections: one transport connection plus its pair of pumps.
//!
//! - Endpoint side: transport → `ChannelEndpoint::inject` and
//!   `ChannelEndpoint::read_outbound` → transport
//! - Device side: transport → TUN/TAP write and TUN/TAP read → transport
//!
//! Both pumps share one `CancellationToken`; the connection is finished
//! once both have exited.

use crate::endpoint::{ChannelEndpoint, EndpointInjector, EndpointReader};
use crate::pump::{PumpExit, PumpReport, pump_from_transport, pump_to_transport};
use crate::transport::FrameConnection;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tunrelay_core::NetworkProtocol;

#[cfg(target_os = "linux")]
use {crate::tun::TunDevice, std::sync::Arc};

/// Outcome of both pumps of a finished connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeReport {
    pub egress: PumpReport,
    pub ingress: PumpReport,
}

pub struct BridgedConnection {
    id: u64,
    token: CancellationToken,
    egress: JoinHandle<PumpReport>,
    ingress: JoinHandle<PumpReport>,
}

impl BridgedConnection {
    /// Relay `connection` to and from the shared virtual NIC.
    ///
    /// Frames arriving on the transport are injected tagged with `protocol`.
    pub fn spawn_endpoint(
        id: u64,
        connection: FrameConnection,
        endpoint: &ChannelEndpoint,
        protocol: NetworkProtocol,
        token: CancellationToken,
    ) -> Self {
        let (reader, writer) = connection.into_split();
        let span = tracing::info_span!("bridge", conn = id);

        let egress = tokio::spawn(
            pump_to_transport(
                EndpointReader::new(endpoint.clone(), token.clone()),
                writer,
                token.clone(),
            )
            .instrument(span.clone()),
        );
        let ingress = tokio::spawn(
            pump_from_transport(
                reader,
                EndpointInjector::new(endpoint.clone(), protocol),
                token.clone(),
            )
            .instrument(span),
        );

        Self {
            id,
            token,
            egress,
            ingress,
        }
    }

    /// Relay `connection` to and from a TUN/TAP device.
    #[cfg(target_os = "linux")]
    pub fn spawn_device(
        id: u64,
        connection: FrameConnection,
        device: Arc<TunDevice>,
        token: CancellationToken,
    ) -> Self {
        let (reader, writer) = connection.into_split();
        let span = tracing::info_span!("bridge", conn = id, device = device.name());

        let egress = tokio::spawn(
            pump_to_transport(Arc::clone(&device), writer, token.clone()).instrument(span.clone()),
        );
        let ingress =
            tokio::spawn(pump_from_transport(reader, device, token.clone()).instrument(span));

        Self {
            id,
            token,
            egress,
            ingress,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ask both pumps to stop.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait until both pumps have exited.
    pub async fn join(self) -> BridgeReport {
        let (egress, ingress) = tokio::join!(self.egress, self.ingress);
        BridgeReport {
            egress: report_or_aborted(egress),
            ingress: report_or_aborted(ingress),
        }
    }
}

fn report_or_aborted(joined: Result<PumpReport, JoinError>) -> PumpReport {
    joined.unwrap_or_else(|e| {
        tracing::error!(error = %e, "pump task did not complete");
        PumpReport {
            exit: PumpExit::Aborted,
            frames: 0,
        }
    })
}
