//! Accept loop fanning transport connections onto one shared endpoint.

use crate::bridge::{BridgeReport, BridgedConnection};
use crate::endpoint::ChannelEndpoint;
use crate::error::NetError;
use crate::transport::Acceptor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunrelay_core::NetworkProtocol;

#[derive(Debug, Clone)]
pub struct MultiplexerOptions {
    /// Connections bridged at once; further clients wait in the listen backlog.
    pub max_connections: usize,
    /// Consecutive accept failures tolerated before giving up.
    pub max_accept_failures: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for MultiplexerOptions {
    fn default() -> Self {
        Self {
            max_connections: 64,
            max_accept_failures: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Bridges every accepted transport connection to the same virtual NIC.
pub struct Multiplexer {
    endpoint: ChannelEndpoint,
    protocol: NetworkProtocol,
    options: MultiplexerOptions,
}

impl Multiplexer {
    pub fn new(
        endpoint: ChannelEndpoint,
        protocol: NetworkProtocol,
        options: MultiplexerOptions,
    ) -> Self {
        Self {
            endpoint,
            protocol,
            options,
        }
    }

    /// Accept and bridge connections until `shutdown` fires.
    ///
    /// Returns `Ok(())` after a requested shutdown, or
    /// `NetError::TransportAccept` once accepting has failed
    /// `max_accept_failures` times in a row. Either way every bridged
    /// connection is cancelled and awaited before returning.
    pub async fn serve<A: Acceptor>(
        &self,
        listener: &A,
        shutdown: CancellationToken,
    ) -> Result<(), NetError> {
        let slots = Arc::new(Semaphore::new(self.options.max_connections.max(1)));
        let connections_root = shutdown.child_token();
        let mut connections: JoinSet<(u64, BridgeReport)> = JoinSet::new();
        let mut next_id = 0u64;
        let mut failures = 0u32;
        let mut backoff = self.options.initial_backoff;

        let result = loop {
            if slots.available_permits() == 0 {
                debug!(
                    max = self.options.max_connections,
                    "connection limit reached, deferring accept"
                );
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    log_finished(joined);
                    continue;
                }
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let accepted = loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break None,
                    Some(joined) = connections.join_next(), if !connections.is_empty() => {
                        log_finished(joined);
                    }
                    accepted = listener.accept() => break Some(accepted),
                }
            };
            let Some(accepted) = accepted else {
                break Ok(());
            };

            match accepted {
                Ok(connection) => {
                    failures = 0;
                    backoff = self.options.initial_backoff;
                    next_id += 1;

                    let bridge = BridgedConnection::spawn_endpoint(
                        next_id,
                        connection,
                        &self.endpoint,
                        self.protocol,
                        connections_root.child_token(),
                    );
                    connections.spawn(async move {
                        let id = bridge.id();
                        let report = bridge.join().await;
                        drop(permit);
                        (id, report)
                    });
                    info!(conn = next_id, active = connections.len(), "connection accepted");
                }
                Err(e) => {
                    drop(permit);
                    failures += 1;
                    if failures >= self.options.max_accept_failures {
                        break Err(NetError::TransportAccept(e));
                    }
                    warn!(
                        error = %e,
                        failures,
                        retry_in = ?backoff,
                        "accept failed, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.options.max_backoff);
                }
            }
        };

        connections_root.cancel();
        while let Some(joined) = connections.join_next().await {
            log_finished(joined);
        }
        info!(accepted = next_id, "multiplexer stopped");

        result
    }
}

fn log_finished(joined: Result<(u64, BridgeReport), JoinError>) {
    match joined {
        Ok((id, report)) => debug!(
            conn = id,
            egress = ?report.egress.exit,
            egress_frames = report.egress.frames,
            ingress = ?report.ingress.exit,
            ingress_frames = report.ingress.frames,
            "connection finished"
        ),
        Err(e) => warn!(error = %e, "connection task failed"),
    }
}
