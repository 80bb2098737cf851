use std::net::IpAddr;
use std::time::Instant;

use anyhow::Context;

use crate::config::Tunables;
use crate::net::{accept_or_stop, bind_tcp_listener, tune_socket};
use crate::stop::StopSignal;

use super::pool::{BridgePool, PooledConnection};

/// Accepts reverse connections dialed in by EU workers and deposits each one
/// into the bridge pool as soon as the TCP handshake completes. No handshake
/// or authentication beyond the bare connect happens here.
pub async fn run(
    bind: IpAddr,
    bridge_port: u16,
    pool: BridgePool,
    tunables: &'static Tunables,
    stop: &'static StopSignal,
) -> anyhow::Result<()> {
    let listener = bind_tcp_listener((bind, bridge_port).into(), tunables.backlog_bridge)
        .with_context(|| format!("cannot bind bridge port {bridge_port}"))?;
    tracing::info!(bridge_port, "bridge acceptor listening");

    while let Some(accepted) = accept_or_stop(&listener, stop).await {
        match accepted {
            Ok((stream, peer)) => {
                tune_socket(&stream, tunables);
                tracing::debug!(peer = %peer, "accepted bridge connection");
                pool.put(PooledConnection {
                    stream,
                    created_at: Instant::now(),
                });
            }
            Err(err) => {
                tracing::warn!(err = %err, "bridge accept error");
            }
        }
    }
    Ok(())
}
