use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use futures_util::AsyncWriteExt;

use crate::config::Tunables;
use crate::limiter::Limiter;
use crate::net::{accept_or_stop, tune_socket};
use crate::proxy::proxy_bidirectional;
use crate::stop::StopSignal;

use super::pool::BridgePool;

/// Accepts user connections on one opened port and dispatches each to a
/// pool connection. Runs until the listener is dropped (port left the
/// desired set) or the process is stopping.
pub async fn accept_loop(
    listener: smol::net::TcpListener,
    port: u16,
    pool: BridgePool,
    tunables: &'static Tunables,
    stop: &'static StopSignal,
    session_limiter: Option<Limiter>,
) {
    while let Some(accepted) = accept_or_stop(&listener, stop).await {
        match accepted {
            Ok((stream, peer)) => {
                tune_socket(&stream, tunables);
                let pool = pool.clone();
                let session_limiter = session_limiter.clone();
                tracing::debug!(port, peer = %peer, "accepted user connection");
                smolscale::spawn(handle_session(stream, port, pool, tunables, session_limiter))
                    .detach();
            }
            Err(err) => {
                tracing::warn!(port, err = %err, "user accept error");
            }
        }
    }
}

async fn handle_session(
    user: smol::net::TcpStream,
    port: u16,
    pool: BridgePool,
    tunables: &'static Tunables,
    session_limiter: Option<Limiter>,
) {
    static ACTIVE: AtomicUsize = AtomicUsize::new(0);
    let active = ACTIVE.fetch_add(1, Ordering::Relaxed) + 1;
    tracing::debug!(port, active, "dispatching user session");
    scopeguard::defer!({
        ACTIVE.fetch_sub(1, Ordering::Relaxed);
    });

    let _permit = match &session_limiter {
        Some(limiter) => Some(limiter.acquire().await),
        None => None,
    };

    let tunnel = match draw_healthy_connection(&pool, port, tunables).await {
        Some(t) => t,
        None => {
            tracing::debug!(port, "no healthy pool connection within pool_wait, dropping session");
            return;
        }
    };

    if let Err(err) = proxy_bidirectional(user, tunnel, tunables).await {
        tracing::debug!(port, err = %err, "session ended with error");
    }
}

/// Draws from the pool until a connection young enough to use accepts the
/// port-assignment header, or `pool_wait` elapses.
async fn draw_healthy_connection(
    pool: &BridgePool,
    port: u16,
    tunables: &Tunables,
) -> Option<smol::net::TcpStream> {
    let deadline = Instant::now() + tunables.pool_wait;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        let conn = pool.get(remaining).await?;
        if conn.created_at.elapsed() >= tunables.pool_max_age {
            tracing::debug!("drew an aged-out pool connection, discarding and redrawing");
            continue;
        }
        match write_assignment(&conn.stream, port).await {
            Ok(()) => return Some(conn.stream),
            Err(err) => {
                tracing::debug!(err = %err, "assignment header write failed, redrawing");
                continue;
            }
        }
    }
}

async fn write_assignment(stream: &smol::net::TcpStream, port: u16) -> std::io::Result<()> {
    debug_assert!(port != 0, "port 0 is reserved for heartbeats");
    let mut w = stream;
    w.write_all(&port.to_be_bytes()).await?;
    w.flush().await
}
