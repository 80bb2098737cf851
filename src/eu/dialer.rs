use std::time::{Duration, Instant};

use anyhow::Context;
use futures_util::AsyncReadExt;
use smol_timeout2::TimeoutExt;

use crate::config::{EuConfig, Tunables};
use crate::limiter::Limiter;
use crate::net::{sleep_or_stop, tune_socket};
use crate::proxy::proxy_bidirectional;
use crate::stop::StopSignal;

const BACKOFF_START: Duration = Duration::from_millis(200);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// One of `pool_size` long-lived workers. Each worker repeatedly dials IR,
/// waits for a port assignment, bridges to the matching local service, and
/// on disconnect reconnects with its own exponential backoff. `worker_id` is
/// only used to stagger the very first dial across workers so they don't
/// all hit IR's accept queue in the same instant.
pub async fn dialer_worker(
    worker_id: usize,
    eu: EuConfig,
    tunables: &'static Tunables,
    dial_limiter: Limiter,
    stop: &'static StopSignal,
) -> anyhow::Result<()> {
    let stagger = Duration::from_millis((worker_id as u64 % 32) * 15 + rand::random::<u64>() % 25);
    if !sleep_or_stop(stagger, stop).await {
        return Ok(());
    }

    let mut backoff = BACKOFF_START;
    while !stop.is_set() {
        match run_one_connection(&eu, tunables, &dial_limiter).await {
            Ok(()) => backoff = BACKOFF_START,
            Err(err) => tracing::debug!(worker_id, err = %err, "dialer connection ended"),
        }
        if !sleep_or_stop(backoff, stop).await {
            break;
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
    Ok(())
}

async fn run_one_connection(
    eu: &EuConfig,
    tunables: &Tunables,
    dial_limiter: &Limiter,
) -> anyhow::Result<()> {
    let permit = dial_limiter.acquire().await;
    let bridge = smol::net::TcpStream::connect((eu.iran_ip, eu.bridge_port))
        .timeout(tunables.dial_timeout)
        .await
        .context("dial to IR timed out")?
        .context("dial to IR failed")?;
    drop(permit);

    tune_socket(&bridge, tunables);
    let created_at = Instant::now();

    let port = read_assignment(&bridge).await?;

    let local = smol::net::TcpStream::connect((tunables.eu_local_host, port))
        .timeout(tunables.dial_timeout)
        .await
        .context("local dial timed out")?
        .with_context(|| format!("local dial to port {port} failed"))?;
    tune_socket(&local, tunables);

    proxy_bidirectional(local, bridge, tunables).await?;

    if created_at.elapsed() >= tunables.pool_max_age {
        tracing::debug!("pool connection exceeded max age, will not be reused");
    }
    Ok(())
}

/// Reads port-assignment headers until a nonzero one arrives, silently
/// absorbing zero-valued heartbeats sent by the IR pinger.
async fn read_assignment(stream: &smol::net::TcpStream) -> anyhow::Result<u16> {
    let mut r = stream;
    loop {
        let mut buf = [0u8; 2];
        r.read_exact(&mut buf).await.context("reading assignment header")?;
        let header = u16::from_be_bytes(buf);
        if header != 0 {
            return Ok(header);
        }
    }
}
