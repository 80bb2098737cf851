use std::time::Duration;

use futures_util::AsyncWriteExt;
use smol_timeout2::TimeoutExt;

use crate::config::Tunables;
use crate::net::sleep_or_stop;
use crate::stop::StopSignal;

use super::pool::{BridgePool, PooledConnection};

/// Every `pool_ping_interval`, drains the pool, writes a zero-port heartbeat
/// header to each connection and puts back only the ones that accept it
/// within one second and aren't already past `pool_max_age`.
pub async fn pinger_loop(
    pool: BridgePool,
    tunables: &'static Tunables,
    stop: &'static StopSignal,
) -> anyhow::Result<()> {
    while sleep_or_stop(tunables.pool_ping_interval, stop).await {
        ping_once(&pool, tunables).await;
    }
    Ok(())
}

async fn ping_once(pool: &BridgePool, tunables: &Tunables) {
    let mut drained = Vec::new();
    while let Some(conn) = pool.try_take() {
        drained.push(conn);
    }
    for conn in drained {
        if conn.created_at.elapsed() >= tunables.pool_max_age {
            tracing::debug!("pinger closing aged-out pool connection");
            continue;
        }
        if heartbeat(&conn).await {
            pool.put(conn);
        } else {
            tracing::debug!("pinger closing pool connection that failed heartbeat");
        }
    }
}

async fn heartbeat(conn: &PooledConnection) -> bool {
    let mut w = &conn.stream;
    matches!(
        w.write_all(&0u16.to_be_bytes())
            .timeout(Duration::from_secs(1))
            .await,
        Some(Ok(()))
    )
}

/// Every `pool_recycle_interval` (explicit, or `max(5, min(30, pool_max_age
/// / 2))` when left at auto), sweeps the pool for connections past
/// `pool_max_age`.
pub async fn recycler_loop(
    pool: BridgePool,
    tunables: &'static Tunables,
    stop: &'static StopSignal,
) -> anyhow::Result<()> {
    while sleep_or_stop(tunables.pool_recycle_interval, stop).await {
        pool.recycle_stale(tunables.pool_max_age);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::AsyncReadExt;
    use smol::net::{TcpListener, TcpStream};

    async fn loopback_stream() -> (smol::net::TcpStream, smol::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (a, (b, _)) =
            futures_util::future::join(TcpStream::connect(addr), async { listener.accept().await })
                .await;
        (a.unwrap(), b.unwrap())
    }

    #[test]
    fn recycler_loop_closes_stale_entries_in_background() {
        smolscale::block_on(async {
            let pool = BridgePool::new(4);
            let (eu_side, ir_side) = loopback_stream().await;

            let mut tunables = Tunables::from_env();
            tunables.pool_max_age = Duration::from_millis(200);
            tunables.pool_recycle_interval = Duration::from_millis(50);
            let tunables: &'static Tunables = Box::leak(Box::new(tunables));
            let stop: &'static StopSignal = Box::leak(Box::new(StopSignal::new()));

            pool.put(PooledConnection {
                stream: ir_side,
                created_at: std::time::Instant::now() - Duration::from_secs(1),
            });
            assert_eq!(pool.len(), 1);

            let task = smolscale::spawn(recycler_loop(pool.clone(), tunables, stop));

            // the stale entry predates pool_max_age, so the background
            // recycler must sweep it out without anything ever drawing it.
            smol::Timer::after(Duration::from_millis(250)).await;
            assert_eq!(pool.len(), 0, "recycler should have closed the aged-out entry");

            stop.trigger();
            let _ = task.await;
            drop(eu_side);
        });
    }

    #[test]
    fn pinger_loop_heartbeats_young_connections_and_keeps_them_pooled() {
        smolscale::block_on(async {
            let pool = BridgePool::new(4);
            let (mut eu_side, ir_side) = loopback_stream().await;

            let mut tunables = Tunables::from_env();
            tunables.pool_max_age = Duration::from_secs(60);
            tunables.pool_ping_interval = Duration::from_millis(50);
            let tunables: &'static Tunables = Box::leak(Box::new(tunables));
            let stop: &'static StopSignal = Box::leak(Box::new(StopSignal::new()));

            pool.put(PooledConnection {
                stream: ir_side,
                created_at: std::time::Instant::now(),
            });

            let task = smolscale::spawn(pinger_loop(pool.clone(), tunables, stop));

            let mut buf = [0u8; 2];
            eu_side.read_exact(&mut buf).await.unwrap();
            assert_eq!(u16::from_be_bytes(buf), 0, "heartbeat header must be zero");

            smol::Timer::after(Duration::from_millis(20)).await;
            assert_eq!(pool.len(), 1, "a healthy connection survives a heartbeat");

            stop.trigger();
            let _ = task.await;
        });
    }
}
