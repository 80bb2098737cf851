use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::{AsyncReadExt, AsyncWriteExt};
use smol::future::FutureExt as _;
use smol_timeout2::TimeoutExt;

use crate::config::Tunables;

/// Copies bytes in both directions between `a` and `b` until either side
/// closes, an unrecoverable I/O error occurs, or the session is idle for
/// longer than `tunables.session_idle` (when nonzero). Connection-reset and
/// broken-pipe style errors are treated as a normal end of session, not a
/// failure, since they're the expected shape of a peer hanging up.
pub async fn proxy_bidirectional(
    a: smol::net::TcpStream,
    b: smol::net::TcpStream,
    tunables: &Tunables,
) -> anyhow::Result<()> {
    let epoch = Instant::now();
    let last_activity = AtomicU64::new(0);

    let a_to_b = copy_half(&a, &b, tunables, &last_activity, epoch);
    let b_to_a = copy_half(&b, &a, tunables, &last_activity, epoch);
    let watchdog = async {
        idle_watchdog(tunables.session_idle, &last_activity, epoch).await;
        Ok(())
    };

    let outcome = a_to_b.race(b_to_a).race(watchdog).await;

    let _ = a.shutdown(std::net::Shutdown::Write);
    let _ = b.shutdown(std::net::Shutdown::Write);

    match outcome {
        Ok(()) => Ok(()),
        Err(err) if is_benign(&err) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn copy_half(
    mut reader: &smol::net::TcpStream,
    mut writer: &smol::net::TcpStream,
    tunables: &Tunables,
    last_activity: &AtomicU64,
    epoch: Instant,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; tunables.copy_chunk];
    let mut unflushed = 0usize;
    loop {
        let n = if tunables.session_idle.is_zero() {
            reader.read(&mut buf).await?
        } else {
            match reader.read(&mut buf).timeout(tunables.session_idle).await {
                Some(res) => res?,
                None => return Ok(()),
            }
        };
        if n == 0 {
            break;
        }
        last_activity.store(epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
        writer.write_all(&buf[..n]).await?;
        unflushed += n;
        if unflushed >= tunables.drain_threshold {
            writer.flush().await?;
            unflushed = 0;
        }
    }
    writer.flush().await?;
    Ok(())
}

/// Polls the shared `last_activity` timestamp and returns once neither
/// direction has moved a byte for `session_idle`. A no-op (never resolves)
/// when idle timeout is disabled.
async fn idle_watchdog(session_idle: Duration, last_activity: &AtomicU64, epoch: Instant) {
    if session_idle.is_zero() {
        std::future::pending::<()>().await;
        return;
    }
    let tick = (session_idle / 4).max(Duration::from_millis(100));
    loop {
        smol::Timer::after(tick).await;
        let last = Duration::from_millis(last_activity.load(Ordering::Relaxed));
        if epoch.elapsed().saturating_sub(last) > session_idle {
            return;
        }
    }
}

fn is_benign(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        err.kind(),
        ConnectionReset | BrokenPipe | UnexpectedEof | ConnectionAborted | NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, (server, _)) = futures_util::future::join(
            TcpStream::connect(addr),
            async { listener.accept().await },
        )
        .await;
        (client.unwrap(), server.unwrap())
    }

    #[test]
    fn echoes_bytes_both_directions() {
        smolscale::block_on(async {
            let (user_a, user_b) = loopback_pair().await;
            let (tunnel_a, tunnel_b) = loopback_pair().await;

            let mut tunables = Tunables::from_env();
            tunables.session_idle = Duration::ZERO;
            tunables.copy_chunk = 4096;
            tunables.drain_threshold = 1;
            let tunables: &'static Tunables = Box::leak(Box::new(tunables));

            let proxy_task = smolscale::spawn(async move {
                proxy_bidirectional(user_b, tunnel_a, tunables).await
            });

            let mut user = user_a;
            let mut echo_peer = tunnel_b;

            user.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            echo_peer.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");

            echo_peer.write_all(b"pong").await.unwrap();
            user.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");

            drop(user);
            drop(echo_peer);
            let _ = proxy_task.await;
        });
    }
}
