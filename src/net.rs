use std::net::SocketAddr;
use std::time::Duration;

use smol::future::FutureExt as _;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};

use crate::config::Tunables;
use crate::stop::StopSignal;

/// Binds a listener the way the external interface requires: `SO_REUSEADDR`
/// and an explicit backlog, neither of which `std::net::TcpListener::bind`
/// exposes.
pub fn bind_tcp_listener(addr: SocketAddr, backlog: i32) -> std::io::Result<smol::net::TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    let std_listener: std::net::TcpListener = socket.into();
    smol::net::TcpListener::try_from(std_listener)
}

/// Applies NODELAY, keepalive and (if configured) explicit send/recv buffer
/// sizes to a connected socket. Never fails the caller: tuning errors are
/// logged and otherwise ignored, since a connection is still usable without
/// them.
pub fn tune_socket(stream: &smol::net::TcpStream, tunables: &Tunables) {
    if let Err(err) = tune_socket_inner(stream, tunables) {
        tracing::warn!(err = %err, "failed to tune TCP socket (non-fatal)");
    }
}

fn tune_socket_inner(stream: &smol::net::TcpStream, tunables: &Tunables) -> std::io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_nodelay(true)?;

    let idle = Duration::from_secs(tunables.keepalive_secs as u64);
    let mut keepalive = TcpKeepalive::new().with_time(idle);
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        keepalive = keepalive.with_interval(idle).with_retries(3);
    }
    sock.set_tcp_keepalive(&keepalive)?;

    if tunables.sockbuf > 0 {
        sock.set_recv_buffer_size(tunables.sockbuf)?;
        sock.set_send_buffer_size(tunables.sockbuf)?;
    }
    Ok(())
}

/// Races `listener.accept()` against the stop signal. `None` means the
/// process is shutting down and the caller should stop accepting.
pub async fn accept_or_stop(
    listener: &smol::net::TcpListener,
    stop: &'static StopSignal,
) -> Option<std::io::Result<(smol::net::TcpStream, SocketAddr)>> {
    enum Res {
        Accepted(std::io::Result<(smol::net::TcpStream, SocketAddr)>),
        Stopped,
    }
    let accept_fut = async { Res::Accepted(listener.accept().await) };
    let stop_fut = async {
        stop.wait().await;
        Res::Stopped
    };
    match accept_fut.race(stop_fut).await {
        Res::Accepted(r) => Some(r),
        Res::Stopped => None,
    }
}

/// Sleeps for `duration`, but returns early (`false`) if the stop signal
/// fires first. Every backoff/interval wait in this crate goes through this
/// so shutdown is prompt instead of waiting out the longest sleep in flight.
pub async fn sleep_or_stop(duration: Duration, stop: &'static StopSignal) -> bool {
    enum Res {
        Slept,
        Stopped,
    }
    let sleep_fut = async {
        smol::Timer::after(duration).await;
        Res::Slept
    };
    let stop_fut = async {
        stop.wait().await;
        Res::Stopped
    };
    matches!(sleep_fut.race(stop_fut).await, Res::Slept)
}
