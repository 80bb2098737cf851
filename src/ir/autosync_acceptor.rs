use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use futures_util::io::BufReader;
use futures_util::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

use crate::config::Tunables;
use crate::limiter::Limiter;
use crate::net::{accept_or_stop, bind_tcp_listener, tune_socket};
use crate::stop::StopSignal;

use super::listener_controller::ListenerController;
use super::pool::BridgePool;

/// Accepts AutoSync connections from EU and applies every successfully
/// parsed port set to the listener controller. A connection that sends a
/// malformed frame is simply closed; it never takes the whole acceptor
/// down.
pub async fn run(
    bind: IpAddr,
    sync_port: u16,
    controller: Arc<ListenerController>,
    pool: BridgePool,
    tunables: &'static Tunables,
    stop: &'static StopSignal,
    session_limiter: Option<Limiter>,
) -> anyhow::Result<()> {
    let listener = bind_tcp_listener((bind, sync_port).into(), tunables.backlog_sync)?;
    tracing::info!(sync_port, "autosync acceptor listening");

    while let Some(accepted) = accept_or_stop(&listener, stop).await {
        match accepted {
            Ok((stream, peer)) => {
                tune_socket(&stream, tunables);
                let controller = controller.clone();
                let pool = pool.clone();
                let session_limiter = session_limiter.clone();
                smolscale::spawn(handle_connection(
                    stream,
                    peer,
                    controller,
                    pool,
                    tunables,
                    stop,
                    session_limiter,
                ))
                .detach();
            }
            Err(err) => {
                tracing::warn!(err = %err, "autosync accept error");
            }
        }
    }
    Ok(())
}

async fn handle_connection(
    stream: smol::net::TcpStream,
    peer: SocketAddr,
    controller: Arc<ListenerController>,
    pool: BridgePool,
    tunables: &'static Tunables,
    stop: &'static StopSignal,
    session_limiter: Option<Limiter>,
) {
    // Buffered so `read_one_message` can peek the framing byte without
    // committing to consuming it, and so the buffer (and any bytes read
    // ahead of where a message boundary turns out to be) persists across
    // the multiple messages one connection sends per spec.md §4.8.
    let mut reader = BufReader::new(stream);
    loop {
        match read_one_message(&mut reader, tunables.max_sync_ports).await {
            Ok(ports) => {
                tracing::debug!(peer = %peer, count = ports.len(), "applying desired port set");
                controller.apply_desired(ports, &pool, tunables, stop, session_limiter.clone());
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::debug!(peer = %peer, "autosync connection closed");
                break;
            }
            Err(err) => {
                tracing::debug!(peer = %peer, err = %err, "malformed autosync message, closing connection");
                break;
            }
        }
    }
}

/// Reads one framed port-set message. A `"PT1"` magic switches to the
/// modern framing (`u16` count, then `count` big-endian `u16` ports); any
/// other leading byte is the legacy 8-bit count, whose following two bytes
/// are already the first port.
///
/// The leading byte is only *peeked* (`fill_buf`, no `consume`) to decide
/// which framing applies, so a legacy message is never forced to give up
/// 3 bytes before it's known to need them: a legacy `count == 0` message is
/// exactly 1 byte on the wire, and committing to it via `consume(1)` alone
/// leaves the stream aligned for whatever the peer sends next. Only once a
/// leading `'P'` (0x50) commits us to checking the full `"PT1"` magic do we
/// `read_exact` 3 bytes outright, since nothing has been consumed yet at
/// that point either way.
pub async fn read_one_message<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    max_sync_ports: usize,
) -> std::io::Result<Vec<u16>> {
    let first = {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        }
        buf[0]
    };

    if first != b'P' {
        reader.consume_unpin(1);
        let count = first as usize;
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut first_port_buf = [0u8; 2];
        reader.read_exact(&mut first_port_buf).await?;
        let first_port = u16::from_be_bytes(first_port_buf);
        return read_clamped_ports(reader, vec![first_port], count - 1, max_sync_ports).await;
    }

    let mut magic = [0u8; 3];
    reader.read_exact(&mut magic).await?;
    if &magic == b"PT1" {
        let mut count_buf = [0u8; 2];
        reader.read_exact(&mut count_buf).await?;
        let count = u16::from_be_bytes(count_buf) as usize;
        read_clamped_ports(reader, Vec::new(), count, max_sync_ports).await
    } else {
        // `magic[0]` is 0x50 -- the one legacy count value (80) that
        // collides with the PT1 marker's first byte. Same rule as any other
        // legacy count: `magic[1..3]` are already the first port.
        let count = magic[0] as usize;
        let first_port = u16::from_be_bytes([magic[1], magic[2]]);
        read_clamped_ports(reader, vec![first_port], count - 1, max_sync_ports).await
    }
}

/// Reads exactly `remaining_on_wire` more `u16` ports off the wire (keeping
/// the framing aligned for the next message) but only keeps up to
/// `max_sync_ports` total, counting anything already in `already_have`.
async fn read_clamped_ports<R: AsyncRead + Unpin>(
    reader: &mut R,
    mut already_have: Vec<u16>,
    remaining_on_wire: usize,
    max_sync_ports: usize,
) -> std::io::Result<Vec<u16>> {
    if already_have.len() > max_sync_ports {
        already_have.truncate(max_sync_ports);
    }
    let keep_more = max_sync_ports.saturating_sub(already_have.len()).min(remaining_on_wire);
    let mut buf = [0u8; 2];
    for i in 0..remaining_on_wire {
        reader.read_exact(&mut buf).await?;
        if i < keep_more {
            already_have.push(u16::from_be_bytes(buf));
        }
    }
    Ok(already_have)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt1(ports: &[u16]) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.extend_from_slice(b"PT1");
        msg.extend_from_slice(&(ports.len() as u16).to_be_bytes());
        for p in ports {
            msg.extend_from_slice(&p.to_be_bytes());
        }
        msg
    }

    #[test]
    fn pt1_round_trips_order_and_duplicates() {
        smolscale::block_on(async {
            let ports = [8080u16, 8080, 9000, 1];
            let mut cursor = futures_util::io::Cursor::new(pt1(&ports));
            let parsed = read_one_message(&mut cursor, 256).await.unwrap();
            assert_eq!(parsed, ports);
        });
    }

    #[test]
    fn pt1_count_zero_clears_set() {
        smolscale::block_on(async {
            let mut cursor = futures_util::io::Cursor::new(pt1(&[]));
            let parsed = read_one_message(&mut cursor, 256).await.unwrap();
            assert!(parsed.is_empty());
        });
    }

    #[test]
    fn legacy_framing_matches_known_byte_sequence() {
        // 0x02 (count=2) 0x1F 0x90 (8080) 0x23 0x28 (9000)
        smolscale::block_on(async {
            let bytes = [0x02u8, 0x1F, 0x90, 0x23, 0x28];
            let mut cursor = futures_util::io::Cursor::new(bytes.to_vec());
            let parsed = read_one_message(&mut cursor, 256).await.unwrap();
            assert_eq!(parsed, vec![8080, 9000]);
        });
    }

    #[test]
    fn legacy_framing_count_zero_has_no_phantom_port() {
        smolscale::block_on(async {
            let bytes = [0x00u8, 0xAA, 0xBB]; // count=0; trailing 2 bytes belong to next message
            let mut cursor = futures_util::io::Cursor::new(bytes.to_vec());
            let parsed = read_one_message(&mut cursor, 256).await.unwrap();
            assert!(parsed.is_empty());
        });
    }

    #[test]
    fn legacy_count_zero_does_not_desync_the_next_message() {
        smolscale::block_on(async {
            // message 1: legacy count=0 (exactly 1 byte on the wire)
            // message 2: legacy count=1, port 8080
            let mut bytes = vec![0x00u8, 0x01u8];
            bytes.extend_from_slice(&8080u16.to_be_bytes());
            let mut cursor = futures_util::io::Cursor::new(bytes);

            let first = read_one_message(&mut cursor, 256).await.unwrap();
            assert!(first.is_empty());

            let second = read_one_message(&mut cursor, 256).await.unwrap();
            assert_eq!(second, vec![8080]);
        });
    }

    #[test]
    fn excess_ports_beyond_clamp_are_still_drained_from_wire() {
        smolscale::block_on(async {
            let ports = [1u16, 2, 3, 4, 5];
            let mut msg = pt1(&ports);
            msg.extend_from_slice(b"PT1\x00\x00"); // a second, empty message right after
            let mut cursor = futures_util::io::Cursor::new(msg);
            let parsed = read_one_message(&mut cursor, 3).await.unwrap();
            assert_eq!(parsed, vec![1, 2, 3]);
            let next = read_one_message(&mut cursor, 3).await.unwrap();
            assert!(next.is_empty());
        });
    }
}
