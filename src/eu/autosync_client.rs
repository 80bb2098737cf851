use std::time::{Duration, Instant};

use anyhow::Context;
use futures_util::AsyncWriteExt;
use smol::process::Command;
use smol_timeout2::TimeoutExt;

use crate::config::{EuConfig, Tunables};
use crate::net::{sleep_or_stop, tune_socket};
use crate::stop::StopSignal;

const BACKOFF_START: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(5);
const WARN_RATE_LIMIT: Duration = Duration::from_secs(60);

/// Maintains a single long-lived connection to IR's sync port, pushing the
/// local listening-port set every `sync_interval`. Reconnects with
/// exponential backoff on disconnect; warns about reconnects at most once
/// per minute so a flapping link doesn't flood the log.
pub async fn run(eu: EuConfig, tunables: &'static Tunables, stop: &'static StopSignal) -> anyhow::Result<()> {
    let mut backoff = BACKOFF_START;
    let mut last_warn = Instant::now() - WARN_RATE_LIMIT - Duration::from_secs(1);

    while !stop.is_set() {
        match run_one_session(&eu, tunables, stop).await {
            Ok(()) => backoff = BACKOFF_START,
            Err(err) => {
                if last_warn.elapsed() >= WARN_RATE_LIMIT {
                    tracing::warn!(err = %err, "autosync connection lost, reconnecting");
                    last_warn = Instant::now();
                }
            }
        }
        if !sleep_or_stop(backoff, stop).await {
            break;
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
    Ok(())
}

async fn run_one_session(
    eu: &EuConfig,
    tunables: &'static Tunables,
    stop: &'static StopSignal,
) -> anyhow::Result<()> {
    let stream = smol::net::TcpStream::connect((eu.iran_ip, eu.sync_port))
        .timeout(tunables.dial_timeout)
        .await
        .context("autosync dial timed out")?
        .context("autosync dial failed")?;
    tune_socket(&stream, tunables);
    tracing::info!("autosync connected");

    while sleep_or_stop(tunables.sync_interval, stop).await {
        let ports =
            enumerate_listening_ports(eu.bridge_port, eu.sync_port, tunables.max_sync_ports).await;
        send_message(&stream, &ports).await?;
    }
    Ok(())
}

async fn send_message(stream: &smol::net::TcpStream, ports: &[u16]) -> anyhow::Result<()> {
    let mut w = stream;
    let mut msg = Vec::with_capacity(5 + ports.len() * 2);
    msg.extend_from_slice(b"PT1");
    msg.extend_from_slice(&(ports.len() as u16).to_be_bytes());
    for p in ports {
        msg.extend_from_slice(&p.to_be_bytes());
    }
    w.write_all(&msg).await?;
    w.flush().await?;
    Ok(())
}

/// Discovers locally listening TCP ports via `/proc/net/tcp[6]`, falling
/// back to `ss -lnt` if the proc files are unreadable, and to an empty set
/// on non-Linux targets. Always excludes the bridge and sync ports
/// themselves and caps the result at `max`.
pub async fn enumerate_listening_ports(bridge_port: u16, sync_port: u16, max: usize) -> Vec<u16> {
    let mut ports = proc_net_tcp_ports().await;
    if ports.is_empty() {
        ports = ss_lnt_ports().await;
    }
    ports.retain(|p| *p != bridge_port && *p != sync_port);
    ports.sort_unstable();
    ports.dedup();
    ports.truncate(max);
    ports
}

#[cfg(target_os = "linux")]
async fn proc_net_tcp_ports() -> Vec<u16> {
    let mut ports = Vec::new();
    for path in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(contents) = smol::fs::read_to_string(path).await {
            ports.extend(parse_proc_net_tcp(&contents));
        }
    }
    ports
}

#[cfg(not(target_os = "linux"))]
async fn proc_net_tcp_ports() -> Vec<u16> {
    Vec::new()
}

/// Parses the listening-socket lines (state `0A`) out of `/proc/net/tcp[6]`.
fn parse_proc_net_tcp(contents: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for line in contents.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let _sl = fields.next();
        let local_address = match fields.next() {
            Some(x) => x,
            None => continue,
        };
        let state = match fields.next() {
            Some(x) => x,
            None => continue,
        };
        if state != "0A" {
            continue;
        }
        if let Some((_, port_hex)) = local_address.split_once(':') {
            if let Ok(port) = u16::from_str_radix(port_hex, 16) {
                ports.push(port);
            }
        }
    }
    ports
}

#[cfg(target_os = "linux")]
async fn ss_lnt_ports() -> Vec<u16> {
    let output = match Command::new("ss").args(["-lnt"]).output().await {
        Ok(o) => o,
        Err(_) => return Vec::new(),
    };
    let text = String::from_utf8_lossy(&output.stdout);
    let mut ports = Vec::new();
    for line in text.lines().skip(1) {
        if let Some(local) = line.split_whitespace().nth(3) {
            if let Some((_, port_str)) = local.rsplit_once(':') {
                if let Ok(port) = port_str.parse::<u16>() {
                    ports.push(port);
                }
            }
        }
    }
    ports
}

#[cfg(not(target_os = "linux"))]
async fn ss_lnt_ports() -> Vec<u16> {
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listen_state_lines_only() {
        let sample = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 123456
   1: 0100007F:9000 00000000:0000 01 00000000:00000000 00:00000000 00000000  1000        0 123457";
        let ports = parse_proc_net_tcp(sample);
        assert_eq!(ports, vec![8080]);
    }
}
