use std::io::{self, BufRead, Write};
use std::net::IpAddr;

use anyhow::Context;

use crate::config::{auto_pool_size, EuConfig, IrConfig, Role, Tunables};

pub enum Bootstrapped {
    Eu(EuConfig),
    Ir(IrConfig),
}

/// Walks the order-sensitive stdin prompts described in the external
/// interface and produces a resolved role configuration. An unrecognized
/// first token is a bootstrap error (the binary exits non-zero on it).
pub fn bootstrap(tunables: &Tunables, nofile_soft: u64) -> anyhow::Result<Bootstrapped> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    let mode = prompt_line(&mut lines, "Select role (1=EU, 2=IR): ")?;
    match mode.trim() {
        "1" => {
            let iran_ip = prompt_default(&mut lines, "Iran IP", "127.0.0.1")?
                .parse::<IpAddr>()
                .context("invalid Iran IP")?;
            let bridge_port = prompt_default(&mut lines, "Bridge port", "7000")?
                .parse::<u16>()
                .context("invalid bridge port")?;
            let sync_port = prompt_default(&mut lines, "Sync port", "7001")?
                .parse::<u16>()
                .context("invalid sync port")?;
            let enable_autosync = prompt_yn(&mut lines, "Enable AutoSync", true)?;
            let pool_size = auto_pool_size(tunables, Role::Eu, nofile_soft);
            Ok(Bootstrapped::Eu(EuConfig {
                iran_ip,
                bridge_port,
                sync_port,
                pool_size,
                enable_autosync,
            }))
        }
        "2" => {
            let bridge_port = prompt_default(&mut lines, "Bridge port", "7000")?
                .parse::<u16>()
                .context("invalid bridge port")?;
            let sync_port = prompt_default(&mut lines, "Sync port", "7001")?
                .parse::<u16>()
                .context("invalid sync port")?;
            let auto_sync = prompt_yn(&mut lines, "Enable AutoSync", true)?;
            let manual_ports = if auto_sync {
                Vec::new()
            } else {
                let raw = prompt_line(&mut lines, "Manual ports (comma-separated): ")?;
                raw.split(',')
                    .filter_map(|p| p.trim().parse::<u16>().ok())
                    .collect()
            };
            let pool_size = auto_pool_size(tunables, Role::Ir, nofile_soft);
            Ok(Bootstrapped::Ir(IrConfig {
                bridge_port,
                sync_port,
                pool_size,
                auto_sync,
                manual_ports,
            }))
        }
        other => anyhow::bail!("unrecognized role selection {other:?}"),
    }
}

fn prompt_line<I: Iterator<Item = io::Result<String>>>(
    lines: &mut I,
    label: &str,
) -> anyhow::Result<String> {
    print!("{label}");
    io::stdout().flush().ok();
    Ok(lines
        .next()
        .transpose()
        .context("reading stdin")?
        .unwrap_or_default())
}

fn prompt_default<I: Iterator<Item = io::Result<String>>>(
    lines: &mut I,
    label: &str,
    default: &str,
) -> anyhow::Result<String> {
    let raw = prompt_line(lines, &format!("{label} [{default}]: "))?;
    let trimmed = raw.trim();
    Ok(if trimmed.is_empty() {
        default.to_string()
    } else {
        trimmed.to_string()
    })
}

fn prompt_yn<I: Iterator<Item = io::Result<String>>>(
    lines: &mut I,
    label: &str,
    default: bool,
) -> anyhow::Result<bool> {
    let raw = prompt_default(lines, label, if default { "y" } else { "n" })?;
    Ok(matches!(raw.trim().to_lowercase().as_str(), "y" | "yes"))
}
