use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

/// Process-wide tunables, sourced once from `PAHLAVI_*` environment
/// variables at startup and never touched again. Leaked to `&'static` in
/// `main` so every task can hold a reference without an `Arc`.
#[derive(Debug, Clone)]
pub struct Tunables {
    pub dial_timeout: Duration,
    pub pool_wait: Duration,
    pub keepalive_secs: u32,
    pub sockbuf: usize,
    pub copy_chunk: usize,
    pub sync_interval: Duration,
    pub backlog_bridge: i32,
    pub backlog_ports: i32,
    pub backlog_sync: i32,
    pub drain_threshold: usize,
    pub max_sync_ports: usize,
    pub pool_max_age: Duration,
    pub pool_ping_interval: Duration,
    pub pool_recycle_interval: Duration,
    pub session_idle: Duration,
    pub max_sessions: usize,
    pub dial_concurrency: usize,
    pub ir_bind: IpAddr,
    pub eu_local_host: IpAddr,
    pub pool_size_override: Option<usize>,
    pub nofile_target: u64,
    pub log_level: String,
}

impl Tunables {
    pub fn from_env() -> Self {
        let pool_max_age_secs: f64 = env_or("PAHLAVI_POOL_MAX_AGE", 1200.0);
        let pool_recycle_interval_secs: f64 = env_or("PAHLAVI_POOL_RECYCLE_INTERVAL", 0.0);
        let pool_recycle_interval = if pool_recycle_interval_secs > 0.0 {
            Duration::from_secs_f64(pool_recycle_interval_secs)
        } else {
            Duration::from_secs_f64((pool_max_age_secs / 2.0).clamp(5.0, 30.0))
        };

        Self {
            dial_timeout: Duration::from_secs_f64(env_or("PAHLAVI_DIAL_TIMEOUT", 5.0)),
            pool_wait: Duration::from_secs_f64(env_or("PAHLAVI_POOL_WAIT", 5.0)),
            keepalive_secs: env_or("PAHLAVI_KEEPALIVE_SECS", 30u32),
            sockbuf: env_or("PAHLAVI_SOCKBUF", 0usize),
            copy_chunk: env_or("PAHLAVI_COPY_CHUNK", 16384usize),
            sync_interval: Duration::from_secs_f64(env_or("PAHLAVI_SYNC_INTERVAL", 5.0)),
            backlog_bridge: env_or("PAHLAVI_BACKLOG_BRIDGE", 128i32),
            backlog_ports: env_or("PAHLAVI_BACKLOG_PORTS", 128i32),
            backlog_sync: env_or("PAHLAVI_BACKLOG_SYNC", 16i32),
            drain_threshold: env_or("PAHLAVI_DRAIN_THRESHOLD", 1_048_576usize),
            max_sync_ports: env_or("PAHLAVI_MAX_SYNC_PORTS", 256usize),
            pool_max_age: Duration::from_secs_f64(pool_max_age_secs),
            pool_ping_interval: Duration::from_secs_f64(env_or("PAHLAVI_POOL_PING_INTERVAL", 30.0)),
            pool_recycle_interval,
            session_idle: Duration::from_secs_f64(env_or("PAHLAVI_SESSION_IDLE", 0.0)),
            max_sessions: env_or("PAHLAVI_MAX_SESSIONS", 0usize),
            dial_concurrency: env_or("PAHLAVI_DIAL_CONCURRENCY", 64usize),
            ir_bind: env_or("PAHLAVI_IR_BIND", IpAddr::from_str("0.0.0.0").unwrap()),
            eu_local_host: env_or("PAHLAVI_EU_LOCAL_HOST", IpAddr::from_str("127.0.0.1").unwrap()),
            pool_size_override: env_opt_usize("PAHLAVI_POOL"),
            nofile_target: env_or("PAHLAVI_NOFILE_TARGET", 65535u64),
            log_level: env::var("PAHLAVI_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

/// Parses `key` from the environment, falling back to (and warning about)
/// `default` on a missing or malformed value.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Err(_) => default,
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, raw, "invalid env value, using default");
                default
            }
        },
    }
}

fn env_opt_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Ir,
    Eu,
}

/// Auto-sizes the bridge pool: an explicit `PAHLAVI_POOL` override wins
/// outright; otherwise the size is bounded by the file-descriptor budget
/// and by system RAM, then clamped to `[100, 2000]`.
pub fn auto_pool_size(tunables: &Tunables, role: Role, nofile_soft: u64) -> usize {
    if let Some(p) = tunables.pool_size_override {
        return p.clamp(100, 2000);
    }

    let fd_budget = nofile_soft.saturating_sub(800);
    let fraction = match role {
        Role::Ir => 0.22,
        Role::Eu => 0.30,
    };
    let from_fd = (fd_budget as f64 * fraction) as usize;

    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    let ram_mib = sys.total_memory() / 1024 / 1024;
    let ram_cap = if ram_mib > 0 {
        ((ram_mib as f64 / 1024.0) * 250.0) as usize
    } else {
        500
    };

    from_fd.min(ram_cap).clamp(100, 2000)
}

/// IR role configuration, gathered interactively over stdin.
#[derive(Debug, Clone)]
pub struct IrConfig {
    pub bridge_port: u16,
    pub sync_port: u16,
    pub pool_size: usize,
    pub auto_sync: bool,
    pub manual_ports: Vec<u16>,
}

/// EU role configuration, gathered interactively over stdin.
#[derive(Debug, Clone)]
pub struct EuConfig {
    pub iran_ip: IpAddr,
    pub bridge_port: u16,
    pub sync_port: u16,
    pub pool_size: usize,
    pub enable_autosync: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_override_is_clamped() {
        let mut t = Tunables::from_env();
        t.pool_size_override = Some(5);
        assert_eq!(auto_pool_size(&t, Role::Ir, 4096), 100);
        t.pool_size_override = Some(1_000_000);
        assert_eq!(auto_pool_size(&t, Role::Ir, 4096), 2000);
    }

    #[test]
    fn pool_auto_size_stays_in_bounds() {
        let mut t = Tunables::from_env();
        t.pool_size_override = None;
        let size = auto_pool_size(&t, Role::Eu, 65535);
        assert!((100..=2000).contains(&size));
    }
}
