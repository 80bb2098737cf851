pub mod bootstrap;
pub mod config;
pub mod eu;
pub mod ir;
pub mod limiter;
pub mod net;
pub mod proxy;
pub mod stop;
pub mod supervisor;

use stop::StopSignal;

/// Raises the soft `RLIMIT_NOFILE` toward `target`, logging (never failing)
/// on platforms or permission levels that refuse it.
pub fn raise_nofile_limit(target: u64) {
    match rlimit::increase_nofile_limit(target) {
        Ok(got) => tracing::info!(target, got, "raised NOFILE soft limit"),
        Err(err) => tracing::warn!(err = %err, target, "failed to raise NOFILE limit (non-fatal)"),
    }
}

/// Reads the current soft `RLIMIT_NOFILE`, falling back to a conservative
/// guess if it can't be read (non-Linux, or a sandboxed environment that
/// hides the limit).
pub fn current_nofile_soft() -> u64 {
    rlimit::getrlimit(rlimit::Resource::NOFILE)
        .map(|(soft, _hard)| soft)
        .unwrap_or(1024)
}

/// Registers the combined SIGINT/SIGTERM handler that trips the
/// process-wide stop signal exactly once.
pub fn install_signal_handler(stop: &'static StopSignal) -> anyhow::Result<()> {
    ctrlc::set_handler(move || {
        tracing::info!("received shutdown signal");
        stop.trigger();
    })?;
    Ok(())
}

/// Runs the selected role to completion (i.e. until `stop` fires and every
/// supervised task has wound down). Returns `Err` only for the IR role, and
/// only once its bridge or sync port has genuinely failed to bind after
/// retrying — a fatal configuration error the caller should exit non-zero
/// on, per spec's fatal-vs-transient error classes.
pub async fn run_role(
    bootstrapped: bootstrap::Bootstrapped,
    tunables: &'static config::Tunables,
    stop: &'static StopSignal,
) -> anyhow::Result<()> {
    match bootstrapped {
        bootstrap::Bootstrapped::Ir(cfg) => ir::run(cfg, tunables, stop).await,
        bootstrap::Bootstrapped::Eu(cfg) => {
            eu::run(cfg, tunables, stop).await;
            Ok(())
        }
    }
}
